//! Completion-driven TCP/UDP runtime behind a handle-based façade.
//!
//! The application supplies a [`NetSink`] and drives everything through
//! [`Net`]: create an endpoint, get back an opaque handle, then listen,
//! connect, or send. The core owns the sockets, keeps the asynchronous
//! I/O in flight through a poller + worker pool, reassembles
//! length-prefixed messages on the stream side, and delivers parsed
//! packets or datagrams back to the sink from worker threads.
//!
//! Stream messages travel as `[flag][size][reserved]` + payload (all u32,
//! network byte order); a peer violating that format gets its connection
//! closed. Datagrams are delivered one per completion, up to 8 KiB.

mod dispatch;
mod error;
mod frame;
mod handle;
mod mgr;
mod port;
mod sink;
mod sock;
mod tcp;
mod udp;

use std::net::SocketAddrV4;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

pub use error::{DatagramError, NetError, NetResult, StreamError};
pub use frame::{FRAME_FLAG, FrameError, HEADER_SIZE, MAX_STREAM_PAYLOAD, Packet};
pub use handle::{TcpHandle, UdpHandle};
pub use mgr::NetConfig;
pub use sink::NetSink;
pub use udp::MAX_DATAGRAM_PAYLOAD;

use mgr::NetCore;

/// A panicking worker must not wedge every later table access; the data
/// under these locks stays coherent because each critical section is a
/// plain insert/remove/clone.
pub(crate) fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Handle-based network context.
///
/// All methods are thread-safe and may be called from any thread,
/// including from inside a sink callback. `Net` is a cheap clone of a
/// shared core, so the application (typically the sink itself) can hold
/// as many copies as it likes; the core keeps only a weak reference back
/// to the sink, which breaks the reference cycle.
///
/// Endpoint handles are plain `u32` newtypes. Destroying a handle cancels
/// its outstanding I/O; completions that race with destruction are
/// dropped once the handle has left the table, so no callback bears a
/// destroyed handle.
#[derive(Clone)]
pub struct Net {
    core: Arc<NetCore>,
}

impl Net {
    /// Starts the runtime with default sizing (workers and accept depth
    /// scale with the logical CPU count).
    pub fn startup<S: NetSink + 'static>(sink: &Arc<S>) -> NetResult<Self> {
        Self::startup_with(sink, NetConfig::default())
    }

    pub fn startup_with<S: NetSink + 'static>(sink: &Arc<S>, config: NetConfig) -> NetResult<Self> {
        let sink: Arc<dyn NetSink> = sink.clone();
        let sink: Weak<dyn NetSink> = Arc::downgrade(&sink);
        Ok(Self { core: NetCore::startup(sink, config)? })
    }

    /// Tears the runtime down: every socket closes, the poller and all
    /// workers join. Idempotent; afterwards every call fails with
    /// [`NetError::NotStarted`].
    pub fn shutdown(&self) {
        self.core.shutdown();
    }

    /// Opens and binds a stream socket. Empty `ip` means the wildcard
    /// address, port 0 an ephemeral port.
    pub fn tcp_create(&self, ip: &str, port: u16) -> NetResult<TcpHandle> {
        self.core.tcp_create(ip, port)
    }

    pub fn tcp_destroy(&self, handle: TcpHandle) -> NetResult<()> {
        self.core.tcp_destroy(handle)
    }

    /// Starts listening and keeps a full backlog of accepts in flight.
    /// Accepted connections surface through
    /// [`NetSink::on_stream_accepted`].
    pub fn tcp_listen(&self, handle: TcpHandle) -> NetResult<()> {
        self.core.tcp_listen(handle)
    }

    /// Synchronous connect with a timeout; on success the first receive
    /// is already armed when this returns.
    pub fn tcp_connect(&self, handle: TcpHandle, ip: &str, port: u16, timeout_ms: u32) -> NetResult<()> {
        self.core.tcp_connect(handle, ip, port, timeout_ms)
    }

    /// Frames `payload` and submits the send. Accepts 1 byte up to
    /// [`MAX_STREAM_PAYLOAD`].
    pub fn tcp_send(&self, handle: TcpHandle, payload: &[u8]) -> NetResult<()> {
        self.core.tcp_send(handle, payload)
    }

    pub fn tcp_local_addr(&self, handle: TcpHandle) -> NetResult<SocketAddrV4> {
        self.core.tcp_local_addr(handle)
    }

    pub fn tcp_remote_addr(&self, handle: TcpHandle) -> NetResult<SocketAddrV4> {
        self.core.tcp_remote_addr(handle)
    }

    /// Opens and binds a datagram socket; receives are armed before this
    /// returns. Broadcast destinations are permitted.
    pub fn udp_create(&self, ip: &str, port: u16) -> NetResult<UdpHandle> {
        self.core.udp_create(ip, port)
    }

    pub fn udp_destroy(&self, handle: UdpHandle) -> NetResult<()> {
        self.core.udp_destroy(handle)
    }

    /// Submits one datagram of 1 byte up to [`MAX_DATAGRAM_PAYLOAD`].
    pub fn udp_send_to(&self, handle: UdpHandle, payload: &[u8], ip: &str, port: u16) -> NetResult<()> {
        self.core.udp_send_to(handle, payload, ip, port)
    }

    pub fn udp_local_addr(&self, handle: UdpHandle) -> NetResult<SocketAddrV4> {
        self.core.udp_local_addr(handle)
    }
}

//! Resource manager: handle tables, public operations, and the event
//! routing invoked from dispatcher workers.
//!
//! Both tables hold reference-counted endpoints behind their own mutex.
//! Lookups clone the reference and release the lock immediately, so no
//! table lock is ever held across a submission or a sink callback. A
//! completion whose handle has left its table is simply dropped; that is
//! the entire teardown contract between the port and the tables.

use std::collections::HashMap;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::thread;

use tracing::{debug, error, warn};

use crate::dispatch::Dispatcher;
use crate::error::{DatagramError, NetError, NetResult, StreamError};
use crate::frame::{FrameHeader, MAX_STREAM_PAYLOAD};
use crate::handle::{Indexer, TcpHandle, UdpHandle};
use crate::lock;
use crate::port::{AcceptOp, CompletionPort, Op, RecvFromOp, RecvOp, SendOp, SendToOp};
use crate::sink::NetSink;
use crate::sock::{Socket, parse_addr};
use crate::tcp::StreamEndpoint;
use crate::udp::{DatagramEndpoint, MAX_DATAGRAM_PAYLOAD};

fn logical_cpus() -> usize {
    thread::available_parallelism().map(|n| n.get()).unwrap_or(1)
}

/// Tuning knobs for [`Net::startup_with`](crate::Net::startup_with).
///
/// The defaults scale with the machine: worker and accept depth at twice
/// the logical CPU count, datagram receive depth at the CPU count.
#[derive(Debug, Clone, Copy, Default)]
pub struct NetConfig {
    workers: Option<usize>,
    listen_backlog: Option<usize>,
    datagram_receivers: Option<usize>,
}

impl NetConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Overrides the dispatcher pool size (default: 2 x logical CPUs).
    pub fn with_workers(mut self, workers: usize) -> Self {
        self.workers = Some(workers.max(1));
        self
    }

    /// Overrides the listen backlog, which is also the number of accept
    /// operations kept in flight per listener (default: 2 x logical CPUs).
    pub fn with_listen_backlog(mut self, backlog: usize) -> Self {
        self.listen_backlog = Some(backlog.max(1));
        self
    }

    /// Overrides the number of concurrent receives armed per datagram
    /// endpoint (default: logical CPUs).
    pub fn with_datagram_receivers(mut self, receivers: usize) -> Self {
        self.datagram_receivers = Some(receivers.max(1));
        self
    }

    fn worker_count(&self) -> usize {
        self.workers.unwrap_or_else(|| 2 * logical_cpus())
    }

    fn backlog(&self) -> usize {
        self.listen_backlog.unwrap_or_else(|| 2 * logical_cpus())
    }

    fn receiver_count(&self) -> usize {
        self.datagram_receivers.unwrap_or_else(logical_cpus)
    }
}

pub(crate) struct NetCore {
    started: AtomicBool,
    cfg: NetConfig,
    sink: Weak<dyn NetSink>,
    port: CompletionPort,
    dispatcher: Dispatcher,
    streams: Mutex<HashMap<TcpHandle, Arc<StreamEndpoint>>>,
    stream_ids: Mutex<Indexer>,
    datagrams: Mutex<HashMap<UdpHandle, Arc<DatagramEndpoint>>>,
    datagram_ids: Mutex<Indexer>,
}

impl NetCore {
    pub(crate) fn startup(sink: Weak<dyn NetSink>, cfg: NetConfig) -> NetResult<Arc<Self>> {
        let port = CompletionPort::open()?;
        let dispatcher = Dispatcher::new(cfg.worker_count());
        let core = Arc::new(Self {
            started: AtomicBool::new(true),
            cfg,
            sink,
            port,
            dispatcher,
            streams: Mutex::new(HashMap::new()),
            stream_ids: Mutex::new(Indexer::new()),
            datagrams: Mutex::new(HashMap::new()),
            datagram_ids: Mutex::new(Indexer::new()),
        });
        core.port.start()?;
        core.dispatcher.start(&core.port.completions(), &Arc::downgrade(&core))?;
        debug!(workers = core.cfg.worker_count(), "network core started");
        Ok(core)
    }

    /// Idempotent. Dropping the tables closes every socket; the poller is
    /// stopped next (aborting whatever was still parked), then the workers
    /// are sentinelled out and joined.
    pub(crate) fn shutdown(&self) {
        if !self.started.swap(false, Ordering::SeqCst) {
            return;
        }
        for (_, ep) in lock(&self.streams).drain() {
            self.port.cancel(ep.token());
        }
        for (_, ep) in lock(&self.datagrams).drain() {
            self.port.cancel(ep.token());
        }
        lock(&self.stream_ids).clear();
        lock(&self.datagram_ids).clear();
        self.port.shutdown();
        self.dispatcher.shutdown(&self.port);
        debug!("network core stopped");
    }

    fn ensure_started(&self) -> NetResult<()> {
        if self.started.load(Ordering::SeqCst) { Ok(()) } else { Err(NetError::NotStarted) }
    }

    // ---- stream operations ----

    pub(crate) fn tcp_create(&self, ip: &str, port: u16) -> NetResult<TcpHandle> {
        self.ensure_started()?;
        let addr = parse_addr(ip, port)?;
        let ep = StreamEndpoint::create(Weak::clone(&self.sink), &self.port)?;
        ep.bind(addr)?;
        self.insert_stream(Arc::new(ep))
    }

    pub(crate) fn tcp_destroy(&self, handle: TcpHandle) -> NetResult<()> {
        self.ensure_started()?;
        self.remove_stream(handle);
        Ok(())
    }

    pub(crate) fn tcp_listen(&self, handle: TcpHandle) -> NetResult<()> {
        self.ensure_started()?;
        let ep = self.get_stream(handle)?;
        let backlog = self.cfg.backlog();
        ep.listen(backlog)?;
        for _ in 0..backlog {
            ep.async_accept(&self.port, AcceptOp::new(handle, ep.sock_ref()))?;
        }
        Ok(())
    }

    pub(crate) fn tcp_connect(
        &self,
        handle: TcpHandle,
        ip: &str,
        port: u16,
        timeout_ms: u32,
    ) -> NetResult<()> {
        self.ensure_started()?;
        let addr = parse_addr(ip, port)?;
        let ep = self.get_stream(handle)?;
        ep.connect(addr, timeout_ms)?;
        ep.async_recv(&self.port, RecvOp::new(handle, ep.sock_ref()))
    }

    pub(crate) fn tcp_send(&self, handle: TcpHandle, payload: &[u8]) -> NetResult<()> {
        self.ensure_started()?;
        if payload.is_empty() || payload.len() > MAX_STREAM_PAYLOAD {
            return Err(NetError::Argument("payload size"));
        }
        let ep = self.get_stream(handle)?;
        let op = SendOp::new(
            handle,
            ep.sock_ref(),
            FrameHeader::encode(payload.len() as u32),
            payload.to_vec().into_boxed_slice(),
        );
        ep.async_send(&self.port, op)
    }

    pub(crate) fn tcp_local_addr(&self, handle: TcpHandle) -> NetResult<SocketAddrV4> {
        self.ensure_started()?;
        self.get_stream(handle)?.local_addr()
    }

    pub(crate) fn tcp_remote_addr(&self, handle: TcpHandle) -> NetResult<SocketAddrV4> {
        self.ensure_started()?;
        self.get_stream(handle)?.remote_addr()
    }

    fn insert_stream(&self, ep: Arc<StreamEndpoint>) -> NetResult<TcpHandle> {
        let id = lock(&self.stream_ids).allocate().ok_or(NetError::HandleSpace)?;
        let handle = TcpHandle::new(id);
        lock(&self.streams).insert(handle, ep);
        Ok(handle)
    }

    fn get_stream(&self, handle: TcpHandle) -> NetResult<Arc<StreamEndpoint>> {
        lock(&self.streams)
            .get(&handle)
            .cloned()
            .ok_or(NetError::UnknownHandle(handle.raw()))
    }

    /// Removing the table entry is what tears a connection down: the id
    /// returns to the indexer, parked operations are aborted, and the
    /// socket closes once the last clone of the reference drops.
    fn remove_stream(&self, handle: TcpHandle) -> Option<Arc<StreamEndpoint>> {
        let ep = lock(&self.streams).remove(&handle)?;
        lock(&self.stream_ids).release(handle.raw());
        self.port.cancel(ep.token());
        Some(ep)
    }

    // ---- datagram operations ----

    pub(crate) fn udp_create(&self, ip: &str, port: u16) -> NetResult<UdpHandle> {
        self.ensure_started()?;
        let addr = parse_addr(ip, port)?;
        let ep = DatagramEndpoint::create(Weak::clone(&self.sink), &self.port)?;
        ep.bind(addr)?;
        let ep = Arc::new(ep);
        let handle = {
            let id = lock(&self.datagram_ids).allocate().ok_or(NetError::HandleSpace)?;
            let handle = UdpHandle::new(id);
            lock(&self.datagrams).insert(handle, Arc::clone(&ep));
            handle
        };
        for _ in 0..self.cfg.receiver_count() {
            if let Err(err) = ep.async_recv_from(&self.port, RecvFromOp::new(handle, ep.sock_ref()))
            {
                self.remove_datagram(handle);
                return Err(err);
            }
        }
        Ok(handle)
    }

    pub(crate) fn udp_destroy(&self, handle: UdpHandle) -> NetResult<()> {
        self.ensure_started()?;
        self.remove_datagram(handle);
        Ok(())
    }

    pub(crate) fn udp_send_to(
        &self,
        handle: UdpHandle,
        payload: &[u8],
        ip: &str,
        port: u16,
    ) -> NetResult<()> {
        self.ensure_started()?;
        if payload.is_empty() || payload.len() > MAX_DATAGRAM_PAYLOAD {
            return Err(NetError::Argument("payload size"));
        }
        if port == 0 {
            return Err(NetError::Argument("port"));
        }
        let dest = parse_addr(ip, port)?;
        let ep = self.get_datagram(handle)?;
        let op = SendToOp::new(handle, ep.sock_ref(), payload.to_vec().into_boxed_slice(), dest);
        ep.async_send_to(&self.port, op)
    }

    pub(crate) fn udp_local_addr(&self, handle: UdpHandle) -> NetResult<SocketAddrV4> {
        self.ensure_started()?;
        self.get_datagram(handle)?.local_addr()
    }

    fn get_datagram(&self, handle: UdpHandle) -> NetResult<Arc<DatagramEndpoint>> {
        lock(&self.datagrams)
            .get(&handle)
            .cloned()
            .ok_or(NetError::UnknownHandle(handle.raw()))
    }

    fn remove_datagram(&self, handle: UdpHandle) -> Option<Arc<DatagramEndpoint>> {
        let ep = lock(&self.datagrams).remove(&handle)?;
        lock(&self.datagram_ids).release(handle.raw());
        self.port.cancel(ep.token());
        Some(ep)
    }

    // ---- completion routing (runs on dispatcher workers) ----

    pub(crate) fn route(&self, op: Op, size: usize) {
        match op {
            Op::Accept(op) => self.on_accept_done(op),
            Op::Recv(op) => self.on_recv_done(op, size),
            Op::RecvFrom(op) => self.on_recv_from_done(op, size),
            // Send completions only exist to free the buffer.
            Op::Send(_) | Op::SendTo(_) => {}
        }
    }

    fn on_accept_done(&self, mut op: AcceptOp) {
        let listener = op.listener;
        let Ok(listener_ep) = self.get_stream(listener) else {
            // Listener destroyed with accepts in flight; drop the buffer.
            return;
        };
        if let Some((sock, peer)) = op.conn.take() {
            self.admit_child(listener, &listener_ep, sock, peer);
        }
        // The listener keeps its full accept depth as long as it lives.
        op.reset();
        if let Err(err) = listener_ep.async_accept(&self.port, op) {
            warn!(%listener, ?err, "failed to re-arm accept");
            self.stream_failed(listener, StreamError::RearmAccept);
        }
    }

    fn admit_child(
        &self,
        listener: TcpHandle,
        listener_ep: &Arc<StreamEndpoint>,
        sock: Socket,
        peer: SocketAddrV4,
    ) {
        let child_ep = match StreamEndpoint::accepted(listener_ep.sink_ref(), sock, &self.port) {
            Ok(ep) => Arc::new(ep),
            Err(err) => {
                warn!(%listener, ?err, "dropping accepted connection");
                return;
            }
        };
        let child = match self.insert_stream(Arc::clone(&child_ep)) {
            Ok(handle) => handle,
            Err(err) => {
                warn!(%listener, ?err, "no handle for accepted connection");
                return;
            }
        };
        debug!(%listener, %child, %peer, "accepted");
        if let Some(sink) = listener_ep.sink() {
            sink.on_stream_accepted(listener, child);
        }
        if let Err(err) = child_ep.async_recv(&self.port, RecvOp::new(child, child_ep.sock_ref())) {
            warn!(%child, ?err, "failed to arm receive on accepted connection");
            self.stream_failed(child, StreamError::ArmChildRecv);
        }
    }

    fn on_recv_done(&self, op: RecvOp, size: usize) {
        let handle = op.handle;
        let Ok(ep) = self.get_stream(handle) else {
            return;
        };
        if size == 0 {
            // Remote half-close, or a cancelled/reset receive folded to a
            // zero-byte transfer.
            self.remove_stream(handle);
            debug!(%handle, "peer disconnected");
            if let Some(sink) = ep.sink() {
                sink.on_stream_disconnected(handle);
            }
            return;
        }
        match ep.on_recv(&op.buf[..size]) {
            Ok(packets) => {
                if let Some(sink) = ep.sink() {
                    for packet in &packets {
                        sink.on_stream_received(handle, packet.as_slice());
                    }
                }
                // Borrowed packets are gone; the scratch buffer can go
                // straight back into the next receive.
                drop(packets);
                if let Err(err) = ep.async_recv(&self.port, op) {
                    warn!(%handle, ?err, "failed to re-arm receive");
                    self.stream_failed(handle, StreamError::RearmRecv);
                }
            }
            Err(err) => {
                debug!(%handle, %err, "malformed frame");
                self.stream_failed(handle, StreamError::Malformed);
            }
        }
    }

    fn on_recv_from_done(&self, mut op: RecvFromOp, size: usize) {
        let handle = op.handle;
        let Ok(ep) = self.get_datagram(handle) else {
            return;
        };
        // A missing peer means no receive actually completed (an error
        // folded to a zero transfer); a zero-length datagram is real wire
        // traffic and is still delivered.
        if let Some(peer) = op.peer {
            if let Some(sink) = ep.sink() {
                sink.on_datagram(handle, &op.buf[..size], peer);
            }
        }
        op.reset();
        if let Err(err) = ep.async_recv_from(&self.port, op) {
            warn!(%handle, ?err, "failed to re-arm datagram receive");
            self.datagram_failed(handle, DatagramError::RearmRecv);
        }
    }

    fn stream_failed(&self, handle: TcpHandle, error: StreamError) {
        error!(%handle, code = error.code(), "stream endpoint failed");
        if let Some(ep) = self.remove_stream(handle) {
            if let Some(sink) = ep.sink() {
                sink.on_stream_error(handle, error);
            }
        }
    }

    fn datagram_failed(&self, handle: UdpHandle, error: DatagramError) {
        error!(%handle, code = error.code(), "datagram endpoint failed");
        if let Some(ep) = self.remove_datagram(handle) {
            if let Some(sink) = ep.sink() {
                sink.on_datagram_error(handle, error);
            }
        }
    }
}

impl Drop for NetCore {
    fn drop(&mut self) {
        self.shutdown();
    }
}

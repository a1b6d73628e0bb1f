//! Stream endpoint: one TCP socket plus its transport flags and framer.
//!
//! Lifecycle: created (socket open) -> bound -> listening or connected ->
//! dropped (send side shut down, fd closed). The endpoint validates state
//! transitions; actual asynchronous I/O is delegated to the completion
//! port, and frame reassembly to [`Framer`].

use std::io;
use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use mio::Token;

use crate::error::{NetError, NetResult};
use crate::frame::{FrameError, Framer, Packet};
use crate::lock;
use crate::port::{AcceptOp, CompletionPort, Op, RecvOp, SendOp};
use crate::sink::NetSink;
use crate::sock::Socket;

pub(crate) struct StreamEndpoint {
    sink: Weak<dyn NetSink>,
    sock: Arc<Socket>,
    token: Token,
    bound: AtomicBool,
    listening: AtomicBool,
    connected: AtomicBool,
    framer: Mutex<Framer>,
}

impl StreamEndpoint {
    /// Opens a fresh stream socket and associates it with the port.
    pub(crate) fn create(sink: Weak<dyn NetSink>, port: &CompletionPort) -> NetResult<Self> {
        let sock = Arc::new(Socket::stream()?);
        let token = port.register(&sock)?;
        Ok(Self {
            sink,
            sock,
            token,
            bound: AtomicBool::new(false),
            listening: AtomicBool::new(false),
            connected: AtomicBool::new(false),
            framer: Mutex::new(Framer::new()),
        })
    }

    /// Wraps a connection produced by a listener's accept completion. The
    /// child inherits the listener's sink and socket options and starts
    /// out bound and connected.
    pub(crate) fn accepted(
        sink: Weak<dyn NetSink>,
        sock: Socket,
        port: &CompletionPort,
    ) -> NetResult<Self> {
        sock.set_nodelay()?;
        let sock = Arc::new(sock);
        let token = port.register(&sock)?;
        Ok(Self {
            sink,
            sock,
            token,
            bound: AtomicBool::new(true),
            listening: AtomicBool::new(false),
            connected: AtomicBool::new(true),
            framer: Mutex::new(Framer::new()),
        })
    }

    pub(crate) fn bind(&self, addr: SocketAddrV4) -> NetResult<()> {
        if self.bound.load(Ordering::Acquire) {
            return Err(NetError::State("already bound"));
        }
        self.sock.set_nodelay()?;
        self.sock.set_reuse_address()?;
        self.sock.bind(addr)?;
        self.bound.store(true, Ordering::Release);
        Ok(())
    }

    pub(crate) fn listen(&self, backlog: usize) -> NetResult<()> {
        if !self.bound.load(Ordering::Acquire) {
            return Err(NetError::State("not bound"));
        }
        if self.listening.load(Ordering::Acquire) {
            return Err(NetError::State("already listening"));
        }
        self.sock.listen(backlog)?;
        self.listening.store(true, Ordering::Release);
        Ok(())
    }

    /// Synchronous connect with a timeout: start the nonblocking connect,
    /// wait for writability, then read back the deferred result.
    pub(crate) fn connect(&self, addr: SocketAddrV4, timeout_ms: u32) -> NetResult<()> {
        if self.connected.load(Ordering::Acquire) {
            return Err(NetError::State("already connected"));
        }
        let finished = self.sock.start_connect(addr).map_err(classify_connect)?;
        if !finished {
            if !self.sock.await_writable(timeout_ms)? {
                return Err(NetError::Timeout);
            }
            if let Some(err) = self.sock.take_error()? {
                return Err(classify_connect(err));
            }
        }
        self.connected.store(true, Ordering::Release);
        Ok(())
    }

    pub(crate) fn async_accept(&self, port: &CompletionPort, op: AcceptOp) -> NetResult<()> {
        if !self.listening.load(Ordering::Acquire) {
            return Err(NetError::State("not listening"));
        }
        port.submit(self.token, Op::Accept(op))?;
        Ok(())
    }

    pub(crate) fn async_send(&self, port: &CompletionPort, op: SendOp) -> NetResult<()> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(NetError::State("not connected"));
        }
        port.submit(self.token, Op::Send(op))?;
        Ok(())
    }

    pub(crate) fn async_recv(&self, port: &CompletionPort, op: RecvOp) -> NetResult<()> {
        if !self.connected.load(Ordering::Acquire) {
            return Err(NetError::State("not connected"));
        }
        port.submit(self.token, Op::Recv(op))?;
        Ok(())
    }

    /// Feeds one received chunk through the framer, returning the messages
    /// it completed. A `FrameError` poisons the endpoint; the caller must
    /// tear it down.
    pub(crate) fn on_recv<'a>(&self, chunk: &'a [u8]) -> Result<Vec<Packet<'a>>, FrameError> {
        let mut out = Vec::new();
        lock(&self.framer).push(chunk, &mut out)?;
        Ok(out)
    }

    pub(crate) fn local_addr(&self) -> NetResult<SocketAddrV4> {
        Ok(self.sock.local_addr()?)
    }

    pub(crate) fn remote_addr(&self) -> NetResult<SocketAddrV4> {
        Ok(self.sock.peer_addr()?)
    }

    pub(crate) fn sink(&self) -> Option<Arc<dyn NetSink>> {
        self.sink.upgrade()
    }

    pub(crate) fn sink_ref(&self) -> Weak<dyn NetSink> {
        Weak::clone(&self.sink)
    }

    pub(crate) fn sock_ref(&self) -> Weak<Socket> {
        Arc::downgrade(&self.sock)
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }
}

impl Drop for StreamEndpoint {
    fn drop(&mut self) {
        // Flush-then-close: peers observe an orderly EOF for data already
        // queued. The fd itself closes with the socket.
        let _ = self.sock.shutdown_send();
    }
}

fn classify_connect(err: io::Error) -> NetError {
    if err.kind() == io::ErrorKind::ConnectionRefused {
        NetError::Refused
    } else {
        NetError::Io(err)
    }
}

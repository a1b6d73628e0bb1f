//! Datagram endpoint. No connection state; one completion per datagram.

use std::net::SocketAddrV4;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};

use mio::Token;

use crate::error::{NetError, NetResult};
use crate::port::{CompletionPort, Op, RecvFromOp, SendToOp};
use crate::sink::NetSink;
use crate::sock::Socket;

/// Largest payload a single datagram may carry.
pub const MAX_DATAGRAM_PAYLOAD: usize = 8 * 1024;

pub(crate) struct DatagramEndpoint {
    sink: Weak<dyn NetSink>,
    sock: Arc<Socket>,
    token: Token,
    bound: AtomicBool,
}

impl DatagramEndpoint {
    pub(crate) fn create(sink: Weak<dyn NetSink>, port: &CompletionPort) -> NetResult<Self> {
        let sock = Arc::new(Socket::dgram()?);
        let token = port.register(&sock)?;
        Ok(Self { sink, sock, token, bound: AtomicBool::new(false) })
    }

    /// Binds the local address and permits broadcast destinations. An
    /// unconnected socket never surfaces ICMP port-unreachable resets on
    /// this path, so a stray peer cannot kill the endpoint.
    pub(crate) fn bind(&self, addr: SocketAddrV4) -> NetResult<()> {
        if self.bound.load(Ordering::Acquire) {
            return Err(NetError::State("already bound"));
        }
        self.sock.set_broadcast()?;
        self.sock.bind(addr)?;
        self.bound.store(true, Ordering::Release);
        Ok(())
    }

    pub(crate) fn async_send_to(&self, port: &CompletionPort, op: SendToOp) -> NetResult<()> {
        port.submit(self.token, Op::SendTo(op))?;
        Ok(())
    }

    pub(crate) fn async_recv_from(&self, port: &CompletionPort, op: RecvFromOp) -> NetResult<()> {
        if !self.bound.load(Ordering::Acquire) {
            return Err(NetError::State("not bound"));
        }
        port.submit(self.token, Op::RecvFrom(op))?;
        Ok(())
    }

    pub(crate) fn local_addr(&self) -> NetResult<SocketAddrV4> {
        Ok(self.sock.local_addr()?)
    }

    pub(crate) fn sink(&self) -> Option<Arc<dyn NetSink>> {
        self.sink.upgrade()
    }

    pub(crate) fn sock_ref(&self) -> Weak<Socket> {
        Arc::downgrade(&self.sock)
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }
}

//! Operation buffers: the typed metadata each asynchronous I/O carries
//! through the completion port.
//!
//! A buffer is owned by exactly one place at a time: the submitter builds
//! it, the port owns it while the operation is parked, and the completion
//! hands it to exactly one dispatcher worker, which either re-submits it
//! (receive and accept paths) or drops it (send paths).

use std::io::{self, IoSlice};
use std::net::SocketAddrV4;
use std::sync::Weak;

use crate::frame::HEADER_SIZE;
use crate::handle::{TcpHandle, UdpHandle};
use crate::sock::Socket;

/// Stream receive scratch size.
pub(crate) const RECV_BUF_SIZE: usize = 2 * 1024;
/// Datagram receive scratch size; one datagram per completion.
pub(crate) const DGRAM_BUF_SIZE: usize = 8 * 1024;

/// Outcome of one nonblocking attempt at an operation.
pub(crate) enum Progress {
    /// The operation finished; the transfer size (or failure) is final.
    Done(io::Result<usize>),
    /// The socket would block; park until the next readiness edge.
    Pending,
}

fn closed() -> io::Error {
    io::Error::new(io::ErrorKind::ConnectionAborted, "socket closed")
}

pub(crate) struct AcceptOp {
    /// Listener the completion is routed back to.
    pub(crate) listener: TcpHandle,
    pub(crate) io: Weak<Socket>,
    /// Filled by the port when the accept completes; reset on re-arm.
    pub(crate) conn: Option<(Socket, SocketAddrV4)>,
}

impl AcceptOp {
    pub(crate) fn new(listener: TcpHandle, io: Weak<Socket>) -> Self {
        Self { listener, io, conn: None }
    }

    pub(crate) fn reset(&mut self) {
        self.conn = None;
    }

    fn advance(&mut self) -> Progress {
        let Some(io) = self.io.upgrade() else {
            return Progress::Done(Err(closed()));
        };
        match io.accept() {
            Ok((sock, peer)) => {
                self.conn = Some((sock, peer));
                Progress::Done(Ok(0))
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Progress::Pending,
            Err(err) => Progress::Done(Err(err)),
        }
    }
}

pub(crate) struct RecvOp {
    pub(crate) handle: TcpHandle,
    pub(crate) io: Weak<Socket>,
    pub(crate) buf: Box<[u8]>,
}

impl RecvOp {
    pub(crate) fn new(handle: TcpHandle, io: Weak<Socket>) -> Self {
        Self { handle, io, buf: vec![0; RECV_BUF_SIZE].into_boxed_slice() }
    }

    fn advance(&mut self) -> Progress {
        let Some(io) = self.io.upgrade() else {
            return Progress::Done(Err(closed()));
        };
        match io.recv(&mut self.buf) {
            Ok(n) => Progress::Done(Ok(n)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Progress::Pending,
            Err(err) => Progress::Done(Err(err)),
        }
    }
}

pub(crate) struct SendOp {
    pub(crate) handle: TcpHandle,
    pub(crate) io: Weak<Socket>,
    header: [u8; HEADER_SIZE],
    payload: Box<[u8]>,
    written: usize,
}

impl SendOp {
    pub(crate) fn new(
        handle: TcpHandle,
        io: Weak<Socket>,
        header: [u8; HEADER_SIZE],
        payload: Box<[u8]>,
    ) -> Self {
        Self { handle, io, header, payload, written: 0 }
    }

    /// Gather-writes `[header, payload]`, resuming mid-frame after a short
    /// write. Completes only when the whole frame reached the kernel.
    fn advance(&mut self) -> Progress {
        let Some(io) = self.io.upgrade() else {
            return Progress::Done(Err(closed()));
        };
        let total = HEADER_SIZE + self.payload.len();
        while self.written < total {
            let res = if self.written < HEADER_SIZE {
                io.send_vectored(&[
                    IoSlice::new(&self.header[self.written..]),
                    IoSlice::new(&self.payload),
                ])
            } else {
                io.send_vectored(&[IoSlice::new(&self.payload[self.written - HEADER_SIZE..])])
            };
            match res {
                Ok(0) => return Progress::Done(Err(io::ErrorKind::WriteZero.into())),
                Ok(n) => self.written += n,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Progress::Pending,
                Err(err) => return Progress::Done(Err(err)),
            }
        }
        Progress::Done(Ok(self.payload.len()))
    }
}

pub(crate) struct RecvFromOp {
    pub(crate) handle: UdpHandle,
    pub(crate) io: Weak<Socket>,
    pub(crate) buf: Box<[u8]>,
    /// Peer address slot, filled on completion.
    pub(crate) peer: Option<SocketAddrV4>,
}

impl RecvFromOp {
    pub(crate) fn new(handle: UdpHandle, io: Weak<Socket>) -> Self {
        Self { handle, io, buf: vec![0; DGRAM_BUF_SIZE].into_boxed_slice(), peer: None }
    }

    pub(crate) fn reset(&mut self) {
        self.peer = None;
    }

    fn advance(&mut self) -> Progress {
        let Some(io) = self.io.upgrade() else {
            return Progress::Done(Err(closed()));
        };
        match io.recv_from(&mut self.buf) {
            Ok((n, peer)) => {
                self.peer = Some(peer);
                Progress::Done(Ok(n))
            }
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Progress::Pending,
            Err(err) => Progress::Done(Err(err)),
        }
    }
}

pub(crate) struct SendToOp {
    pub(crate) handle: UdpHandle,
    pub(crate) io: Weak<Socket>,
    payload: Box<[u8]>,
    dest: SocketAddrV4,
}

impl SendToOp {
    pub(crate) fn new(
        handle: UdpHandle,
        io: Weak<Socket>,
        payload: Box<[u8]>,
        dest: SocketAddrV4,
    ) -> Self {
        Self { handle, io, payload, dest }
    }

    fn advance(&mut self) -> Progress {
        let Some(io) = self.io.upgrade() else {
            return Progress::Done(Err(closed()));
        };
        match io.send_to(&self.payload, self.dest) {
            Ok(n) => Progress::Done(Ok(n)),
            Err(err) if err.kind() == io::ErrorKind::WouldBlock => Progress::Pending,
            Err(err) => Progress::Done(Err(err)),
        }
    }
}

pub(crate) enum Op {
    Accept(AcceptOp),
    Recv(RecvOp),
    Send(SendOp),
    RecvFrom(RecvFromOp),
    SendTo(SendToOp),
}

impl Op {
    /// Receive-direction operations wait on readable edges, send-direction
    /// ones on writable edges.
    pub(crate) fn is_reader(&self) -> bool {
        matches!(self, Op::Accept(_) | Op::Recv(_) | Op::RecvFrom(_))
    }

    pub(crate) fn advance(&mut self) -> Progress {
        match self {
            Op::Accept(op) => op.advance(),
            Op::Recv(op) => op.advance(),
            Op::Send(op) => op.advance(),
            Op::RecvFrom(op) => op.advance(),
            Op::SendTo(op) => op.advance(),
        }
    }

    /// Short tag for logging.
    pub(crate) fn kind(&self) -> &'static str {
        match self {
            Op::Accept(_) => "accept",
            Op::Recv(_) => "recv",
            Op::Send(_) => "send",
            Op::RecvFrom(_) => "recv_from",
            Op::SendTo(_) => "send_to",
        }
    }
}

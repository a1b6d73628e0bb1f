//! Thin RAII wrapper around a nonblocking IPv4 socket fd.
//!
//! Everything here is a direct syscall translation; policy (state checks,
//! framing, event routing) lives in the endpoint and core layers.

use std::io::{self, IoSlice};
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, RawFd};

use crate::error::{NetError, NetResult};

macro_rules! syscall {
    ($fn: ident ( $($arg: expr),* $(,)* ) ) => {{
        let res = unsafe { libc::$fn($($arg, )*) };
        if res == -1 {
            Err(std::io::Error::last_os_error())
        } else {
            Ok(res)
        }
    }};
}

/// Parses the public-API address form: dotted quad, or empty for the
/// wildcard address. Port 0 requests an ephemeral port.
pub(crate) fn parse_addr(ip: &str, port: u16) -> NetResult<SocketAddrV4> {
    let ip = if ip.is_empty() {
        Ipv4Addr::UNSPECIFIED
    } else {
        ip.parse().map_err(|_| NetError::Argument("ip"))?
    };
    Ok(SocketAddrV4::new(ip, port))
}

fn to_raw(addr: SocketAddrV4) -> libc::sockaddr_in {
    let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
    raw.sin_family = libc::AF_INET as libc::sa_family_t;
    raw.sin_port = addr.port().to_be();
    raw.sin_addr = libc::in_addr { s_addr: u32::from(*addr.ip()).to_be() };
    raw
}

fn from_raw(raw: &libc::sockaddr_in) -> SocketAddrV4 {
    SocketAddrV4::new(
        Ipv4Addr::from(u32::from_be(raw.sin_addr.s_addr)),
        u16::from_be(raw.sin_port),
    )
}

const ADDR_LEN: libc::socklen_t = mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;

#[derive(Debug)]
pub(crate) struct Socket {
    fd: RawFd,
}

impl Socket {
    fn open(ty: libc::c_int) -> io::Result<Self> {
        let fd = syscall!(socket(libc::AF_INET, ty | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC, 0))?;
        Ok(Self { fd })
    }

    pub(crate) fn stream() -> io::Result<Self> {
        Self::open(libc::SOCK_STREAM)
    }

    pub(crate) fn dgram() -> io::Result<Self> {
        Self::open(libc::SOCK_DGRAM)
    }

    pub(crate) fn bind(&self, addr: SocketAddrV4) -> io::Result<()> {
        let raw = to_raw(addr);
        syscall!(bind(self.fd, &raw as *const _ as *const libc::sockaddr, ADDR_LEN))?;
        Ok(())
    }

    pub(crate) fn listen(&self, backlog: usize) -> io::Result<()> {
        syscall!(listen(self.fd, backlog as libc::c_int))?;
        Ok(())
    }

    /// Starts a nonblocking connect. `Ok(true)` means the connect finished
    /// synchronously, `Ok(false)` that it is in progress.
    pub(crate) fn start_connect(&self, addr: SocketAddrV4) -> io::Result<bool> {
        let raw = to_raw(addr);
        match syscall!(connect(self.fd, &raw as *const _ as *const libc::sockaddr, ADDR_LEN)) {
            Ok(_) => Ok(true),
            Err(err) if err.raw_os_error() == Some(libc::EINPROGRESS) => Ok(false),
            Err(err) => Err(err),
        }
    }

    /// Waits until the socket is writable. `Ok(false)` on timeout.
    pub(crate) fn await_writable(&self, timeout_ms: u32) -> io::Result<bool> {
        let mut pfd =
            libc::pollfd { fd: self.fd, events: libc::POLLOUT, revents: 0 };
        loop {
            match syscall!(poll(&mut pfd, 1, timeout_ms as libc::c_int)) {
                Ok(0) => return Ok(false),
                Ok(_) => return Ok(true),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }

    /// Drains `SO_ERROR`, reporting a deferred connect failure if any.
    pub(crate) fn take_error(&self) -> io::Result<Option<io::Error>> {
        let mut err: libc::c_int = 0;
        let mut len = mem::size_of::<libc::c_int>() as libc::socklen_t;
        syscall!(getsockopt(
            self.fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        ))?;
        if err == 0 { Ok(None) } else { Ok(Some(io::Error::from_raw_os_error(err))) }
    }

    pub(crate) fn accept(&self) -> io::Result<(Socket, SocketAddrV4)> {
        let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = ADDR_LEN;
        let fd = syscall!(accept4(
            self.fd,
            &mut raw as *mut _ as *mut libc::sockaddr,
            &mut len,
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        ))?;
        Ok((Socket { fd }, from_raw(&raw)))
    }

    pub(crate) fn recv(&self, buf: &mut [u8]) -> io::Result<usize> {
        loop {
            match syscall!(recv(self.fd, buf.as_mut_ptr().cast(), buf.len(), 0)) {
                Ok(n) => return Ok(n as usize),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }

    /// Gather-write. `MSG_NOSIGNAL` keeps a dead peer from raising SIGPIPE.
    pub(crate) fn send_vectored(&self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        let iov: Vec<libc::iovec> = bufs
            .iter()
            .map(|b| libc::iovec { iov_base: b.as_ptr() as *mut libc::c_void, iov_len: b.len() })
            .collect();
        let mut msg: libc::msghdr = unsafe { mem::zeroed() };
        msg.msg_iov = iov.as_ptr() as *mut libc::iovec;
        msg.msg_iovlen = iov.len();
        loop {
            match syscall!(sendmsg(self.fd, &msg, libc::MSG_NOSIGNAL)) {
                Ok(n) => return Ok(n as usize),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }

    pub(crate) fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddrV4)> {
        let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
        loop {
            let mut len = ADDR_LEN;
            match syscall!(recvfrom(
                self.fd,
                buf.as_mut_ptr().cast(),
                buf.len(),
                0,
                &mut raw as *mut _ as *mut libc::sockaddr,
                &mut len,
            )) {
                Ok(n) => return Ok((n as usize, from_raw(&raw))),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }

    pub(crate) fn send_to(&self, buf: &[u8], dest: SocketAddrV4) -> io::Result<usize> {
        let raw = to_raw(dest);
        loop {
            match syscall!(sendto(
                self.fd,
                buf.as_ptr().cast(),
                buf.len(),
                libc::MSG_NOSIGNAL,
                &raw as *const _ as *const libc::sockaddr,
                ADDR_LEN,
            )) {
                Ok(n) => return Ok(n as usize),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                Err(err) => return Err(err),
            }
        }
    }

    fn set_opt(&self, level: libc::c_int, opt: libc::c_int, value: libc::c_int) -> io::Result<()> {
        syscall!(setsockopt(
            self.fd,
            level,
            opt,
            &value as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        ))?;
        Ok(())
    }

    pub(crate) fn set_nodelay(&self) -> io::Result<()> {
        self.set_opt(libc::IPPROTO_TCP, libc::TCP_NODELAY, 1)
    }

    pub(crate) fn set_reuse_address(&self) -> io::Result<()> {
        self.set_opt(libc::SOL_SOCKET, libc::SO_REUSEADDR, 1)
    }

    pub(crate) fn set_broadcast(&self) -> io::Result<()> {
        self.set_opt(libc::SOL_SOCKET, libc::SO_BROADCAST, 1)
    }

    pub(crate) fn local_addr(&self) -> io::Result<SocketAddrV4> {
        let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = ADDR_LEN;
        syscall!(getsockname(self.fd, &mut raw as *mut _ as *mut libc::sockaddr, &mut len))?;
        Ok(from_raw(&raw))
    }

    pub(crate) fn peer_addr(&self) -> io::Result<SocketAddrV4> {
        let mut raw: libc::sockaddr_in = unsafe { mem::zeroed() };
        let mut len = ADDR_LEN;
        syscall!(getpeername(self.fd, &mut raw as *mut _ as *mut libc::sockaddr, &mut len))?;
        Ok(from_raw(&raw))
    }

    pub(crate) fn shutdown_send(&self) -> io::Result<()> {
        syscall!(shutdown(self.fd, libc::SHUT_WR))?;
        Ok(())
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd
    }
}

impl Drop for Socket {
    fn drop(&mut self) {
        let _ = syscall!(close(self.fd));
    }
}

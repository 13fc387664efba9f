//! File-descriptor-owning socket with typed option setters.
//!
//! A [`Socket`] owns its fd exclusively and closes it exactly once, on drop.
//! All sockets created here are non-blocking; the async layer in
//! [`crate::net`] supplies the suspension behaviour on top.

use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use libc::c_int;

use crate::addr::SocketAddr;
use crate::error::SocketError;
use crate::sys::{self, PacketInfo};

/// Socket type selector for [`Socket::new`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Type {
    Stream,
    Datagram,
}

impl Type {
    fn raw(self) -> c_int {
        match self {
            Type::Stream => libc::SOCK_STREAM,
            Type::Datagram => libc::SOCK_DGRAM,
        }
    }
}

/// An owned, non-blocking socket file descriptor.
#[derive(Debug)]
pub struct Socket {
    fd: OwnedFd,
}

impl Socket {
    /// Creates a non-blocking socket of the family needed to reach `addr`.
    pub fn for_addr(addr: &SocketAddr, ty: Type) -> Result<Socket, SocketError> {
        let fd = sys::socket(addr.family(), ty.raw())?;
        let socket = Socket { fd };
        socket.set_nonblocking(true)?;
        socket.set_nosigpipe()?;
        Ok(socket)
    }

    pub(crate) fn from_fd(fd: OwnedFd) -> Socket {
        Socket { fd }
    }

    pub fn fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }

    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<(), SocketError> {
        sys::set_nonblocking(self.fd(), nonblocking)
    }

    pub fn set_reuseaddr(&self, on: bool) -> Result<(), SocketError> {
        sys::setsockopt(self.fd(), libc::SOL_SOCKET, libc::SO_REUSEADDR, on as c_int, "setsockopt(SO_REUSEADDR)")
    }

    pub fn set_nodelay(&self, on: bool) -> Result<(), SocketError> {
        sys::setsockopt(self.fd(), libc::IPPROTO_TCP, libc::TCP_NODELAY, on as c_int, "setsockopt(TCP_NODELAY)")
    }

    /// Suppresses `SIGPIPE` on Darwin; a no-op elsewhere (writes use
    /// `MSG_NOSIGNAL` semantics through the error path instead).
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    pub fn set_nosigpipe(&self) -> Result<(), SocketError> {
        sys::setsockopt(self.fd(), libc::SOL_SOCKET, libc::SO_NOSIGPIPE, 1 as c_int, "setsockopt(SO_NOSIGPIPE)")
    }

    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    pub fn set_nosigpipe(&self) -> Result<(), SocketError> {
        Ok(())
    }

    /// Asks the kernel for destination info on incoming datagrams
    /// (`IP_PKTINFO` family of options).
    pub fn set_recv_pktinfo(&self, ipv6: bool, on: bool) -> Result<(), SocketError> {
        let (level, name) = if ipv6 { sys::RECV_PKTINFO_V6 } else { sys::RECV_PKTINFO_V4 };
        sys::setsockopt(self.fd(), level, name, on as c_int, "setsockopt(PKTINFO)")
    }

    pub fn bind(&self, addr: &SocketAddr) -> Result<(), SocketError> {
        let (raw, len) = addr.to_raw()?;
        sys::bind(self.fd(), &raw, len)
    }

    pub fn listen(&self, backlog: i32) -> Result<(), SocketError> {
        sys::listen(self.fd(), backlog)
    }

    /// Starts a non-blocking connect; `EINPROGRESS` surfaces as
    /// `WouldBlock`-class errors for the async layer to wait on.
    pub fn connect(&self, addr: &SocketAddr) -> io::Result<()> {
        let (raw, len) = addr.to_raw().map_err(io::Error::from)?;
        sys::connect(self.fd(), &raw, len)
    }

    pub fn accept(&self) -> io::Result<(Socket, SocketAddr)> {
        let (fd, storage, len) = sys::accept(self.fd())?;
        let addr = SocketAddr::from_raw(&storage, len).map_err(io::Error::from)?;
        Ok((Socket { fd }, addr))
    }

    pub fn read(&self, buf: &mut [u8]) -> io::Result<usize> {
        sys::read(self.fd(), buf)
    }

    pub fn write(&self, buf: &[u8]) -> io::Result<usize> {
        sys::write(self.fd(), buf)
    }

    pub fn recv_from(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        let (n, storage, len) = sys::recv_from(self.fd(), buf)?;
        let addr = SocketAddr::from_raw(&storage, len).map_err(io::Error::from)?;
        Ok((n, addr))
    }

    pub fn send_to(&self, buf: &[u8], addr: &SocketAddr) -> io::Result<usize> {
        let (raw, len) = addr.to_raw().map_err(io::Error::from)?;
        sys::send_to(self.fd(), buf, &raw, len)
    }

    pub fn recv_msg(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr, Option<PacketInfo>)> {
        let raw = sys::recv_msg(self.fd(), buf)?;
        let addr = SocketAddr::from_raw(&raw.addr.0, raw.addr.1).map_err(io::Error::from)?;
        Ok((raw.len, addr, raw.pktinfo))
    }

    pub fn send_msg(&self, buf: &[u8], addr: &SocketAddr) -> io::Result<usize> {
        let (raw, len) = addr.to_raw().map_err(io::Error::from)?;
        sys::send_msg(self.fd(), buf, &raw, len)
    }

    pub fn shutdown_write(&self) -> Result<(), SocketError> {
        sys::shutdown(self.fd(), libc::SHUT_WR)
    }

    pub fn local_addr(&self) -> Result<SocketAddr, SocketError> {
        let (storage, len) = sys::getsockname(self.fd())?;
        SocketAddr::from_raw(&storage, len)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr, SocketError> {
        let (storage, len) = sys::getpeername(self.fd())?;
        SocketAddr::from_raw(&storage, len)
    }

    /// Reads and clears `SO_ERROR`; used to resolve non-blocking connects.
    pub fn take_error(&self) -> Result<Option<io::Error>, SocketError> {
        let errno = sys::getsockopt_int(self.fd(), libc::SOL_SOCKET, libc::SO_ERROR, "getsockopt(SO_ERROR)")?;
        if errno == 0 {
            Ok(None)
        } else {
            Ok(Some(io::Error::from_raw_os_error(errno)))
        }
    }
}

impl AsRawFd for Socket {
    fn as_raw_fd(&self) -> RawFd {
        self.fd.as_raw_fd()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{Ipv4Addr, SocketAddrV4};

    #[test]
    fn bind_resolves_ephemeral_port() {
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
        let socket = Socket::for_addr(&addr, Type::Stream).unwrap();
        socket.set_reuseaddr(true).unwrap();
        socket.bind(&addr).unwrap();
        socket.listen(8).unwrap();
        let local = socket.local_addr().unwrap();
        assert!(matches!(local, SocketAddr::V4(a) if a.port() != 0));
    }

    #[test]
    fn accept_on_idle_listener_would_block() {
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 0));
        let socket = Socket::for_addr(&addr, Type::Stream).unwrap();
        socket.bind(&addr).unwrap();
        socket.listen(8).unwrap();
        let err = socket.accept().unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::WouldBlock);
    }
}

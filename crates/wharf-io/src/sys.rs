//! Thin platform syscall wrappers.
//!
//! Each wrapper performs exactly one syscall and translates `-1` into an
//! error carrying the errno. Operations that participate in the readiness
//! protocol (read, write, accept, connect, recv*, send*) return
//! [`io::Result`] so the async layer can observe `EAGAIN`/`EINTR`; one-shot
//! setup operations return [`SocketError`] directly.

use std::io;
use std::mem;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};

use libc::{c_int, c_uint, c_void, socklen_t};

use crate::error::SocketError;

pub(crate) fn last_err(ctx: &'static str) -> SocketError {
    SocketError::Syscall { ctx, source: io::Error::last_os_error() }
}

fn cvt(ret: c_int, ctx: &'static str) -> Result<c_int, SocketError> {
    if ret < 0 {
        Err(last_err(ctx))
    } else {
        Ok(ret)
    }
}

fn cvt_io(ret: isize) -> io::Result<usize> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(ret as usize)
    }
}

pub(crate) fn socket(family: c_int, ty: c_int) -> Result<OwnedFd, SocketError> {
    let fd = unsafe { libc::socket(family, ty, 0) };
    if fd < 0 {
        return Err(last_err("socket"));
    }
    let fd = unsafe { OwnedFd::from_raw_fd(fd) };
    set_cloexec(fd.as_raw_fd())?;
    Ok(fd)
}

pub(crate) fn socketpair() -> Result<(OwnedFd, OwnedFd), SocketError> {
    let mut fds = [0 as c_int; 2];
    cvt(unsafe { libc::socketpair(libc::AF_UNIX, libc::SOCK_STREAM, 0, fds.as_mut_ptr()) }, "socketpair")?;
    let a = unsafe { OwnedFd::from_raw_fd(fds[0]) };
    let b = unsafe { OwnedFd::from_raw_fd(fds[1]) };
    for fd in [a.as_raw_fd(), b.as_raw_fd()] {
        set_cloexec(fd)?;
        set_nonblocking(fd, true)?;
    }
    Ok((a, b))
}

pub(crate) fn set_cloexec(fd: RawFd) -> Result<(), SocketError> {
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFD, libc::FD_CLOEXEC) }, "fcntl(F_SETFD)")?;
    Ok(())
}

pub(crate) fn set_nonblocking(fd: RawFd, nonblocking: bool) -> Result<(), SocketError> {
    let flags = cvt(unsafe { libc::fcntl(fd, libc::F_GETFL) }, "fcntl(F_GETFL)")?;
    let flags = if nonblocking { flags | libc::O_NONBLOCK } else { flags & !libc::O_NONBLOCK };
    cvt(unsafe { libc::fcntl(fd, libc::F_SETFL, flags) }, "fcntl(F_SETFL)")?;
    Ok(())
}

pub(crate) fn setsockopt<T>(fd: RawFd, level: c_int, name: c_int, value: T, ctx: &'static str) -> Result<(), SocketError> {
    let ret = unsafe {
        libc::setsockopt(fd, level, name, &value as *const T as *const c_void, mem::size_of::<T>() as socklen_t)
    };
    cvt(ret, ctx)?;
    Ok(())
}

pub(crate) fn getsockopt_int(fd: RawFd, level: c_int, name: c_int, ctx: &'static str) -> Result<c_int, SocketError> {
    let mut value: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;
    let ret = unsafe { libc::getsockopt(fd, level, name, &mut value as *mut c_int as *mut c_void, &mut len) };
    cvt(ret, ctx)?;
    Ok(value)
}

pub(crate) fn bind(fd: RawFd, addr: &libc::sockaddr_storage, len: socklen_t) -> Result<(), SocketError> {
    cvt(unsafe { libc::bind(fd, addr as *const _ as *const libc::sockaddr, len) }, "bind")?;
    Ok(())
}

pub(crate) fn listen(fd: RawFd, backlog: c_int) -> Result<(), SocketError> {
    cvt(unsafe { libc::listen(fd, backlog) }, "listen")?;
    Ok(())
}

pub(crate) fn connect(fd: RawFd, addr: &libc::sockaddr_storage, len: socklen_t) -> io::Result<()> {
    let ret = unsafe { libc::connect(fd, addr as *const _ as *const libc::sockaddr, len) };
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

pub(crate) fn accept(fd: RawFd) -> io::Result<(OwnedFd, libc::sockaddr_storage, socklen_t)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    let ret = unsafe { libc::accept(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) };
    if ret < 0 {
        return Err(io::Error::last_os_error());
    }
    let accepted = unsafe { OwnedFd::from_raw_fd(ret) };
    set_cloexec(accepted.as_raw_fd()).map_err(io::Error::from)?;
    set_nonblocking(accepted.as_raw_fd(), true).map_err(io::Error::from)?;
    Ok((accepted, storage, len))
}

pub(crate) fn read(fd: RawFd, buf: &mut [u8]) -> io::Result<usize> {
    cvt_io(unsafe { libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len()) })
}

pub(crate) fn write(fd: RawFd, buf: &[u8]) -> io::Result<usize> {
    cvt_io(unsafe { libc::write(fd, buf.as_ptr() as *const c_void, buf.len()) })
}

pub(crate) fn shutdown(fd: RawFd, how: c_int) -> Result<(), SocketError> {
    cvt(unsafe { libc::shutdown(fd, how) }, "shutdown")?;
    Ok(())
}

pub(crate) fn getsockname(fd: RawFd) -> Result<(libc::sockaddr_storage, socklen_t), SocketError> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    cvt(unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) }, "getsockname")?;
    Ok((storage, len))
}

pub(crate) fn getpeername(fd: RawFd) -> Result<(libc::sockaddr_storage, socklen_t), SocketError> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    cvt(unsafe { libc::getpeername(fd, &mut storage as *mut _ as *mut libc::sockaddr, &mut len) }, "getpeername")?;
    Ok((storage, len))
}

pub(crate) fn recv_from(fd: RawFd, buf: &mut [u8]) -> io::Result<(usize, libc::sockaddr_storage, socklen_t)> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    let ret = unsafe {
        libc::recvfrom(
            fd,
            buf.as_mut_ptr() as *mut c_void,
            buf.len(),
            0,
            &mut storage as *mut _ as *mut libc::sockaddr,
            &mut len,
        )
    };
    let n = cvt_io(ret)?;
    Ok((n, storage, len))
}

pub(crate) fn send_to(fd: RawFd, buf: &[u8], addr: &libc::sockaddr_storage, len: socklen_t) -> io::Result<usize> {
    let ret = unsafe {
        libc::sendto(fd, buf.as_ptr() as *const c_void, buf.len(), 0, addr as *const _ as *const libc::sockaddr, len)
    };
    cvt_io(ret)
}

pub(crate) fn unlink(path: &std::ffi::CStr) -> Result<(), SocketError> {
    cvt(unsafe { libc::unlink(path.as_ptr()) }, "unlink")?;
    Ok(())
}

/// Destination information recovered from `IP_PKTINFO` / `IPV6_PKTINFO`
/// control messages on a datagram socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketInfo {
    /// The local address the datagram was sent to.
    pub destination: IpAddr,
    /// Index of the interface the datagram arrived on.
    pub interface: u32,
}

// The pktinfo payload layouts are stable ABI; declaring them here avoids
// relying on libc exposing them for every target.
#[repr(C)]
struct InPktinfo {
    ipi_ifindex: c_int,
    ipi_spec_dst: libc::in_addr,
    ipi_addr: libc::in_addr,
}

#[repr(C)]
struct In6Pktinfo {
    ipi6_addr: libc::in6_addr,
    ipi6_ifindex: c_uint,
}

#[cfg(target_os = "linux")]
pub(crate) const RECV_PKTINFO_V4: (c_int, c_int) = (libc::IPPROTO_IP, libc::IP_PKTINFO);
#[cfg(not(target_os = "linux"))]
pub(crate) const RECV_PKTINFO_V4: (c_int, c_int) = (libc::IPPROTO_IP, 26); // IP_RECVPKTINFO

pub(crate) const RECV_PKTINFO_V6: (c_int, c_int) = (libc::IPPROTO_IPV6, libc::IPV6_RECVPKTINFO);

#[cfg(target_os = "linux")]
const CMSG_PKTINFO_V4: c_int = libc::IP_PKTINFO;
#[cfg(not(target_os = "linux"))]
const CMSG_PKTINFO_V4: c_int = 26;

const CMSG_PKTINFO_V6: c_int = libc::IPV6_PKTINFO;

pub(crate) struct RawMessage {
    pub len: usize,
    pub addr: (libc::sockaddr_storage, socklen_t),
    pub pktinfo: Option<PacketInfo>,
}

pub(crate) fn recv_msg(fd: RawFd, buf: &mut [u8]) -> io::Result<RawMessage> {
    let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
    let mut iov = libc::iovec { iov_base: buf.as_mut_ptr() as *mut c_void, iov_len: buf.len() };
    // u64-aligned control buffer; cmsghdr requires at least pointer alignment
    let mut control = [0u64; 32];

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = &mut storage as *mut _ as *mut c_void;
    msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as socklen_t;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    msg.msg_control = control.as_mut_ptr() as *mut c_void;
    msg.msg_controllen = mem::size_of_val(&control) as _;

    let n = cvt_io(unsafe { libc::recvmsg(fd, &mut msg, 0) })?;

    let mut pktinfo = None;
    unsafe {
        let mut cmsg = libc::CMSG_FIRSTHDR(&msg);
        while !cmsg.is_null() {
            let level = (*cmsg).cmsg_level;
            let ty = (*cmsg).cmsg_type;
            if level == libc::IPPROTO_IP && ty == CMSG_PKTINFO_V4 {
                let info = (libc::CMSG_DATA(cmsg) as *const InPktinfo).read_unaligned();
                pktinfo = Some(PacketInfo {
                    destination: IpAddr::V4(Ipv4Addr::from(u32::from_be(info.ipi_addr.s_addr))),
                    interface: info.ipi_ifindex as u32,
                });
            } else if level == libc::IPPROTO_IPV6 && ty == CMSG_PKTINFO_V6 {
                let info = (libc::CMSG_DATA(cmsg) as *const In6Pktinfo).read_unaligned();
                pktinfo = Some(PacketInfo {
                    destination: IpAddr::V6(Ipv6Addr::from(info.ipi6_addr.s6_addr)),
                    interface: info.ipi6_ifindex,
                });
            }
            cmsg = libc::CMSG_NXTHDR(&msg, cmsg);
        }
    }

    Ok(RawMessage { len: n, addr: (storage, msg.msg_namelen), pktinfo })
}

pub(crate) fn send_msg(fd: RawFd, buf: &[u8], addr: &libc::sockaddr_storage, len: socklen_t) -> io::Result<usize> {
    let mut iov = libc::iovec { iov_base: buf.as_ptr() as *mut c_void, iov_len: buf.len() };
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = addr as *const _ as *mut c_void;
    msg.msg_namelen = len;
    msg.msg_iov = &mut iov;
    msg.msg_iovlen = 1;
    cvt_io(unsafe { libc::sendmsg(fd, &msg, 0) })
}

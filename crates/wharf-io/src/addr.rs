//! Socket address model.
//!
//! Three address families are supported: IPv4, IPv6 and UNIX-domain paths.
//! The IP variants reuse the std address types; the UNIX variant validates
//! the path against the platform `sun_path` limit (104 bytes on the BSDs,
//! 108 on Linux) when it is encoded.

use std::fmt;
use std::mem;
use std::net::{self, Ipv4Addr, Ipv6Addr, SocketAddrV4, SocketAddrV6};
use std::path::{Path, PathBuf};

use libc::socklen_t;

use crate::error::SocketError;

/// A socket address: IPv4, IPv6 or a UNIX-domain path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SocketAddr {
    V4(SocketAddrV4),
    V6(SocketAddrV6),
    Unix(PathBuf),
}

impl SocketAddr {
    pub fn unix<P: AsRef<Path>>(path: P) -> Self {
        Self::Unix(path.as_ref().to_path_buf())
    }

    /// The address family constant matching this variant.
    pub(crate) fn family(&self) -> libc::c_int {
        match self {
            Self::V4(_) => libc::AF_INET,
            Self::V6(_) => libc::AF_INET6,
            Self::Unix(_) => libc::AF_UNIX,
        }
    }

    pub fn is_unix(&self) -> bool {
        matches!(self, Self::Unix(_))
    }

    /// The port for IP addresses; `None` for UNIX addresses.
    pub fn port(&self) -> Option<u16> {
        match self {
            Self::V4(a) => Some(a.port()),
            Self::V6(a) => Some(a.port()),
            Self::Unix(_) => None,
        }
    }

    /// Encodes into a `sockaddr_storage` suitable for bind/connect/sendto.
    pub(crate) fn to_raw(&self) -> Result<(libc::sockaddr_storage, socklen_t), SocketError> {
        let mut storage: libc::sockaddr_storage = unsafe { mem::zeroed() };
        let len = match self {
            Self::V4(addr) => {
                let sin = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in;
                unsafe {
                    (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                    (*sin).sin_port = addr.port().to_be();
                    (*sin).sin_addr = libc::in_addr { s_addr: u32::from(*addr.ip()).to_be() };
                }
                mem::size_of::<libc::sockaddr_in>()
            }
            Self::V6(addr) => {
                let sin6 = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_in6;
                let mut ip: libc::in6_addr = unsafe { mem::zeroed() };
                ip.s6_addr = addr.ip().octets();
                unsafe {
                    (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                    (*sin6).sin6_port = addr.port().to_be();
                    (*sin6).sin6_addr = ip;
                    (*sin6).sin6_flowinfo = addr.flowinfo();
                    (*sin6).sin6_scope_id = addr.scope_id();
                }
                mem::size_of::<libc::sockaddr_in6>()
            }
            Self::Unix(path) => {
                let sun = &mut storage as *mut libc::sockaddr_storage as *mut libc::sockaddr_un;
                let bytes = path_bytes(path)?;
                let sun_path_len = unsafe { mem::size_of_val(&(*sun).sun_path) };
                if bytes.len() >= sun_path_len {
                    return Err(SocketError::unsupported_address(format!(
                        "unix path of {} bytes exceeds the {} byte limit",
                        bytes.len(),
                        sun_path_len - 1
                    )));
                }
                if bytes.contains(&0) {
                    return Err(SocketError::unsupported_address("unix path contains a NUL byte"));
                }
                unsafe {
                    (*sun).sun_family = libc::AF_UNIX as libc::sa_family_t;
                    for (dst, src) in (*sun).sun_path.iter_mut().zip(bytes.iter()) {
                        *dst = *src as libc::c_char;
                    }
                }
                path_offset() + bytes.len() + 1
            }
        };
        Ok((storage, len as socklen_t))
    }

    /// Decodes a kernel-filled `sockaddr_storage`.
    pub(crate) fn from_raw(storage: &libc::sockaddr_storage, len: socklen_t) -> Result<Self, SocketError> {
        match storage.ss_family as libc::c_int {
            libc::AF_INET => {
                let sin = unsafe { &*(storage as *const _ as *const libc::sockaddr_in) };
                let ip = Ipv4Addr::from(u32::from_be(sin.sin_addr.s_addr));
                Ok(Self::V4(SocketAddrV4::new(ip, u16::from_be(sin.sin_port))))
            }
            libc::AF_INET6 => {
                let sin6 = unsafe { &*(storage as *const _ as *const libc::sockaddr_in6) };
                let ip = Ipv6Addr::from(sin6.sin6_addr.s6_addr);
                Ok(Self::V6(SocketAddrV6::new(
                    ip,
                    u16::from_be(sin6.sin6_port),
                    sin6.sin6_flowinfo,
                    sin6.sin6_scope_id,
                )))
            }
            libc::AF_UNIX => {
                let sun = unsafe { &*(storage as *const _ as *const libc::sockaddr_un) };
                let offset = path_offset();
                let path_len = (len as usize).saturating_sub(offset).min(sun.sun_path.len());
                let bytes: Vec<u8> = sun.sun_path[..path_len]
                    .iter()
                    .map(|&c| c as u8)
                    .take_while(|&c| c != 0)
                    .collect();
                Ok(Self::Unix(bytes_to_path(bytes)))
            }
            family => Err(SocketError::unsupported_address(format!("address family {family}"))),
        }
    }
}

fn path_offset() -> usize {
    let sun: libc::sockaddr_un = unsafe { mem::zeroed() };
    let base = &sun as *const _ as usize;
    let path = &sun.sun_path as *const _ as usize;
    path - base
}

#[cfg(unix)]
fn path_bytes(path: &Path) -> Result<&[u8], SocketError> {
    use std::os::unix::ffi::OsStrExt;
    Ok(path.as_os_str().as_bytes())
}

#[cfg(unix)]
fn bytes_to_path(bytes: Vec<u8>) -> PathBuf {
    use std::os::unix::ffi::OsStringExt;
    PathBuf::from(std::ffi::OsString::from_vec(bytes))
}

impl From<net::SocketAddr> for SocketAddr {
    fn from(addr: net::SocketAddr) -> Self {
        match addr {
            net::SocketAddr::V4(a) => Self::V4(a),
            net::SocketAddr::V6(a) => Self::V6(a),
        }
    }
}

impl From<SocketAddrV4> for SocketAddr {
    fn from(addr: SocketAddrV4) -> Self {
        Self::V4(addr)
    }
}

impl From<SocketAddrV6> for SocketAddr {
    fn from(addr: SocketAddrV6) -> Self {
        Self::V6(addr)
    }
}

impl fmt::Display for SocketAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::V4(a) => a.fmt(f),
            Self::V6(a) => a.fmt(f),
            Self::Unix(p) => write!(f, "unix:{}", p.display()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn v4_round_trip() {
        let addr = SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::new(192, 168, 1, 7), 8080));
        let (raw, len) = addr.to_raw().unwrap();
        assert_eq!(SocketAddr::from_raw(&raw, len).unwrap(), addr);
    }

    #[test]
    fn v6_round_trip_keeps_scope() {
        let ip = Ipv6Addr::new(0xfe80, 0, 0, 0, 0, 0, 0, 1);
        let addr = SocketAddr::V6(SocketAddrV6::new(ip, 443, 0, 3));
        let (raw, len) = addr.to_raw().unwrap();
        assert_eq!(SocketAddr::from_raw(&raw, len).unwrap(), addr);
    }

    #[test]
    fn unix_round_trip() {
        let addr = SocketAddr::unix("/tmp/wharf-test.sock");
        let (raw, len) = addr.to_raw().unwrap();
        assert_eq!(SocketAddr::from_raw(&raw, len).unwrap(), addr);
    }

    #[test]
    fn unix_path_limit_is_enforced() {
        let long = "x".repeat(200);
        let err = SocketAddr::unix(&long).to_raw().unwrap_err();
        assert!(matches!(err, SocketError::UnsupportedAddress { .. }));
    }

    #[test]
    fn display_formats() {
        assert_eq!(SocketAddr::V4(SocketAddrV4::new(Ipv4Addr::LOCALHOST, 80)).to_string(), "127.0.0.1:80");
        assert_eq!(SocketAddr::unix("/run/app.sock").to_string(), "unix:/run/app.sock");
    }
}

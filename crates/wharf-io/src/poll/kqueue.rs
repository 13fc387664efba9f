//! kqueue backend (Darwin, FreeBSD).
//!
//! Each suspension registers an `EV_ADD | EV_ONESHOT` kevent for the
//! requested filter(s); re-adding an already armed filter just re-arms it.

use std::io;
use std::mem;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;
use std::time::Duration;

use crate::error::SocketError;
use crate::poll::{Event, Fired, Interest};
use crate::sys;

const MAX_EVENTS: usize = 256;

pub(crate) struct Selector {
    kq: OwnedFd,
    events: Vec<libc::kevent>,
}

impl Selector {
    pub(crate) fn new() -> Result<Selector, SocketError> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(sys::last_err("kqueue"));
        }
        Ok(Selector { kq: unsafe { OwnedFd::from_raw_fd(kq) }, events: Vec::with_capacity(MAX_EVENTS) })
    }

    /// The wake pipe stays armed with `EV_CLEAR` instead of oneshot.
    pub(crate) fn register_waker(&mut self, fd: RawFd) -> Result<(), SocketError> {
        let change = kevent(fd, libc::EVFILT_READ as i32, (libc::EV_ADD | libc::EV_CLEAR) as i32);
        self.change(&[change], "kevent(ADD waker)")
    }

    pub(crate) fn arm(&mut self, fd: RawFd, interest: Interest) -> Result<(), SocketError> {
        let mut changes: [libc::kevent; 2] = unsafe { mem::zeroed() };
        let mut n = 0;
        if interest.is_readable() {
            changes[n] = kevent(fd, libc::EVFILT_READ as i32, (libc::EV_ADD | libc::EV_ONESHOT) as i32);
            n += 1;
        }
        if interest.is_writable() {
            changes[n] = kevent(fd, libc::EVFILT_WRITE as i32, (libc::EV_ADD | libc::EV_ONESHOT) as i32);
            n += 1;
        }
        self.change(&changes[..n], "kevent(ADD)")
    }

    pub(crate) fn forget(&mut self, fd: RawFd) {
        // oneshot filters disappear on fire; deleting may find nothing
        let changes = [
            kevent(fd, libc::EVFILT_READ as i32, libc::EV_DELETE as i32),
            kevent(fd, libc::EVFILT_WRITE as i32, libc::EV_DELETE as i32),
        ];
        for change in changes {
            let _ = self.change(&[change], "kevent(DELETE)");
        }
    }

    fn change(&mut self, changes: &[libc::kevent], ctx: &'static str) -> Result<(), SocketError> {
        if changes.is_empty() {
            return Ok(());
        }
        let ret = unsafe {
            libc::kevent(self.kq.as_raw_fd(), changes.as_ptr(), changes.len() as _, ptr::null_mut(), 0, ptr::null())
        };
        if ret < 0 {
            return Err(sys::last_err(ctx));
        }
        Ok(())
    }

    pub(crate) fn wait(&mut self, timeout: Option<Duration>, fired: &mut Vec<Fired>) -> Result<(), SocketError> {
        let timespec = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs() as _,
            tv_nsec: d.subsec_nanos() as _,
        });
        let timespec_ptr = timespec.as_ref().map(|t| t as *const _).unwrap_or(ptr::null());

        self.events.clear();
        self.events.resize(MAX_EVENTS, unsafe { mem::zeroed() });

        let count = unsafe {
            libc::kevent(
                self.kq.as_raw_fd(),
                ptr::null(),
                0,
                self.events.as_mut_ptr(),
                MAX_EVENTS as _,
                timespec_ptr,
            )
        };
        if count < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(SocketError::syscall("kevent(wait)", err));
        }

        for event in &self.events[..count as usize] {
            let fd = event.ident as RawFd;
            let eof = event.flags & (libc::EV_EOF as u16 as _) != 0;
            let error = if event.flags & (libc::EV_ERROR as u16 as _) != 0 {
                Some(event.data as i32)
            } else {
                None
            };
            fired.push(Fired {
                fd,
                event: Event {
                    readable: event.filter == libc::EVFILT_READ as _,
                    writable: event.filter == libc::EVFILT_WRITE as _,
                    eof,
                },
                error,
            });
        }
        Ok(())
    }
}

fn kevent(fd: RawFd, filter: i32, flags: i32) -> libc::kevent {
    let mut event: libc::kevent = unsafe { mem::zeroed() };
    event.ident = fd as usize;
    event.filter = filter as _;
    event.flags = flags as _;
    event
}

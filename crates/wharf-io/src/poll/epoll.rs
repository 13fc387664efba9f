//! epoll backend (Linux).
//!
//! Each fd is added once, then re-armed per suspension with `EPOLL_CTL_MOD`
//! carrying the union of current interests plus `EPOLLET | EPOLLONESHOT`.

use std::collections::HashSet;
use std::io;
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::time::Duration;

use crate::error::SocketError;
use crate::poll::{Event, Fired, Interest};
use crate::sys;

const MAX_EVENTS: usize = 256;

pub(crate) struct Selector {
    epfd: OwnedFd,
    added: HashSet<RawFd>,
    events: Vec<libc::epoll_event>,
}

impl Selector {
    pub(crate) fn new() -> Result<Selector, SocketError> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(sys::last_err("epoll_create1"));
        }
        Ok(Selector {
            epfd: unsafe { OwnedFd::from_raw_fd(epfd) },
            added: HashSet::new(),
            events: Vec::with_capacity(MAX_EVENTS),
        })
    }

    /// The wake pipe stays registered level-triggered for the lifetime of
    /// the pool.
    pub(crate) fn register_waker(&mut self, fd: RawFd) -> Result<(), SocketError> {
        let mut event = libc::epoll_event { events: libc::EPOLLIN as u32, u64: fd as u64 };
        let ret = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_ADD, fd, &mut event) };
        if ret < 0 {
            return Err(sys::last_err("epoll_ctl(ADD waker)"));
        }
        Ok(())
    }

    pub(crate) fn arm(&mut self, fd: RawFd, interest: Interest) -> Result<(), SocketError> {
        let mut events = (libc::EPOLLET | libc::EPOLLONESHOT) as u32;
        if interest.is_readable() {
            events |= (libc::EPOLLIN | libc::EPOLLRDHUP) as u32;
        }
        if interest.is_writable() {
            events |= libc::EPOLLOUT as u32;
        }
        let mut event = libc::epoll_event { events, u64: fd as u64 };

        let op = if self.added.contains(&fd) { libc::EPOLL_CTL_MOD } else { libc::EPOLL_CTL_ADD };
        let ret = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, &mut event) };
        if ret < 0 {
            let err = io::Error::last_os_error();
            // the added-set can go stale across close/reopen of the same fd
            let retry_op = match err.raw_os_error() {
                Some(libc::ENOENT) => libc::EPOLL_CTL_ADD,
                Some(libc::EEXIST) => libc::EPOLL_CTL_MOD,
                _ => return Err(SocketError::syscall("epoll_ctl", err)),
            };
            let ret = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), retry_op, fd, &mut event) };
            if ret < 0 {
                return Err(sys::last_err("epoll_ctl"));
            }
        }
        self.added.insert(fd);
        Ok(())
    }

    pub(crate) fn forget(&mut self, fd: RawFd) {
        if self.added.remove(&fd) {
            unsafe {
                libc::epoll_ctl(self.epfd.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, std::ptr::null_mut());
            }
        }
    }

    pub(crate) fn wait(&mut self, timeout: Option<Duration>, fired: &mut Vec<Fired>) -> Result<(), SocketError> {
        let timeout_ms = match timeout {
            None => -1,
            Some(d) => duration_to_ms(d),
        };

        self.events.clear();
        self.events.resize(MAX_EVENTS, libc::epoll_event { events: 0, u64: 0 });

        let count = unsafe {
            libc::epoll_wait(self.epfd.as_raw_fd(), self.events.as_mut_ptr(), MAX_EVENTS as i32, timeout_ms)
        };
        if count < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(SocketError::syscall("epoll_wait", err));
        }

        for event in &self.events[..count as usize] {
            let flags = event.events;
            let hup = flags & (libc::EPOLLHUP | libc::EPOLLERR) as u32 != 0;
            fired.push(Fired {
                fd: event.u64 as RawFd,
                event: Event {
                    readable: flags & libc::EPOLLIN as u32 != 0 || hup,
                    writable: flags & libc::EPOLLOUT as u32 != 0 || hup,
                    eof: flags & (libc::EPOLLRDHUP | libc::EPOLLHUP) as u32 != 0,
                },
                // errno surfaces when the owner retries the syscall
                error: None,
            });
        }
        Ok(())
    }
}

fn duration_to_ms(d: Duration) -> i32 {
    // round up so sub-millisecond timeouts still sleep
    let ms = d.as_millis();
    let ms = if d.subsec_nanos() % 1_000_000 != 0 { ms + 1 } else { ms };
    i32::try_from(ms).unwrap_or(i32::MAX)
}

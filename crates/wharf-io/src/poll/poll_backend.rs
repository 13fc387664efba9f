//! Portable `poll(2)` fallback.
//!
//! The pollfd array is rebuilt from the current interest set on every wait;
//! O(N) per cycle is accepted for the portability. Without an explicit
//! timeout the wait caps at 100 ms so interest changes are picked up.

use std::collections::HashMap;
use std::io;
use std::os::fd::RawFd;
use std::time::Duration;

use crate::error::SocketError;
use crate::poll::{Event, Fired, Interest};

const DEFAULT_TIMEOUT_MS: i32 = 100;

pub(crate) struct Selector {
    interest: HashMap<RawFd, Interest>,
    waker_fd: RawFd,
    pollfds: Vec<libc::pollfd>,
}

impl Selector {
    pub(crate) fn new() -> Result<Selector, SocketError> {
        Ok(Selector { interest: HashMap::new(), waker_fd: -1, pollfds: Vec::new() })
    }

    pub(crate) fn register_waker(&mut self, fd: RawFd) -> Result<(), SocketError> {
        self.waker_fd = fd;
        Ok(())
    }

    pub(crate) fn arm(&mut self, fd: RawFd, interest: Interest) -> Result<(), SocketError> {
        self.interest.insert(fd, interest);
        Ok(())
    }

    pub(crate) fn forget(&mut self, fd: RawFd) {
        self.interest.remove(&fd);
    }

    pub(crate) fn wait(&mut self, timeout: Option<Duration>, fired: &mut Vec<Fired>) -> Result<(), SocketError> {
        self.pollfds.clear();
        self.pollfds.push(libc::pollfd { fd: self.waker_fd, events: libc::POLLIN, revents: 0 });
        for (&fd, &interest) in &self.interest {
            let mut events = 0;
            if interest.is_readable() {
                events |= libc::POLLIN;
            }
            if interest.is_writable() {
                events |= libc::POLLOUT;
            }
            self.pollfds.push(libc::pollfd { fd, events, revents: 0 });
        }

        let timeout_ms = timeout
            .map(|d| i32::try_from(d.as_millis().max(1)).unwrap_or(i32::MAX))
            .unwrap_or(DEFAULT_TIMEOUT_MS);

        let count = unsafe { libc::poll(self.pollfds.as_mut_ptr(), self.pollfds.len() as libc::nfds_t, timeout_ms) };
        if count < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(SocketError::syscall("poll", err));
        }

        for pollfd in &self.pollfds {
            if pollfd.revents == 0 {
                continue;
            }
            let hup = pollfd.revents & (libc::POLLHUP | libc::POLLERR) != 0;
            let event = Event {
                readable: pollfd.revents & libc::POLLIN != 0 || hup,
                writable: pollfd.revents & libc::POLLOUT != 0 || hup,
                eof: pollfd.revents & libc::POLLHUP != 0,
            };
            fired.push(Fired { fd: pollfd.fd, event, error: None });
            if pollfd.fd != self.waker_fd {
                // emulate oneshot: clear the fired directions
                if let Some(interest) = self.interest.get_mut(&pollfd.fd) {
                    let mut remaining = None;
                    if interest.is_readable() && !event.readable && !event.eof {
                        remaining = Some(Interest::READABLE);
                    }
                    if interest.is_writable() && !event.writable && !event.eof {
                        remaining = Some(match remaining {
                            None => Interest::WRITABLE,
                            Some(i) => i.add(Interest::WRITABLE),
                        });
                    }
                    match remaining {
                        Some(i) => *interest = i,
                        None => {
                            self.interest.remove(&pollfd.fd);
                        }
                    }
                }
            }
        }
        Ok(())
    }
}

//! The polling socket pool.
//!
//! The pool multiplexes non-blocking file descriptors over the best kernel
//! primitive available: kqueue on the BSDs and Darwin, epoll on Linux, and
//! plain `poll(2)` everywhere else. Tasks suspend on an fd through
//! [`PoolHandle::readiness`] (or the lower-level `poll_suspend` used by the
//! async sockets) and are resumed when the kernel reports the interest, the
//! fd is closed, or the pool itself is dropped.
//!
//! Invariants kept here:
//! - at most one waiter per `(fd, direction)` pair at a time;
//! - a registration is removed on wakeup, on cancellation (dropping the
//!   [`Readiness`] future) and on fd close;
//! - a waiter is only resumed for events inside its interest mask, with the
//!   spec'd exception that read-side EOF also wakes a pending writer;
//! - dropping the pool completes every pending waiter with
//!   [`SocketError::PoolClosed`].

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::future::Future;
use std::io;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};
use std::pin::Pin;
use std::rc::Rc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::task::{Context, Poll, Waker};
use std::time::Duration;

use tracing::trace;

use crate::error::SocketError;
use crate::sys;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
#[cfg(any(target_os = "linux", target_os = "android"))]
use epoll::Selector;

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
mod kqueue;
#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
use kqueue::Selector;

#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd"
)))]
mod poll_backend;
#[cfg(not(any(
    target_os = "linux",
    target_os = "android",
    target_os = "macos",
    target_os = "ios",
    target_os = "freebsd"
)))]
use poll_backend::Selector;

/// Readiness interest for a suspension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u8);

impl Interest {
    pub const READABLE: Interest = Interest(0b01);
    pub const WRITABLE: Interest = Interest(0b10);

    pub const fn add(self, other: Interest) -> Interest {
        Interest(self.0 | other.0)
    }

    pub const fn is_readable(self) -> bool {
        self.0 & Self::READABLE.0 != 0
    }

    pub const fn is_writable(self) -> bool {
        self.0 & Self::WRITABLE.0 != 0
    }
}

/// One side of the readiness protocol; the internal registration key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub(crate) enum Direction {
    Read,
    Write,
}

impl Direction {
    fn interest(self) -> Interest {
        match self {
            Direction::Read => Interest::READABLE,
            Direction::Write => Interest::WRITABLE,
        }
    }
}

/// What the kernel reported for a resumed suspension.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Event {
    pub readable: bool,
    pub writable: bool,
    /// Peer closed its sending side (kqueue `EV_EOF`, epoll `EPOLLRDHUP`).
    pub eof: bool,
}

/// Event plus the fd it fired on; produced by the selector backends.
#[derive(Debug, Clone, Copy)]
pub(crate) struct Fired {
    pub fd: RawFd,
    pub event: Event,
    /// Errno reported by the kernel alongside the event (kqueue `EV_ERROR`).
    pub error: Option<i32>,
}

#[derive(Debug, Clone, Copy)]
pub(crate) enum WakeError {
    Disconnected,
    PoolClosed,
    Os(i32),
}

impl WakeError {
    fn into_socket_error(self) -> SocketError {
        match self {
            WakeError::Disconnected => SocketError::Disconnected,
            WakeError::PoolClosed => SocketError::PoolClosed,
            WakeError::Os(errno) => {
                SocketError::syscall("kernel event", io::Error::from_raw_os_error(errno))
            }
        }
    }
}

pub(crate) struct WaitSlot {
    waker: Waker,
    result: Option<Result<Event, WakeError>>,
}

pub(crate) type SlotRef = Rc<RefCell<WaitSlot>>;

/// Cross-thread wakeup for a pool blocked in its kernel wait. Writes one
/// byte into the pool's internal socketpair; coalesced by a flag.
#[derive(Clone)]
pub(crate) struct Unparker {
    inner: Arc<UnparkInner>,
}

struct UnparkInner {
    fd: OwnedFd,
    pending: AtomicBool,
}

impl Unparker {
    pub(crate) fn unpark(&self) {
        if !self.inner.pending.swap(true, Ordering::SeqCst) {
            let buf = [1u8];
            // EAGAIN just means a wakeup byte is already queued
            let _ = sys::write(self.inner.fd.as_raw_fd(), &buf);
        }
    }

    fn reset(&self) {
        self.inner.pending.store(false, Ordering::SeqCst);
    }
}

pub(crate) struct PoolInner {
    selector: RefCell<Selector>,
    waiters: RefCell<HashMap<(RawFd, Direction), SlotRef>>,
    closed: Cell<bool>,
    wake_rx: OwnedFd,
    unparker: Unparker,
}

impl PoolInner {
    fn new() -> Result<Rc<PoolInner>, SocketError> {
        let (wake_rx, wake_tx) = sys::socketpair()?;
        let mut selector = Selector::new()?;
        selector.register_waker(wake_rx.as_raw_fd())?;
        Ok(Rc::new(PoolInner {
            selector: RefCell::new(selector),
            waiters: RefCell::new(HashMap::new()),
            closed: Cell::new(false),
            wake_rx,
            unparker: Unparker { inner: Arc::new(UnparkInner { fd: wake_tx, pending: AtomicBool::new(false) }) },
        }))
    }

    pub(crate) fn unparker(&self) -> Unparker {
        self.unparker.clone()
    }

    /// Suspends the calling task until `fd` is ready in `dir`.
    ///
    /// `store` is the caller's slot holder; a `Some` slot means a
    /// registration from an earlier `Pending` is outstanding. At most one
    /// waiter may exist per `(fd, dir)` at a time.
    pub(crate) fn poll_suspend(
        &self,
        fd: RawFd,
        dir: Direction,
        store: &mut Option<SlotRef>,
        cx: &mut Context<'_>,
    ) -> Poll<Result<Event, SocketError>> {
        if let Some(slot) = store {
            let mut inner = slot.borrow_mut();
            if let Some(result) = inner.result.take() {
                drop(inner);
                *store = None;
                return Poll::Ready(result.map_err(WakeError::into_socket_error));
            }
            if !inner.waker.will_wake(cx.waker()) {
                inner.waker = cx.waker().clone();
            }
            return Poll::Pending;
        }

        if self.closed.get() {
            return Poll::Ready(Err(SocketError::PoolClosed));
        }

        let key = (fd, dir);
        let slot: SlotRef = Rc::new(RefCell::new(WaitSlot { waker: cx.waker().clone(), result: None }));
        {
            let mut waiters = self.waiters.borrow_mut();
            debug_assert!(!waiters.contains_key(&key), "second waiter for fd {fd} {dir:?}");
            waiters.insert(key, slot.clone());
        }
        if let Err(e) = self.arm(fd) {
            self.waiters.borrow_mut().remove(&key);
            return Poll::Ready(Err(e));
        }
        trace!(fd, ?dir, "task suspended on readiness");
        *store = Some(slot);
        Poll::Pending
    }

    /// Re-arms the selector with the union of outstanding interests on `fd`.
    fn arm(&self, fd: RawFd) -> Result<(), SocketError> {
        let waiters = self.waiters.borrow();
        let mut interest = None;
        for dir in [Direction::Read, Direction::Write] {
            if waiters.contains_key(&(fd, dir)) {
                interest = Some(match interest {
                    None => dir.interest(),
                    Some(i) => Interest::add(i, dir.interest()),
                });
            }
        }
        drop(waiters);
        match interest {
            Some(interest) => self.selector.borrow_mut().arm(fd, interest),
            None => Ok(()),
        }
    }

    /// Drops the registration owned by `slot` without waking it.
    pub(crate) fn cancel(&self, fd: RawFd, dir: Direction, slot: &SlotRef) {
        let mut waiters = self.waiters.borrow_mut();
        if let Some(existing) = waiters.get(&(fd, dir)) {
            if Rc::ptr_eq(existing, slot) {
                waiters.remove(&(fd, dir));
            }
        }
    }

    /// Called when a socket closes: wakes both directions with
    /// `Disconnected` and forgets the fd in the kernel.
    pub(crate) fn drop_fd(&self, fd: RawFd) {
        for dir in [Direction::Read, Direction::Write] {
            self.complete((fd, dir), Err(WakeError::Disconnected));
        }
        self.selector.borrow_mut().forget(fd);
    }

    fn complete(&self, key: (RawFd, Direction), result: Result<Event, WakeError>) {
        let slot = self.waiters.borrow_mut().remove(&key);
        if let Some(slot) = slot {
            let mut inner = slot.borrow_mut();
            inner.result = Some(result);
            inner.waker.wake_by_ref();
        }
    }

    fn close(&self) {
        if self.closed.replace(true) {
            return;
        }
        let keys: Vec<_> = self.waiters.borrow().keys().copied().collect();
        for key in keys {
            self.complete(key, Err(WakeError::PoolClosed));
        }
    }

    /// One cycle of the pool's run loop: block in the kernel wait (bounded
    /// by `timeout`), then wake every waiter whose event fired. Returns the
    /// number of waiters woken.
    pub(crate) fn turn(&self, timeout: Option<Duration>) -> Result<usize, SocketError> {
        if self.closed.get() {
            return Ok(0);
        }

        let mut fired = Vec::new();
        self.selector.borrow_mut().wait(timeout, &mut fired)?;

        let mut woken = 0;
        for Fired { fd, event, error } in fired {
            if fd == self.wake_rx.as_raw_fd() {
                self.drain_wake_pipe();
                continue;
            }
            if let Some(errno) = error {
                for dir in [Direction::Read, Direction::Write] {
                    self.complete((fd, dir), Err(WakeError::Os(errno)));
                    woken += 1;
                }
                continue;
            }
            if event.readable || event.eof {
                self.complete((fd, Direction::Read), Ok(event));
                woken += 1;
            }
            // read-side EOF also releases a pending writer
            if event.writable || event.eof {
                self.complete((fd, Direction::Write), Ok(event));
                woken += 1;
            }
            // a oneshot fire disarms the whole fd; re-arm what still waits
            self.arm(fd)?;
        }
        Ok(woken)
    }

    fn drain_wake_pipe(&self) {
        let mut buf = [0u8; 64];
        loop {
            match sys::read(self.wake_rx.as_raw_fd(), &mut buf) {
                Ok(0) => break,
                Ok(_) => continue,
                Err(_) => break,
            }
        }
        self.unparker.reset();
    }
}

/// Owner of the pool. Dropping it completes all pending waiters with
/// [`SocketError::PoolClosed`].
pub struct Pool {
    inner: Rc<PoolInner>,
}

impl Pool {
    pub fn new() -> Result<Pool, SocketError> {
        Ok(Pool { inner: PoolInner::new()? })
    }

    pub fn handle(&self) -> PoolHandle {
        PoolHandle { inner: self.inner.clone() }
    }

    /// Runs one wait-and-dispatch cycle; exposed for embedding the pool in
    /// an application's own loop.
    pub fn turn(&self, timeout: Option<Duration>) -> Result<usize, SocketError> {
        self.inner.turn(timeout)
    }
}

impl Drop for Pool {
    fn drop(&mut self) {
        self.inner.close();
    }
}

/// Cheap handle used by sockets and the server to reach the pool.
#[derive(Clone)]
pub struct PoolHandle {
    pub(crate) inner: Rc<PoolInner>,
}

impl PoolHandle {
    /// Suspends until `fd` reports one of the requested events, the fd is
    /// closed (`Disconnected`) or the pool goes away (`PoolClosed`).
    /// Dropping the returned future deregisters promptly.
    pub fn readiness(&self, fd: RawFd, interest: Interest) -> Readiness {
        Readiness {
            pool: self.inner.clone(),
            fd,
            interest,
            read_slot: None,
            write_slot: None,
        }
    }
}

/// Future returned by [`PoolHandle::readiness`].
pub struct Readiness {
    pool: Rc<PoolInner>,
    fd: RawFd,
    interest: Interest,
    read_slot: Option<SlotRef>,
    write_slot: Option<SlotRef>,
}

impl Future for Readiness {
    type Output = Result<Event, SocketError>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.get_mut();
        if this.interest.is_readable() {
            let pool = this.pool.clone();
            if let Poll::Ready(result) = pool.poll_suspend(this.fd, Direction::Read, &mut this.read_slot, cx) {
                return Poll::Ready(result);
            }
        }
        if this.interest.is_writable() {
            let pool = this.pool.clone();
            if let Poll::Ready(result) = pool.poll_suspend(this.fd, Direction::Write, &mut this.write_slot, cx) {
                return Poll::Ready(result);
            }
        }
        Poll::Pending
    }
}

impl Drop for Readiness {
    fn drop(&mut self) {
        if let Some(slot) = self.read_slot.take() {
            self.pool.cancel(self.fd, Direction::Read, &slot);
        }
        if let Some(slot) = self.write_slot.take() {
            self.pool.cancel(self.fd, Direction::Write, &slot);
        }
    }
}

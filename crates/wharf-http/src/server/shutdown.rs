//! One-shot shutdown signal shared between the server and its connections.

use std::cell::{Cell, RefCell};
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

/// A clonable latch: once [`Shutdown::notify`] fires, every current and
/// future [`Shutdown::notified`] completes immediately.
#[derive(Clone, Default)]
pub struct Shutdown {
    inner: Rc<Inner>,
}

#[derive(Default)]
struct Inner {
    notified: Cell<bool>,
    wakers: RefCell<Vec<Waker>>,
}

impl Shutdown {
    pub fn new() -> Shutdown {
        Shutdown::default()
    }

    pub fn notify(&self) {
        if self.inner.notified.replace(true) {
            return;
        }
        for waker in self.inner.wakers.borrow_mut().drain(..) {
            waker.wake();
        }
    }

    pub fn is_notified(&self) -> bool {
        self.inner.notified.get()
    }

    pub fn notified(&self) -> Notified {
        Notified { shutdown: self.clone() }
    }
}

/// Future resolving once the signal fires.
pub struct Notified {
    shutdown: Shutdown,
}

impl Future for Notified {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.shutdown.inner.notified.get() {
            return Poll::Ready(());
        }
        let mut wakers = self.shutdown.inner.wakers.borrow_mut();
        if !wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
            wakers.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::task::noop_waker_ref;
    use futures::FutureExt;

    #[test]
    fn notify_releases_waiters() {
        let shutdown = Shutdown::new();
        let mut notified = shutdown.notified();
        let mut cx = Context::from_waker(noop_waker_ref());

        assert!(notified.poll_unpin(&mut cx).is_pending());
        shutdown.notify();
        assert!(notified.poll_unpin(&mut cx).is_ready());
        // late subscribers resolve immediately
        assert!(shutdown.notified().poll_unpin(&mut cx).is_ready());
    }
}

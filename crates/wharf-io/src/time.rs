//! Sleeps and deadlines on the runtime's timer queue.
//!
//! The executor consults [`TimerQueue::next_timeout`] before blocking in the
//! pool and fires due timers after every turn. [`timeout`] races an
//! operation against a [`Sleep`]; the operation is always polled at least
//! once, even with a zero duration.

use std::cell::{Cell, RefCell};
use std::cmp::Reverse;
use std::collections::{BinaryHeap, HashMap};
use std::future::Future;
use std::pin::{pin, Pin};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use futures::future::Either;
use thiserror::Error;

use crate::executor;

/// An operation exceeded its deadline.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("operation timed out after {duration:?}")]
pub struct TimeoutError {
    duration: Duration,
}

impl TimeoutError {
    pub fn duration(&self) -> Duration {
        self.duration
    }
}

enum TimerState {
    Waiting(Waker),
    Fired,
}

#[derive(Default)]
pub(crate) struct TimerQueue {
    heap: RefCell<BinaryHeap<Reverse<(Instant, u64)>>>,
    entries: RefCell<HashMap<u64, TimerState>>,
    next_id: Cell<u64>,
}

impl TimerQueue {
    fn insert(&self, deadline: Instant, waker: Waker) -> u64 {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.entries.borrow_mut().insert(id, TimerState::Waiting(waker));
        self.heap.borrow_mut().push(Reverse((deadline, id)));
        id
    }

    fn update_waker(&self, id: u64, waker: &Waker) {
        if let Some(TimerState::Waiting(stored)) = self.entries.borrow_mut().get_mut(&id) {
            if !stored.will_wake(waker) {
                *stored = waker.clone();
            }
        }
    }

    fn is_fired(&self, id: u64) -> bool {
        matches!(self.entries.borrow().get(&id), Some(TimerState::Fired))
    }

    fn cancel(&self, id: u64) {
        self.entries.borrow_mut().remove(&id);
    }

    /// Time until the earliest live deadline; `Some(ZERO)` when overdue.
    pub(crate) fn next_timeout(&self, now: Instant) -> Option<Duration> {
        let mut heap = self.heap.borrow_mut();
        let entries = self.entries.borrow();
        while let Some(Reverse((deadline, id))) = heap.peek().copied() {
            if !entries.contains_key(&id) {
                // cancelled; drop the stale heap entry
                heap.pop();
                continue;
            }
            return Some(deadline.saturating_duration_since(now));
        }
        None
    }

    /// Fires every due timer, waking its task.
    pub(crate) fn fire_due(&self, now: Instant) {
        loop {
            let due = {
                let mut heap = self.heap.borrow_mut();
                match heap.peek().copied() {
                    Some(Reverse((deadline, id))) if deadline <= now => {
                        heap.pop();
                        Some(id)
                    }
                    _ => None,
                }
            };
            let Some(id) = due else { break };
            let mut entries = self.entries.borrow_mut();
            if let Some(state) = entries.get_mut(&id) {
                let previous = std::mem::replace(state, TimerState::Fired);
                drop(entries);
                if let TimerState::Waiting(waker) = previous {
                    waker.wake();
                }
            }
        }
    }
}

/// Future that completes once its deadline passes.
pub struct Sleep {
    deadline: Instant,
    id: Option<u64>,
    queue: std::rc::Rc<executor::RuntimeInner>,
}

impl Sleep {
    pub fn deadline(&self) -> Instant {
        self.deadline
    }
}

impl Future for Sleep {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let this = self.get_mut();
        match this.id {
            None => {
                if Instant::now() >= this.deadline {
                    return Poll::Ready(());
                }
                this.id = Some(this.queue.timer().insert(this.deadline, cx.waker().clone()));
                Poll::Pending
            }
            Some(id) => {
                if this.queue.timer().is_fired(id) {
                    this.queue.timer().cancel(id);
                    this.id = None;
                    Poll::Ready(())
                } else {
                    this.queue.timer().update_waker(id, cx.waker());
                    Poll::Pending
                }
            }
        }
    }
}

impl Drop for Sleep {
    fn drop(&mut self) {
        if let Some(id) = self.id.take() {
            self.queue.timer().cancel(id);
        }
    }
}

/// Suspends the current task for `duration`.
///
/// Panics outside a runtime context, like the rest of the timer surface.
pub fn sleep(duration: Duration) -> Sleep {
    sleep_until(Instant::now() + duration)
}

pub fn sleep_until(deadline: Instant) -> Sleep {
    Sleep { deadline, id: None, queue: executor::current() }
}

/// Races `future` against a `duration` sleep; the loser is dropped.
///
/// The operation is polled before the deadline is checked, so even a zero
/// duration lets it make one step of progress.
pub async fn timeout<F: Future>(duration: Duration, future: F) -> Result<F::Output, TimeoutError> {
    let future = pin!(future);
    let sleep = pin!(sleep(duration));
    match futures::future::select(future, sleep).await {
        Either::Left((output, _)) => Ok(output),
        Either::Right(((), _)) => Err(TimeoutError { duration }),
    }
}

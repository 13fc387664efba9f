//! Single-threaded cooperative executor.
//!
//! One logical executor drives every task; suspension points are the socket
//! operations, the pool's readiness future and the timer. Wakers carry only
//! a task id plus a handle to the shared ready queue, so they stay `Send`
//! and a wakeup from another thread interrupts the pool's kernel wait
//! through its wake pipe.
//!
//! `spawn` hands back a [`JoinHandle`]; dropping or aborting the handle
//! cancels the task at its next suspension point.

use std::cell::{Cell, RefCell};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::pin::pin;
use std::rc::Rc;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll, Wake, Waker};
use std::time::Instant;

use futures::future::{FutureExt, LocalBoxFuture, RemoteHandle};

use crate::error::SocketError;
use crate::poll::{Pool, PoolHandle, PoolInner, Unparker};
use crate::time::TimerQueue;

const ROOT_TASK: usize = 0;

struct Shared {
    ready: Mutex<VecDeque<usize>>,
    unparker: Unparker,
}

impl Shared {
    fn push(&self, id: usize) {
        self.ready.lock().unwrap().push_back(id);
        self.unparker.unpark();
    }

    fn pop(&self) -> Option<usize> {
        self.ready.lock().unwrap().pop_front()
    }
}

struct TaskWaker {
    id: usize,
    shared: Arc<Shared>,
}

impl Wake for TaskWaker {
    fn wake(self: Arc<Self>) {
        self.shared.push(self.id);
    }

    fn wake_by_ref(self: &Arc<Self>) {
        self.shared.push(self.id);
    }
}

pub(crate) struct RuntimeInner {
    pool: Rc<PoolInner>,
    timer: TimerQueue,
    tasks: RefCell<HashMap<usize, LocalBoxFuture<'static, ()>>>,
    shared: Arc<Shared>,
    next_id: Cell<usize>,
}

impl RuntimeInner {
    pub(crate) fn timer(&self) -> &TimerQueue {
        &self.timer
    }

    fn waker_for(&self, id: usize) -> Waker {
        Waker::from(Arc::new(TaskWaker { id, shared: self.shared.clone() }))
    }

    fn poll_task(&self, id: usize) {
        // take the future out of the table so the task may spawn re-entrantly
        let Some(mut future) = self.tasks.borrow_mut().remove(&id) else {
            return;
        };
        let waker = self.waker_for(id);
        let mut cx = Context::from_waker(&waker);
        if future.as_mut().poll(&mut cx).is_pending() {
            self.tasks.borrow_mut().insert(id, future);
        }
    }

    fn spawn_boxed(&self, future: LocalBoxFuture<'static, ()>) -> usize {
        let id = self.next_id.get();
        self.next_id.set(id + 1);
        self.tasks.borrow_mut().insert(id, future);
        self.shared.push(id);
        id
    }
}

/// The wharf runtime: pool, timer and executor in one.
pub struct Runtime {
    pool: Pool,
    inner: Rc<RuntimeInner>,
}

impl Runtime {
    pub fn new() -> Result<Runtime, SocketError> {
        let pool = Pool::new()?;
        let pool_inner = pool.handle().inner;
        let unparker = pool_inner.unparker();
        let inner = Rc::new(RuntimeInner {
            pool: pool_inner,
            timer: TimerQueue::default(),
            tasks: RefCell::new(HashMap::new()),
            shared: Arc::new(Shared { ready: Mutex::new(VecDeque::new()), unparker }),
            next_id: Cell::new(ROOT_TASK + 1),
        });
        Ok(Runtime { pool, inner })
    }

    /// Handle for constructing sockets against this runtime's pool.
    pub fn pool(&self) -> PoolHandle {
        self.pool.handle()
    }

    /// Spawns a task onto this runtime.
    pub fn spawn<F>(&self, future: F) -> JoinHandle<F::Output>
    where
        F: Future + 'static,
        F::Output: Send + 'static,
    {
        let (remote, handle) = future.remote_handle();
        let id = self.inner.spawn_boxed(Box::pin(remote));
        JoinHandle { handle: Some(handle), id, shared: self.inner.shared.clone() }
    }

    /// Drives `future` (and everything spawned) to completion, blocking in
    /// the pool whenever no task is runnable.
    pub fn block_on<F: Future>(&self, future: F) -> F::Output {
        let _guard = ContextGuard::enter(self.inner.clone());
        let mut future = pin!(future);
        let root_waker = self.inner.waker_for(ROOT_TASK);
        let mut cx = Context::from_waker(&root_waker);

        self.inner.shared.push(ROOT_TASK);
        loop {
            while let Some(id) = self.inner.shared.pop() {
                if id == ROOT_TASK {
                    if let Poll::Ready(output) = future.as_mut().poll(&mut cx) {
                        return output;
                    }
                } else {
                    self.inner.poll_task(id);
                }
            }

            let timeout = self.inner.timer.next_timeout(Instant::now());
            if let Err(e) = self.inner.pool.turn(timeout) {
                // a failing kernel wait leaves the waiters parked; surfacing
                // it everywhere beats spinning silently
                panic!("event pool wait failed: {e}");
            }
            self.inner.timer.fire_due(Instant::now());
        }
    }
}

/// Handle to a spawned task.
///
/// Await it for the task's output. `abort` (or just dropping the handle)
/// cancels the task at its next suspension point; `detach` lets the task
/// run to completion unobserved.
pub struct JoinHandle<T> {
    handle: Option<RemoteHandle<T>>,
    id: usize,
    shared: Arc<Shared>,
}

impl<T: 'static> JoinHandle<T> {
    pub fn abort(&mut self) {
        if self.handle.take().is_some() {
            // schedule the task so its teardown runs promptly
            self.shared.push(self.id);
        }
    }

    pub fn detach(mut self) {
        if let Some(handle) = self.handle.take() {
            handle.forget();
        }
    }
}

impl<T: 'static> Future for JoinHandle<T> {
    type Output = T;

    fn poll(mut self: std::pin::Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<T> {
        let handle = self.handle.as_mut().expect("JoinHandle polled after abort or detach");
        handle.poll_unpin(cx)
    }
}

impl<T> Drop for JoinHandle<T> {
    fn drop(&mut self) {
        if self.handle.take().is_some() {
            self.shared.push(self.id);
        }
    }
}

thread_local! {
    static CURRENT: RefCell<Option<Rc<RuntimeInner>>> = const { RefCell::new(None) };
}

struct ContextGuard {
    previous: Option<Rc<RuntimeInner>>,
}

impl ContextGuard {
    fn enter(inner: Rc<RuntimeInner>) -> ContextGuard {
        let previous = CURRENT.with(|current| current.borrow_mut().replace(inner));
        ContextGuard { previous }
    }
}

impl Drop for ContextGuard {
    fn drop(&mut self) {
        CURRENT.with(|current| *current.borrow_mut() = self.previous.take());
    }
}

pub(crate) fn current() -> Rc<RuntimeInner> {
    CURRENT.with(|current| current.borrow().clone()).expect("not inside a wharf runtime")
}

/// Spawns onto the runtime currently driving this thread.
pub fn spawn<F>(future: F) -> JoinHandle<F::Output>
where
    F: Future + 'static,
    F::Output: Send + 'static,
{
    let inner = current();
    let (remote, handle) = future.remote_handle();
    let id = inner.spawn_boxed(Box::pin(remote));
    JoinHandle { handle: Some(handle), id, shared: inner.shared.clone() }
}

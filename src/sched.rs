//! Cooperative task runtime: a single-threaded scheduler with structured
//! waits on signals and counted semaphores.
//!
//! Every task runs on the scheduler's thread and only yields at await
//! points, so engine state can live in `Rc`/`RefCell` without locking.
//! Blocking work (subprocesses, bulk file IO) is pushed to the blocking
//! pool via [`background`]; the engine caps how much of it is in flight
//! with a [`Semaphore`] sized to the configured job count.

use std::cell::{Cell, RefCell};
use std::collections::VecDeque;
use std::future::Future;
use std::pin::Pin;
use std::rc::Rc;
use std::task::{Context, Poll, Waker};

use crate::error::{Error, Result};

/// Boxed local future, used for object-safe async methods on build actions.
pub type DynFuture<'a, T> = Pin<Box<dyn Future<Output = T> + 'a>>;

/// Owns the runtime that drives all cooperative tasks of one build run.
pub struct Scheduler {
    jobs: usize,
    runtime: tokio::runtime::Runtime,
}

impl Scheduler {
    pub fn new(jobs: usize) -> Result<Scheduler> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;
        Ok(Scheduler {
            jobs: jobs.max(1),
            runtime,
        })
    }

    pub fn jobs(&self) -> usize {
        self.jobs
    }

    /// Drive a future to completion on the calling thread. Tasks spawned
    /// with [`spawn`] from inside it are interleaved on this same thread.
    pub fn run<T>(&self, fut: impl Future<Output = T>) -> T {
        let local = tokio::task::LocalSet::new();
        local.block_on(&self.runtime, fut)
    }
}

/// Handle on a spawned task.
pub struct Task<T> {
    name: String,
    handle: tokio::task::JoinHandle<T>,
}

/// Spawn a task onto the current scheduler.
pub fn spawn<T: 'static>(name: impl Into<String>, fut: impl Future<Output = T> + 'static) -> Task<T> {
    Task {
        name: name.into(),
        handle: tokio::task::spawn_local(fut),
    }
}

impl<T> Task<T> {
    pub fn cancel(&self) {
        self.handle.abort();
    }

    /// Wait for the task; a cancelled task yields `Error::Cancelled`, a
    /// panicking task resumes its panic in the caller.
    pub async fn join(self) -> Result<T> {
        match self.handle.await {
            Ok(v) => Ok(v),
            Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
            Err(_) => Err(Error::Cancelled(self.name)),
        }
    }
}

impl Task<Result<()>> {
    /// Join and flatten: cancellation and the task's own error look alike
    /// to the waiter.
    pub async fn result(self) -> Result<()> {
        self.join().await.and_then(|r| r)
    }
}

/// Give other ready tasks a chance to run.
pub async fn yield_now() {
    tokio::task::yield_now().await
}

/// Run a blocking closure on the blocking pool, suspending the calling task
/// until it completes.
pub async fn background<T, F>(f: F) -> T
where
    T: Send + 'static,
    F: FnOnce() -> T + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(v) => v,
        Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
        Err(_) => unreachable!("blocking pool tasks are never aborted"),
    }
}

struct SignalInner {
    fired: Cell<bool>,
    waiters: RefCell<Vec<Waker>>,
}

/// One-shot edge-triggered event: firing wakes all current waiters, and any
/// later wait returns immediately.
#[derive(Clone)]
pub struct Signal {
    inner: Rc<SignalInner>,
}

impl Signal {
    pub fn new() -> Signal {
        Signal {
            inner: Rc::new(SignalInner {
                fired: Cell::new(false),
                waiters: RefCell::new(Vec::new()),
            }),
        }
    }

    pub fn fired(&self) -> bool {
        self.inner.fired.get()
    }

    pub fn fire(&self) {
        self.inner.fired.set(true);
        for waker in self.inner.waiters.borrow_mut().drain(..) {
            waker.wake();
        }
    }

    pub fn wait(&self) -> SignalWait {
        SignalWait {
            inner: Rc::clone(&self.inner),
        }
    }
}

impl Default for Signal {
    fn default() -> Self {
        Signal::new()
    }
}

pub struct SignalWait {
    inner: Rc<SignalInner>,
}

impl Future for SignalWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        if self.inner.fired.get() {
            return Poll::Ready(());
        }
        let mut waiters = self.inner.waiters.borrow_mut();
        if !waiters.iter().any(|w| w.will_wake(cx.waker())) {
            waiters.push(cx.waker().clone());
        }
        Poll::Pending
    }
}

struct SemInner {
    count: Cell<usize>,
    waiters: RefCell<VecDeque<Waker>>,
}

/// Counted semaphore: `lock` suspends at zero, `unlock` releases at most
/// one waiter.
#[derive(Clone)]
pub struct Semaphore {
    inner: Rc<SemInner>,
}

impl Semaphore {
    pub fn new(count: usize) -> Semaphore {
        Semaphore {
            inner: Rc::new(SemInner {
                count: Cell::new(count),
                waiters: RefCell::new(VecDeque::new()),
            }),
        }
    }

    pub fn count(&self) -> usize {
        self.inner.count.get()
    }

    pub fn lock(&self) -> SemaphoreWait {
        SemaphoreWait {
            inner: Rc::clone(&self.inner),
        }
    }

    pub fn unlock(&self) {
        self.inner.count.set(self.inner.count.get() + 1);
        if let Some(waker) = self.inner.waiters.borrow_mut().pop_front() {
            waker.wake();
        }
    }

    /// Acquire with release-on-drop.
    pub async fn acquire(&self) -> SemaphoreGuard {
        self.lock().await;
        SemaphoreGuard { sem: self.clone() }
    }
}

pub struct SemaphoreWait {
    inner: Rc<SemInner>,
}

impl Future for SemaphoreWait {
    type Output = ();

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
        let count = self.inner.count.get();
        if count > 0 {
            self.inner.count.set(count - 1);
            return Poll::Ready(());
        }
        let mut waiters = self.inner.waiters.borrow_mut();
        if !waiters.iter().any(|w| w.will_wake(cx.waker())) {
            waiters.push_back(cx.waker().clone());
        }
        Poll::Pending
    }
}

pub struct SemaphoreGuard {
    sem: Semaphore,
}

impl Drop for SemaphoreGuard {
    fn drop(&mut self) {
        self.sem.unlock();
    }
}

/// Structured-concurrency handle: children spawned through a scope are tied
/// to it. The first child error aborts the remaining children (they observe
/// cancellation at their next suspension point) and is returned from
/// `wait`. Dropping a scope aborts any children still running.
pub struct Scope {
    set: tokio::task::JoinSet<Result<()>>,
}

impl Scope {
    pub fn new() -> Scope {
        Scope {
            set: tokio::task::JoinSet::new(),
        }
    }

    pub fn run(&mut self, fut: impl Future<Output = Result<()>> + 'static) {
        self.set.spawn_local(fut);
    }

    pub async fn wait(mut self) -> Result<()> {
        let mut first: Option<Error> = None;
        while let Some(joined) = self.set.join_next().await {
            let res = match joined {
                Ok(res) => res,
                Err(err) if err.is_panic() => std::panic::resume_unwind(err.into_panic()),
                Err(_) => Err(Error::Cancelled("scope child".to_owned())),
            };
            if let Err(err) = res {
                if first.is_none() {
                    first = Some(err);
                    self.set.abort_all();
                }
            }
        }
        match first {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Scope::new()
    }
}

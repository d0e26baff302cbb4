//! Worker pool that isolates protected calls from their callers.

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::{debug, warn};

use crate::error::RejectedError;

/// A unit of work handed to an [`Executor`].
pub type Task = Box<dyn FnOnce() + Send + 'static>;

/// Runs submitted tasks on threads other than the caller's.
pub trait Executor: Send + Sync + 'static {
    /// Submits a task, or rejects it right away.
    fn submit(&self, task: Task) -> Result<(), RejectedError>;
}

const DEFAULT_KEEP_ALIVE: Duration = Duration::from_secs(60);

struct PoolInner {
    name: String,
    handoff: Sender<Task>,
    idle: Receiver<Task>,
    threads: AtomicUsize,
    next_id: AtomicUsize,
    max_threads: Option<usize>,
    keep_alive: Duration,
}

/// A pool that reuses idle threads and grows on demand.
///
/// Tasks are handed to a waiting idle thread through a rendezvous channel;
/// when no thread is waiting a new one is started. Idle threads retire after
/// the keep-alive elapses. With a thread limit set, a submission that finds
/// the pool saturated is rejected.
#[derive(Clone)]
pub struct CachedThreadPool {
    inner: Arc<PoolInner>,
}

impl CachedThreadPool {
    /// Creates an unbounded pool whose threads are named `{name}-{n}`.
    pub fn new(name: impl Into<String>) -> Self {
        Self::build(name.into(), None, DEFAULT_KEEP_ALIVE)
    }

    /// Limits the number of live threads.
    pub fn with_max_threads(self, max_threads: usize) -> Self {
        Self::build(
            self.inner.name.clone(),
            Some(max_threads),
            self.inner.keep_alive,
        )
    }

    /// Sets how long an idle thread waits for work before it exits.
    pub fn with_keep_alive(self, keep_alive: Duration) -> Self {
        Self::build(self.inner.name.clone(), self.inner.max_threads, keep_alive)
    }

    fn build(name: String, max_threads: Option<usize>, keep_alive: Duration) -> Self {
        let (handoff, idle) = crossbeam_channel::bounded(0);
        Self {
            inner: Arc::new(PoolInner {
                name,
                handoff,
                idle,
                threads: AtomicUsize::new(0),
                next_id: AtomicUsize::new(1),
                max_threads,
                keep_alive,
            }),
        }
    }

    /// Number of live threads, busy or idle.
    pub fn threads(&self) -> usize {
        self.inner.threads.load(Ordering::Acquire)
    }

    fn reserve_thread(&self) -> Result<(), RejectedError> {
        let Some(max) = self.inner.max_threads else {
            self.inner.threads.fetch_add(1, Ordering::AcqRel);
            return Ok(());
        };

        self.inner
            .threads
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |current| {
                (current < max).then_some(current + 1)
            })
            .map(|_| ())
            .map_err(|busy| {
                RejectedError::new(format!(
                    "{} is saturated with {} busy threads",
                    self.inner.name, busy
                ))
            })
    }

    fn spawn(&self, task: Task) -> Result<(), RejectedError> {
        self.reserve_thread()?;

        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        let inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name(format!("{}-{}", self.inner.name, id))
            .spawn(move || work(&inner, task))
            .map(|_| ())
            .map_err(|err| {
                self.inner.threads.fetch_sub(1, Ordering::AcqRel);
                RejectedError::new(format!("failed to start worker thread: {err}"))
            })
    }
}

impl Executor for CachedThreadPool {
    fn submit(&self, task: Task) -> Result<(), RejectedError> {
        match self.inner.handoff.try_send(task) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(task)) | Err(TrySendError::Disconnected(task)) => {
                self.spawn(task).inspect_err(|err| warn!(error = %err, "task rejected"))
            }
        }
    }
}

impl std::fmt::Debug for CachedThreadPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CachedThreadPool")
            .field("name", &self.inner.name)
            .field("threads", &self.threads())
            .field("max_threads", &self.inner.max_threads)
            .finish()
    }
}

fn work(inner: &PoolInner, first: Task) {
    run_task(first);
    while let Ok(task) = inner.idle.recv_timeout(inner.keep_alive) {
        run_task(task);
    }
    inner.threads.fetch_sub(1, Ordering::AcqRel);
    debug!(pool = %inner.name, "idle worker retired");
}

fn run_task(task: Task) {
    if panic::catch_unwind(AssertUnwindSafe(task)).is_err() {
        warn!("pool task panicked");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Barrier;

    #[test]
    fn runs_tasks_off_the_calling_thread() {
        let pool = CachedThreadPool::new("test-pool");
        let (tx, rx) = crossbeam_channel::bounded(1);
        let caller = thread::current().id();

        pool.submit(Box::new(move || {
            let _ = tx.send(thread::current().id());
        }))
        .unwrap();

        let worker = rx.recv_timeout(Duration::from_secs(2)).unwrap();
        assert_ne!(worker, caller);
    }

    #[test]
    fn idle_threads_are_reused() {
        let pool = CachedThreadPool::new("test-pool");
        let (tx, rx) = crossbeam_channel::unbounded();

        for _ in 0..5 {
            let tx = tx.clone();
            pool.submit(Box::new(move || {
                let _ = tx.send(());
            }))
            .unwrap();
            rx.recv_timeout(Duration::from_secs(2)).unwrap();
            // let the worker get back to waiting for work
            thread::sleep(Duration::from_millis(20));
        }

        assert_eq!(pool.threads(), 1);
    }

    #[test]
    fn saturated_pool_rejects() {
        let pool = CachedThreadPool::new("tiny-pool").with_max_threads(1);
        let barrier = Arc::new(Barrier::new(2));
        let blocker = Arc::clone(&barrier);

        pool.submit(Box::new(move || {
            blocker.wait();
        }))
        .unwrap();

        let rejected = pool.submit(Box::new(|| {})).unwrap_err();
        assert!(rejected.reason().contains("tiny-pool"));

        barrier.wait();
    }

    #[test]
    fn idle_threads_retire_after_keep_alive() {
        let pool = CachedThreadPool::new("test-pool").with_keep_alive(Duration::from_millis(20));
        pool.submit(Box::new(|| {})).unwrap();

        thread::sleep(Duration::from_millis(200));
        assert_eq!(pool.threads(), 0);
    }
}

//! Result handles produced by the dispatch pipeline.
//!
//! A [`Promise`] is a single-assignment cell: the first completion wins and
//! later ones are ignored, which is how a call racing its deadline is
//! resolved. A [`Deferred`] is computed anew on every observation.

use std::fmt;
use std::mem;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex, MutexGuard};
use smallvec::SmallVec;
use tracing::warn;

use crate::error::Failure;

/// Completion signal passed to callbacks: the value itself stays in the cell.
pub type Completion = Result<(), Failure>;

type Callback = Box<dyn FnOnce(&Completion) + Send + 'static>;

struct State<T> {
    value: Option<Result<T, Failure>>,
    completion: Option<Completion>,
    settling: bool,
    callbacks: SmallVec<[Callback; 2]>,
}

struct Inner<T> {
    state: Mutex<State<T>>,
    done: Condvar,
}

/// Single-assignment result cell.
///
/// Completion callbacks run before the result is published: a waiter that
/// wakes up sees every side effect of the callbacks.
pub struct Promise<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Promise<T> {
    /// Creates an incomplete promise.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                state: Mutex::new(State {
                    value: None,
                    completion: None,
                    settling: false,
                    callbacks: SmallVec::new(),
                }),
                done: Condvar::new(),
            }),
        }
    }

    /// Creates a promise that already holds `result`.
    pub fn completed(result: Result<T, Failure>) -> Self {
        let promise = Self::new();
        promise.complete(result);
        promise
    }

    /// Another handle to the same cell.
    pub(crate) fn share(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }

    /// Completes the cell. Returns false, dropping `result`, if it was
    /// already complete.
    pub fn complete(&self, result: Result<T, Failure>) -> bool {
        let mut state = self.inner.state.lock();
        if state.settling || state.completion.is_some() {
            return false;
        }

        let completion = result.as_ref().map(|_| ()).map_err(Clone::clone);
        state.value = Some(result);
        state.settling = true;

        // Callbacks registered while others run are picked up by the next
        // round; the result is published once none are left.
        loop {
            let callbacks = mem::take(&mut state.callbacks);
            if callbacks.is_empty() {
                break;
            }
            MutexGuard::unlocked(&mut state, || {
                for callback in callbacks {
                    if panic::catch_unwind(AssertUnwindSafe(|| callback(&completion))).is_err() {
                        warn!("completion callback panicked");
                    }
                }
            });
        }
        state.completion = Some(completion);
        state.settling = false;
        drop(state);

        self.inner.done.notify_all();
        true
    }

    /// Returns true once the cell holds a result.
    pub fn is_done(&self) -> bool {
        self.inner.state.lock().completion.is_some()
    }

    /// Runs `callback` when the cell completes, or right away if it already
    /// has.
    pub fn on_complete<F>(&self, callback: F)
    where
        F: FnOnce(&Completion) + Send + 'static,
    {
        let mut state = self.inner.state.lock();
        match state.completion.clone() {
            Some(completion) => {
                drop(state);
                callback(&completion);
            }
            None => state.callbacks.push(Box::new(callback)),
        }
    }

    /// Blocks until the cell completes or `timeout` elapses.
    ///
    /// Returns `None` if the deadline passed first.
    pub fn wait_timeout(self, timeout: Duration) -> Option<Result<T, Failure>> {
        let deadline = Instant::now().checked_add(timeout);
        let mut state = self.inner.state.lock();
        while state.completion.is_none() {
            match deadline {
                Some(deadline) => {
                    if self.inner.done.wait_until(&mut state, deadline).timed_out() {
                        break;
                    }
                }
                None => self.inner.done.wait(&mut state),
            }
        }
        if state.completion.is_none() {
            return None;
        }
        state.value.take()
    }

    /// Blocks until the cell completes.
    pub fn wait(self) -> Result<T, Failure> {
        let mut state = self.inner.state.lock();
        while state.completion.is_none() {
            self.inner.done.wait(&mut state);
        }
        match state.value.take() {
            Some(result) => result,
            None => Err(Failure::Panicked("result already taken".to_string())),
        }
    }
}

impl<T> Default for Promise<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> fmt::Debug for Promise<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Promise")
            .field("done", &self.is_done())
            .finish()
    }
}

/// A value recomputed on every observation.
pub struct Deferred<T> {
    compute: Arc<dyn Fn() -> Result<T, Failure> + Send + Sync + 'static>,
}

impl<T> Deferred<T> {
    /// Wraps `compute`.
    pub fn new<F>(compute: F) -> Self
    where
        F: Fn() -> Result<T, Failure> + Send + Sync + 'static,
    {
        Self {
            compute: Arc::new(compute),
        }
    }

    /// Computes the value.
    pub fn get(&self) -> Result<T, Failure> {
        (self.compute)()
    }
}

impl<T> Clone for Deferred<T> {
    fn clone(&self) -> Self {
        Self {
            compute: Arc::clone(&self.compute),
        }
    }
}

impl<T> fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Deferred")
    }
}

/// What a circuit breaker hands back for one execution.
#[derive(Debug)]
pub enum ResultHandle<T> {
    /// The call was dispatched and completes asynchronously.
    Pending(Promise<T>),

    /// The circuit was open; the value comes from the open-circuit fallback.
    Deferred(Deferred<T>),
}

impl<T> ResultHandle<T> {
    /// A handle that already failed.
    pub fn failed(failure: Failure) -> Self {
        ResultHandle::Pending(Promise::completed(Err(failure)))
    }

    /// Returns true if observing the handle would not block.
    pub fn is_done(&self) -> bool {
        match self {
            ResultHandle::Pending(promise) => promise.is_done(),
            ResultHandle::Deferred(_) => true,
        }
    }

    /// Blocks up to `timeout` for the result; `None` if the deadline passed.
    pub fn wait_timeout(self, timeout: Duration) -> Option<Result<T, Failure>> {
        match self {
            ResultHandle::Pending(promise) => promise.wait_timeout(timeout),
            ResultHandle::Deferred(deferred) => Some(deferred.get()),
        }
    }

    /// Blocks for the result.
    pub fn wait(self) -> Result<T, Failure> {
        match self {
            ResultHandle::Pending(promise) => promise.wait(),
            ResultHandle::Deferred(deferred) => deferred.get(),
        }
    }
}

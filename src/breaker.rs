//! Circuit breakers guarding the calls of one group.

use std::fmt;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tracing::debug;

use crate::bucket::{BucketRange, BucketRangeFinder};
use crate::config::{Config, RecognizedFailures};
use crate::error::{unwrap_ref, Failure};
use crate::metrics::MetricSink;
use crate::promise::{Completion, Deferred, Promise, ResultHandle};
use crate::registry::{BucketedFailures, BucketedStates};
use crate::state::{LastFailureCause, StateManager};
use crate::timeout::TimeoutScheduler;

/// The breaker of one group.
///
/// Cloning is cheap; clones share all state.
#[derive(Clone)]
pub enum CircuitBreaker {
    /// Tracks health per timeout bucket and short-circuits open buckets.
    Guarded(Arc<GuardedBreaker>),

    /// Runs every call as is: no deadline, no health tracking.
    PassThrough,
}

impl CircuitBreaker {
    /// Creates a guarded breaker for `group`.
    pub fn guarded(group: &str, config: Arc<Config>) -> Self {
        CircuitBreaker::Guarded(Arc::new(GuardedBreaker::new(group, config)))
    }

    /// Runs `supplier` under this breaker.
    ///
    /// `open_fallback` produces the value when the call's bucket is open; it
    /// receives the bucket's last recognized failure as of the moment the
    /// result is observed.
    pub fn execute<T, S, F>(
        &self,
        supplier: S,
        open_fallback: F,
        timeout: Duration,
    ) -> ResultHandle<T>
    where
        T: Send + 'static,
        S: FnOnce() -> Promise<T>,
        F: Fn(Option<Failure>) -> Result<T, Failure> + Send + Sync + 'static,
    {
        match self {
            CircuitBreaker::Guarded(breaker) => {
                breaker.execute(supplier, open_fallback, timeout)
            }
            CircuitBreaker::PassThrough => ResultHandle::Pending(supplier()),
        }
    }

    /// Returns true if both handles refer to the same breaker.
    pub fn same_breaker(&self, other: &CircuitBreaker) -> bool {
        match (self, other) {
            (CircuitBreaker::Guarded(a), CircuitBreaker::Guarded(b)) => Arc::ptr_eq(a, b),
            (CircuitBreaker::PassThrough, CircuitBreaker::PassThrough) => true,
            _ => false,
        }
    }
}

impl fmt::Debug for CircuitBreaker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CircuitBreaker::Guarded(breaker) => f
                .debug_struct("Guarded")
                .field("group", &breaker.group)
                .field("buckets", &breaker.states.len())
                .finish(),
            CircuitBreaker::PassThrough => f.write_str("PassThrough"),
        }
    }
}

/// Breaker with per-bucket state, deadlines and failure recognition.
pub struct GuardedBreaker {
    group: Arc<str>,
    bucket_finder: BucketRangeFinder,
    timeouts: TimeoutScheduler,
    states: BucketedStates,
    failures: BucketedFailures,
    recognized: RecognizedFailures,
    metric_sink: Arc<dyn MetricSink>,
}

impl GuardedBreaker {
    /// Creates the breaker of `group`.
    pub fn new(group: &str, config: Arc<Config>) -> Self {
        debug!(group, strategy = ?config.strategy(), "creating circuit breaker");
        let group: Arc<str> = Arc::from(group);
        Self {
            bucket_finder: config.bucket_finder(),
            timeouts: TimeoutScheduler::new(Arc::clone(config.scheduler())),
            failures: BucketedFailures::new(),
            recognized: config.recognized_failures().clone(),
            metric_sink: Arc::clone(config.metric_sink()),
            states: BucketedStates::new(Arc::clone(&group), config),
            group,
        }
    }

    /// The group this breaker guards.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// Returns true if the bucket of `timeout` is currently open.
    pub fn is_open(&self, timeout: Duration) -> bool {
        self.states.get(self.bucket_finder.find(timeout)).is_open()
    }

    /// See [`CircuitBreaker::execute`].
    pub fn execute<T, S, F>(
        &self,
        supplier: S,
        open_fallback: F,
        timeout: Duration,
    ) -> ResultHandle<T>
    where
        T: Send + 'static,
        S: FnOnce() -> Promise<T>,
        F: Fn(Option<Failure>) -> Result<T, Failure> + Send + Sync + 'static,
    {
        let bucket = self.bucket_finder.find(timeout);
        let state = self.states.get(bucket);
        let last_failure = self.failures.get(bucket);

        if state.is_open() {
            debug!(group = %self.group, %bucket, "circuit open, short-circuiting call");
            self.metric_sink.record_short_circuit(&self.group);
            let deferred = Deferred::new(move || open_fallback(last_failure.get()));
            return ResultHandle::Deferred(deferred);
        }

        let guarded = self.timeouts.add_timeout(supplier, timeout, bucket);
        let promise = guarded();
        let listener = ResultListener {
            group: Arc::clone(&self.group),
            bucket,
            state,
            last_failure,
            recognized: self.recognized.clone(),
            metric_sink: Arc::clone(&self.metric_sink),
            started: Instant::now(),
        };
        promise.on_complete(move |completion| listener.accept(completion));
        ResultHandle::Pending(promise)
    }
}

/// Feeds the outcome of one call back into its bucket.
struct ResultListener {
    group: Arc<str>,
    bucket: BucketRange,
    state: Arc<dyn StateManager>,
    last_failure: Arc<LastFailureCause>,
    recognized: RecognizedFailures,
    metric_sink: Arc<dyn MetricSink>,
    started: Instant,
}

impl ResultListener {
    fn accept(&self, completion: &Completion) {
        let elapsed = self.started.elapsed();
        match completion {
            Ok(()) => {
                self.metric_sink.record_call(&self.group, true, elapsed);
                self.state.handle_success();
            }
            Err(failure) => {
                self.metric_sink.record_call(&self.group, false, elapsed);
                if failure.is_timeout() {
                    self.metric_sink.record_timeout(&self.group);
                }
                if self.is_recognized(failure) {
                    self.last_failure.set(failure.clone());
                    self.state.handle_failure();
                } else {
                    debug!(
                        group = %self.group,
                        bucket = %self.bucket,
                        error = %failure,
                        "unrecognized failure not counted"
                    );
                }
            }
        }
    }

    // Timeouts always count, whatever the configured set says.
    fn is_recognized(&self, failure: &Failure) -> bool {
        let failure = unwrap_ref(failure);
        matches!(failure, Failure::Timeout(_)) || self.recognized.contains(failure)
    }
}

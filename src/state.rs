//! Per-bucket circuit state machines.
//!
//! Each (breaker, bucket) pair owns one [`StateManager`]. Two strategies
//! exist: [`ConsecutiveFailures`] opens after a run of failures, and
//! [`FrequentFailures`] judges the failure ratio over a sampling window.
//! Both are re-evaluated by a periodic tick on the shared [`Scheduler`].

use std::ops::ControlFlow;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use arc_swap::ArcSwapOption;
use atomic::Atomic;
use tracing::{debug, info};

use crate::bucket::BucketRange;
use crate::error::{unwrap_failure, Failure};
use crate::metrics::{MetricSink, NullMetricSink};
use crate::scheduler::Scheduler;

/// Health state machine of one bucket.
pub trait StateManager: Send + Sync + 'static {
    /// Returns true if calls must currently be blocked.
    fn is_open(&self) -> bool;

    /// Records a successful call.
    fn handle_success(&self);

    /// Records a recognized failure.
    fn handle_failure(&self);
}

/// Which [`StateManager`] a breaker creates for its buckets.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Strategy {
    /// Open after a number of failures in a row.
    #[default]
    ConsecutiveFailures,

    /// Open or throttle based on the failure percentage of a window.
    FrequentFailures,
}

/// Reports state transitions of one group's bucket.
#[derive(Clone)]
pub struct StateObserver {
    group: Arc<str>,
    bucket: BucketRange,
    sink: Arc<dyn MetricSink>,
}

impl StateObserver {
    /// Creates an observer for `bucket` of `group`.
    pub fn new(group: Arc<str>, bucket: BucketRange, sink: Arc<dyn MetricSink>) -> Self {
        Self {
            group,
            bucket,
            sink,
        }
    }

    /// An observer that only logs.
    pub fn detached() -> Self {
        Self::new(Arc::from(""), BucketRange::ALL, Arc::new(NullMetricSink))
    }

    fn transition(&self, from: &'static str, to: &'static str) {
        info!(
            group = %self.group,
            bucket = %self.bucket,
            from,
            to,
            "circuit state changed"
        );
        self.sink.record_state_transition(&self.group, from, to);
    }
}

/// Schedules `tick` on `manager` until the manager is dropped.
fn schedule_ticks<M, F>(
    scheduler: &Scheduler,
    manager: &Arc<M>,
    initial: Duration,
    period: Duration,
    tick: F,
) where
    M: Send + Sync + 'static,
    F: Fn(&M) + Send + 'static,
{
    let manager: Weak<M> = Arc::downgrade(manager);
    scheduler.schedule_at_fixed_rate(initial, period, move || match manager.upgrade() {
        Some(manager) => {
            tick(&manager);
            ControlFlow::Continue(())
        }
        None => ControlFlow::Break(()),
    });
}

/// Opens after `threshold` failures in a row.
///
/// Every tick lowers a tripped counter to `threshold - 1`, which lets exactly
/// one trial call through: a failing trial trips the breaker again, a
/// successful one resets the counter.
pub struct ConsecutiveFailures {
    threshold: u32,
    failures: AtomicU32,
    observer: StateObserver,
}

impl ConsecutiveFailures {
    /// Creates a manager without a tick; see [`start`](Self::start).
    pub fn new(threshold: u32, observer: StateObserver) -> Self {
        Self {
            threshold,
            failures: AtomicU32::new(0),
            observer,
        }
    }

    /// Creates a manager ticking every `open_time`, starting right away.
    pub fn start(
        threshold: u32,
        open_time: Duration,
        scheduler: &Scheduler,
        observer: StateObserver,
    ) -> Arc<Self> {
        let manager = Arc::new(Self::new(threshold, observer));
        schedule_ticks(
            scheduler,
            &manager,
            Duration::ZERO,
            open_time,
            Self::half_open_check,
        );
        manager
    }

    /// Current run of failures.
    pub fn failures(&self) -> u32 {
        self.failures.load(Ordering::Acquire)
    }

    pub(crate) fn half_open_check(&self) {
        let threshold = self.threshold;
        let lowered = self
            .failures
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |failures| {
                (failures >= threshold).then(|| threshold.saturating_sub(1))
            });
        if lowered.is_ok() {
            self.observer.transition("open", "half-open");
        }
    }
}

impl StateManager for ConsecutiveFailures {
    fn is_open(&self) -> bool {
        self.failures() >= self.threshold
    }

    fn handle_success(&self) {
        self.failures.store(0, Ordering::Release);
    }

    fn handle_failure(&self) {
        let failures = self.failures.fetch_add(1, Ordering::AcqRel) + 1;
        if failures == self.threshold {
            self.observer.transition("closed", "open");
        }
    }
}

/// State of a [`FrequentFailures`] manager.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrequencyState {
    /// All calls pass.
    Closed,

    /// All calls are blocked.
    Open,

    /// Calls pass as trials; the first outcome decides the next state.
    HalfOpen,

    /// A share of calls is blocked at random.
    Throttle,
}

impl FrequencyState {
    fn as_str(self) -> &'static str {
        match self {
            FrequencyState::Closed => "closed",
            FrequencyState::Open => "open",
            FrequencyState::HalfOpen => "half-open",
            FrequencyState::Throttle => "throttle",
        }
    }
}

/// Randomized admission used in [`FrequencyState::Throttle`].
#[derive(Clone)]
pub struct Throttle {
    percentage: i32,
    draw: Arc<dyn Fn() -> u32 + Send + Sync>,
}

impl Throttle {
    /// Blocks about `percentage` percent of calls.
    pub fn new(percentage: i32) -> Self {
        Self::with_draw(percentage, || fastrand::u32(0..100))
    }

    /// Uses `draw` as the source of numbers in `[0, 100)`.
    pub fn with_draw<F>(percentage: i32, draw: F) -> Self
    where
        F: Fn() -> u32 + Send + Sync + 'static,
    {
        Self {
            percentage,
            draw: Arc::new(draw),
        }
    }

    /// Returns true if this call must be blocked.
    pub fn throttle(&self) -> bool {
        i64::from((self.draw)()) < i64::from(self.percentage)
    }
}

/// Judges the failure percentage of each sampling window.
///
/// A tick with at least `min_window` samples opens on 100% failures,
/// throttles above `acceptable_percentage` and closes otherwise, then starts
/// a new window. A tick with fewer samples only moves an open circuit to
/// half-open. Reading and resetting the two counters is not one atomic step;
/// an outcome recorded in between is dropped from the window.
pub struct FrequentFailures {
    acceptable_percentage: u32,
    min_window: u32,
    throttle: Throttle,
    failures: AtomicU32,
    successes: AtomicU32,
    state: Atomic<FrequencyState>,
    observer: StateObserver,
}

impl FrequentFailures {
    /// Creates a manager without a tick; see [`start`](Self::start).
    pub fn new(
        acceptable_percentage: u32,
        min_window: u32,
        throttle: Throttle,
        observer: StateObserver,
    ) -> Self {
        Self {
            acceptable_percentage,
            min_window,
            throttle,
            failures: AtomicU32::new(0),
            successes: AtomicU32::new(0),
            state: Atomic::new(FrequencyState::Closed),
            observer,
        }
    }

    /// Creates a manager whose first tick comes one `open_time` from now.
    pub fn start(
        acceptable_percentage: u32,
        min_window: u32,
        throttle: Throttle,
        open_time: Duration,
        scheduler: &Scheduler,
        observer: StateObserver,
    ) -> Arc<Self> {
        let manager = Arc::new(Self::new(
            acceptable_percentage,
            min_window,
            throttle,
            observer,
        ));
        schedule_ticks(scheduler, &manager, open_time, open_time, Self::update_state);
        manager
    }

    /// Current state.
    pub fn state(&self) -> FrequencyState {
        self.state.load(Ordering::Acquire)
    }

    fn move_from(&self, from: FrequencyState, to: FrequencyState) {
        if self
            .state
            .compare_exchange(from, to, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            self.observer.transition(from.as_str(), to.as_str());
        }
    }

    pub(crate) fn update_state(&self) {
        let failures = self.failures.load(Ordering::Acquire);
        let total = failures.saturating_add(self.successes.load(Ordering::Acquire));

        if total < self.min_window {
            self.move_from(FrequencyState::Open, FrequencyState::HalfOpen);
            return;
        }

        let percentage = f64::from(failures) * 100.0 / f64::from(total);
        let next = if failures == total {
            FrequencyState::Open
        } else if percentage > f64::from(self.acceptable_percentage) {
            FrequencyState::Throttle
        } else {
            FrequencyState::Closed
        };
        debug!(failures, total, percentage, "failure window evaluated");

        let previous = self.state.swap(next, Ordering::AcqRel);
        if previous != next {
            self.observer.transition(previous.as_str(), next.as_str());
        }
        self.failures.store(0, Ordering::Release);
        self.successes.store(0, Ordering::Release);
    }
}

impl StateManager for FrequentFailures {
    fn is_open(&self) -> bool {
        match self.state() {
            FrequencyState::Throttle => self.throttle.throttle(),
            FrequencyState::Open => true,
            FrequencyState::Closed | FrequencyState::HalfOpen => false,
        }
    }

    fn handle_success(&self) {
        self.move_from(FrequencyState::HalfOpen, FrequencyState::Closed);
        self.successes.fetch_add(1, Ordering::AcqRel);
    }

    fn handle_failure(&self) {
        self.move_from(FrequencyState::HalfOpen, FrequencyState::Open);
        self.failures.fetch_add(1, Ordering::AcqRel);
    }
}

/// Most recent recognized failure of one bucket. Last write wins.
#[derive(Default)]
pub struct LastFailureCause {
    last: ArcSwapOption<Failure>,
}

impl LastFailureCause {
    /// Creates an empty cell.
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores `failure` with its wrapper layers stripped.
    pub fn set(&self, failure: Failure) {
        self.last.store(Some(Arc::new(unwrap_failure(failure))));
    }

    /// The last stored failure.
    pub fn get(&self) -> Option<Failure> {
        self.last.load_full().map(|failure| (*failure).clone())
    }
}

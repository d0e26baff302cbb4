//! Configuration for a [`Switchgear`](crate::Switchgear).

use std::error::Error;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::bucket::BucketRangeFinder;
use crate::error::{ConfigError, Failure};
use crate::metrics::{MetricSink, NullMetricSink};
use crate::pool::{CachedThreadPool, Executor};
use crate::scheduler::Scheduler;
use crate::state::Strategy;

const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);
const DEFAULT_FAILURES_ALLOWED: u32 = 100;
const DEFAULT_FAILURES_PERCENTAGE: u32 = 80;
const DEFAULT_THROTTLING_PERCENTAGE: u32 = 80;
const DEFAULT_WINDOW_SIZE: u32 = 100;
const DEFAULT_CIRCUIT_OPEN_TIME: Duration = Duration::from_millis(1000);
const ISOLATION_THREAD_NAME: &str = "switchgear-isolation";
const STATE_MANAGER_THREAD_NAME: &str = "switchgear-state-manager";

type Recognizer = Arc<dyn Fn(&(dyn Error + 'static)) -> bool + Send + Sync>;

/// Failure kinds that count against a breaker's health.
///
/// An empty set recognizes every failure.
#[derive(Clone, Default)]
pub struct RecognizedFailures {
    recognizers: Vec<Recognizer>,
}

impl RecognizedFailures {
    /// Creates an empty set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Recognizes failures whose underlying error is an `E`.
    pub fn of<E: Error + 'static>(self) -> Self {
        self.matching(|error| error.is::<E>())
    }

    /// Recognizes failures whose underlying error satisfies `predicate`.
    pub fn matching<F>(mut self, predicate: F) -> Self
    where
        F: Fn(&(dyn Error + 'static)) -> bool + Send + Sync + 'static,
    {
        self.recognizers.push(Arc::new(predicate));
        self
    }

    /// Returns true if the set is empty.
    pub fn is_empty(&self) -> bool {
        self.recognizers.is_empty()
    }

    /// Returns true if `failure` is in the set.
    pub fn contains(&self, failure: &Failure) -> bool {
        if self.is_empty() {
            return true;
        }
        let cause: &(dyn Error + 'static) = failure.root_cause();
        self.recognizers.iter().any(|recognize| recognize(cause))
    }
}

impl fmt::Debug for RecognizedFailures {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RecognizedFailures")
            .field("len", &self.recognizers.len())
            .finish()
    }
}

/// Immutable settings shared by every breaker of a [`Switchgear`](crate::Switchgear).
#[derive(Clone)]
pub struct Config {
    executor: Arc<dyn Executor>,
    scheduler: Arc<Scheduler>,
    circuit_breaker_enabled: bool,
    default_timeout: Duration,
    strategy: Strategy,
    max_consecutive_failures: u32,
    acceptable_failure_percentage: u32,
    min_window_size: u32,
    throttling_percentage: u32,
    circuit_open_time: Duration,
    bucket_finder: BucketRangeFinder,
    recognized_failures: RecognizedFailures,
    metric_sink: Arc<dyn MetricSink>,
}

impl Config {
    /// Creates a new builder with default settings.
    pub fn builder() -> ConfigBuilder {
        ConfigBuilder::new()
    }

    /// Pool running the protected calls.
    pub fn executor(&self) -> &Arc<dyn Executor> {
        &self.executor
    }

    /// Scheduler running deadlines and state ticks.
    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Whether calls go through real circuit breakers.
    pub fn circuit_breaker_enabled(&self) -> bool {
        self.circuit_breaker_enabled
    }

    /// Timeout of calls that do not set their own.
    pub fn default_timeout(&self) -> Duration {
        self.default_timeout
    }

    /// State manager strategy.
    pub fn strategy(&self) -> Strategy {
        self.strategy
    }

    /// Failures in a row that open a consecutive-failures bucket.
    pub fn max_consecutive_failures(&self) -> u32 {
        self.max_consecutive_failures
    }

    /// Failure percentage above which a frequent-failures bucket throttles.
    pub fn acceptable_failure_percentage(&self) -> u32 {
        self.acceptable_failure_percentage
    }

    /// Samples needed before a frequent-failures window is judged.
    pub fn min_window_size(&self) -> u32 {
        self.min_window_size
    }

    /// Percentage of calls blocked while throttling.
    pub fn throttling_percentage(&self) -> u32 {
        self.throttling_percentage
    }

    /// Period of state ticks.
    pub fn circuit_open_time(&self) -> Duration {
        self.circuit_open_time
    }

    /// How timeouts map to buckets.
    pub fn bucket_finder(&self) -> BucketRangeFinder {
        self.bucket_finder
    }

    /// Failures that count against breaker health.
    pub fn recognized_failures(&self) -> &RecognizedFailures {
        &self.recognized_failures
    }

    /// Where breaker events are reported.
    pub fn metric_sink(&self) -> &Arc<dyn MetricSink> {
        &self.metric_sink
    }
}

impl fmt::Debug for Config {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Config")
            .field("circuit_breaker_enabled", &self.circuit_breaker_enabled)
            .field("default_timeout", &self.default_timeout)
            .field("strategy", &self.strategy)
            .field("max_consecutive_failures", &self.max_consecutive_failures)
            .field(
                "acceptable_failure_percentage",
                &self.acceptable_failure_percentage,
            )
            .field("min_window_size", &self.min_window_size)
            .field("throttling_percentage", &self.throttling_percentage)
            .field("circuit_open_time", &self.circuit_open_time)
            .field("bucket_finder", &self.bucket_finder)
            .field("recognized_failures", &self.recognized_failures)
            .finish_non_exhaustive()
    }
}

/// Builder for [`Config`].
pub struct ConfigBuilder {
    executor: Option<Arc<dyn Executor>>,
    scheduler: Option<Arc<Scheduler>>,
    circuit_breaker_enabled: bool,
    default_timeout: Duration,
    strategy: Strategy,
    max_consecutive_failures: u32,
    acceptable_failure_percentage: u32,
    min_window_size: u32,
    throttling_percentage: u32,
    circuit_open_time: Duration,
    bucket_width: Option<Duration>,
    recognized_failures: RecognizedFailures,
    metric_sink: Arc<dyn MetricSink>,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    /// Creates a new builder with default settings.
    pub fn new() -> Self {
        Self {
            executor: None,
            scheduler: None,
            circuit_breaker_enabled: true,
            default_timeout: DEFAULT_TIMEOUT,
            strategy: Strategy::default(),
            max_consecutive_failures: DEFAULT_FAILURES_ALLOWED,
            acceptable_failure_percentage: DEFAULT_FAILURES_PERCENTAGE,
            min_window_size: DEFAULT_WINDOW_SIZE,
            throttling_percentage: DEFAULT_THROTTLING_PERCENTAGE,
            circuit_open_time: DEFAULT_CIRCUIT_OPEN_TIME,
            bucket_width: None,
            recognized_failures: RecognizedFailures::new(),
            metric_sink: Arc::new(NullMetricSink),
        }
    }

    /// Sets the pool running protected calls.
    pub fn executor<E: Executor>(mut self, executor: E) -> Self {
        self.executor = Some(Arc::new(executor));
        self
    }

    /// Sets the scheduler for deadlines and state ticks.
    pub fn scheduler(mut self, scheduler: Arc<Scheduler>) -> Self {
        self.scheduler = Some(scheduler);
        self
    }

    /// Enables or disables circuit breaking.
    pub fn circuit_breaker_enabled(mut self, enabled: bool) -> Self {
        self.circuit_breaker_enabled = enabled;
        self
    }

    /// Sets the timeout of calls that do not set their own.
    pub fn default_timeout(mut self, timeout: Duration) -> Self {
        self.default_timeout = timeout;
        self
    }

    /// Sets the state manager strategy.
    pub fn strategy(mut self, strategy: Strategy) -> Self {
        self.strategy = strategy;
        self
    }

    /// Sets the number of failures in a row that opens a bucket.
    pub fn max_consecutive_failures(mut self, count: u32) -> Self {
        self.max_consecutive_failures = count;
        self
    }

    /// Sets the failure percentage above which a bucket throttles.
    pub fn acceptable_failure_percentage(mut self, percentage: u32) -> Self {
        self.acceptable_failure_percentage = percentage;
        self
    }

    /// Sets the number of samples needed to judge a window.
    pub fn min_window_size(mut self, size: u32) -> Self {
        self.min_window_size = size;
        self
    }

    /// Sets the percentage of calls blocked while throttling.
    pub fn throttling_percentage(mut self, percentage: u32) -> Self {
        self.throttling_percentage = percentage;
        self
    }

    /// Sets the period of state ticks.
    pub fn circuit_open_time(mut self, duration: Duration) -> Self {
        self.circuit_open_time = duration;
        self
    }

    /// Splits breaker state into timeout buckets `width` wide.
    pub fn bucket_width(mut self, width: Duration) -> Self {
        self.bucket_width = Some(width);
        self
    }

    /// Sets the failures that count against breaker health.
    pub fn recognized_failures(mut self, recognized: RecognizedFailures) -> Self {
        self.recognized_failures = recognized;
        self
    }

    /// Sets a metric sink for breaker events.
    pub fn metric_sink<M: MetricSink>(mut self, sink: M) -> Self {
        self.metric_sink = Arc::new(sink);
        self
    }

    /// Validates the settings and builds the configuration.
    ///
    /// Missing collaborators are created here: a cached thread pool and a
    /// single-threaded scheduler.
    pub fn build(self) -> Result<Config, ConfigError> {
        positive_duration("default timeout", self.default_timeout)?;
        positive_duration("circuit open time", self.circuit_open_time)?;
        positive("max consecutive failures", self.max_consecutive_failures)?;
        positive("minimum window size", self.min_window_size)?;
        percentage(
            "acceptable failure percentage",
            self.acceptable_failure_percentage,
        )?;
        percentage("throttling percentage", self.throttling_percentage)?;

        let bucket_width = self
            .bucket_width
            .map(|width| u64::try_from(width.as_millis()).unwrap_or(u64::MAX));
        let bucket_finder = BucketRangeFinder::from_width(bucket_width)?;

        let executor = match self.executor {
            Some(executor) => executor,
            None => Arc::new(CachedThreadPool::new(ISOLATION_THREAD_NAME)),
        };
        let scheduler = match self.scheduler {
            Some(scheduler) => scheduler,
            None => Arc::new(Scheduler::new(STATE_MANAGER_THREAD_NAME).map_err(|err| {
                ConfigError::Spawn {
                    what: "scheduler",
                    reason: err.to_string(),
                }
            })?),
        };

        Ok(Config {
            executor,
            scheduler,
            circuit_breaker_enabled: self.circuit_breaker_enabled,
            default_timeout: self.default_timeout,
            strategy: self.strategy,
            max_consecutive_failures: self.max_consecutive_failures,
            acceptable_failure_percentage: self.acceptable_failure_percentage,
            min_window_size: self.min_window_size,
            throttling_percentage: self.throttling_percentage,
            circuit_open_time: self.circuit_open_time,
            bucket_finder,
            recognized_failures: self.recognized_failures,
            metric_sink: self.metric_sink,
        })
    }
}

fn positive(option: &'static str, value: u32) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::NotPositive { option });
    }
    Ok(())
}

fn positive_duration(option: &'static str, value: Duration) -> Result<(), ConfigError> {
    if value.is_zero() {
        return Err(ConfigError::NotPositive { option });
    }
    Ok(())
}

fn percentage(option: &'static str, value: u32) -> Result<(), ConfigError> {
    if !(1..=100).contains(&value) {
        return Err(ConfigError::PercentageOutOfRange { option, value });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bucket::BucketRange;
    use crate::error::RejectedError;
    use std::io;

    #[test]
    fn defaults() {
        let config = Config::builder().build().unwrap();

        assert!(config.circuit_breaker_enabled());
        assert_eq!(config.default_timeout(), Duration::from_millis(1000));
        assert_eq!(config.strategy(), Strategy::ConsecutiveFailures);
        assert_eq!(config.max_consecutive_failures(), 100);
        assert_eq!(config.acceptable_failure_percentage(), 80);
        assert_eq!(config.min_window_size(), 100);
        assert_eq!(config.throttling_percentage(), 80);
        assert_eq!(config.circuit_open_time(), Duration::from_millis(1000));
        assert_eq!(config.bucket_finder(), BucketRangeFinder::Single);
        assert!(config.recognized_failures().is_empty());
    }

    #[test]
    fn rejects_out_of_range_values() {
        let zero_timeout = Config::builder().default_timeout(Duration::ZERO).build();
        assert_eq!(
            zero_timeout.unwrap_err(),
            ConfigError::NotPositive {
                option: "default timeout"
            }
        );

        let percentage = Config::builder().throttling_percentage(101).build();
        assert_eq!(
            percentage.unwrap_err(),
            ConfigError::PercentageOutOfRange {
                option: "throttling percentage",
                value: 101
            }
        );

        assert!(Config::builder().acceptable_failure_percentage(0).build().is_err());
        assert!(Config::builder().max_consecutive_failures(0).build().is_err());
        assert!(Config::builder().min_window_size(0).build().is_err());
        assert!(Config::builder().circuit_open_time(Duration::ZERO).build().is_err());
        assert!(Config::builder().bucket_width(Duration::ZERO).build().is_err());
    }

    #[test]
    fn bucket_width_enables_fixed_buckets() {
        let config = Config::builder()
            .bucket_width(Duration::from_millis(50))
            .build()
            .unwrap();

        assert_eq!(
            config.bucket_finder().find(Duration::from_millis(60)),
            BucketRange::new(50, 99)
        );
    }

    #[test]
    fn recognized_failures_match_by_type() {
        let recognized = RecognizedFailures::new().of::<io::Error>();

        let io_failure = Failure::from_call(Box::new(io::Error::new(io::ErrorKind::Other, "io")));
        let rejected: Failure = RejectedError::new("full").into();

        assert!(recognized.contains(&io_failure));
        assert!(!recognized.contains(&rejected));
        assert!(RecognizedFailures::new().contains(&rejected));
    }

    #[test]
    fn recognized_failures_can_list_builtin_failures() {
        let recognized = RecognizedFailures::new().of::<RejectedError>();

        let rejected: Failure = RejectedError::new("full").into();
        let wrapped = Failure::Execution(Box::new(rejected.clone()));
        let io_failure = Failure::from_call(Box::new(io::Error::new(io::ErrorKind::Other, "io")));

        assert!(recognized.contains(&rejected));
        assert!(recognized.contains(&wrapped));
        assert!(!recognized.contains(&io_failure));
    }

    #[test]
    fn recognized_failures_match_by_predicate() {
        let recognized = RecognizedFailures::new().matching(|error| {
            error
                .downcast_ref::<io::Error>()
                .is_some_and(|error| error.kind() == io::ErrorKind::ConnectionRefused)
        });

        let refused =
            Failure::from_call(Box::new(io::Error::from(io::ErrorKind::ConnectionRefused)));
        let other = Failure::from_call(Box::new(io::Error::from(io::ErrorKind::NotFound)));

        assert!(recognized.contains(&refused));
        assert!(!recognized.contains(&other));
    }
}

//! # switchgear
//!
//! Deadline-bounded, pool-isolated execution of protected calls behind
//! circuit breakers.
//!
//! Every call runs on an isolation worker pool with a deadline. Calls are
//! grouped by name, and every group has its own circuit breaker. A breaker
//! keeps separate health state per *timeout bucket*, so slow calls with a
//! generous timeout cannot trip the circuit of fast calls in the same group.
//!
//! ## Strategies
//!
//! - [`Strategy::ConsecutiveFailures`] opens after a run of failures and lets
//!   one trial call through every open period.
//! - [`Strategy::FrequentFailures`] looks at the failure rate every period,
//!   throttling calls above the acceptable rate and opening when everything
//!   failed.
//!
//! ## Basic Usage
//!
//! ```rust
//! use std::io;
//! use std::time::Duration;
//! use switchgear::{Action, Config, Switchgear};
//!
//! let switchgear = Switchgear::new(
//!     Config::builder()
//!         .default_timeout(Duration::from_millis(500))
//!         .max_consecutive_failures(5)
//!         .build()
//!         .unwrap(),
//! );
//!
//! let action = Action::builder(|| Ok::<_, io::Error>("profile"))
//!     .group("profiles")
//!     .failure_fallback(|_failure| "cached profile")
//!     .build();
//!
//! let outcome = switchgear.execute(&action);
//! assert_eq!(outcome.value(), Some(&"profile"));
//! ```
//!
//! ## Async Support
//!
//! With the `async` feature enabled, calls can be awaited without blocking
//! the runtime:
//!
//! ```rust,ignore
//! let outcome = switchgear.execute_async(action).await;
//! ```
//!
//! ## Features
//!
//! - `async` - Async entry points on top of Tokio
//! - `prometheus` - Prometheus metrics integration

#![forbid(unsafe_code)]
#![deny(missing_docs)]
#![cfg_attr(docsrs, feature(doc_cfg))]

mod action;
mod breaker;
mod bucket;
mod collect;
mod config;
mod dispatch;
mod error;
mod metrics;
mod outcome;
mod pool;
pub mod prelude;
mod promise;
mod registry;
mod scheduler;
mod state;
mod switchgear;
mod timeout;

// Re-exports
pub use action::{Action, ActionBuilder, DEFAULT_GROUP};
pub use breaker::{CircuitBreaker, GuardedBreaker};
pub use bucket::{BucketRange, BucketRangeFinder};
pub use collect::collect;
pub use config::{Config, ConfigBuilder, RecognizedFailures};
pub use dispatch::Dispatcher;
pub use error::{
    unwrap_failure, BoxError, CircuitOpenError, ConfigError, Failure, RejectedError, SharedError,
    TimeoutError,
};
#[cfg(feature = "prometheus")]
#[cfg_attr(docsrs, doc(cfg(feature = "prometheus")))]
pub use metrics::PrometheusSink;
pub use metrics::{MetricSink, NullMetricSink};
pub use outcome::Outcome;
pub use pool::{CachedThreadPool, Executor, Task};
pub use promise::{Completion, Deferred, Promise, ResultHandle};
pub use registry::{BreakerRegistry, BucketedFailures, BucketedStates, Registry};
pub use scheduler::{Scheduler, TimerHandle};
pub use state::{
    ConsecutiveFailures, FrequencyState, FrequentFailures, LastFailureCause, StateManager,
    StateObserver, Strategy, Throttle,
};
pub use switchgear::Switchgear;
pub use timeout::TimeoutScheduler;

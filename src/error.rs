//! Failure taxonomy for protected calls.
//!
//! Every way a protected call can go wrong ends up as a [`Failure`]. The
//! variants mirror where the failure came from: the worker pool refusing the
//! work, the deadline firing, the unit of work itself, an open circuit, or a
//! user supplied fallback. [`Failure::Execution`] is the wrapper layer added by
//! the dispatch machinery and is always stripped with [`unwrap_failure`] before
//! a failure is shown to a fallback or remembered as a bucket's last failure.

use std::any::Any;
use std::error::Error;
use std::fmt::{self, Display, Formatter};
use std::sync::Arc;
use std::time::Duration;

use crate::bucket::BucketRange;

/// Boxed error returned by units of work and fallbacks.
pub type BoxError = Box<dyn Error + Send + Sync + 'static>;

/// Shared, cloneable error held inside a [`Failure`].
pub type SharedError = Arc<dyn Error + Send + Sync + 'static>;

/// A failed protected call.
#[derive(Debug, Clone, thiserror::Error)]
pub enum Failure {
    /// The worker pool refused to run the unit of work.
    #[error(transparent)]
    Rejected(#[from] RejectedError),

    /// The deadline fired before the unit of work completed.
    #[error(transparent)]
    Timeout(#[from] TimeoutError),

    /// The unit of work returned an error.
    #[error("call failed: {0}")]
    Call(#[source] SharedError),

    /// The unit of work or a fallback panicked.
    #[error("call panicked: {0}")]
    Panicked(String),

    /// The circuit was open and the default open-circuit fallback was used.
    #[error(transparent)]
    CircuitOpen(#[from] CircuitOpenError),

    /// A user supplied fallback returned an error.
    #[error("fallback failed: {0}")]
    Fallback(#[source] SharedError),

    /// Wrapper added around failures raised during deferred execution.
    #[error("execution failed: {0}")]
    Execution(#[source] Box<Failure>),
}

impl Failure {
    /// Wraps an error returned by a unit of work.
    ///
    /// An error that already is a [`Failure`] is kept as is.
    pub fn from_call(error: BoxError) -> Self {
        Self::from_boxed(error, Failure::Call)
    }

    /// Wraps an error returned by a user fallback.
    ///
    /// An error that already is a [`Failure`] is kept as is.
    pub fn from_fallback(error: BoxError) -> Self {
        Self::from_boxed(error, Failure::Fallback)
    }

    fn from_boxed(error: BoxError, wrap: fn(SharedError) -> Failure) -> Self {
        match error.downcast::<Failure>() {
            Ok(failure) => *failure,
            Err(error) => wrap(Arc::from(error)),
        }
    }

    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "unknown panic payload".to_string()
        };
        Failure::Panicked(message)
    }

    /// The error this failure is about, past every wrapper layer.
    ///
    /// For [`Failure::Call`] and [`Failure::Fallback`] this is the user's own
    /// error. Rejections, timeouts and open circuits give their own error
    /// type; a panic gives the failure itself.
    pub fn root_cause(&self) -> &(dyn Error + Send + Sync + 'static) {
        match unwrap_ref(self) {
            Failure::Call(error) | Failure::Fallback(error) => error.as_ref(),
            Failure::Rejected(rejected) => rejected,
            Failure::Timeout(timeout) => timeout,
            Failure::CircuitOpen(open) => open,
            failure => failure,
        }
    }

    /// Returns true if the failure, once unwrapped, is a timeout.
    pub fn is_timeout(&self) -> bool {
        matches!(unwrap_ref(self), Failure::Timeout(_))
    }

    /// Returns true if the failure, once unwrapped, is an open circuit.
    pub fn is_circuit_open(&self) -> bool {
        matches!(unwrap_ref(self), Failure::CircuitOpen(_))
    }

    /// Attempts to view the underlying error as a concrete type.
    pub fn downcast_ref<E: Error + 'static>(&self) -> Option<&E> {
        self.root_cause().downcast_ref::<E>()
    }
}

/// Strips every [`Failure::Execution`] layer and returns the real cause.
pub fn unwrap_failure(failure: Failure) -> Failure {
    let mut failure = failure;
    while let Failure::Execution(inner) = failure {
        failure = *inner;
    }
    failure
}

/// Borrowing variant of [`unwrap_failure`].
pub fn unwrap_ref(failure: &Failure) -> &Failure {
    let mut failure = failure;
    while let Failure::Execution(inner) = failure {
        failure = inner;
    }
    failure
}

/// The worker pool refused a submission.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("worker pool rejected the call: {reason}")]
pub struct RejectedError {
    reason: String,
}

impl RejectedError {
    /// Creates a rejection with the pool's reason.
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }

    /// The pool's reason for rejecting the work.
    pub fn reason(&self) -> &str {
        &self.reason
    }
}

/// A deadline fired before the call completed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TimeoutError {
    after: Duration,
    bucket: BucketRange,
}

impl TimeoutError {
    /// Creates a timeout for a call guarded by `after` in `bucket`.
    pub fn new(after: Duration, bucket: BucketRange) -> Self {
        Self { after, bucket }
    }

    /// The timeout that elapsed.
    pub fn after(&self) -> Duration {
        self.after
    }

    /// The timeout bucket of the call.
    pub fn bucket(&self) -> BucketRange {
        self.bucket
    }
}

impl Display for TimeoutError {
    fn fmt(&self, f: &mut Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "circuit breaker timeout after {} ms",
            self.after.as_millis()
        )?;
        if !self.bucket.is_all() {
            write!(f, " for timeout bucket {} ms", self.bucket)?;
        }
        Ok(())
    }
}

impl Error for TimeoutError {}

/// The circuit is open; carries the failure that tripped it, if known.
#[derive(Debug, Clone, thiserror::Error)]
#[error("circuit breaker is open")]
pub struct CircuitOpenError {
    #[source]
    cause: Option<Box<Failure>>,
}

impl CircuitOpenError {
    /// Creates an open-circuit failure caused by `cause`.
    pub fn new(cause: Option<Failure>) -> Self {
        Self {
            cause: cause.map(Box::new),
        }
    }

    /// The last failure observed before the circuit opened.
    pub fn cause(&self) -> Option<&Failure> {
        self.cause.as_deref()
    }
}

/// Invalid configuration value.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ConfigError {
    /// A value that must be strictly positive was zero.
    #[error("{option} must be greater than zero")]
    NotPositive {
        /// Name of the offending option.
        option: &'static str,
    },

    /// A percentage fell outside of `[1, 100]`.
    #[error("{option} must be within [1, 100], got {value}")]
    PercentageOutOfRange {
        /// Name of the offending option.
        option: &'static str,
        /// The rejected value.
        value: u32,
    },

    /// A default collaborator could not start its thread.
    #[error("failed to start {what}: {reason}")]
    Spawn {
        /// The collaborator that failed to start.
        what: &'static str,
        /// The underlying I/O error.
        reason: String,
    },
}

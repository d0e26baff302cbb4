//! Units of work and their fallbacks.

use std::fmt;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use crate::error::{BoxError, CircuitOpenError, Failure};

/// Name of the group used when an action does not pick one: the empty string.
pub const DEFAULT_GROUP: &str = "";

pub(crate) type Work<T> = Arc<dyn Fn() -> Result<Option<T>, BoxError> + Send + Sync>;
type OpenFallback<T> = Arc<dyn Fn(Option<Failure>) -> Result<T, BoxError> + Send + Sync>;
type FailureFallback<T> = Arc<dyn Fn(Failure) -> Result<T, BoxError> + Send + Sync>;

/// A unit of work to run under protection, plus how to recover from it.
///
/// The work may run any number of times: once per execution, or never if the
/// circuit of its group is open. Cloning is cheap.
pub struct Action<T> {
    group: Arc<str>,
    work: Work<T>,
    open_fallback: OpenFallback<T>,
    failure_fallback: Option<FailureFallback<T>>,
    timeout: Option<Duration>,
}

impl<T: Send + 'static> Action<T> {
    /// An action in the default group with default fallbacks and timeout.
    pub fn from_fn<F, E>(work: F) -> Self
    where
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        Self::builder(work).build()
    }

    /// Starts configuring an action running `work`.
    pub fn builder<F, E>(work: F) -> ActionBuilder<T>
    where
        F: Fn() -> Result<T, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        ActionBuilder::new(Arc::new(move || work().map(Some).map_err(Into::<BoxError>::into)))
    }

    /// Starts configuring an action whose work may produce no value.
    pub fn optional<F, E>(work: F) -> ActionBuilder<T>
    where
        F: Fn() -> Result<Option<T>, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        ActionBuilder::new(Arc::new(move || work().map_err(Into::<BoxError>::into)))
    }
}

impl<T> Action<T> {
    /// The circuit-breaker group of this action.
    pub fn group(&self) -> &str {
        &self.group
    }

    /// The action's own timeout, if it has one.
    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Returns true if a failure fallback was configured.
    pub fn has_failure_fallback(&self) -> bool {
        self.failure_fallback.is_some()
    }

    pub(crate) fn work(&self) -> Work<T> {
        Arc::clone(&self.work)
    }

    /// Produces the open-circuit value; the result is never empty.
    pub(crate) fn open_fallback(&self) -> impl Fn(Option<Failure>) -> Result<Option<T>, Failure> {
        let fallback = Arc::clone(&self.open_fallback);
        move |cause| guarded(|| fallback(cause)).map(Some)
    }

    /// Applies the failure fallback, or hands `failure` back if there is none.
    pub(crate) fn recover(&self, failure: Failure) -> Result<T, Failure> {
        match &self.failure_fallback {
            Some(fallback) => guarded(|| fallback(failure)),
            None => Err(failure),
        }
    }
}

impl<T> Clone for Action<T> {
    fn clone(&self) -> Self {
        Self {
            group: Arc::clone(&self.group),
            work: Arc::clone(&self.work),
            open_fallback: Arc::clone(&self.open_fallback),
            failure_fallback: self.failure_fallback.clone(),
            timeout: self.timeout,
        }
    }
}

impl<T> fmt::Debug for Action<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Action")
            .field("group", &self.group)
            .field("timeout", &self.timeout)
            .field("failure_fallback", &self.failure_fallback.is_some())
            .finish_non_exhaustive()
    }
}

// Runs a user fallback, turning its errors and panics into failures.
fn guarded<T, F>(fallback: F) -> Result<T, Failure>
where
    F: FnOnce() -> Result<T, BoxError>,
{
    match panic::catch_unwind(AssertUnwindSafe(fallback)) {
        Ok(result) => result.map_err(Failure::from_fallback),
        Err(payload) => {
            tracing::warn!("fallback panicked");
            Err(Failure::from_panic(payload))
        }
    }
}

fn circuit_open<T>(cause: Option<Failure>) -> Result<T, BoxError> {
    Err(Box::new(Failure::CircuitOpen(CircuitOpenError::new(cause))))
}

/// Builder for [`Action`].
pub struct ActionBuilder<T> {
    group: Option<String>,
    work: Work<T>,
    open_fallback: Option<OpenFallback<T>>,
    failure_fallback: Option<FailureFallback<T>>,
    timeout: Option<Duration>,
}

impl<T: Send + 'static> ActionBuilder<T> {
    fn new(work: Work<T>) -> Self {
        Self {
            group: None,
            work,
            open_fallback: None,
            failure_fallback: None,
            timeout: None,
        }
    }

    /// Sets the circuit-breaker group.
    pub fn group(mut self, group: impl Into<String>) -> Self {
        self.group = Some(group.into());
        self
    }

    /// Sets the action's timeout, overriding the configured default.
    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Value to use while the circuit is open. Receives the last recognized
    /// failure of the call's bucket.
    pub fn open_fallback<F>(self, fallback: F) -> Self
    where
        F: Fn(Option<Failure>) -> T + Send + Sync + 'static,
    {
        self.try_open_fallback(move |cause| Ok::<_, BoxError>(fallback(cause)))
    }

    /// Fallible variant of [`open_fallback`](Self::open_fallback).
    pub fn try_open_fallback<F, E>(mut self, fallback: F) -> Self
    where
        F: Fn(Option<Failure>) -> Result<T, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        self.open_fallback = Some(Arc::new(move |cause| {
            fallback(cause).map_err(Into::<BoxError>::into)
        }));
        self
    }

    /// Value to use when the call fails. Receives the unwrapped failure.
    pub fn failure_fallback<F>(self, fallback: F) -> Self
    where
        F: Fn(Failure) -> T + Send + Sync + 'static,
    {
        self.try_failure_fallback(move |failure| Ok::<_, BoxError>(fallback(failure)))
    }

    /// Fallible variant of [`failure_fallback`](Self::failure_fallback).
    pub fn try_failure_fallback<F, E>(mut self, fallback: F) -> Self
    where
        F: Fn(Failure) -> Result<T, E> + Send + Sync + 'static,
        E: Into<BoxError>,
    {
        self.failure_fallback = Some(Arc::new(move |failure| {
            fallback(failure).map_err(Into::<BoxError>::into)
        }));
        self
    }

    /// Builds the action.
    pub fn build(self) -> Action<T> {
        Action {
            group: Arc::from(self.group.as_deref().unwrap_or(DEFAULT_GROUP)),
            work: self.work,
            open_fallback: match self.open_fallback {
                Some(fallback) => fallback,
                None => Arc::new(circuit_open::<T>),
            },
            failure_fallback: self.failure_fallback,
            timeout: self.timeout,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io;

    fn io_error(message: &str) -> io::Error {
        io::Error::new(io::ErrorKind::Other, message.to_string())
    }

    #[test]
    fn defaults() {
        let action = Action::from_fn(|| Ok::<_, io::Error>(1));
        let explicit = Action::builder(|| Ok::<_, io::Error>(2)).group("").build();
        assert_eq!(action.group(), "");
        assert_eq!(action.group(), explicit.group());
        assert_eq!(action.timeout(), None);
        assert!(!action.has_failure_fallback());
        assert_eq!((action.work())().unwrap(), Some(1));
    }

    #[test]
    fn default_open_fallback_reports_open_circuit_with_cause() {
        let action = Action::from_fn(|| Ok::<_, io::Error>(1));
        let cause = Failure::from_call(Box::new(io_error("down")));

        let failure = (action.open_fallback())(Some(cause)).unwrap_err();

        match failure {
            Failure::CircuitOpen(open) => {
                assert!(open.cause().unwrap().downcast_ref::<io::Error>().is_some());
            }
            other => panic!("unexpected failure: {other}"),
        }
    }

    #[test]
    fn custom_open_fallback_sees_cause() {
        let action = Action::builder(|| Ok::<_, io::Error>("work"))
            .open_fallback(|cause| if cause.is_some() { "with cause" } else { "no cause" })
            .build();

        assert_eq!((action.open_fallback())(None).unwrap(), Some("no cause"));
    }

    #[test]
    fn failing_fallback_error_becomes_fallback_failure() {
        let action = Action::builder(|| Ok::<_, io::Error>(0))
            .try_failure_fallback(|_| Err::<u32, _>(io_error("fallback down")))
            .build();

        let failure = action.recover(Failure::Panicked("work".into())).unwrap_err();

        assert!(matches!(failure, Failure::Fallback(_)));
        assert_eq!(failure.root_cause().to_string(), "fallback down");
    }

    #[test]
    fn panicking_fallback_becomes_panicked_failure() {
        let action = Action::builder(|| Ok::<_, io::Error>(0))
            .failure_fallback(|_| panic!("fallback exploded"))
            .build();

        let failure = action.recover(Failure::Panicked("work".into())).unwrap_err();

        assert!(matches!(failure, Failure::Panicked(message) if message == "fallback exploded"));
    }

    #[test]
    fn optional_work_may_be_empty() {
        let action = Action::<u32>::optional(|| Ok::<_, io::Error>(None))
            .group("lookups")
            .timeout(Duration::from_millis(5))
            .build();

        assert_eq!(action.group(), "lookups");
        assert_eq!(action.timeout(), Some(Duration::from_millis(5)));
        assert_eq!((action.work())().unwrap(), None);
    }
}

//! Turns dispatched calls into outcomes.

use std::time::Duration;

use tracing::debug;

use crate::action::Action;
use crate::bucket::BucketRange;
use crate::error::{unwrap_failure, Failure, TimeoutError};
use crate::outcome::Outcome;
use crate::promise::ResultHandle;

/// Waits up to `timeout` for `handle` and resolves it into an [`Outcome`].
///
/// A failure, with its wrapper layers stripped, goes through the action's
/// failure fallback when it has one. The fallback's own failure is reported
/// as is, without a second round of fallbacks.
pub fn collect<T>(
    action: &Action<T>,
    handle: ResultHandle<Option<T>>,
    timeout: Duration,
) -> Outcome<T> {
    let failure = match handle.wait_timeout(timeout) {
        Some(Ok(value)) => return Outcome::from_option(value),
        Some(Err(failure)) => unwrap_failure(failure),
        None => {
            debug!(group = action.group(), ?timeout, "gave up waiting for call");
            Failure::Timeout(TimeoutError::new(timeout, BucketRange::ALL))
        }
    };

    if !action.has_failure_fallback() {
        return Outcome::Failed(failure);
    }
    debug!(group = action.group(), error = %failure, "applying failure fallback");
    action.recover(failure).into()
}

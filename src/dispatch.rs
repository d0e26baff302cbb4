//! Hands actions to their breaker and the worker pool.

use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;
use std::time::Duration;

use tracing::warn;

use crate::action::{Action, Work};
use crate::error::Failure;
use crate::pool::Executor;
use crate::promise::{Promise, ResultHandle};
use crate::registry::BreakerRegistry;

/// Starts protected calls without waiting for them.
pub struct Dispatcher {
    executor: Arc<dyn Executor>,
    breakers: BreakerRegistry,
}

impl Dispatcher {
    /// Creates a dispatcher running work on `executor`.
    pub fn new(executor: Arc<dyn Executor>, breakers: BreakerRegistry) -> Self {
        Self { executor, breakers }
    }

    /// The breakers used by this dispatcher.
    pub fn breakers(&self) -> &BreakerRegistry {
        &self.breakers
    }

    /// Starts `action` under its group's breaker with `timeout`.
    ///
    /// Never blocks on the work itself and never panics; anything going wrong
    /// while starting the call ends up in the returned handle.
    pub fn dispatch<T: Send + 'static>(
        &self,
        action: &Action<T>,
        timeout: Duration,
    ) -> ResultHandle<Option<T>> {
        let started = panic::catch_unwind(AssertUnwindSafe(|| {
            let breaker = self.breakers.get_for(action.group());
            let executor = Arc::clone(&self.executor);
            let work = action.work();
            breaker.execute(
                move || submit(executor.as_ref(), work),
                action.open_fallback(),
                timeout,
            )
        }));
        started.unwrap_or_else(|payload| {
            warn!(group = action.group(), "failed to dispatch call");
            ResultHandle::failed(Failure::from_panic(payload))
        })
    }
}

// Runs `work` on the pool. Errors and panics of the work are wrapped in an
// execution layer; a refused submission fails the promise right away.
fn submit<T: Send + 'static>(executor: &dyn Executor, work: Work<T>) -> Promise<Option<T>> {
    let promise = Promise::new();
    let completer = promise.share();
    let task = Box::new(move || {
        let result = match panic::catch_unwind(AssertUnwindSafe(|| work())) {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(error)) => Err(Failure::from_call(error)),
            Err(payload) => {
                warn!("unit of work panicked");
                Err(Failure::from_panic(payload))
            }
        };
        completer.complete(result.map_err(|failure| Failure::Execution(Box::new(failure))));
    });

    if let Err(rejected) = executor.submit(task) {
        warn!(reason = rejected.reason(), "worker pool rejected call");
        promise.complete(Err(rejected.into()));
    }
    promise
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::error::{unwrap_failure, RejectedError};
    use crate::pool::Task;
    use std::io;
    use std::sync::atomic::{AtomicUsize, Ordering};

    struct Refusing;

    impl Executor for Refusing {
        fn submit(&self, _task: Task) -> Result<(), RejectedError> {
            Err(RejectedError::new("full"))
        }
    }

    fn dispatcher(executor: Arc<dyn Executor>) -> Dispatcher {
        let config = Arc::new(Config::builder().build().unwrap());
        Dispatcher::new(executor, BreakerRegistry::from_config(config))
    }

    fn pooled() -> Dispatcher {
        let config = Config::builder().build().unwrap();
        dispatcher(Arc::clone(config.executor()))
    }

    #[test]
    fn work_errors_are_wrapped_once() {
        let action = Action::<u32>::from_fn(|| Err(io::Error::new(io::ErrorKind::Other, "down")));

        let failure = pooled()
            .dispatch(&action, Duration::from_secs(1))
            .wait()
            .unwrap_err();

        assert!(matches!(failure, Failure::Execution(_)));
        let failure = unwrap_failure(failure);
        assert!(matches!(failure, Failure::Call(_)));
        assert!(failure.downcast_ref::<io::Error>().is_some());
    }

    #[test]
    fn panics_become_failures() {
        let action =
            Action::<u32>::from_fn(|| -> Result<u32, io::Error> { panic!("worker blew up") });

        let failure = pooled()
            .dispatch(&action, Duration::from_secs(1))
            .wait()
            .unwrap_err();

        assert!(matches!(unwrap_failure(failure), Failure::Panicked(m) if m == "worker blew up"));
    }

    #[test]
    fn rejection_fails_without_running_work() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);
        let action = Action::from_fn(move || {
            counter.fetch_add(1, Ordering::SeqCst);
            Ok::<_, io::Error>(1)
        });

        let handle = dispatcher(Arc::new(Refusing)).dispatch(&action, Duration::from_secs(1));

        assert!(handle.is_done());
        assert!(matches!(handle.wait(), Err(Failure::Rejected(_))));
        assert_eq!(runs.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn value_passes_through() {
        let action = Action::from_fn(|| Ok::<_, io::Error>("value"));

        let value = pooled()
            .dispatch(&action, Duration::from_secs(1))
            .wait()
            .unwrap();

        assert_eq!(value, Some("value"));
    }
}

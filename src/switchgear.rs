//! The public entry point.

use std::sync::Arc;
use std::time::Duration;

use crate::action::Action;
use crate::collect::collect;
use crate::config::Config;
use crate::dispatch::Dispatcher;
use crate::outcome::Outcome;
use crate::promise::ResultHandle;
use crate::registry::BreakerRegistry;

struct Inner {
    config: Arc<Config>,
    dispatcher: Dispatcher,
}

/// Runs actions with deadlines on an isolation pool, behind per-group circuit
/// breakers.
///
/// Cloning is cheap; clones share pool, scheduler and breakers.
#[derive(Clone)]
pub struct Switchgear {
    inner: Arc<Inner>,
}

impl Switchgear {
    /// Creates a switchgear from `config`.
    pub fn new(config: Config) -> Self {
        let config = Arc::new(config);
        let dispatcher = Dispatcher::new(
            Arc::clone(config.executor()),
            BreakerRegistry::from_config(Arc::clone(&config)),
        );
        Self {
            inner: Arc::new(Inner { config, dispatcher }),
        }
    }

    /// The configuration in use.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Number of groups that have a breaker so far.
    pub fn groups(&self) -> usize {
        self.inner.dispatcher.breakers().len()
    }

    /// Runs `action` and blocks for its outcome.
    pub fn execute<T: Send + 'static>(&self, action: &Action<T>) -> Outcome<T> {
        let (handle, timeout) = self.dispatch(action);
        collect(action, handle, timeout)
    }

    /// Runs all `actions` concurrently and blocks for their outcomes, in order.
    pub fn execute_in_parallel<T: Send + 'static>(
        &self,
        actions: &[Action<T>],
    ) -> Vec<Outcome<T>> {
        let dispatched: Vec<_> = actions.iter().map(|action| self.dispatch(action)).collect();
        actions
            .iter()
            .zip(dispatched)
            .map(|(action, (handle, timeout))| collect(action, handle, timeout))
            .collect()
    }

    fn dispatch<T: Send + 'static>(
        &self,
        action: &Action<T>,
    ) -> (ResultHandle<Option<T>>, Duration) {
        let timeout = self.timeout_of(action);
        (self.inner.dispatcher.dispatch(action, timeout), timeout)
    }

    fn timeout_of<T>(&self, action: &Action<T>) -> Duration {
        action
            .timeout()
            .unwrap_or_else(|| self.inner.config.default_timeout())
    }
}

#[cfg(feature = "async")]
impl Switchgear {
    /// Runs `action` without blocking the async runtime.
    pub async fn execute_async<T: Send + 'static>(&self, action: Action<T>) -> Outcome<T> {
        let switchgear = self.clone();
        match tokio::task::spawn_blocking(move || switchgear.execute(&action)).await {
            Ok(outcome) => outcome,
            Err(err) => Outcome::Failed(crate::error::Failure::Panicked(err.to_string())),
        }
    }

    /// Runs all `actions` concurrently without blocking the async runtime.
    pub async fn execute_in_parallel_async<T: Send + 'static>(
        &self,
        actions: Vec<Action<T>>,
    ) -> Vec<Outcome<T>> {
        let waits = actions.into_iter().map(|action| {
            let (handle, timeout) = self.dispatch(&action);
            async move {
                match tokio::task::spawn_blocking(move || collect(&action, handle, timeout)).await {
                    Ok(outcome) => outcome,
                    Err(err) => Outcome::Failed(crate::error::Failure::Panicked(err.to_string())),
                }
            }
        });
        let waits: Vec<_> = waits.collect();
        futures::future::join_all(waits).await
    }
}

impl std::fmt::Debug for Switchgear {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Switchgear")
            .field("config", &self.inner.config)
            .field("groups", &self.groups())
            .finish()
    }
}

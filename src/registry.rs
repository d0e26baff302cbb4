//! Lazily populated registries: breakers per group, state per bucket.
//!
//! Entries are never evicted; a long-running process keeps one entry per
//! group and bucket it has ever seen.

use std::borrow::Borrow;
use std::collections::HashMap;
use std::hash::Hash;
use std::sync::Arc;

use parking_lot::RwLock;
use tracing::debug;

use crate::breaker::CircuitBreaker;
use crate::bucket::BucketRange;
use crate::config::Config;
use crate::state::{
    ConsecutiveFailures, FrequentFailures, LastFailureCause, StateManager, StateObserver,
    Strategy, Throttle,
};

/// Concurrent map with atomic get-or-create.
///
/// Racing lookups of a missing key may each build a value, but only the
/// first one inserted is kept and returned to all of them.
pub struct Registry<K, V> {
    entries: RwLock<HashMap<K, V, ahash::RandomState>>,
}

impl<K, V> Default for Registry<K, V> {
    fn default() -> Self {
        Self {
            entries: RwLock::new(HashMap::default()),
        }
    }
}

impl<K, V> Registry<K, V>
where
    K: Eq + Hash,
    V: Clone,
{
    /// Creates an empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns the value for `key`, building it with `create` if missing.
    pub fn get_or_create<Q, F>(&self, key: &Q, create: F) -> V
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ToOwned<Owned = K> + ?Sized,
        F: FnOnce() -> V,
    {
        if let Some(value) = self.entries.read().get(key) {
            return value.clone();
        }

        let created = create();
        self.entries
            .write()
            .entry(key.to_owned())
            .or_insert(created)
            .clone()
    }

    /// Returns the value for `key` if present.
    pub fn get<Q>(&self, key: &Q) -> Option<V>
    where
        K: Borrow<Q>,
        Q: Hash + Eq + ?Sized,
    {
        self.entries.read().get(key).cloned()
    }

    /// Number of entries.
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    /// Returns true if there are no entries.
    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

/// One [`StateManager`] per bucket of a breaker.
pub struct BucketedStates {
    group: Arc<str>,
    config: Arc<Config>,
    states: Registry<BucketRange, Arc<dyn StateManager>>,
}

impl BucketedStates {
    /// Creates an empty holder for the breaker of `group`.
    pub fn new(group: Arc<str>, config: Arc<Config>) -> Self {
        Self {
            group,
            config,
            states: Registry::new(),
        }
    }

    /// The state manager of `bucket`, started on first use.
    pub fn get(&self, bucket: BucketRange) -> Arc<dyn StateManager> {
        self.states.get_or_create(&bucket, || self.start(bucket))
    }

    /// Number of buckets seen so far.
    pub fn len(&self) -> usize {
        self.states.len()
    }

    /// Returns true if no bucket was used yet.
    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    fn start(&self, bucket: BucketRange) -> Arc<dyn StateManager> {
        let config = &self.config;
        let strategy = config.strategy();
        debug!(group = %self.group, %bucket, ?strategy, "starting bucket state");

        let observer = StateObserver::new(
            Arc::clone(&self.group),
            bucket,
            Arc::clone(config.metric_sink()),
        );
        match strategy {
            Strategy::ConsecutiveFailures => ConsecutiveFailures::start(
                config.max_consecutive_failures(),
                config.circuit_open_time(),
                config.scheduler(),
                observer,
            ),
            Strategy::FrequentFailures => FrequentFailures::start(
                config.acceptable_failure_percentage(),
                config.min_window_size(),
                Throttle::new(i32::try_from(config.throttling_percentage()).unwrap_or(i32::MAX)),
                config.circuit_open_time(),
                config.scheduler(),
                observer,
            ),
        }
    }
}

/// One [`LastFailureCause`] per bucket of a breaker.
#[derive(Default)]
pub struct BucketedFailures {
    failures: Registry<BucketRange, Arc<LastFailureCause>>,
}

impl BucketedFailures {
    /// Creates an empty holder.
    pub fn new() -> Self {
        Self::default()
    }

    /// The last-failure cell of `bucket`.
    pub fn get(&self, bucket: BucketRange) -> Arc<LastFailureCause> {
        self.failures
            .get_or_create(&bucket, || Arc::new(LastFailureCause::new()))
    }
}

type BreakerFactory = Box<dyn Fn(&str) -> CircuitBreaker + Send + Sync>;

/// One [`CircuitBreaker`] per group name.
pub struct BreakerRegistry {
    breakers: Registry<String, CircuitBreaker>,
    factory: BreakerFactory,
}

impl BreakerRegistry {
    /// Creates a registry building breakers with `factory`.
    pub fn new<F>(factory: F) -> Self
    where
        F: Fn(&str) -> CircuitBreaker + Send + Sync + 'static,
    {
        Self {
            breakers: Registry::new(),
            factory: Box::new(factory),
        }
    }

    /// Creates a registry for `config`: real breakers when circuit breaking
    /// is enabled, pass-through ones otherwise.
    pub fn from_config(config: Arc<Config>) -> Self {
        if config.circuit_breaker_enabled() {
            Self::new(move |group| CircuitBreaker::guarded(group, Arc::clone(&config)))
        } else {
            Self::new(|_| CircuitBreaker::PassThrough)
        }
    }

    /// The breaker of `group`, created on first use.
    pub fn get_for(&self, group: &str) -> CircuitBreaker {
        self.breakers
            .get_or_create(group, || (self.factory)(group))
    }

    /// Number of groups seen so far.
    pub fn len(&self) -> usize {
        self.breakers.len()
    }

    /// Returns true if no group was used yet.
    pub fn is_empty(&self) -> bool {
        self.breakers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Barrier;
    use std::thread;
    use std::time::Duration;

    fn config(strategy: Strategy) -> Arc<Config> {
        Arc::new(
            Config::builder()
                .strategy(strategy)
                .circuit_open_time(Duration::from_secs(60))
                .build()
                .unwrap(),
        )
    }

    #[test]
    fn racing_creators_share_one_value() {
        let registry: Arc<Registry<String, Arc<usize>>> = Arc::new(Registry::new());
        let built = Arc::new(AtomicUsize::new(0));
        let barrier = Arc::new(Barrier::new(8));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let registry = Arc::clone(&registry);
                let built = Arc::clone(&built);
                let barrier = Arc::clone(&barrier);
                thread::spawn(move || {
                    barrier.wait();
                    registry.get_or_create("key", || {
                        built.fetch_add(1, Ordering::SeqCst);
                        Arc::new(i)
                    })
                })
            })
            .collect();
        let values: Vec<_> = handles.into_iter().map(|h| h.join().unwrap()).collect();

        assert!(values.iter().all(|v| Arc::ptr_eq(v, &values[0])));
        assert_eq!(registry.len(), 1);
        assert!(built.load(Ordering::SeqCst) >= 1);
    }

    #[test]
    fn same_bucket_shares_state() {
        let states = BucketedStates::new(Arc::from("group"), config(Strategy::ConsecutiveFailures));
        let a = states.get(BucketRange::new(10, 19));
        let b = states.get(BucketRange::new(10, 19));
        let c = states.get(BucketRange::new(20, 29));

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
        assert_eq!(states.len(), 2);
    }

    #[test]
    fn strategy_selects_the_state_manager() {
        let consecutive =
            BucketedStates::new(Arc::from("g"), config(Strategy::ConsecutiveFailures));
        let manager = consecutive.get(BucketRange::ALL);
        thread::sleep(Duration::from_millis(10));
        // default threshold of 100
        for _ in 0..99 {
            manager.handle_failure();
        }
        assert!(!manager.is_open());
        manager.handle_failure();
        assert!(manager.is_open());

        let frequent = BucketedStates::new(Arc::from("g"), config(Strategy::FrequentFailures));
        let manager = frequent.get(BucketRange::ALL);
        for _ in 0..500 {
            manager.handle_failure();
        }
        // frequent-failures state only changes on a tick
        assert!(!manager.is_open());
    }

    #[test]
    fn last_failure_cells_are_per_bucket() {
        let failures = BucketedFailures::new();
        let a = failures.get(BucketRange::new(0, 9));
        let b = failures.get(BucketRange::new(0, 9));
        let c = failures.get(BucketRange::ALL);

        assert!(Arc::ptr_eq(&a, &b));
        assert!(!Arc::ptr_eq(&a, &c));
    }

    #[test]
    fn groups_get_their_own_breaker() {
        let registry = BreakerRegistry::from_config(config(Strategy::ConsecutiveFailures));

        let a = registry.get_for("a");
        let a_again = registry.get_for("a");
        let b = registry.get_for("b");

        assert!(a.same_breaker(&a_again));
        assert!(!a.same_breaker(&b));
        assert_eq!(registry.len(), 2);
    }
}

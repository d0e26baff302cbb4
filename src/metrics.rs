//! Metric sinks for breaker events.

use std::time::Duration;

/// Trait for metrics sinks that can receive circuit breaker events.
pub trait MetricSink: Send + Sync + 'static {
    /// Records a state transition of one group's bucket.
    fn record_state_transition(&self, group: &str, from: &str, to: &str);

    /// Records a call that went through the breaker and completed.
    fn record_call(&self, group: &str, success: bool, duration: Duration);

    /// Records a call answered by the open-circuit fallback without running.
    fn record_short_circuit(&self, group: &str);

    /// Records a call cut off by its deadline.
    fn record_timeout(&self, group: &str);
}

/// A null metrics sink that discards all events.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullMetricSink;

impl MetricSink for NullMetricSink {
    fn record_state_transition(&self, _group: &str, _from: &str, _to: &str) {}
    fn record_call(&self, _group: &str, _success: bool, _duration: Duration) {}
    fn record_short_circuit(&self, _group: &str) {}
    fn record_timeout(&self, _group: &str) {}
}

#[cfg(feature = "prometheus")]
pub use self::prometheus_sink::PrometheusSink;

#[cfg(feature = "prometheus")]
mod prometheus_sink {
    use std::time::Duration;

    use prometheus_client::metrics::counter::Counter;
    use prometheus_client::metrics::family::Family;
    use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
    use prometheus_client::registry::Registry;

    use super::MetricSink;

    type Labels = Vec<(String, String)>;

    fn call_duration_histogram() -> Histogram {
        Histogram::new(exponential_buckets(0.001, 2.0, 14))
    }

    fn group_labels(group: &str) -> Labels {
        vec![("group".to_string(), group.to_string())]
    }

    /// Publishes breaker events into a `prometheus-client` registry.
    #[derive(Clone)]
    pub struct PrometheusSink {
        calls: Family<Labels, Counter>,
        durations: Family<Labels, Histogram, fn() -> Histogram>,
        short_circuits: Family<Labels, Counter>,
        timeouts: Family<Labels, Counter>,
        transitions: Family<Labels, Counter>,
    }

    impl PrometheusSink {
        /// Creates the sink and registers its metrics in `registry`.
        pub fn register(registry: &mut Registry) -> Self {
            let sink = Self {
                calls: Family::default(),
                durations: Family::new_with_constructor(
                    call_duration_histogram as fn() -> Histogram,
                ),
                short_circuits: Family::default(),
                timeouts: Family::default(),
                transitions: Family::default(),
            };

            registry.register(
                "switchgear_calls",
                "Protected calls by group and result",
                sink.calls.clone(),
            );
            registry.register(
                "switchgear_call_duration_seconds",
                "Duration of protected calls",
                sink.durations.clone(),
            );
            registry.register(
                "switchgear_short_circuits",
                "Calls answered by the open-circuit fallback",
                sink.short_circuits.clone(),
            );
            registry.register(
                "switchgear_timeouts",
                "Calls cut off by their deadline",
                sink.timeouts.clone(),
            );
            registry.register(
                "switchgear_state_transitions",
                "Circuit state transitions",
                sink.transitions.clone(),
            );

            sink
        }
    }

    impl MetricSink for PrometheusSink {
        fn record_state_transition(&self, group: &str, from: &str, to: &str) {
            let mut labels = group_labels(group);
            labels.push(("from".to_string(), from.to_string()));
            labels.push(("to".to_string(), to.to_string()));
            self.transitions.get_or_create(&labels).inc();
        }

        fn record_call(&self, group: &str, success: bool, duration: Duration) {
            let labels = group_labels(group);
            self.durations
                .get_or_create(&labels)
                .observe(duration.as_secs_f64());

            let mut labels = labels;
            let result = if success { "success" } else { "failure" };
            labels.push(("result".to_string(), result.to_string()));
            self.calls.get_or_create(&labels).inc();
        }

        fn record_short_circuit(&self, group: &str) {
            self.short_circuits.get_or_create(&group_labels(group)).inc();
        }

        fn record_timeout(&self, group: &str) {
            self.timeouts.get_or_create(&group_labels(group)).inc();
        }
    }

}

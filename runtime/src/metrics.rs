use ahash::AHashMap as HashMap;
use policy_agent_core::{metrics, MetricsSender};
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;
use std::time::Duration;
use tracing::debug;

/// The converger's duration metrics, backed by one histogram per stable
/// metric name.
pub struct PrometheusMetrics {
    durations: HashMap<&'static str, Histogram>,
}

impl PrometheusMetrics {
    pub fn register(registry: &mut Registry) -> Self {
        let mut durations = HashMap::new();
        for (name, help) in [
            (
                metrics::ENFORCE_DURATION,
                "Seconds spent enforcing changed policy rule sets in a poll cycle",
            ),
            (
                metrics::POLL_DURATION,
                "Seconds a whole policy poll cycle took",
            ),
            (
                metrics::ASG_ENFORCE_DURATION,
                "Seconds spent enforcing changed ASG rule sets in a sweep",
            ),
            (
                metrics::ASG_CLEANUP_DURATION,
                "Seconds spent reaping orphaned ASG chains in a sweep",
            ),
            (
                metrics::ASG_POLL_DURATION,
                "Seconds a whole ASG sweep took",
            ),
        ] {
            let histogram = Histogram::new(exponential_buckets(0.001, 2.0, 16));
            registry.register(name, help, histogram.clone());
            durations.insert(name, histogram);
        }
        Self { durations }
    }
}

impl MetricsSender for PrometheusMetrics {
    fn send_duration(&self, name: &'static str, elapsed: Duration) {
        match self.durations.get(name) {
            Some(histogram) => histogram.observe(elapsed.as_secs_f64()),
            None => debug!(name, "dropping unregistered duration metric"),
        }
    }
}

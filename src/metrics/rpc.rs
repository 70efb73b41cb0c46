//! The three RPC latency aggregates scraped from the requestor.
//!
//! Everything is registered against a [`MetricsRegistry`] owned by the caller
//! rather than a process-wide recorder, so tests can build independent
//! registries and inspect what was rendered.

use super::MetricsError;
use metrics::{Counter, Histogram};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use std::time::Duration;
use tokio::task::JoinHandle;

pub const SERVICE_LABEL: &str = "rpc-demo-req";
pub const DURATIONS_SUMMARY: &str = "rpc_durations_seconds";
pub const DURATIONS_HISTOGRAM: &str = "rpc_durations_histogram_seconds";
pub const REQUESTS_COUNTER: &str = "rpc_reqs_count";
/// How often buffered histogram samples are folded into their aggregates.
pub const UPKEEP_PERIOD: Duration = Duration::from_secs(5);

/// `count` bucket bounds starting at `start`, each `factor` times the last.
pub fn exponential_buckets(start: f64, factor: f64, count: usize) -> Vec<f64> {
    std::iter::successors(Some(start), |b| Some(b * factor))
        .take(count)
        .collect()
}

pub struct MetricsRegistry {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
}

impl MetricsRegistry {
    /// Summary metrics are rendered as quantiles; the histogram gets fixed
    /// buckets `1, 2, 4, ... 32768`.
    pub fn new() -> Result<Self, MetricsError> {
        let recorder = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Full(DURATIONS_HISTOGRAM.to_string()),
                &exponential_buckets(1.0, 2.0, 16),
            )?
            .build_recorder();
        let handle = recorder.handle();
        Ok(Self { recorder, handle })
    }

    pub fn handle(&self) -> PrometheusHandle {
        self.handle.clone()
    }

    /// Prometheus text exposition of everything recorded so far.
    pub fn render(&self) -> String {
        self.handle.render()
    }

    /// Fold buffered histogram samples on a timer. A recorder built without
    /// the exporter's own runtime only does this on render, so an unscraped
    /// requestor would otherwise grow without bound.
    pub fn spawn_upkeep(&self, period: Duration) -> JoinHandle<()> {
        let handle = self.handle.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(period);
            loop {
                ticker.tick().await;
                handle.run_upkeep();
            }
        })
    }

    pub fn rpc_metrics(&self) -> RpcMetrics {
        metrics::with_local_recorder(&self.recorder, || {
            metrics::describe_histogram!(DURATIONS_SUMMARY, "RPC latency distributions.");
            metrics::describe_histogram!(DURATIONS_HISTOGRAM, "RPC latency distributions.");
            metrics::describe_counter!(REQUESTS_COUNTER, "Requests");
            RpcMetrics {
                durations: metrics::histogram!(DURATIONS_SUMMARY, "service" => SERVICE_LABEL),
                durations_histogram: metrics::histogram!(DURATIONS_HISTOGRAM),
                requests: metrics::counter!(REQUESTS_COUNTER, "service" => SERVICE_LABEL),
            }
        })
    }
}

/// Handles to the summary, histogram and counter. Written only by the
/// request loop; the exporter reads them through the registry.
#[derive(Clone)]
pub struct RpcMetrics {
    durations: Histogram,
    durations_histogram: Histogram,
    requests: Counter,
}

impl RpcMetrics {
    /// Record one completed request that took `millis` milliseconds.
    pub fn observe(&self, millis: f64) {
        self.durations.record(millis);
        self.durations_histogram.record(millis);
        self.requests.increment(1);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn buckets_double_from_one() {
        let buckets = exponential_buckets(1.0, 2.0, 16);
        assert_eq!(buckets.len(), 16);
        assert_eq!(buckets[0], 1.0);
        assert_eq!(buckets[1], 2.0);
        assert_eq!(buckets[15], 32768.0);
    }

    #[test]
    fn observations_reach_all_three_aggregates() {
        let registry = MetricsRegistry::new().expect("registry");
        let rpc = registry.rpc_metrics();
        rpc.observe(1.0);
        rpc.observe(3.0);
        rpc.observe(40.0);

        let text = registry.render();
        assert!(text.contains("rpc_reqs_count{service=\"rpc-demo-req\"} 3"), "{text}");
        assert!(text.contains("# TYPE rpc_durations_seconds summary"), "{text}");
        assert!(
            text.contains("rpc_durations_seconds_count{service=\"rpc-demo-req\"} 3"),
            "{text}"
        );
        assert!(text.contains("# TYPE rpc_durations_histogram_seconds histogram"), "{text}");
        assert!(text.contains("rpc_durations_histogram_seconds_bucket"), "{text}");
        assert!(text.contains("rpc_durations_histogram_seconds_count 3"), "{text}");
    }

    #[test]
    fn registries_are_independent() {
        let a = MetricsRegistry::new().expect("registry a");
        let b = MetricsRegistry::new().expect("registry b");
        a.rpc_metrics().observe(2.0);
        b.rpc_metrics();
        assert!(a.render().contains("rpc_reqs_count{service=\"rpc-demo-req\"} 1"));
        assert!(!b.render().contains("rpc_reqs_count{service=\"rpc-demo-req\"} 1"));
    }

    #[tokio::test]
    async fn upkeep_keeps_running_without_losing_samples() {
        let registry = MetricsRegistry::new().expect("registry");
        let rpc = registry.rpc_metrics();
        let upkeep = registry.spawn_upkeep(Duration::from_millis(5));
        for ms in [1.0, 8.0, 300.0] {
            rpc.observe(ms);
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        assert!(!upkeep.is_finished());

        let text = registry.render();
        assert!(text.contains("rpc_durations_histogram_seconds_count 3"), "{text}");
        assert!(
            text.contains("rpc_durations_seconds_count{service=\"rpc-demo-req\"} 3"),
            "{text}"
        );
        upkeep.abort();
    }
}

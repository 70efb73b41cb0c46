use super::MetricsError;
use hdrhistogram::Histogram;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::RwLock;

/// Local latency and throughput collector backing the exit report.
pub struct Stats {
    // Latency histogram (nanosecond precision)
    latency_hist: RwLock<Histogram<u64>>,

    pub sent_count: AtomicU64,
    pub received_count: AtomicU64,
    pub error_count: AtomicU64,

    start_time: Instant,
}

impl Stats {
    pub fn new() -> Result<Self, MetricsError> {
        Ok(Self {
            // 1ns to 60s range, 3 significant digits
            latency_hist: RwLock::new(Histogram::new_with_bounds(1, 60_000_000_000, 3)?),
            sent_count: AtomicU64::new(0),
            received_count: AtomicU64::new(0),
            error_count: AtomicU64::new(0),
            start_time: Instant::now(),
        })
    }

    /// Record an outgoing request, or a reply sent by the replier.
    pub fn record_sent(&self) {
        self.sent_count.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a reply that came back after `latency_ns`.
    pub async fn record_received(&self, latency_ns: u64) {
        self.received_count.fetch_add(1, Ordering::Relaxed);
        self.latency_hist.write().await.saturating_record(latency_ns);
    }

    pub fn record_error(&self) {
        self.error_count.fetch_add(1, Ordering::Relaxed);
    }

    pub async fn snapshot(&self) -> StatsSnapshot {
        let hist = self.latency_hist.read().await;
        StatsSnapshot {
            sent_count: self.sent_count.load(Ordering::Relaxed),
            received_count: self.received_count.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            elapsed: self.start_time.elapsed(),
            latency_ns_p50: hist.value_at_quantile(0.5),
            latency_ns_p99: hist.value_at_quantile(0.99),
            latency_ns_max: hist.max(),
            latency_ns_mean: hist.mean(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct StatsSnapshot {
    pub sent_count: u64,
    pub received_count: u64,
    pub error_count: u64,
    pub elapsed: Duration,
    pub latency_ns_p50: u64,
    pub latency_ns_p99: u64,
    pub latency_ns_max: u64,
    pub latency_ns_mean: f64,
}

impl StatsSnapshot {
    /// Replies per second since the collector was created.
    pub fn throughput(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 {
            self.received_count as f64 / secs
        } else {
            0.0
        }
    }
}

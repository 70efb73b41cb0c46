use crate::metrics::rpc::RpcMetrics;
use crate::metrics::stats::Stats;
use crate::payload::request_payload;
use crate::transport::Transport;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::time::sleep;
use tracing::{debug, info};

/// Fixed bound on every request.
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone, Debug)]
pub struct RequestorConfig {
    pub subject: String,
    /// Pause after each successful request.
    pub delay: Option<Duration>,
    pub timeout: Duration,
}

impl RequestorConfig {
    pub fn new(subject: impl Into<String>, delay: Option<Duration>) -> Self {
        Self {
            subject: subject.into(),
            delay,
            timeout: REQUEST_TIMEOUT,
        }
    }
}

/// Whole milliseconds in `d` as a float. The nanosecond count is divided as
/// an integer first, so 1.9999ms reports as 1.
pub fn to_millis(d: Duration) -> f64 {
    (d.as_nanos() / 1_000_000) as f64
}

/// The load-generating loop. It runs as one task that owns the sequence
/// counter outright, so the counter is a plain integer: no other task ever
/// reads or writes it.
pub struct RequestLoop {
    transport: Arc<dyn Transport>,
    config: RequestorConfig,
    metrics: RpcMetrics,
    stats: Arc<Stats>,
    sequence: u64,
}

impl RequestLoop {
    pub fn new(
        transport: Arc<dyn Transport>,
        config: RequestorConfig,
        metrics: RpcMetrics,
        stats: Arc<Stats>,
    ) -> Self {
        Self {
            transport,
            config,
            metrics,
            stats,
            sequence: 0,
        }
    }

    /// Issue requests until the connection is closed. Returns how many
    /// requests were issued, including the one the close interrupted.
    pub async fn run(mut self) -> u64 {
        info!(
            subject = %self.config.subject,
            delay = ?self.config.delay,
            timeout = ?self.config.timeout,
            "Starting request loop"
        );
        loop {
            self.sequence += 1;
            let payload = request_payload(self.sequence);

            let start = Instant::now();
            self.stats.record_sent();
            let res = self
                .transport
                .request(&self.config.subject, payload, self.config.timeout)
                .await;

            match res {
                Ok(_) => {
                    let elapsed = start.elapsed();
                    self.metrics.observe(to_millis(elapsed));
                    self.stats
                        .record_received(u64::try_from(elapsed.as_nanos()).unwrap_or(u64::MAX))
                        .await;
                    if let Some(delay) = self.config.delay {
                        sleep(delay).await;
                    }
                }
                Err(e) if e.is_closed() => {
                    debug!(sequence = self.sequence, "Connection closed, stopping request loop");
                    return self.sequence;
                }
                Err(e) => {
                    self.stats.record_error();
                    debug!(sequence = self.sequence, error = %e, "Request error");
                    // Errors such as no-responders can resolve without ever
                    // suspending; give the runtime a turn before retrying.
                    tokio::task::yield_now().await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::rpc::MetricsRegistry;
    use crate::payload::parse_sequence;
    use crate::transport::mock::MockBus;
    use crate::transport::{IncomingRequest, RequestHandler};
    use bytes::Bytes;
    use futures::FutureExt;
    use std::sync::Mutex;

    #[test]
    fn millis_truncate_before_dividing() {
        assert_eq!(to_millis(Duration::from_nanos(999_999)), 0.0);
        assert_eq!(to_millis(Duration::from_nanos(1_000_000)), 1.0);
        assert_eq!(to_millis(Duration::from_nanos(1_500_000)), 1.0);
        assert_eq!(to_millis(Duration::from_nanos(1_999_999)), 1.0);
        assert_eq!(to_millis(Duration::from_millis(250)), 250.0);
    }

    fn recording_handler(seen: Arc<Mutex<Vec<u64>>>) -> RequestHandler {
        Arc::new(move |req: IncomingRequest| {
            let seen = seen.clone();
            async move {
                if let Some(seq) = parse_sequence(&req.payload) {
                    seen.lock().unwrap().push(seq);
                }
                let _ = req.responder.send(Bytes::new()).await;
            }
            .boxed()
        })
    }

    #[tokio::test]
    async fn sequences_are_contiguous_from_one() {
        let bus = MockBus::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        let server = bus.connect();
        server
            .queue_subscribe("demo.requests", "demo", recording_handler(seen.clone()))
            .await
            .expect("subscribe");

        let client: Arc<dyn Transport> = Arc::new(bus.connect());
        let registry = MetricsRegistry::new().expect("registry");
        let stats = Arc::new(Stats::new().expect("stats"));
        let request_loop = RequestLoop::new(
            client.clone(),
            RequestorConfig::new("demo.requests", None),
            registry.rpc_metrics(),
            stats.clone(),
        );
        let handle = tokio::spawn(request_loop.run());

        tokio::time::sleep(Duration::from_millis(100)).await;
        client.close().await;
        let issued = handle.await.expect("join");

        let mut seen = seen.lock().unwrap().clone();
        seen.sort_unstable();
        assert!(seen.len() >= 10, "only {} requests served", seen.len());
        let expected: Vec<u64> = (1..=seen.len() as u64).collect();
        assert_eq!(seen, expected);
        assert!(issued >= seen.len() as u64);

        let snap = stats.snapshot().await;
        assert_eq!(snap.error_count, 0);
        assert!(registry.render().contains("rpc_reqs_count{service=\"rpc-demo-req\"}"));
    }

    #[tokio::test]
    async fn close_interrupts_request_in_flight() {
        let bus = MockBus::new();
        let server = bus.connect();
        // Never replies, so the request would otherwise wait for the timeout.
        let silent: RequestHandler = Arc::new(|req: IncomingRequest| {
            async move {
                let _held = req;
                futures::future::pending::<()>().await
            }
            .boxed()
        });
        server
            .queue_subscribe("slow", "demo", silent)
            .await
            .expect("subscribe");

        let client: Arc<dyn Transport> = Arc::new(bus.connect());
        let registry = MetricsRegistry::new().expect("registry");
        let request_loop = RequestLoop::new(
            client.clone(),
            RequestorConfig::new("slow", None),
            registry.rpc_metrics(),
            Arc::new(Stats::new().expect("stats")),
        );
        let handle = tokio::spawn(request_loop.run());

        tokio::time::sleep(Duration::from_millis(50)).await;
        let started = Instant::now();
        client.close().await;
        let issued = tokio::time::timeout(REQUEST_TIMEOUT, handle)
            .await
            .expect("loop exits within one request timeout")
            .expect("join");
        assert_eq!(issued, 1);
        assert!(started.elapsed() < Duration::from_secs(1));
    }

    #[tokio::test]
    async fn request_errors_do_not_stop_the_loop() {
        let bus = MockBus::new();
        let client: Arc<dyn Transport> = Arc::new(bus.connect());
        let registry = MetricsRegistry::new().expect("registry");
        let stats = Arc::new(Stats::new().expect("stats"));
        let request_loop = RequestLoop::new(
            client.clone(),
            RequestorConfig::new("nobody.home", Some(Duration::from_millis(1))),
            registry.rpc_metrics(),
            stats.clone(),
        );
        let handle = tokio::spawn(request_loop.run());

        tokio::time::sleep(Duration::from_millis(20)).await;
        client.close().await;
        handle.await.expect("join");

        let snap = stats.snapshot().await;
        assert!(snap.error_count > 1);
        assert_eq!(snap.received_count, 0);
        assert!(!registry.render().contains("rpc_reqs_count{service=\"rpc-demo-req\"} 1"));
    }
}

//! Latency aggregates: Prometheus-facing RPC metrics, the `/metrics`
//! exporter and a local summary used for exit reports.

pub mod http;
pub mod rpc;
pub mod stats;

#[derive(thiserror::Error, Debug)]
pub enum MetricsError {
    #[error("histogram buckets: {0}")]
    Buckets(#[from] metrics_exporter_prometheus::BuildError),
    #[error("latency histogram: {0}")]
    Histogram(#[from] hdrhistogram::CreationError),
    #[error("can't start HTTP listener on {addr}: {source}")]
    Bind {
        addr: std::net::SocketAddr,
        source: std::io::Error,
    },
    #[error("HTTP server failed after {0} attempts")]
    ServeExhausted(usize),
}

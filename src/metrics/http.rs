//! Pull-based `/metrics` endpoint served with axum.

use super::MetricsError;
use metrics_exporter_prometheus::PrometheusHandle;
use std::future::Future;
use std::net::{Ipv4Addr, SocketAddr};
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub const MAX_SERVE_ATTEMPTS: usize = 10;

pub fn router(handle: PrometheusHandle) -> axum::Router {
    axum::Router::new().route(
        "/metrics",
        axum::routing::get(move || async move { handle.render() }),
    )
}

/// Bind the exporter listener on all interfaces. Failure here is fatal to the
/// requestor, so it happens before the background server starts.
pub async fn bind(port: u16) -> Result<TcpListener, MetricsError> {
    let addr = SocketAddr::from((Ipv4Addr::UNSPECIFIED, port));
    let listener = TcpListener::bind(addr)
        .await
        .map_err(|source| MetricsError::Bind { addr, source })?;
    debug!("listening at http://{}/metrics", addr);
    Ok(listener)
}

/// Run `attempt` until it succeeds or `max_attempts` runs have failed.
/// Returns the number of the successful attempt.
pub async fn retry_serve<F, Fut>(max_attempts: usize, mut attempt: F) -> Result<usize, MetricsError>
where
    F: FnMut(usize) -> Fut,
    Fut: Future<Output = std::io::Result<()>>,
{
    for n in 1..=max_attempts {
        match attempt(n).await {
            Ok(()) => return Ok(n),
            Err(e) => debug!(
                attempt = n,
                error = %e,
                "Unable to start HTTP server (may already be running)"
            ),
        }
    }
    Err(MetricsError::ServeExhausted(max_attempts))
}

/// Serve `/metrics` in the background. The first attempt uses `listener`;
/// later attempts re-bind its address.
pub fn spawn_exporter(
    listener: TcpListener,
    handle: PrometheusHandle,
    max_attempts: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let addr = match listener.local_addr() {
            Ok(addr) => addr,
            Err(e) => {
                warn!(error = %e, "HTTP listener has no local address");
                return;
            }
        };
        let app = router(handle);
        let mut first = Some(listener);
        let res = retry_serve(max_attempts, |_| {
            let app = app.clone();
            let listener = first.take();
            async move {
                let listener = match listener {
                    Some(l) => l,
                    None => TcpListener::bind(addr).await?,
                };
                debug!("Ready to serve Prometheus requests.");
                axum::serve(listener, app.into_make_service()).await
            }
        })
        .await;
        match res {
            Ok(n) => info!(attempts = n, "Metrics server stopped"),
            Err(e) => warn!(error = %e, "Metrics server stopped"),
        }
    })
}

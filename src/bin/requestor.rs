use anyhow::{Context, Result};
use clap::Parser;
use latency_clients::cli::{RequestorArgs, normalize_flags};
use latency_clients::config::Role;
use latency_clients::metrics::http::{self, MAX_SERVE_ATTEMPTS};
use latency_clients::metrics::rpc::{MetricsRegistry, UPKEEP_PERIOD};
use latency_clients::metrics::stats::Stats;
use latency_clients::roles::requestor::{REQUEST_TIMEOUT, RequestLoop, RequestorConfig};
use latency_clients::shutdown::{ShutdownCoordinator, wait_for_interrupt};
use latency_clients::transport::Transport;
use latency_clients::{logging, transport};
use std::sync::Arc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> Result<()> {
    let args = RequestorArgs::parse_from(normalize_flags(std::env::args()));
    logging::init(logging::level_for(args.debug))?;

    let subject = args.effective_subject().to_string();
    info!("Prometheus Port: {}", args.port);
    info!("Server URLs:     {}", args.urls);
    info!("Subject: {}", subject);

    let registry = MetricsRegistry::new()?;
    let listener = http::bind(args.port)
        .await
        .context("Couldn't start HTTP server")?;
    let exporter = http::spawn_exporter(listener, registry.handle(), MAX_SERVE_ATTEMPTS);
    let upkeep = registry.spawn_upkeep(UPKEEP_PERIOD);

    let options = args.client.client_options(Role::Requestor);
    let transport: Arc<dyn Transport> = Arc::new(
        transport::nats::connect(&args.urls, &options)
            .await
            .context("Can't connect")?,
    );

    let stats = Arc::new(Stats::new()?);
    let request_loop = RequestLoop::new(
        transport.clone(),
        RequestorConfig::new(subject, args.delay()),
        registry.rpc_metrics(),
        stats.clone(),
    );
    let worker = tokio::spawn(request_loop.run());

    ShutdownCoordinator::for_role(Role::Requestor)
        .run(wait_for_interrupt(), &*transport)
        .await?;

    match tokio::time::timeout(REQUEST_TIMEOUT, worker).await {
        Ok(Ok(issued)) => info!(issued, "Request loop stopped"),
        Ok(Err(e)) => warn!(error = %e, "Request loop failed"),
        Err(_) => warn!("Request loop did not stop within the request timeout"),
    }
    exporter.abort();
    upkeep.abort();

    let snap = stats.snapshot().await;
    info!(
        sent = snap.sent_count,
        completed = snap.received_count,
        errors = snap.error_count,
        throughput = snap.throughput(),
        p50_ms = snap.latency_ns_p50 as f64 / 1e6,
        p99_ms = snap.latency_ns_p99 as f64 / 1e6,
        max_ms = snap.latency_ns_max as f64 / 1e6,
        "Final Requestor Statistics"
    );
    println!("Exiting...");
    Ok(())
}

use anyhow::{Context, Result};
use clap::Parser;
use latency_clients::cli::{ReplierArgs, normalize_flags};
use latency_clients::config::Role;
use latency_clients::metrics::stats::Stats;
use latency_clients::roles::replier::{ReplierConfig, start_replier};
use latency_clients::shutdown::{ShutdownCoordinator, wait_for_interrupt};
use latency_clients::{logging, transport};
use std::sync::Arc;
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    let args = ReplierArgs::parse_from(normalize_flags(std::env::args()));
    logging::init(logging::level_for(args.debug))?;

    let options = args.client.client_options(Role::Replier);
    let transport = transport::nats::connect(&args.urls, &options)
        .await
        .context("Can't connect")?;

    let stats = Arc::new(Stats::new()?);
    let config = ReplierConfig {
        subject: args.subject.clone(),
        queue_group: args.queue_group.clone(),
        delay: args.delay(),
    };
    start_replier(&transport, &config, stats.clone())
        .await
        .context("couldn't subscribe")?;

    // Drain on interrupt so requests already handed to us are still
    // answered when scaling down.
    ShutdownCoordinator::for_role(Role::Replier)
        .run(wait_for_interrupt(), &transport)
        .await?;

    let snap = stats.snapshot().await;
    info!(
        served = snap.sent_count,
        errors = snap.error_count,
        "Final Replier Statistics"
    );
    println!("Exiting.");
    Ok(())
}

use crate::metrics::stats::Stats;
use crate::transport::{IncomingRequest, RequestHandler, Transport, TransportError};
use bytes::Bytes;
use futures::FutureExt;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, info};

#[derive(Clone, Debug)]
pub struct ReplierConfig {
    pub subject: String,
    pub queue_group: String,
    /// Artificial service time applied before every reply.
    pub delay: Option<Duration>,
}

/// Subscribe to the configured subject within the queue group and answer
/// every request with an empty reply. Returns once the subscription is live;
/// replies keep flowing until the transport is drained or closed.
pub async fn start_replier(
    transport: &dyn Transport,
    config: &ReplierConfig,
    stats: Arc<Stats>,
) -> Result<(), TransportError> {
    info!(
        subject = %config.subject,
        queue_group = %config.queue_group,
        delay = ?config.delay,
        "Starting replier"
    );
    transport
        .queue_subscribe(
            &config.subject,
            &config.queue_group,
            reply_handler(config.delay, stats),
        )
        .await?;
    info!("Subscribed. Waiting for requests...");
    Ok(())
}

fn reply_handler(delay: Option<Duration>, stats: Arc<Stats>) -> RequestHandler {
    Arc::new(move |request: IncomingRequest| {
        let stats = stats.clone();
        async move {
            let IncomingRequest {
                payload, responder, ..
            } = request;
            if let Some(delay) = delay {
                sleep(delay).await;
            }
            match responder.send(Bytes::new()).await {
                Ok(()) => stats.record_sent(),
                Err(e) => {
                    debug!(error = %e, "Reply failed");
                    stats.record_error();
                }
            }
            debug!("received: {}", String::from_utf8_lossy(&payload));
        }
        .boxed()
    })
}

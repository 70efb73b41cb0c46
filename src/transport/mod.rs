//! Messaging seam: the trait both roles drive, its error type and the adapters.

#[cfg(any(test, feature = "transport-mock"))]
pub mod mock;
#[cfg(feature = "transport-nats")]
pub mod nats;

use std::sync::Arc;
use std::time::Duration;

use std::panic::AssertUnwindSafe;

use bytes::Bytes;
use futures::FutureExt;
use futures::future::BoxFuture;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("connect: {0}")]
    Connect(String),
    #[error("subscribe: {0}")]
    Subscribe(String),
    #[error("publish: {0}")]
    Publish(String),
    #[error("request: {0}")]
    Request(String),
    #[error("timeout")]
    Timeout,
    #[error("no responders")]
    NoResponders,
    #[error("connection closed")]
    Closed,
}

impl TransportError {
    /// True when the connection was closed locally, which ends the request loop.
    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed)
    }
}

/// A request delivered to a subscription.
#[derive(Debug)]
pub struct IncomingRequest {
    pub subject: String,
    pub payload: Bytes,
    /// Reply address, kept for diagnostics; replies go through `responder`.
    pub reply: Option<String>,
    pub responder: Responder,
}

#[async_trait::async_trait]
pub trait ResponderInner: Send + Sync {
    async fn send(&self, payload: Bytes) -> Result<(), TransportError>;
}

/// Publishes to the reply address of one request. A request without a reply
/// address gets a responder whose sends are no-ops.
#[derive(Clone)]
pub struct Responder {
    inner: Option<Arc<dyn ResponderInner>>,
}

impl std::fmt::Debug for Responder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Responder")
            .field("has_reply", &self.inner.is_some())
            .finish()
    }
}

impl Responder {
    pub fn new(inner: impl ResponderInner + 'static) -> Self {
        Self {
            inner: Some(Arc::new(inner)),
        }
    }

    pub fn none() -> Self {
        Self { inner: None }
    }

    pub async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        match &self.inner {
            Some(inner) => inner.send(payload).await,
            None => Ok(()),
        }
    }
}

/// Per-request callback. Deliveries on one subscription are handled one at a
/// time, in arrival order, so a handler that sleeps holds back the next one.
pub type RequestHandler = Arc<dyn Fn(IncomingRequest) -> BoxFuture<'static, ()> + Send + Sync>;

#[async_trait::async_trait]
pub trait Transport: Send + Sync {
    /// Blocking request/reply bounded by `timeout`. Fails with
    /// `TransportError::Closed` as soon as the connection is closed locally,
    /// including for a request already in flight.
    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, TransportError>;

    /// Subscribe as a member of `queue_group`; each message on `subject` is
    /// delivered to exactly one member of the group.
    async fn queue_subscribe(
        &self,
        subject: &str,
        queue_group: &str,
        handler: RequestHandler,
    ) -> Result<(), TransportError>;

    /// Unsubscribe, answer every request already delivered, flush, then close.
    /// A connection that is already closed has nothing to drain: `Ok(())`.
    async fn drain(&self) -> Result<(), TransportError>;

    /// Close immediately. In-flight requests fail with `Closed`.
    async fn close(&self);
}

/// The receiving half of one queue subscription, as seen by its worker.
#[async_trait::async_trait]
pub(crate) trait Deliveries: Send {
    /// Next delivered request, or `None` once the subscription has ended and
    /// its buffer is empty.
    async fn next_request(&mut self) -> Option<IncomingRequest>;

    /// Tell the server to stop routing to this member. Requests already
    /// delivered stay buffered and are still returned by `next_request`.
    async fn stop_intake(&mut self);
}

enum Step {
    Stop,
    Next(Option<IncomingRequest>),
}

/// Hand every delivery to `handler` until the subscription ends. When `stop`
/// fires the subscription stops taking new work, then everything it was
/// already handed is answered before this returns.
pub(crate) async fn serve_deliveries<D: Deliveries>(
    mut deliveries: D,
    handler: RequestHandler,
    stop: CancellationToken,
) {
    let mut draining = false;
    loop {
        let step = if draining {
            Step::Next(deliveries.next_request().await)
        } else {
            tokio::select! {
                biased;
                _ = stop.cancelled() => Step::Stop,
                next = deliveries.next_request() => Step::Next(next),
            }
        };
        match step {
            Step::Stop => {
                debug!("Unsubscribing, finishing buffered requests");
                deliveries.stop_intake().await;
                draining = true;
            }
            Step::Next(Some(request)) => {
                if AssertUnwindSafe((handler)(request))
                    .catch_unwind()
                    .await
                    .is_err()
                {
                    warn!("Request handler panicked");
                }
            }
            Step::Next(None) => break,
        }
    }
}

//! NATS adapter (feature `transport-nats`) using async-nats.
use crate::config::ClientOption;
use crate::transport::{
    Deliveries, IncomingRequest, RequestHandler, Responder, ResponderInner, Transport,
    TransportError, serve_deliveries,
};
use async_nats::client::RequestErrorKind;
use async_nats::{ClientError, Event, ServerAddr};
use bytes::Bytes;
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Upper bound on each wait while shutting the connection.
const CLOSE_WAIT: Duration = Duration::from_secs(5);

pub struct NatsTransport {
    client: Arc<async_nats::Client>,
    // Fires on drain or close; subscription workers stop taking deliveries.
    stop: CancellationToken,
    // Fires on close, or when the client gives up on the connection; pending
    // and future requests fail with `Closed`.
    closed: CancellationToken,
    // Fires once the connection handler has written everything and exited.
    terminated: CancellationToken,
    // Set by whichever of drain or close runs first.
    shut: AtomicBool,
    workers: Mutex<Vec<JoinHandle<()>>>,
}

/// Split a comma-separated server list into validated entries.
pub fn parse_servers(urls: &str) -> Result<Vec<String>, TransportError> {
    let servers: Vec<String> = urls
        .split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect();
    if servers.is_empty() {
        return Err(TransportError::Connect("no server URLs given".into()));
    }
    for server in &servers {
        server
            .parse::<ServerAddr>()
            .map_err(|e| TransportError::Connect(format!("invalid server URL {server:?}: {e}")))?;
    }
    Ok(servers)
}

pub async fn connect(
    urls: &str,
    options: &[ClientOption],
) -> Result<NatsTransport, TransportError> {
    let servers = parse_servers(urls)?.join(",");
    let closed = CancellationToken::new();
    let terminated = CancellationToken::new();
    let mut log_events = false;
    let mut connect = async_nats::ConnectOptions::new();
    for option in options {
        connect = match option {
            ClientOption::Name(name) => connect.name(name),
            ClientOption::Credentials(path) => {
                connect.credentials_file(path).await.map_err(|e| {
                    TransportError::Connect(format!("credentials {}: {e}", path.display()))
                })?
            }
            ClientOption::LifecycleLogging => {
                log_events = true;
                connect
            }
            ClientOption::MaxReconnects(max) => connect.max_reconnects(*max),
            ClientOption::RootCertificates(path) => connect.add_root_certificates(path.clone()),
            ClientOption::ClientCertificate { cert, key } => {
                connect.add_client_certificate(cert.clone(), key.clone())
            }
        };
    }

    let lifecycle = Arc::new(Lifecycle {
        log: log_events,
        seen_connect: AtomicBool::new(false),
        client: OnceLock::new(),
        closed: closed.clone(),
        terminated: terminated.clone(),
    });
    let events = lifecycle.clone();
    connect = connect.event_callback(move |event| {
        let events = events.clone();
        async move { events.on_event(event) }
    });

    let client = connect
        .connect(servers.as_str())
        .await
        .map_err(|e| TransportError::Connect(e.to_string()))?;
    let client = Arc::new(client);
    let _ = lifecycle.client.set(Arc::downgrade(&client));
    info!(server = %server_addr(&client), "Connected");
    Ok(NatsTransport {
        client,
        stop: CancellationToken::new(),
        closed,
        terminated,
        shut: AtomicBool::new(false),
        workers: Mutex::new(Vec::new()),
    })
}

fn server_addr(client: &async_nats::Client) -> String {
    let info = client.server_info();
    format!("{}:{}", info.host, info.port)
}

/// Connection events. Logging is optional; marking the connection closed
/// when the client gives up is not.
struct Lifecycle {
    log: bool,
    seen_connect: AtomicBool,
    // Weak so the callback, which the connection owns, does not keep the
    // client alive.
    client: OnceLock<Weak<async_nats::Client>>,
    closed: CancellationToken,
    terminated: CancellationToken,
}

impl Lifecycle {
    fn on_event(&self, event: Event) {
        match event {
            Event::Closed => {
                self.closed.cancel();
                self.terminated.cancel();
                if self.log {
                    info!("Connection closed");
                }
            }
            Event::ClientError(ClientError::MaxReconnects) => {
                self.closed.cancel();
                error!("Error: err=giving up after max reconnects");
            }
            _ if !self.log => {}
            // First connect is logged by `connect` itself.
            Event::Connected if !self.seen_connect.swap(true, Ordering::SeqCst) => {}
            Event::Connected => match self.client.get().and_then(Weak::upgrade) {
                Some(client) => info!("Reconnected to {}", server_addr(&client)),
                None => info!("Reconnected"),
            },
            Event::Disconnected => info!("Disconnected"),
            Event::ServerError(e) => error!("Error: err={}", e),
            Event::ClientError(e) => error!("Error: err={}", e),
            other => debug!(event = %other, "Connection event"),
        }
    }
}

impl NatsTransport {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }

    /// Flush queued publishes, then drain the client and wait for its
    /// connection handler to exit. `Client::drain` only queues the request;
    /// the handler writes what is left and closes the socket afterwards.
    async fn shut_connection(&self) -> Result<(), TransportError> {
        self.closed.cancel();
        self.stop.cancel();
        match tokio::time::timeout(CLOSE_WAIT, self.client.flush()).await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Flush before close failed"),
            Err(_) => warn!(wait = ?CLOSE_WAIT, "Flush before close timed out"),
        }
        self.client
            .drain()
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))?;
        if tokio::time::timeout(CLOSE_WAIT, self.terminated.cancelled())
            .await
            .is_err()
        {
            warn!(wait = ?CLOSE_WAIT, "Connection handler did not report close");
        }
        debug!("Connection shut");
        Ok(())
    }
}

#[async_trait::async_trait]
impl Transport for NatsTransport {
    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, TransportError> {
        self.ensure_open()?;
        let fut = self.client.request(subject.to_string(), payload);
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            res = tokio::time::timeout(timeout, fut) => match res {
                Ok(Ok(msg)) => Ok(msg.payload),
                Ok(Err(e)) => Err(match e.kind() {
                    RequestErrorKind::TimedOut => TransportError::Timeout,
                    RequestErrorKind::NoResponders => TransportError::NoResponders,
                    _ if self.closed.is_cancelled() => TransportError::Closed,
                    _ => TransportError::Request(e.to_string()),
                }),
                Err(_) => Err(TransportError::Timeout),
            },
        }
    }

    async fn queue_subscribe(
        &self,
        subject: &str,
        queue_group: &str,
        handler: RequestHandler,
    ) -> Result<(), TransportError> {
        self.ensure_open()?;
        let sub = self
            .client
            .queue_subscribe(subject.to_string(), queue_group.to_string())
            .await
            .map_err(|e| TransportError::Subscribe(e.to_string()))?;
        let deliveries = NatsDeliveries {
            client: (*self.client).clone(),
            sub,
        };
        let handle = tokio::spawn(serve_deliveries(deliveries, handler, self.stop.clone()));
        self.workers.lock().await.push(handle);
        Ok(())
    }

    async fn drain(&self) -> Result<(), TransportError> {
        // Already closed, by us or by the client giving up: nothing to drain.
        if self.closed.is_cancelled() || self.shut.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        debug!("Draining connection.");
        self.stop.cancel();
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Subscription worker ended abnormally");
            }
        }
        self.shut_connection().await
    }

    async fn close(&self) {
        if self.shut.swap(true, Ordering::SeqCst) {
            return;
        }
        self.closed.cancel();
        for worker in self.workers.lock().await.drain(..) {
            worker.abort();
        }
        if let Err(e) = self.shut_connection().await {
            debug!(error = %e, "Close did not flush cleanly");
        }
    }
}

struct NatsDeliveries {
    client: async_nats::Client,
    sub: async_nats::Subscriber,
}

#[async_trait::async_trait]
impl Deliveries for NatsDeliveries {
    async fn next_request(&mut self) -> Option<IncomingRequest> {
        let msg = self.sub.next().await?;
        Some(incoming_request(&self.client, msg))
    }

    // Unsubscribes server-side; the subscriber then yields whatever is
    // already buffered and ends.
    async fn stop_intake(&mut self) {
        if let Err(e) = self.sub.drain().await {
            warn!(error = %e, "Unsubscribe failed");
        }
    }
}

fn incoming_request(client: &async_nats::Client, msg: async_nats::Message) -> IncomingRequest {
    let responder = match msg.reply.clone() {
        Some(reply) => Responder::new(NatsResponder {
            client: client.clone(),
            reply,
        }),
        None => Responder::none(),
    };
    IncomingRequest {
        subject: msg.subject.to_string(),
        payload: msg.payload,
        reply: msg.reply.map(|r| r.to_string()),
        responder,
    }
}

struct NatsResponder {
    client: async_nats::Client,
    reply: async_nats::Subject,
}

#[async_trait::async_trait]
impl ResponderInner for NatsResponder {
    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        self.client
            .publish(self.reply.clone(), payload)
            .await
            .map_err(|e| TransportError::Publish(e.to_string()))
    }
}

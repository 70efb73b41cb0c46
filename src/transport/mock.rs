//! Mock transport for tests: an in-process bus with queue-group request/reply.
//!
//! Every `MockBus` is private to its creator, so tests running in parallel do
//! not see each other's subscriptions.

use super::{
    Deliveries, IncomingRequest, RequestHandler, Responder, ResponderInner, Transport,
    TransportError, serve_deliveries,
};
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::warn;

struct Member {
    id: u64,
    tx: flume::Sender<IncomingRequest>,
}

#[derive(Default)]
struct Group {
    members: Vec<Member>,
    next: usize,
}

#[derive(Default)]
struct Bus {
    // subject -> queue group -> members
    subjects: HashMap<String, BTreeMap<String, Group>>,
    next_id: u64,
}

#[derive(Clone, Default)]
pub struct MockBus(Arc<Mutex<Bus>>);

impl MockBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Open a new connection on this bus.
    pub fn connect(&self) -> MockTransport {
        MockTransport {
            bus: self.clone(),
            stop: CancellationToken::new(),
            closed: CancellationToken::new(),
            workers: tokio::sync::Mutex::new(Vec::new()),
        }
    }

    /// Number of live queue-group members subscribed to `subject`.
    pub fn member_count(&self, subject: &str) -> usize {
        self.state()
            .subjects
            .get(subject)
            .map(|groups| groups.values().map(|g| g.members.len()).sum())
            .unwrap_or(0)
    }

    fn state(&self) -> MutexGuard<'_, Bus> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn join(&self, subject: &str, group: &str) -> (u64, flume::Receiver<IncomingRequest>) {
        let (tx, rx) = flume::unbounded();
        let mut bus = self.state();
        bus.next_id += 1;
        let id = bus.next_id;
        bus.subjects
            .entry(subject.to_string())
            .or_default()
            .entry(group.to_string())
            .or_default()
            .members
            .push(Member { id, tx });
        (id, rx)
    }

    fn leave(&self, subject: &str, group: &str, id: u64) {
        let mut bus = self.state();
        if let Some(g) = bus
            .subjects
            .get_mut(subject)
            .and_then(|groups| groups.get_mut(group))
        {
            g.members.retain(|m| m.id != id);
        }
    }

    /// Pick one member per queue group, round-robin within each group.
    fn route(&self, subject: &str) -> Vec<flume::Sender<IncomingRequest>> {
        let mut bus = self.state();
        let Some(groups) = bus.subjects.get_mut(subject) else {
            return Vec::new();
        };
        groups
            .values_mut()
            .filter(|g| !g.members.is_empty())
            .map(|g| {
                let idx = g.next % g.members.len();
                g.next = g.next.wrapping_add(1);
                g.members[idx].tx.clone()
            })
            .collect()
    }

    fn next_inbox(&self) -> String {
        let mut bus = self.state();
        bus.next_id += 1;
        format!("_INBOX.mock.{}", bus.next_id)
    }
}

pub struct MockTransport {
    bus: MockBus,
    stop: CancellationToken,
    closed: CancellationToken,
    workers: tokio::sync::Mutex<Vec<JoinHandle<()>>>,
}

impl MockTransport {
    fn ensure_open(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            Err(TransportError::Closed)
        } else {
            Ok(())
        }
    }
}

#[async_trait::async_trait]
impl Transport for MockTransport {
    async fn request(
        &self,
        subject: &str,
        payload: Bytes,
        timeout: Duration,
    ) -> Result<Bytes, TransportError> {
        self.ensure_open()?;
        let targets = self.bus.route(subject);
        if targets.is_empty() {
            return Err(TransportError::NoResponders);
        }
        let (tx, rx) = flume::bounded(1);
        let reply = self.bus.next_inbox();
        for target in targets {
            let incoming = IncomingRequest {
                subject: subject.to_string(),
                payload: payload.clone(),
                reply: Some(reply.clone()),
                responder: Responder::new(MockResponder { tx: tx.clone() }),
            };
            let _ = target.send(incoming);
        }
        drop(tx);
        tokio::select! {
            _ = self.closed.cancelled() => Err(TransportError::Closed),
            res = tokio::time::timeout(timeout, rx.recv_async()) => match res {
                Ok(Ok(bytes)) => Ok(bytes),
                Ok(Err(_)) => Err(TransportError::Request("request dropped without reply".into())),
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
        let (id, rx) = self.bus.join(subject, queue_group);
        let deliveries = MockDeliveries {
            bus: self.bus.clone(),
            subject: subject.to_string(),
            queue_group: queue_group.to_string(),
            id,
            rx,
        };
        let handle = tokio::spawn(serve_deliveries(deliveries, handler, self.stop.clone()));
        self.workers.lock().await.push(handle);
        Ok(())
    }

    async fn drain(&self) -> Result<(), TransportError> {
        if self.closed.is_cancelled() {
            return Ok(());
        }
        self.stop.cancel();
        let workers = std::mem::take(&mut *self.workers.lock().await);
        for worker in workers {
            if let Err(e) = worker.await {
                warn!(error = %e, "Subscription worker ended abnormally");
            }
        }
        self.close().await;
        Ok(())
    }

    async fn close(&self) {
        self.closed.cancel();
        self.stop.cancel();
        for worker in self.workers.lock().await.drain(..) {
            worker.abort();
        }
    }
}

/// One member's queue. Leaving the group drops the bus's sender, so once the
/// buffer is empty `next_request` returns `None`.
struct MockDeliveries {
    bus: MockBus,
    subject: String,
    queue_group: String,
    id: u64,
    rx: flume::Receiver<IncomingRequest>,
}

#[async_trait::async_trait]
impl Deliveries for MockDeliveries {
    async fn next_request(&mut self) -> Option<IncomingRequest> {
        self.rx.recv_async().await.ok()
    }

    async fn stop_intake(&mut self) {
        self.bus.leave(&self.subject, &self.queue_group, self.id);
    }
}

impl Drop for MockDeliveries {
    fn drop(&mut self) {
        self.bus.leave(&self.subject, &self.queue_group, self.id);
    }
}

struct MockResponder {
    tx: flume::Sender<Bytes>,
}

#[async_trait::async_trait]
impl ResponderInner for MockResponder {
    async fn send(&self, payload: Bytes) -> Result<(), TransportError> {
        // First reply wins; later ones are dropped like NATS does for a
        // request that already resolved.
        let _ = self.tx.try_send(payload);
        Ok(())
    }
}

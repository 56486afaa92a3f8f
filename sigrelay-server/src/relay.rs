//! Relay core: producer slot, consumer registry, and pending-request table.
//!
//! [`RelayCore`] tracks the single current producer session, the set of
//! connected consumers, and every in-flight request. Cloning it is cheap —
//! all instances share the same underlying state.
//!
//! The correlation invariant lives here: every request id registered in the
//! pending table is resolved **at most once** — by the matching producer
//! response, by the timeout supervisor, or by the originating consumer's
//! disconnect sweep, whichever removes the entry first. All three paths go
//! through a single atomic map removal, so there is no window in which two
//! resolutions can race.

use std::sync::{
    atomic::{AtomicU64, Ordering},
    Arc,
};
use std::time::{Duration, Instant};

use axum::extract::ws::Message;
use dashmap::DashMap;
use serde_json::{Map, Value};
use tokio::sync::{mpsc, Mutex};
use tracing::{debug, trace, warn};

use sigrelay_protocol::{ClientMessage, ErrorKind, ResponsePayload, ServerMessage};

use crate::auth::SessionId;

// ════════════════════════════════════════════════════════════════════
// Per-session state
// ════════════════════════════════════════════════════════════════════

/// State tracked for each connected consumer.
struct ConsumerState {
    /// Channel feeding the session's WebSocket send loop.
    sender: mpsc::Sender<Message>,
}

/// The single current producer session.
///
/// Replaced wholesale when a new producer authenticates; a superseded
/// producer stays connected but its generation no longer matches, so its
/// frames are discarded.
struct ProducerSlot {
    id: SessionId,
    generation: u64,
    sender: mpsc::Sender<Message>,
}

/// An in-flight request awaiting its producer response.
struct PendingRequest {
    consumer: SessionId,
    /// Producer generation the request was forwarded under.
    #[allow(dead_code)]
    generation: u64,
    created_at: Instant,
}

// ════════════════════════════════════════════════════════════════════
// RelayCore
// ════════════════════════════════════════════════════════════════════

/// Shared relay state with request forwarding and response routing.
#[derive(Clone)]
pub struct RelayCore {
    consumers: Arc<DashMap<u64, ConsumerState>>,
    pending: Arc<DashMap<String, PendingRequest>>,
    producer: Arc<Mutex<Option<ProducerSlot>>>,
    /// Generation of the most recently registered producer.
    current_generation: Arc<AtomicU64>,
    next_id: Arc<AtomicU64>,
    request_timeout: Duration,
}

impl RelayCore {
    /// Create an empty core with the given producer-response deadline.
    pub fn new(request_timeout: Duration) -> Self {
        Self {
            consumers: Arc::new(DashMap::new()),
            pending: Arc::new(DashMap::new()),
            producer: Arc::new(Mutex::new(None)),
            current_generation: Arc::new(AtomicU64::new(0)),
            next_id: Arc::new(AtomicU64::new(1)),
            request_timeout,
        }
    }

    /// Allocate a new unique [`SessionId`].
    pub fn next_session_id(&self) -> SessionId {
        SessionId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    // ────────────────────────────────────────────────────────────────
    // Registration / cleanup
    // ────────────────────────────────────────────────────────────────

    /// Add a consumer session to the registry.
    pub(crate) fn register_consumer(&self, id: SessionId, sender: mpsc::Sender<Message>) {
        self.consumers.insert(id.0, ConsumerState { sender });
        debug!("{}: consumer registered ({} connected)", id, self.consumers.len());
    }

    /// Remove a consumer and abandon its outstanding requests.
    ///
    /// Abandoned requests are dropped without a synthesized error — no one
    /// remains to receive it. Idempotent.
    pub(crate) fn unregister_consumer(&self, id: SessionId) {
        self.consumers.remove(&id.0);

        let before = self.pending.len();
        self.pending.retain(|_, req| req.consumer != id);
        let dropped = before.saturating_sub(self.pending.len());
        if dropped > 0 {
            debug!("{}: abandoned {} outstanding request(s)", id, dropped);
        }
    }

    /// Install `id` as the current producer, superseding any previous one.
    ///
    /// Returns the generation assigned to this producer. The previous
    /// producer, if still connected, is left alone — it simply stops being a
    /// forwarding target and its frames stop passing the generation check.
    pub(crate) async fn set_producer(&self, id: SessionId, sender: mpsc::Sender<Message>) -> u64 {
        let generation = self.current_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let mut slot = self.producer.lock().await;
        if let Some(old) = slot.replace(ProducerSlot {
            id,
            generation,
            sender,
        }) {
            debug!("{}: producer superseded by {}", old.id, id);
        } else {
            debug!("{}: producer registered", id);
        }
        generation
    }

    /// Clear the producer slot — only if it still refers to this session.
    ///
    /// A producer that reconnected before the old connection finished closing
    /// must not be clobbered by the old connection's cleanup. Idempotent.
    pub(crate) async fn clear_producer(&self, id: SessionId) {
        let mut slot = self.producer.lock().await;
        if slot.as_ref().map(|p| p.id) == Some(id) {
            *slot = None;
            debug!("{}: producer disconnected", id);
        }
    }

    // ────────────────────────────────────────────────────────────────
    // Consumer path
    // ────────────────────────────────────────────────────────────────

    /// Handle a consumer `get`: register the correlation id, forward to the
    /// producer, and arm the timeout supervisor.
    pub(crate) async fn handle_get(
        &self,
        consumer: SessionId,
        resource: String,
        params: Map<String, Value>,
        request_id: Option<String>,
    ) {
        let request_id =
            request_id.unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let Some((generation, producer_tx)) = self.producer_sender().await else {
            trace!("{}: no producer for '{}'", consumer, resource);
            self.send_error(consumer, request_id, ErrorKind::ProducerOffline)
                .await;
            return;
        };

        // Register before forwarding so a fast response always finds its
        // entry. The map guard must drop before any await below.
        let duplicate = match self.pending.entry(request_id.clone()) {
            dashmap::Entry::Occupied(_) => true,
            dashmap::Entry::Vacant(entry) => {
                entry.insert(PendingRequest {
                    consumer,
                    generation,
                    created_at: Instant::now(),
                });
                false
            }
        };
        if duplicate {
            warn!(
                "{}: request id '{}' already in flight, refusing",
                consumer, request_id
            );
            self.send_error(consumer, request_id, ErrorKind::SendFailed)
                .await;
            return;
        }

        let forward = ServerMessage::Request {
            request_id: request_id.clone(),
            resource,
            params,
        };
        let text = match serde_json::to_string(&forward) {
            Ok(t) => t,
            Err(e) => {
                // Unreachable for these types; keep the table consistent anyway.
                warn!("{}: failed to serialize request: {}", consumer, e);
                self.pending.remove(&request_id);
                self.send_error(consumer, request_id, ErrorKind::SendFailed)
                    .await;
                return;
            }
        };

        if producer_tx.send(Message::Text(text.into())).await.is_err() {
            self.pending.remove(&request_id);
            self.send_error(consumer, request_id, ErrorKind::SendFailed)
                .await;
            return;
        }

        trace!("{}: forwarded request '{}'", consumer, request_id);
        self.spawn_timeout(request_id, consumer);
    }

    /// One timer task per outstanding request.
    fn spawn_timeout(&self, request_id: String, consumer: SessionId) {
        let core = self.clone();
        tokio::spawn(async move {
            tokio::time::sleep(core.request_timeout).await;
            core.expire(&request_id, consumer).await;
        });
    }

    /// Timeout supervisor body: compare-and-remove, then synthesize `timeout`.
    ///
    /// The entry is removed only if it still belongs to the consumer that
    /// created it; an entry already resolved (or reused) is left alone.
    async fn expire(&self, request_id: &str, consumer: SessionId) {
        let removed = self
            .pending
            .remove_if(request_id, |_, req| req.consumer == consumer);

        if let Some((id, req)) = removed {
            debug!(
                "{}: request '{}' timed out after {:?}",
                consumer,
                id,
                req.created_at.elapsed()
            );
            self.send_error(consumer, id, ErrorKind::Timeout).await;
        }
    }

    // ────────────────────────────────────────────────────────────────
    // Producer path
    // ────────────────────────────────────────────────────────────────

    /// Handle one frame from a producer read loop.
    ///
    /// `generation` is the generation assigned when that producer registered;
    /// frames from a superseded producer fail the check and are discarded.
    /// Malformed payloads and non-`response` messages are discarded silently.
    /// The response text is forwarded to the waiting consumer **verbatim**.
    pub(crate) async fn handle_producer_frame(&self, generation: u64, text: &str) {
        let msg: ClientMessage = match serde_json::from_str(text) {
            Ok(m) => m,
            Err(_) => {
                trace!("discarding malformed producer frame");
                return;
            }
        };

        let request_id = match msg {
            ClientMessage::Response {
                request_id: Some(id),
                ..
            } => id,
            ClientMessage::Response { request_id: None, .. } => {
                trace!("discarding response without request_id");
                return;
            }
            _ => return,
        };

        if generation != self.current_generation.load(Ordering::SeqCst) {
            debug!("discarding response '{}' from stale producer", request_id);
            return;
        }

        let Some((_, req)) = self.pending.remove(&request_id) else {
            // Already resolved by timeout or disconnect, or an unknown id.
            trace!("discarding response for unknown request '{}'", request_id);
            return;
        };

        self.send_raw(req.consumer, text.to_string()).await;
    }

    // ────────────────────────────────────────────────────────────────
    // Delivery helpers
    // ────────────────────────────────────────────────────────────────

    async fn producer_sender(&self) -> Option<(u64, mpsc::Sender<Message>)> {
        self.producer
            .lock()
            .await
            .as_ref()
            .map(|p| (p.generation, p.sender.clone()))
    }

    /// Synthesize an error `response` for a single consumer.
    async fn send_error(&self, consumer: SessionId, request_id: String, kind: ErrorKind) {
        let msg = ServerMessage::Response(ResponsePayload::error(request_id, kind));
        let text = match serde_json::to_string(&msg) {
            Ok(t) => t,
            Err(e) => {
                warn!("failed to serialize error response: {}", e);
                return;
            }
        };
        self.send_raw(consumer, text).await;
    }

    /// Deliver a text frame to a consumer; failures are swallowed (the
    /// consumer's own disconnect cleanup reconciles).
    async fn send_raw(&self, consumer: SessionId, text: String) {
        // Clone the sender out of the map so no guard is held across the send.
        let Some(tx) = self
            .consumers
            .get(&consumer.0)
            .map(|entry| entry.sender.clone())
        else {
            trace!("{}: gone before delivery", consumer);
            return;
        };

        if tx.send(Message::Text(text.into())).await.is_err() {
            trace!("{}: send failed, presumed disconnecting", consumer);
        }
    }

    // ────────────────────────────────────────────────────────────────
    // Introspection (health endpoint, tests)
    // ────────────────────────────────────────────────────────────────

    /// Number of currently connected consumers.
    pub fn consumer_count(&self) -> usize {
        self.consumers.len()
    }

    /// Number of in-flight requests.
    pub fn pending_count(&self) -> usize {
        self.pending.len()
    }

    /// Whether a producer session is currently registered.
    pub async fn producer_connected(&self) -> bool {
        self.producer.lock().await.is_some()
    }
}

// ════════════════════════════════════════════════════════════════════
// Tests
// ════════════════════════════════════════════════════════════════════

//! Outbound relay connection for the producer agent.
//!
//! [`BridgeClient`] manages a `tokio-tungstenite` WebSocket connection to the
//! relay, with:
//!
//! - **Auth handshake**: `auth` as the first frame, `auth_ok` awaited under a
//!   deadline
//! - **Request serving**: forwarded `request` frames → [`ResourceResolver`] →
//!   `response` frames
//! - **Reconnection**: exponential backoff with a capped delay
//! - **Keepalive**: periodic WebSocket Ping frames

use std::sync::Arc;
use std::time::Duration;

use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use serde_json::{Map, Value};
use thiserror::Error;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_tungstenite::{connect_async, tungstenite::Message, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, trace, warn};

use sigrelay_protocol::{ClientMessage, ErrorKind, ResponsePayload, Role, ServerMessage};

use crate::resolver::{ResolveError, ResourceResolver};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

// ════════════════════════════════════════════════════════════════════
// Configuration
// ════════════════════════════════════════════════════════════════════

/// Configuration for the bridge's relay connection.
#[derive(Debug, Clone)]
pub struct BridgeConfig {
    /// `ws://` or `wss://` URL of the relay's WebSocket endpoint.
    pub url: String,
    /// Producer shared secret.
    pub token: String,
    /// Interval between WebSocket Ping frames.
    pub keepalive_interval: Duration,
    /// Deadline for the `auth_ok` reply.
    pub auth_timeout: Duration,
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            url: "ws://localhost:8080/ws".to_string(),
            token: "producer-secret".to_string(),
            keepalive_interval: Duration::from_secs(20),
            auth_timeout: Duration::from_secs(10),
        }
    }
}

// ════════════════════════════════════════════════════════════════════
// Errors
// ════════════════════════════════════════════════════════════════════

/// Errors from a single connection attempt.
#[derive(Error, Debug)]
pub enum BridgeError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("relay rejected authentication: {0}")]
    AuthRejected(String),

    #[error("connection closed")]
    ConnectionClosed,
}

// ════════════════════════════════════════════════════════════════════
// BridgeClient
// ════════════════════════════════════════════════════════════════════

/// Producer-side relay client.
pub struct BridgeClient {
    config: BridgeConfig,
    resolver: Arc<dyn ResourceResolver>,
}

impl BridgeClient {
    pub fn new(config: BridgeConfig, resolver: Arc<dyn ResourceResolver>) -> Self {
        Self { config, resolver }
    }

    /// Connect and serve forever, reconnecting with exponential backoff
    /// (500 ms doubling to an 8 s cap, reset after an authenticated session).
    pub async fn run(&self) {
        let backoff = [500u64, 1_000, 2_000, 4_000, 8_000];
        let mut attempt = 0usize;

        loop {
            match self.run_once().await {
                Ok(()) => {
                    info!("relay connection closed, reconnecting");
                    attempt = 0;
                }
                Err(e) => {
                    warn!("relay connection error: {}, reconnecting", e);
                }
            }

            let delay_ms = backoff.get(attempt).copied().unwrap_or(8_000);
            attempt += 1;
            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
        }
    }

    /// One connection lifecycle: connect, authenticate, serve until closed.
    ///
    /// Returns `Ok(())` when an authenticated session ends (relay restart,
    /// network drop); `Err` when connecting or authenticating fails.
    pub async fn run_once(&self) -> Result<(), BridgeError> {
        let (ws, _response) = connect_async(&self.config.url).await?;
        debug!("connected to relay at {}", self.config.url);

        let (mut ws_write, mut ws_read) = ws.split();

        // ── Auth handshake ──────────────────────────────────────────
        let auth = ClientMessage::Auth {
            role: Role::Producer.as_str().to_string(),
            token: self.config.token.clone(),
        };
        let auth_text = serde_json::to_string(&auth)
            .map_err(|e| BridgeError::AuthRejected(e.to_string()))?;
        ws_write.send(Message::Text(auth_text.into())).await?;

        let ack = tokio::time::timeout(self.config.auth_timeout, recv_reply(&mut ws_read))
            .await
            .map_err(|_| BridgeError::AuthRejected("timed out waiting for auth_ok".to_string()))??;

        match ack {
            ServerMessage::AuthOk {
                role: Role::Producer,
            } => info!("authenticated with relay, waiting for requests"),
            other => {
                return Err(BridgeError::AuthRejected(format!(
                    "unexpected reply: {:?}",
                    other
                )))
            }
        }

        // ── Write channel + keepalive ───────────────────────────────
        let (write_tx, write_rx) = mpsc::unbounded_channel::<Message>();
        let write_task = tokio::spawn(run_write_loop(ws_write, write_rx));
        let keepalive_task = tokio::spawn(run_keepalive(
            write_tx.clone(),
            self.config.keepalive_interval,
        ));

        // ── Request loop ────────────────────────────────────────────
        // Requests are served in arrival order; the relay's per-request
        // timeout bounds how long a slow query can hold up the queue's tail.
        self.read_loop(&mut ws_read, &write_tx).await;

        keepalive_task.abort();
        write_task.abort();
        Ok(())
    }

    async fn read_loop(
        &self,
        ws_read: &mut SplitStream<WsStream>,
        write_tx: &mpsc::UnboundedSender<Message>,
    ) {
        while let Some(result) = ws_read.next().await {
            let text = match result {
                Ok(Message::Text(text)) => text.to_string(),
                Ok(Message::Close(_)) => {
                    debug!("relay sent close frame");
                    break;
                }
                Ok(_) => continue,
                Err(e) => {
                    debug!("read error: {}", e);
                    break;
                }
            };

            let msg: ServerMessage = match serde_json::from_str(&text) {
                Ok(m) => m,
                Err(_) => {
                    trace!("discarding unparseable frame from relay");
                    continue;
                }
            };

            if let ServerMessage::Request {
                request_id,
                resource,
                params,
            } = msg
            {
                self.serve_request(request_id, &resource, &params, write_tx)
                    .await;
            }
        }
    }

    /// Resolve one request and queue the response frame.
    async fn serve_request(
        &self,
        request_id: String,
        resource: &str,
        params: &Map<String, Value>,
        write_tx: &mpsc::UnboundedSender<Message>,
    ) {
        trace!("serving request '{}' for '{}'", request_id, resource);

        let payload = match self.resolver.resolve(resource, params).await {
            Ok(data) => ResponsePayload::ok(request_id, data),
            Err(ResolveError::UnknownResource) => {
                ResponsePayload::error(request_id, ErrorKind::UnknownResource)
            }
            Err(ResolveError::Storage(e)) => {
                // The wire error set is fixed; let the relay's timeout answer.
                warn!("storage failure for '{}': {}", resource, e);
                return;
            }
        };

        match serde_json::to_string(&payload.into_client_frame()) {
            Ok(json) => {
                let _ = write_tx.send(Message::Text(json.into()));
            }
            Err(e) => warn!("failed to serialize response: {}", e),
        }
    }
}

// ════════════════════════════════════════════════════════════════════
// Background task implementations
// ════════════════════════════════════════════════════════════════════

/// Write loop: drains the mpsc channel and sends frames.
async fn run_write_loop(
    mut ws_write: SplitSink<WsStream, Message>,
    mut write_rx: mpsc::UnboundedReceiver<Message>,
) {
    while let Some(msg) = write_rx.recv().await {
        if ws_write.send(msg).await.is_err() {
            debug!("write failed, closing write loop");
            break;
        }
    }
}

/// Keepalive loop: periodic WebSocket Ping frames.
async fn run_keepalive(write_tx: mpsc::UnboundedSender<Message>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // skip first immediate tick

    loop {
        ticker.tick().await;
        if write_tx.send(Message::Ping(Default::default())).is_err() {
            break; // channel closed, connection gone
        }
    }
}

/// Receive the next text frame during the handshake and parse it.
async fn recv_reply(ws_read: &mut SplitStream<WsStream>) -> Result<ServerMessage, BridgeError> {
    while let Some(result) = ws_read.next().await {
        match result? {
            Message::Text(text) => {
                return serde_json::from_str(&text)
                    .map_err(|_| BridgeError::AuthRejected(format!("unexpected reply: {}", text)));
            }
            Message::Close(_) => return Err(BridgeError::ConnectionClosed),
            _ => {}
        }
    }
    Err(BridgeError::ConnectionClosed)
}

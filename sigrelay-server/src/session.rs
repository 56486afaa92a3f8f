//! Per-connection WebSocket session management.
//!
//! Each accepted connection runs [`run_session`]:
//!
//! 1. **Auth phase** — wait (bounded) for the first frame and decide a role,
//!    or close with a reason-specific code.
//! 2. **Send loop** — drains the per-session `mpsc` channel and writes frames
//!    to the WebSocket.
//! 3. **Keepalive** — periodic WebSocket Ping frames on the same channel.
//! 4. **Role loop** — the producer loop feeds response frames into the core;
//!    the consumer loop dispatches `get` messages.
//! 5. A **cleanup** fence when the role loop ends: unregister the consumer
//!    (sweeping its pending requests) or clear the producer slot.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::extract::ws::{CloseFrame, Message, WebSocket};
use futures_util::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::sync::mpsc;
use tracing::{debug, trace, warn};

use sigrelay_protocol::{ClientMessage, Role, ServerMessage};

use crate::{
    auth::{AuthError, Authenticator, SessionId},
    config::RelayConfig,
    relay::RelayCore,
};

// ════════════════════════════════════════════════════════════════════
// Session context
// ════════════════════════════════════════════════════════════════════

/// Shared context injected into every session.
#[derive(Clone)]
pub(crate) struct SessionContext {
    pub core: RelayCore,
    pub auth: Arc<Authenticator>,
    pub config: RelayConfig,
}

// ════════════════════════════════════════════════════════════════════
// Session entry point
// ════════════════════════════════════════════════════════════════════

/// Drive a single WebSocket connection to completion.
///
/// This function is `await`ed inside the Axum upgrade handler's task.
pub(crate) async fn run_session(socket: WebSocket, remote_addr: SocketAddr, ctx: SessionContext) {
    let id = ctx.core.next_session_id();

    let (role, mut socket) = match authenticate(socket, id, &ctx).await {
        Some(outcome) => outcome,
        None => return,
    };

    debug!("{}: authenticated as {} from {}", id, role, remote_addr);

    let ack = ServerMessage::AuthOk { role };
    let ack_text = match serde_json::to_string(&ack) {
        Ok(t) => t,
        Err(e) => {
            warn!("{}: failed to serialize auth_ok: {}", id, e);
            return;
        }
    };

    let (ws_sender, ws_receiver) = socket.split();

    // One bounded channel feeds the send loop; the relay core and the
    // keepalive ticker both write into it.
    let (tx, rx) = mpsc::channel::<Message>(ctx.config.channel_capacity);
    let send_handle = tokio::spawn(send_loop(ws_sender, rx, id));
    let keepalive_handle = tokio::spawn(keepalive_loop(
        tx.clone(),
        ctx.config.keepalive_interval,
    ));

    // Register first, then acknowledge: by the time the client sees auth_ok,
    // the session is already a routing target.
    match role {
        Role::Producer => {
            let generation = ctx.core.set_producer(id, tx.clone()).await;
            if tx.send(Message::Text(ack_text.into())).await.is_err() {
                debug!("{}: closed before auth_ok", id);
            } else {
                producer_loop(ws_receiver, id, generation, &ctx.core).await;
            }
            ctx.core.clear_producer(id).await;
        }
        Role::Consumer => {
            ctx.core.register_consumer(id, tx.clone());
            if tx.send(Message::Text(ack_text.into())).await.is_err() {
                debug!("{}: closed before auth_ok", id);
            } else {
                consumer_loop(ws_receiver, id, &ctx.core).await;
            }
            ctx.core.unregister_consumer(id);
        }
    }

    send_handle.abort();
    keepalive_handle.abort();

    debug!("{}: session ended", id);
}

// ════════════════════════════════════════════════════════════════════
// Auth phase
// ════════════════════════════════════════════════════════════════════

/// Run the auth handshake; on failure the socket is closed with the
/// reason-specific code and `None` is returned.
async fn authenticate(
    mut socket: WebSocket,
    id: SessionId,
    ctx: &SessionContext,
) -> Option<(Role, WebSocket)> {
    let first = tokio::time::timeout(ctx.config.auth_timeout, recv_text(&mut socket)).await;

    let decision = match first {
        Err(_) => Err(AuthError::Timeout),
        // Peer closed before sending anything — nothing to reject.
        Ok(None) => {
            trace!("{}: closed during auth", id);
            return None;
        }
        Ok(Some(text)) => ctx.auth.decide(&text),
    };

    match decision {
        Ok(role) => Some((role, socket)),
        Err(err) => {
            warn!("{}: auth rejected: {}", id, err);
            let close = Message::Close(Some(CloseFrame {
                code: err.close_code(),
                reason: err.close_reason().into(),
            }));
            let _ = socket.send(close).await;
            None
        }
    }
}

/// Receive the next text payload, skipping control frames.
async fn recv_text(socket: &mut WebSocket) -> Option<String> {
    while let Some(result) = socket.recv().await {
        match result {
            Ok(Message::Text(text)) => return Some(text.to_string()),
            Ok(Message::Binary(bytes)) => {
                return Some(String::from_utf8_lossy(&bytes).into_owned())
            }
            Ok(Message::Close(_)) | Err(_) => return None,
            // Ping/pong are handled transparently by axum.
            Ok(_) => {}
        }
    }
    None
}

// ════════════════════════════════════════════════════════════════════
// Send loop & keepalive
// ════════════════════════════════════════════════════════════════════

async fn send_loop(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut rx: mpsc::Receiver<Message>,
    id: SessionId,
) {
    while let Some(msg) = rx.recv().await {
        if ws_sender.send(msg).await.is_err() {
            debug!("{}: send failed — closing", id);
            break;
        }
    }
}

async fn keepalive_loop(tx: mpsc::Sender<Message>, interval: Duration) {
    let mut ticker = tokio::time::interval(interval);
    ticker.tick().await; // skip first immediate tick

    loop {
        ticker.tick().await;
        if tx.send(Message::Ping(Default::default())).await.is_err() {
            break; // session gone
        }
    }
}

// ════════════════════════════════════════════════════════════════════
// Role loops
// ════════════════════════════════════════════════════════════════════

/// Producer read loop: every frame goes to the core, which discards
/// everything but well-formed `response` messages from the current
/// generation.
async fn producer_loop(
    mut ws_receiver: SplitStream<WebSocket>,
    id: SessionId,
    generation: u64,
    core: &RelayCore,
) {
    while let Some(text) = next_text(&mut ws_receiver, id).await {
        core.handle_producer_frame(generation, &text).await;
    }
}

/// Consumer read loop: dispatch `get` messages; everything else is discarded
/// without closing the connection.
async fn consumer_loop(mut ws_receiver: SplitStream<WebSocket>, id: SessionId, core: &RelayCore) {
    while let Some(text) = next_text(&mut ws_receiver, id).await {
        match serde_json::from_str::<ClientMessage>(&text) {
            Ok(ClientMessage::Get {
                resource,
                params,
                request_id,
            }) => {
                core.handle_get(id, resource, params, request_id).await;
            }
            Ok(_) => trace!("{}: ignoring non-get message", id),
            Err(_) => trace!("{}: discarding malformed frame", id),
        }
    }
}

/// Pull the next text payload off a split read half; `None` ends the session.
async fn next_text(ws_receiver: &mut SplitStream<WebSocket>, id: SessionId) -> Option<String> {
    while let Some(result) = ws_receiver.next().await {
        match result {
            Ok(Message::Text(text)) => return Some(text.to_string()),
            Ok(Message::Binary(bytes)) => {
                return Some(String::from_utf8_lossy(&bytes).into_owned())
            }
            Ok(Message::Close(_)) => {
                trace!("{}: received close frame", id);
                return None;
            }
            Ok(_) => {}
            Err(e) => {
                debug!("{}: recv error: {}", id, e);
                return None;
            }
        }
    }
    None
}

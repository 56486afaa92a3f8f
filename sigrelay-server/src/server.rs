//! Axum WebSocket listener and upgrade handler.
//!
//! [`RelayServer::bind`] binds the configured address; [`RelayServer::serve`]
//! mounts the WebSocket endpoint at the configured path and runs the server.
//! Authentication happens in-band (first frame) inside the session, not at
//! upgrade time, so the upgrade handler accepts every connection.
//!
//! # Health endpoint
//!
//! `GET /health` returns `200 OK` with a JSON body:
//! ```json
//! { "status": "ok", "producer_connected": true, "consumers": 3,
//!   "pending_requests": 0, "uptime_secs": 120 }
//! ```

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Instant;

use axum::{
    extract::{ws::WebSocketUpgrade, ConnectInfo, State},
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tracing::info;

use crate::{
    auth::Authenticator,
    config::RelayConfig,
    error::{RelayError, RelayResult},
    relay::RelayCore,
    session::{run_session, SessionContext},
};

// ════════════════════════════════════════════════════════════════════
// Shared server state
// ════════════════════════════════════════════════════════════════════

#[derive(Clone)]
struct ServerState {
    session_ctx: SessionContext,
    started_at: Instant,
}

// ════════════════════════════════════════════════════════════════════
// RelayServer
// ════════════════════════════════════════════════════════════════════

/// A bound, not-yet-running relay.
pub struct RelayServer {
    listener: TcpListener,
    ws_path: String,
    state: ServerState,
}

impl RelayServer {
    /// Bind the configured address and prepare the relay state.
    pub async fn bind(config: RelayConfig) -> RelayResult<Self> {
        let listener = TcpListener::bind(config.bind_addr)
            .await
            .map_err(|source| RelayError::Bind {
                addr: config.bind_addr,
                source,
            })?;

        let core = RelayCore::new(config.request_timeout);
        let auth = Arc::new(Authenticator::new(&config));
        let ws_path = config.ws_path.clone();

        Ok(Self {
            listener,
            ws_path,
            state: ServerState {
                session_ctx: SessionContext { core, auth, config },
                started_at: Instant::now(),
            },
        })
    }

    /// The address actually bound (useful with port 0).
    pub fn local_addr(&self) -> RelayResult<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// A handle to the relay core (health, tests, metrics).
    pub fn core(&self) -> RelayCore {
        self.state.session_ctx.core.clone()
    }

    /// Run the server until it fails or the process shuts down.
    pub async fn serve(self) -> RelayResult<()> {
        let app = Router::new()
            .route(&self.ws_path, get(ws_upgrade_handler))
            .route("/health", get(health_handler))
            .with_state(self.state)
            .layer(CorsLayer::permissive());

        info!(
            "relay listening on {} (path {})",
            self.listener.local_addr()?,
            self.ws_path
        );

        axum::serve(
            self.listener,
            app.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .await?;

        Ok(())
    }
}

// ════════════════════════════════════════════════════════════════════
// Handlers
// ════════════════════════════════════════════════════════════════════

/// WebSocket upgrade handler.
///
/// Role assignment and token validation happen on the first in-band frame;
/// see [`crate::auth`].
async fn ws_upgrade_handler(
    ws: WebSocketUpgrade,
    ConnectInfo(remote_addr): ConnectInfo<SocketAddr>,
    State(state): State<ServerState>,
) -> impl IntoResponse {
    let ctx = state.session_ctx.clone();
    ws.on_upgrade(move |socket| run_session(socket, remote_addr, ctx))
}

/// Health check endpoint.
async fn health_handler(State(state): State<ServerState>) -> impl IntoResponse {
    let core = &state.session_ctx.core;

    Json(serde_json::json!({
        "status": "ok",
        "producer_connected": core.producer_connected().await,
        "consumers": core.consumer_count(),
        "pending_requests": core.pending_count(),
        "uptime_secs": state.started_at.elapsed().as_secs(),
    }))
}

//! Session host
//!
//! Accepts terminal WebSocket connections on `/ws`, runs one [`Session`] per
//! connection and exposes `/health` and `/sessions` for operators.

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::{State, WebSocketUpgrade, ws::WebSocket},
    response::IntoResponse,
    routing::get,
};
use serde::Serialize;
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;

use super::registry::{SessionInfo, SessionRegistry, SharedRegistry};
use super::transport::split_axum;
use crate::config::Config;
use crate::conversation::{Session, SessionConfig};
use crate::engine::Engines;
use crate::protocol::{HEADER_LEN, MAX_PAYLOAD};
use crate::{Error, Result};

/// Shared state for the session host's handlers
#[derive(Debug, Clone)]
pub struct ServerState {
    pub session_config: Arc<SessionConfig>,
    pub engines: Engines,
    pub registry: SharedRegistry,
}

impl ServerState {
    /// # Errors
    ///
    /// Returns error if the pipeline configuration is unusable
    pub fn new(config: &Config, engines: Engines) -> Result<Self> {
        Ok(Self {
            session_config: Arc::new(SessionConfig::from_config(config)?),
            engines,
            registry: SessionRegistry::shared(),
        })
    }
}

/// Health check response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
    pub sessions: usize,
}

/// Liveness probe with the live session count
async fn health(State(state): State<ServerState>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
        sessions: state.registry.read().await.len(),
    })
}

/// List live sessions
async fn sessions(State(state): State<ServerState>) -> Json<Vec<SessionInfo>> {
    Json(state.registry.read().await.list())
}

/// Handle WebSocket upgrade request
async fn ws_upgrade(State(state): State<ServerState>, ws: WebSocketUpgrade) -> impl IntoResponse {
    ws.max_message_size(HEADER_LEN + MAX_PAYLOAD)
        .on_upgrade(move |socket| handle_socket(socket, state))
}

/// Run one session for the lifetime of the connection
async fn handle_socket(socket: WebSocket, state: ServerState) {
    let (source, sink) = split_axum(socket);
    let session = Session::new(Arc::clone(&state.session_config), state.engines.clone());
    let session_id = session.id();

    state.registry.write().await.register(session.handle());
    tracing::info!(session_id = %session_id, "terminal connected");

    match session.run(Box::new(source), Box::new(sink)).await {
        Ok(summary) => {
            tracing::debug!(session_id = %session_id, reason = %summary.reason, "session finished");
        }
        Err(e) => {
            tracing::warn!(session_id = %session_id, error = %e, "session failed");
        }
    }

    state.registry.write().await.unregister(session_id);
    tracing::info!(session_id = %session_id, "terminal disconnected");
}

/// Build the router with all routes
pub fn router(state: ServerState) -> Router {
    Router::new()
        .route("/ws", get(ws_upgrade))
        .route("/health", get(health))
        .route("/sessions", get(sessions))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve on an already bound listener until `shutdown` is cancelled
///
/// Live sessions are asked to close when shutdown begins.
///
/// # Errors
///
/// Returns error if the server fails while running
pub async fn serve(
    listener: TcpListener,
    state: ServerState,
    shutdown: CancellationToken,
) -> Result<()> {
    let registry = Arc::clone(&state.registry);

    axum::serve(listener, router(state))
        .with_graceful_shutdown(async move {
            shutdown.cancelled().await;
            tracing::info!("shutting down, closing sessions");
            registry.read().await.close_all();
        })
        .await
        .map_err(|e| Error::Transport(format!("server error: {e}")))
}

/// Bind the configured address and serve until `shutdown` is cancelled
///
/// # Errors
///
/// Returns error if the server fails to bind or run
pub async fn run_server(config: &Config, engines: Engines, shutdown: CancellationToken) -> Result<()> {
    let state = ServerState::new(config, engines)?;

    let addr = format!("{}:{}", config.server.host, config.server.port);
    let listener = TcpListener::bind(&addr)
        .await
        .map_err(|e| Error::Config(format!("failed to bind {addr}: {e}")))?;

    tracing::info!(addr = %addr, "session host listening");
    serve(listener, state, shutdown).await
}

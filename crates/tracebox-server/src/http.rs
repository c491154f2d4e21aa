//! HTTP transport for the browser client.
//!
//! ## Endpoints
//!
//! - `GET /` - Stepping UI
//! - `GET /ws` - Websocket upgrade, one session per connection
//! - `GET /health` - Health check

use crate::ws;
use axum::{
    extract::{ws::WebSocketUpgrade, State},
    response::{Html, IntoResponse, Json},
    routing::get,
    Router,
};
use std::sync::Arc;
use tokio::sync::broadcast;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracebox_core::SandboxConfig;

const INDEX_HTML: &str = include_str!("../static/index.html");

/// State shared by every request handler.
#[derive(Clone)]
pub struct AppState {
    /// Configuration handed to each new session.
    pub sandbox: Arc<SandboxConfig>,
    /// Fires once when the server is shutting down.
    pub shutdown: broadcast::Sender<()>,
    /// Tracks live session tasks so shutdown can wait for them.
    pub sessions: TaskTracker,
}

impl AppState {
    pub fn new(sandbox: SandboxConfig, shutdown: broadcast::Sender<()>) -> Self {
        Self {
            sandbox: Arc::new(sandbox),
            shutdown,
            sessions: TaskTracker::new(),
        }
    }
}

/// Build the HTTP router.
///
/// The returned router can be served directly with axum or composed
/// into a larger application.
pub fn build_router(state: AppState) -> Router {
    tracing::debug!("Building HTTP router");

    let router = Router::new()
        .route("/", get(root_handler))
        .route("/health", get(health_handler))
        .route("/ws", get(ws_handler))
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    tracing::debug!("HTTP router built with routes: /, /health, /ws");
    router
}

/// Health check endpoint.
async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    tracing::trace!("Health check request");
    Json(serde_json::json!({
        "status": "healthy",
        "service": "tracebox",
        "isolation": state.sandbox.isolation.name(),
        "sessions": state.sessions.len(),
    }))
}

/// Stepping UI.
async fn root_handler() -> impl IntoResponse {
    tracing::trace!("Root page request");
    Html(INDEX_HTML)
}

/// Upgrade to a websocket and hand it to a new session.
async fn ws_handler(upgrade: WebSocketUpgrade, State(state): State<AppState>) -> impl IntoResponse {
    upgrade.on_upgrade(move |socket| {
        let shutdown = state.shutdown.subscribe();
        // Tracked so shutdown can wait for sandbox teardown.
        state
            .sessions
            .track_future(ws::handle_socket(socket, Arc::clone(&state.sandbox), shutdown))
    })
}

/// Start the HTTP server.
///
/// This function runs until the server is shut down via the provided
/// shutdown signal.
pub async fn serve(
    state: AppState,
    addr: std::net::SocketAddr,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<(), std::io::Error> {
    let router = build_router(state);

    tracing::info!(%addr, "Starting HTTP server");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::debug!(%addr, "TCP listener bound");

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
}

//! WebSocket control-plane server for Tether.
//!
//! Exposes the repository and orchestration engines of `tether-core` to
//! remote clients over an authenticated WebSocket connection.
//!
//! # Routes
//!
//! - `GET /ws` - the message protocol (see [`websocket`])
//! - `GET /health` - liveness check
//! - `GET /status` - secret-protected status report

pub mod auth;
pub mod connection;
pub mod handlers;
pub mod routes;
pub mod state;
pub mod websocket;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{routing::get, Router};
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tower_http::cors::{Any, CorsLayer};

pub use connection::{Connection, ConnectionRegistry};
pub use handlers::{HandlerError, HandlerRegistry, ProgressEmitter};
pub use state::{ServerConfig, ServerState};

/// Build the router for `state`.
pub fn router(state: Arc<ServerState>) -> Router {
    Router::new()
        .route("/ws", get(websocket::ws_handler))
        .route("/health", get(routes::health))
        .route("/status", get(routes::status))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

/// Handle to a running server.
pub struct ServerHandle {
    state: Arc<ServerState>,
    local_addr: SocketAddr,
    shutdown_tx: Option<oneshot::Sender<()>>,
    task: Option<JoinHandle<()>>,
}

impl ServerHandle {
    /// Address the server is bound to (useful with port 0).
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn is_running(&self) -> bool {
        self.shutdown_tx.is_some()
    }

    pub fn state(&self) -> &Arc<ServerState> {
        &self.state
    }

    /// Close every socket and stop accepting connections.
    pub async fn stop(&mut self) {
        self.state.begin_shutdown();
        if let Some(tx) = self.shutdown_tx.take() {
            let _ = tx.send(());
        }
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

/// Bind `addr` and serve in a background task.
pub async fn start(state: Arc<ServerState>, addr: SocketAddr) -> std::io::Result<ServerHandle> {
    let listener = TcpListener::bind(addr).await?;
    let local_addr = listener.local_addr()?;
    let (shutdown_tx, shutdown_rx) = oneshot::channel();
    let app = router(Arc::clone(&state));

    let task = tokio::spawn(async move {
        log::info!("Server listening on ws://{}/ws", local_addr);
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async {
                shutdown_rx.await.ok();
                log::info!("Server shutting down");
            })
            .await;
        if let Err(e) = result {
            log::error!("Server error: {}", e);
        }
    });

    Ok(ServerHandle {
        state,
        local_addr,
        shutdown_tx: Some(shutdown_tx),
        task: Some(task),
    })
}

// ============================================================================
// TESTS
// ============================================================================

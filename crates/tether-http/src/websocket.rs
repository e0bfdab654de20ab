//! WebSocket endpoint and message dispatch.
//!
//! Clients connect to `/ws`, receive a `welcome` message and must then send
//! `auth` with the shared secret. Every other kind is rejected until the
//! connection is authenticated.
//!
//! # Dispatch
//!
//! Frames of one connection are parsed, authenticated and routed in arrival
//! order by [`on_message`]. Handler bodies then run as separate tasks, so a
//! `cancel` is processed while an `execute_command` on the same connection
//! is still running.

use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
};
use futures::{FutureExt, SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot};

use tether_core::protocol::{kinds, result_kind, Message};

use crate::auth::secret_matches;
use crate::connection::Connection;
use crate::handlers::{Handler, ProgressEmitter};
use crate::state::ServerState;

/// Handler for GET /ws
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
) -> impl IntoResponse {
    ws.on_upgrade(|socket| handle_socket(socket, state))
}

/// Handle an individual WebSocket connection.
async fn handle_socket(socket: WebSocket, state: Arc<ServerState>) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<Message>();
    let (close_tx, mut close_rx) = oneshot::channel::<()>();

    let conn = Arc::new(Connection::new(tx));
    state.connections.register(Arc::clone(&conn));
    log::info!("Connection {} opened", conn.id());

    conn.send(Message::new(
        kinds::WELCOME,
        json!({
            "connectionId": conn.id().to_string(),
            "version": state.config.version,
        }),
    ));

    // Writer: drains the connection's queue into the socket.
    let writer = tokio::spawn(async move {
        loop {
            tokio::select! {
                Some(message) = rx.recv() => {
                    if sender.send(WsMessage::Text(message.to_json().into())).await.is_err() {
                        return;
                    }
                }
                _ = &mut close_rx => break,
                else => break,
            }
        }
        while let Ok(message) = rx.try_recv() {
            if sender.send(WsMessage::Text(message.to_json().into())).await.is_err() {
                return;
            }
        }
        let _ = sender.send(WsMessage::Close(None)).await;
    });

    let mut shutdown = state.shutdown_signal();
    loop {
        tokio::select! {
            frame = receiver.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => on_message(&state, &conn, text.as_str()),
                Some(Ok(WsMessage::Binary(bytes))) => match std::str::from_utf8(&bytes) {
                    Ok(text) => on_message(&state, &conn, text),
                    Err(_) => {
                        conn.send(Message::error("Invalid message: binary frame is not UTF-8", None));
                    }
                },
                Some(Ok(WsMessage::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("Connection {} read error: {}", conn.id(), e);
                    break;
                }
            },
            _ = shutdown.wait_for(|closing| *closing) => break,
        }
    }

    state.connections.remove(conn.id());
    let _ = close_tx.send(());
    let _ = writer.await;
    log::info!("Connection {} closed", conn.id());
}

/// Parse, authenticate and dispatch one inbound frame.
///
/// Must be called from within a tokio runtime; handlers are spawned.
pub fn on_message(state: &Arc<ServerState>, conn: &Arc<Connection>, raw: &str) {
    let message = match Message::parse(raw) {
        Ok(message) => message,
        Err(e) => {
            log::debug!("Connection {} sent malformed message: {}", conn.id(), e);
            conn.send(Message::error(format!("Invalid message: {e}"), None));
            return;
        }
    };

    if message.kind == kinds::AUTH {
        authenticate(state, conn, message);
        return;
    }

    if !conn.is_authenticated() {
        conn.send(Message::error("Not authenticated", Some(&message.kind)).with_id(message.id));
        return;
    }

    let Some(handler) = state.handlers.get(&message.kind) else {
        let text = format!("Unknown message type: {}", message.kind);
        conn.send(Message::error(text, Some(&message.kind)).with_id(message.id));
        return;
    };

    tokio::spawn(run_handler(
        Arc::clone(state),
        Arc::clone(conn),
        handler,
        message,
    ));
}

fn authenticate(state: &ServerState, conn: &Connection, message: Message) {
    let secret = message.payload.get("secret").and_then(Value::as_str);

    let reply = if secret_matches(&state.config.secret, secret) {
        conn.mark_authenticated();
        log::info!("Connection {} authenticated", conn.id());
        Message::new(kinds::AUTH_SUCCESS, Value::Null)
    } else {
        log::warn!("Connection {} failed authentication", conn.id());
        Message::new(kinds::AUTH_FAILED, json!({ "message": "Invalid secret" }))
    };
    conn.send(reply.with_id(message.id));
}

async fn run_handler(
    state: Arc<ServerState>,
    conn: Arc<Connection>,
    handler: Handler,
    message: Message,
) {
    let Message { kind, payload, id } = message;
    let emitter = ProgressEmitter::new(Arc::clone(&conn), id.clone());
    log::debug!("Dispatching {} for connection {}", kind, conn.id());

    let outcome = AssertUnwindSafe(async move { handler(state, payload, emitter).await })
        .catch_unwind()
        .await;

    let reply = match outcome {
        Ok(Ok(value)) => Message::new(result_kind(&kind), value),
        Ok(Err(e)) => {
            log::warn!("{} failed: {}", kind, e);
            Message::error(e.to_string(), Some(&kind))
        }
        Err(_) => {
            log::error!("{} handler panicked", kind);
            Message::error(format!("Internal error while handling {kind}"), Some(&kind))
        }
    };

    if !conn.send(reply.with_id(id)) {
        log::debug!("Connection {} closed before {} completed", conn.id(), kind);
    }
}

// ============================================================================
// TESTS
// ============================================================================

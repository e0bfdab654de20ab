//! The connection manager.
//!
//! # Lifecycle
//!
//! ```text
//! Disconnected --connect()--> Connecting --open--> Connected
//!      ^                          |                    |
//!      |                     dial failed         abnormal close
//!      |                          v                    v
//!      +---- attempts spent --- Reconnecting{attempt} <+
//! ```
//!
//! `disconnect()` leaves any state for `Disconnected` and suppresses
//! reconnection. A single background task owns the socket; callers talk to
//! it through an outbound channel and receive inbound messages through
//! subscriptions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::{json, Value};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message as WsMessage;

use tether_core::protocol::{kinds, result_kind, Message};

use crate::config::ClientConfig;
use crate::error::ClientError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting { attempt: u32 },
}

type Callback = Arc<dyn Fn(&Message) + Send + Sync>;

struct Inner {
    config: ClientConfig,
    state: watch::Sender<ConnectionState>,
    /// `None` until the server answers `auth`
    authenticated: watch::Sender<Option<bool>>,
    outbound: Mutex<Option<mpsc::UnboundedSender<WsMessage>>>,
    subscribers: Mutex<HashMap<String, Vec<(u64, Callback)>>>,
    /// Fires whenever an open transport closes
    closed: broadcast::Sender<()>,
    stop: Mutex<Option<watch::Sender<bool>>>,
    task: Mutex<Option<JoinHandle<()>>>,
    next_id: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

/// A handle to one registered message handler.
pub struct Subscription {
    id: u64,
    kind: String,
    inner: Weak<Inner>,
}

impl Subscription {
    /// Remove this handler. Other handlers for the same kind are kept.
    pub fn unsubscribe(&self) {
        let Some(inner) = self.inner.upgrade() else {
            return;
        };
        let mut subscribers = lock(&inner.subscribers);
        if let Some(list) = subscribers.get_mut(&self.kind) {
            list.retain(|(id, _)| *id != self.id);
            if list.is_empty() {
                subscribers.remove(&self.kind);
            }
        }
    }
}

/// Unsubscribes on drop, so a request cleans up however it ends.
struct SubscriptionGuard(Vec<Subscription>);

impl Drop for SubscriptionGuard {
    fn drop(&mut self) {
        for subscription in &self.0 {
            subscription.unsubscribe();
        }
    }
}

/// Client side of the control-plane protocol.
///
/// Cheap to clone; clones share one connection.
#[derive(Clone)]
pub struct Client {
    inner: Arc<Inner>,
}

impl Client {
    pub fn new(config: ClientConfig) -> Self {
        Self {
            inner: Arc::new(Inner {
                config,
                state: watch::channel(ConnectionState::Disconnected).0,
                authenticated: watch::channel(None).0,
                outbound: Mutex::new(None),
                subscribers: Mutex::new(HashMap::new()),
                closed: broadcast::channel(4).0,
                stop: Mutex::new(None),
                task: Mutex::new(None),
                next_id: AtomicU64::new(1),
            }),
        }
    }

    pub fn state(&self) -> ConnectionState {
        *self.inner.state.borrow()
    }

    /// Receiver that observes every state transition.
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state.subscribe()
    }

    pub fn is_authenticated(&self) -> bool {
        *self.inner.authenticated.borrow() == Some(true)
    }

    fn is_open(&self) -> bool {
        lock(&self.inner.outbound).is_some()
    }

    /// Open the connection in the background.
    ///
    /// No-op unless the client is `Disconnected`. Must be called from within
    /// a tokio runtime.
    pub fn connect(&self) {
        let mut task = lock(&self.inner.task);
        if self.state() != ConnectionState::Disconnected {
            return;
        }

        let (stop_tx, stop_rx) = watch::channel(false);
        *lock(&self.inner.stop) = Some(stop_tx);
        self.inner.state.send_replace(ConnectionState::Connecting);
        *task = Some(tokio::spawn(run(Arc::clone(&self.inner), stop_rx)));
    }

    /// Close the connection and cancel any pending reconnect.
    pub async fn disconnect(&self) {
        if let Some(stop) = lock(&self.inner.stop).take() {
            stop.send_replace(true);
        }
        let task = lock(&self.inner.task).take();
        if let Some(task) = task {
            let _ = task.await;
        }
        self.inner.state.send_replace(ConnectionState::Disconnected);
    }

    /// Wait until the server answers the `auth` message.
    pub async fn wait_until_authenticated(&self, timeout: Duration) -> Result<(), ClientError> {
        let mut rx = self.inner.authenticated.subscribe();
        let answer = tokio::time::timeout(timeout, rx.wait_for(Option::is_some))
            .await
            .map_err(|_| ClientError::Timeout {
                kind: kinds::AUTH.to_string(),
                after: timeout,
            })?
            .map(|answer| *answer)
            .map_err(|_| ClientError::Transport("client dropped".to_string()))?;

        match answer {
            Some(true) => Ok(()),
            _ => Err(ClientError::AuthFailed),
        }
    }

    /// Send a message without waiting for a reply.
    ///
    /// Returns `false` when the transport is not open.
    pub fn send(&self, kind: &str, payload: Value) -> bool {
        self.send_message(Message::new(kind, payload))
    }

    fn send_message(&self, message: Message) -> bool {
        match lock(&self.inner.outbound).as_ref() {
            Some(tx) => tx.send(WsMessage::Text(message.to_json().into())).is_ok(),
            None => false,
        }
    }

    /// Register `handler` for messages of `kind`.
    ///
    /// Exact-kind handlers receive the payload; [`kinds::WILDCARD`] handlers
    /// receive the whole message as JSON.
    pub fn on_message<F>(&self, kind: &str, handler: F) -> Subscription
    where
        F: Fn(&Value) + Send + Sync + 'static,
    {
        if kind == kinds::WILDCARD {
            self.subscribe_raw(kind, move |message| {
                handler(&serde_json::to_value(message).unwrap_or_default())
            })
        } else {
            self.subscribe_raw(kind, move |message| handler(&message.payload))
        }
    }

    fn subscribe_raw<F>(&self, kind: &str, handler: F) -> Subscription
    where
        F: Fn(&Message) + Send + Sync + 'static,
    {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        lock(&self.inner.subscribers)
            .entry(kind.to_string())
            .or_default()
            .push((id, Arc::new(handler)));
        Subscription {
            id,
            kind: kind.to_string(),
            inner: Arc::downgrade(&self.inner),
        }
    }

    /// Send a request and wait for its `<kind>_result`.
    ///
    /// Fails with [`ClientError::Remote`] on a matching `error` message,
    /// [`ClientError::Timeout`] after the configured timeout, and
    /// [`ClientError::Transport`] if the connection closes first. A timeout
    /// only abandons the wait; the server keeps working.
    pub async fn request(&self, kind: &str, payload: Value) -> Result<Value, ClientError> {
        if !self.is_open() {
            return Err(ClientError::NotConnected);
        }

        let request_id = self.inner.next_id.fetch_add(1, Ordering::Relaxed).to_string();
        let (tx, rx) = oneshot::channel::<Result<Value, ClientError>>();
        let reply = Arc::new(Mutex::new(Some(tx)));

        let matches_id = {
            let request_id = request_id.clone();
            move |message: &Message| message.id.as_deref().map_or(true, |id| id == request_id)
        };

        let on_result = {
            let reply = Arc::clone(&reply);
            let matches_id = matches_id.clone();
            self.subscribe_raw(&result_kind(kind), move |message| {
                if matches_id(message) {
                    if let Some(tx) = lock(&reply).take() {
                        let _ = tx.send(Ok(message.payload.clone()));
                    }
                }
            })
        };
        let on_error = {
            let reply = Arc::clone(&reply);
            let kind = kind.to_string();
            self.subscribe_raw(kinds::ERROR, move |message| {
                if message.original_kind() == Some(kind.as_str()) && matches_id(message) {
                    if let Some(tx) = lock(&reply).take() {
                        let _ = tx.send(Err(ClientError::Remote {
                            message: message
                                .payload
                                .get("message")
                                .and_then(Value::as_str)
                                .unwrap_or("Unknown error")
                                .to_string(),
                            original_kind: Some(kind.clone()),
                        }));
                    }
                }
            })
        };
        let _guard = SubscriptionGuard(vec![on_result, on_error]);

        let mut closed = self.inner.closed.subscribe();
        if !self.send_message(Message::new(kind, payload).with_id(Some(request_id))) {
            return Err(ClientError::NotConnected);
        }

        let timeout = self.inner.config.request_timeout;
        tokio::select! {
            outcome = rx => outcome.unwrap_or_else(|_| {
                Err(ClientError::Transport("client dropped".to_string()))
            }),
            _ = closed.recv() => Err(ClientError::Transport("connection closed".to_string())),
            _ = tokio::time::sleep(timeout) => Err(ClientError::Timeout {
                kind: kind.to_string(),
                after: timeout,
            }),
        }
    }
}

impl Inner {
    /// Route one inbound frame to subscribers.
    fn dispatch(&self, raw: &str) {
        let message = match Message::parse(raw) {
            Ok(message) => message,
            Err(e) => {
                log::debug!("Ignoring malformed message: {}", e);
                return;
            }
        };

        match message.kind.as_str() {
            kinds::AUTH_SUCCESS => {
                self.authenticated.send_replace(Some(true));
            }
            kinds::AUTH_FAILED => {
                log::warn!("Server rejected the shared secret");
                self.authenticated.send_replace(Some(false));
            }
            _ => {}
        }

        // Collected first so handlers may (un)subscribe without deadlocking.
        let handlers: Vec<Callback> = {
            let subscribers = lock(&self.subscribers);
            [message.kind.as_str(), kinds::WILDCARD]
                .iter()
                .filter_map(|kind| subscribers.get(*kind))
                .flatten()
                .map(|(_, callback)| Arc::clone(callback))
                .collect()
        };
        for handler in handlers {
            handler(&message);
        }
    }

    fn set_state(&self, state: ConnectionState) {
        self.state.send_replace(state);
    }
}

/// Connection task: dial, run the session, back off and redial.
async fn run(inner: Arc<Inner>, mut stop: watch::Receiver<bool>) {
    let policy = inner.config.reconnect.clone();
    let mut attempt = 0u32;

    loop {
        let dial = tokio::select! {
            dial = tokio_tungstenite::connect_async(inner.config.url.as_str()) => dial,
            _ = stop.wait_for(|stopped| *stopped) => break,
        };

        match dial {
            Ok((socket, _)) => {
                attempt = 0;
                log::info!("Connected to {}", inner.config.url);
                let requested = session(&inner, socket, &mut stop).await;
                if requested {
                    break;
                }
                log::warn!("Connection to {} lost", inner.config.url);
            }
            Err(e) => log::warn!("Failed to connect to {}: {}", inner.config.url, e),
        }

        attempt += 1;
        if !policy.allows(attempt) {
            log::warn!("Giving up on {} after {} attempts", inner.config.url, attempt - 1);
            break;
        }
        inner.set_state(ConnectionState::Reconnecting { attempt });
        let delay = policy.delay(attempt);
        log::info!("Reconnecting in {:?} (attempt {})", delay, attempt);

        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = stop.wait_for(|stopped| *stopped) => break,
        }
    }

    inner.set_state(ConnectionState::Disconnected);
}

/// Drive one open socket. Returns `true` if the caller asked to disconnect.
async fn session<S>(
    inner: &Inner,
    socket: tokio_tungstenite::WebSocketStream<S>,
    stop: &mut watch::Receiver<bool>,
) -> bool
where
    S: tokio::io::AsyncRead + tokio::io::AsyncWrite + Unpin,
{
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    // `auth` is queued before the channel is published, so it goes out first.
    let auth = Message::new(kinds::AUTH, json!({ "secret": inner.config.secret }));
    let _ = tx.send(WsMessage::Text(auth.to_json().into()));
    inner.authenticated.send_replace(None);
    *lock(&inner.outbound) = Some(tx);
    inner.set_state(ConnectionState::Connected);

    let requested = loop {
        tokio::select! {
            Some(outgoing) = rx.recv() => {
                if let Err(e) = sink.send(outgoing).await {
                    log::debug!("Write failed: {}", e);
                    break false;
                }
            }
            frame = stream.next() => match frame {
                Some(Ok(WsMessage::Text(text))) => inner.dispatch(text.as_str()),
                Some(Ok(WsMessage::Close(_))) | None => break false,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    log::debug!("Read failed: {}", e);
                    break false;
                }
            },
            _ = async { let _ = stop.wait_for(|stopped| *stopped).await; } => {
                let _ = sink.send(WsMessage::Close(None)).await;
                let _ = sink.close().await;
                break true;
            }
        }
    };

    *lock(&inner.outbound) = None;
    inner.authenticated.send_replace(None);
    let _ = inner.closed.send(());
    requested
}

// ============================================================================
// TESTS
// ============================================================================

//! Live WebSocket connections.
//!
//! A [`Connection`] is the server's record of one client: an id, an
//! outbound message channel drained by the socket writer task, and an
//! authenticated flag that only ever goes from `false` to `true`.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use tether_core::protocol::Message;
use tokio::sync::mpsc;
use uuid::Uuid;

pub struct Connection {
    id: Uuid,
    authenticated: AtomicBool,
    tx: mpsc::UnboundedSender<Message>,
}

impl Connection {
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            authenticated: AtomicBool::new(false),
            tx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn is_authenticated(&self) -> bool {
        self.authenticated.load(Ordering::Acquire)
    }

    pub(crate) fn mark_authenticated(&self) {
        self.authenticated.store(true, Ordering::Release);
    }

    /// Queue a message for the client. Returns `false` once the socket is gone.
    pub fn send(&self, message: Message) -> bool {
        self.tx.send(message).is_ok()
    }
}

/// All open connections, keyed by id.
#[derive(Default)]
pub struct ConnectionRegistry {
    connections: Mutex<HashMap<Uuid, Arc<Connection>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, connection: Arc<Connection>) {
        self.lock().insert(connection.id(), connection);
    }

    pub fn remove(&self, id: Uuid) -> Option<Arc<Connection>> {
        self.lock().remove(&id)
    }

    pub fn len(&self) -> usize {
        self.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().is_empty()
    }

    /// Send `message` to every authenticated connection; returns the recipient count.
    pub fn broadcast(&self, message: &Message) -> usize {
        let recipients: Vec<Arc<Connection>> = self
            .lock()
            .values()
            .filter(|c| c.is_authenticated())
            .cloned()
            .collect();

        recipients
            .iter()
            .filter(|c| c.send(message.clone()))
            .count()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashMap<Uuid, Arc<Connection>>> {
        self.connections.lock().unwrap_or_else(|e| e.into_inner())
    }
}

// ============================================================================
// TESTS
// ============================================================================

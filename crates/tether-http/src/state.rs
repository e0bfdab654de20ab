//! Shared state for the server.

use std::sync::Arc;

use tether_core::protocol::Message;
use tether_core::{Credential, Orchestrator, RepoManager};
use tokio::sync::watch;

use crate::connection::ConnectionRegistry;
use crate::handlers::HandlerRegistry;

/// Server settings.
#[derive(Clone)]
pub struct ServerConfig {
    /// Shared secret clients present in their `auth` message
    pub secret: String,
    /// Reported in `welcome` and `/status`
    pub version: String,
}

impl ServerConfig {
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: secret.into(),
            version: env!("CARGO_PKG_VERSION").to_string(),
        }
    }
}

impl std::fmt::Debug for ServerConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ServerConfig")
            .field("secret", &"***")
            .field("version", &self.version)
            .finish()
    }
}

/// Shared state available to every connection and handler.
pub struct ServerState {
    pub config: ServerConfig,
    pub repos: Arc<RepoManager>,
    pub orchestrator: Arc<Orchestrator>,
    /// Default git credential; a request may carry its own `token`
    pub credential: Option<Credential>,
    pub connections: ConnectionRegistry,
    pub handlers: HandlerRegistry,
    shutdown: watch::Sender<bool>,
}

impl ServerState {
    /// State with the built-in handlers registered.
    pub fn new(config: ServerConfig, repos: Arc<RepoManager>, orchestrator: Arc<Orchestrator>) -> Self {
        Self {
            config,
            repos,
            orchestrator,
            credential: None,
            connections: ConnectionRegistry::new(),
            handlers: HandlerRegistry::with_builtins(),
            shutdown: watch::channel(false).0,
        }
    }

    pub fn with_credential(mut self, credential: Option<Credential>) -> Self {
        self.credential = credential;
        self
    }

    /// Send `message` to every authenticated connection.
    pub fn broadcast(&self, message: &Message) -> usize {
        self.connections.broadcast(message)
    }

    /// Receiver that flips to `true` when the server starts shutting down.
    pub fn shutdown_signal(&self) -> watch::Receiver<bool> {
        self.shutdown.subscribe()
    }

    /// Ask every open socket to flush its queue and close.
    pub fn begin_shutdown(&self) {
        self.shutdown.send_replace(true);
    }
}

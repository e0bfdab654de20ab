use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ClientError {
    /// The transport is not open; nothing was sent
    #[error("Not connected")]
    NotConnected,

    #[error("{kind} timed out after {after:?}")]
    Timeout { kind: String, after: Duration },

    /// The transport closed while waiting
    #[error("Transport error: {0}")]
    Transport(String),

    /// The server answered with an `error` message
    #[error("{message}")]
    Remote {
        message: String,
        original_kind: Option<String>,
    },

    #[error("Authentication failed")]
    AuthFailed,
}

//! Client connection manager for the Tether control plane.
//!
//! Connects to a `tether-http` server, authenticates with the shared secret,
//! and turns the message protocol into request/response calls:
//!
//! ```no_run
//! # async fn demo() -> Result<(), tether_client::ClientError> {
//! use std::time::Duration;
//! use serde_json::json;
//! use tether_client::{Client, ClientConfig};
//!
//! let client = Client::new(ClientConfig::new("ws://127.0.0.1:8787/ws", "secret"));
//! client.connect();
//! client.wait_until_authenticated(Duration::from_secs(5)).await?;
//!
//! let _progress = client.on_message("progress", |event| println!("{event}"));
//! let result = client
//!     .request("clone_repo", json!({"owner": "acme", "repo": "widgets"}))
//!     .await?;
//! # let _ = result;
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;

pub use client::{Client, ConnectionState, Subscription};
pub use config::{ClientConfig, ReconnectPolicy};
pub use error::ClientError;

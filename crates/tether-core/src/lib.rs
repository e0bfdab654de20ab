//! # tether-core
//!
//! Core engines for Tether, the remote control plane for AI coding agents.
//!
//! This crate is transport-agnostic and is used by:
//! - the WebSocket server (`tether-http`)
//! - the remote client (`tether-client`)
//! - the daemon binary (`tether-daemon`)
//!
//! ## Key Concepts
//!
//! - **Target**: A repository working directory identified by `(owner, name)`
//! - **Turn**: One user or assistant message in a target's conversation history
//! - **Message**: The `{type, payload, id?}` envelope spoken on the wire

pub mod git;
pub mod logging;
pub mod orchestrator;
pub mod paths;
pub mod protocol;
pub mod shell;
pub mod spawn;
pub mod target;

// Re-export commonly used types
pub use git::{Credential, GitError, RepoConfig, RepoManager};
pub use orchestrator::{ExecuteResult, Orchestrator, OrchestratorError, ToolConfig, ToolOutput, Turn};
pub use protocol::{Message, ProgressEvent};
pub use target::{Target, TargetError, Workspace};

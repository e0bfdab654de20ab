//! Request handlers, keyed by message kind.
//!
//! # Overview
//!
//! A handler receives the shared [`ServerState`], the request payload and a
//! [`ProgressEmitter`] bound to the requesting connection. Its `Ok` value
//! becomes the payload of the `<kind>_result` reply; an `Err` becomes an
//! `error` message carrying `originalKind`.
//!
//! # Built-in Handlers
//!
//! | Kind | Engine |
//! |------|--------|
//! | `clone_repo`, `get_commits`, `get_diff`, `commit_changes`, `rollback` | [`RepoManager`](tether_core::RepoManager) |
//! | `execute_command`, `cancel` | [`Orchestrator`](tether_core::Orchestrator) |

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;

use futures::future::BoxFuture;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::mpsc;

use tether_core::orchestrator::ToolOutput;
use tether_core::protocol::{kinds, Message, ProgressEvent};
use tether_core::{Credential, GitError, OrchestratorError, Target, TargetError};

use crate::connection::Connection;
use crate::state::ServerState;

const DEFAULT_COMMIT_LIMIT: usize = 20;
const MAX_COMMIT_LIMIT: usize = 500;
const DEFAULT_COMMIT_MESSAGE: &str = "Update from remote agent";

// ============================================================================
// ERROR TYPE
// ============================================================================

#[derive(Error, Debug)]
pub enum HandlerError {
    #[error("Invalid payload: {0}")]
    InvalidPayload(String),

    #[error(transparent)]
    Target(#[from] TargetError),

    #[error(transparent)]
    Git(#[from] GitError),

    #[error(transparent)]
    Orchestrator(#[from] OrchestratorError),

    #[error("Failed to encode result: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("{0}")]
    Failed(String),
}

// ============================================================================
// PROGRESS
// ============================================================================

/// Sends `progress` messages for one request.
#[derive(Clone)]
pub struct ProgressEmitter {
    connection: Arc<Connection>,
    request_id: Option<String>,
}

impl ProgressEmitter {
    pub fn new(connection: Arc<Connection>, request_id: Option<String>) -> Self {
        Self {
            connection,
            request_id,
        }
    }

    /// Send a progress event. Returns `false` if the connection is gone.
    pub fn emit(&self, event: ProgressEvent) -> bool {
        self.connection
            .send(Message::progress(&event).with_id(self.request_id.clone()))
    }

    pub fn stage(&self, stage: &str, message: impl Into<String>) -> bool {
        self.emit(ProgressEvent::stage(stage).message(message))
    }
}

// ============================================================================
// REGISTRY
// ============================================================================

pub type HandlerFuture = BoxFuture<'static, Result<Value, HandlerError>>;

pub type Handler =
    Arc<dyn Fn(Arc<ServerState>, Value, ProgressEmitter) -> HandlerFuture + Send + Sync>;

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Handler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in request kind.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register(kinds::CLONE_REPO, clone_repo);
        registry.register(kinds::GET_COMMITS, get_commits);
        registry.register(kinds::GET_DIFF, get_diff);
        registry.register(kinds::EXECUTE_COMMAND, execute_command);
        registry.register(kinds::COMMIT_CHANGES, commit_changes);
        registry.register(kinds::ROLLBACK, rollback);
        registry.register(kinds::CANCEL, cancel);
        registry
    }

    /// Bind `kind` to `handler`, replacing any previous binding.
    pub fn register<F, Fut>(&mut self, kind: &str, handler: F)
    where
        F: Fn(Arc<ServerState>, Value, ProgressEmitter) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, HandlerError>> + Send + 'static,
    {
        self.handlers.insert(
            kind.to_string(),
            Arc::new(move |state, payload, emitter| Box::pin(handler(state, payload, emitter))),
        );
    }

    pub fn get(&self, kind: &str) -> Option<Handler> {
        self.handlers.get(kind).cloned()
    }

    pub fn contains(&self, kind: &str) -> bool {
        self.handlers.contains_key(kind)
    }
}

// ============================================================================
// PAYLOADS
// ============================================================================

#[derive(Deserialize)]
struct TargetRef {
    owner: String,
    repo: String,
}

impl TargetRef {
    fn target(&self) -> Result<Target, TargetError> {
        Target::new(self.owner.as_str(), self.repo.as_str())
    }
}

#[derive(Deserialize)]
struct ClonePayload {
    #[serde(flatten)]
    target: TargetRef,
    token: Option<String>,
}

#[derive(Deserialize)]
struct CommitsPayload {
    #[serde(flatten)]
    target: TargetRef,
    limit: Option<usize>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct DiffPayload {
    #[serde(flatten)]
    target: TargetRef,
    commit_hash: String,
}

#[derive(Deserialize)]
struct ExecutePayload {
    #[serde(flatten)]
    target: TargetRef,
    prompt: String,
}

#[derive(Deserialize)]
struct CommitPayload {
    #[serde(flatten)]
    target: TargetRef,
    message: Option<String>,
    token: Option<String>,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RollbackPayload {
    #[serde(flatten)]
    target: TargetRef,
    commit_hash: String,
    token: Option<String>,
}

fn parse<T: DeserializeOwned>(payload: Value) -> Result<T, HandlerError> {
    serde_json::from_value(payload).map_err(|e| HandlerError::InvalidPayload(e.to_string()))
}

/// A request token overrides the server's configured credential.
fn credential(state: &ServerState, token: Option<String>) -> Option<Credential> {
    token
        .filter(|t| !t.is_empty())
        .map(Credential::new)
        .or_else(|| state.credential.clone())
}

// ============================================================================
// BUILT-IN HANDLERS
// ============================================================================

/// Working-copy mutations wait for the tool to leave the directory alone.
fn ensure_idle(state: &ServerState, target: &Target) -> Result<(), HandlerError> {
    if state.orchestrator.is_running(target) {
        return Err(OrchestratorError::Busy(target.id()).into());
    }
    Ok(())
}

async fn clone_repo(
    state: Arc<ServerState>,
    payload: Value,
    emit: ProgressEmitter,
) -> Result<Value, HandlerError> {
    let req: ClonePayload = parse(payload)?;
    let target = req.target.target()?;
    ensure_idle(&state, &target)?;
    let credential = credential(&state, req.token);

    if state.repos.workspace().is_cloned(&target) {
        emit.stage("syncing", format!("Pulling latest changes for {target}"));
    } else {
        emit.stage("cloning", format!("Cloning {target}"));
    }

    let outcome = state
        .repos
        .clone_or_pull(&target, credential.as_ref())
        .await?;
    emit.stage("done", format!("Repository ready at {}", outcome.path.display()));

    Ok(serde_json::to_value(outcome)?)
}

async fn get_commits(
    state: Arc<ServerState>,
    payload: Value,
    _emit: ProgressEmitter,
) -> Result<Value, HandlerError> {
    let req: CommitsPayload = parse(payload)?;
    let target = req.target.target()?;
    let limit = req.limit.unwrap_or(DEFAULT_COMMIT_LIMIT).min(MAX_COMMIT_LIMIT);
    if limit == 0 {
        return Ok(json!([]));
    }

    let commits = state.repos.get_commit_history(&target, limit).await?;
    Ok(serde_json::to_value(commits)?)
}

async fn get_diff(
    state: Arc<ServerState>,
    payload: Value,
    _emit: ProgressEmitter,
) -> Result<Value, HandlerError> {
    let req: DiffPayload = parse(payload)?;
    let target = req.target.target()?;

    let diff = state
        .repos
        .get_commit_diff(&target, &req.commit_hash)
        .await?;
    Ok(Value::String(diff))
}

async fn execute_command(
    state: Arc<ServerState>,
    payload: Value,
    emit: ProgressEmitter,
) -> Result<Value, HandlerError> {
    let req: ExecutePayload = parse(payload)?;
    let target = req.target.target()?;
    if req.prompt.trim().is_empty() {
        return Err(HandlerError::InvalidPayload("prompt cannot be empty".to_string()));
    }

    emit.stage(
        "running",
        format!("Running {} in {target}", state.orchestrator.config().binary_path),
    );

    let (tx, mut rx) = mpsc::unbounded_channel();
    let forward = emit.clone();
    let forwarder = tokio::spawn(async move {
        while let Some(event) = rx.recv().await {
            let progress = match event {
                ToolOutput::Stdout(text) => ProgressEvent::output("stdout", text),
                ToolOutput::Stderr(text) => ProgressEvent::output("stderr", text),
                ToolOutput::Exit(exit) => {
                    ProgressEvent::stage("complete").message(format!("exit code {}", exit.code))
                }
            };
            forward.emit(progress);
        }
    });

    let result = state.orchestrator.execute(&target, &req.prompt, tx).await;
    // The sender is dropped with the run, so this drains every chunk before the reply.
    if let Err(e) = forwarder.await {
        log::warn!("Progress forwarder for {} failed: {}", target, e);
    }

    Ok(serde_json::to_value(result?)?)
}

async fn commit_changes(
    state: Arc<ServerState>,
    payload: Value,
    emit: ProgressEmitter,
) -> Result<Value, HandlerError> {
    let req: CommitPayload = parse(payload)?;
    let target = req.target.target()?;
    ensure_idle(&state, &target)?;
    let credential = credential(&state, req.token);
    let message = req
        .message
        .filter(|m| !m.trim().is_empty())
        .unwrap_or_else(|| DEFAULT_COMMIT_MESSAGE.to_string());

    emit.stage("committing", format!("Committing changes in {target}"));
    let outcome = state
        .repos
        .commit_and_push(&target, &message, credential.as_ref())
        .await?;
    emit.stage(
        "done",
        outcome
            .short_hash
            .as_deref()
            .map(|h| format!("Pushed {h}"))
            .unwrap_or_else(|| "Nothing to commit".to_string()),
    );

    Ok(serde_json::to_value(outcome)?)
}

async fn rollback(
    state: Arc<ServerState>,
    payload: Value,
    emit: ProgressEmitter,
) -> Result<Value, HandlerError> {
    let req: RollbackPayload = parse(payload)?;
    let target = req.target.target()?;
    ensure_idle(&state, &target)?;
    let credential = credential(&state, req.token);

    emit.stage(
        "rolling_back",
        format!("Resetting {target} to {}", req.commit_hash),
    );
    let outcome = state
        .repos
        .rollback_to_commit(&target, &req.commit_hash, credential.as_ref())
        .await?;
    emit.stage("done", format!("Force-pushed {}", outcome.branch));

    Ok(serde_json::to_value(outcome)?)
}

async fn cancel(
    state: Arc<ServerState>,
    payload: Value,
    _emit: ProgressEmitter,
) -> Result<Value, HandlerError> {
    let req: TargetRef = parse(payload)?;
    let target = req.target()?;

    let cancelled = state.orchestrator.cancel(&target);
    log::info!("Cancel requested for {} (cancelled: {})", target, cancelled);
    Ok(json!({ "cancelled": cancelled }))
}

// ============================================================================
// TESTS
// ============================================================================

//! Repository state management.
//!
//! # Overview
//!
//! This module owns the on-disk working copies of every target. It wraps
//! the `git` CLI so that user configuration (hooks, proxies, credential
//! helpers) keeps working without extra setup.
//!
//! # Modules
//!
//! - [`repo`] - [`RepoManager`]: clone/pull, commit/push, rollback
//! - [`history`] - Commit history listing and commit diffs
//!
//! # Error Handling
//!
//! All operations return `Result<T, GitError>`. Credentials embedded in
//! remote URLs are redacted from error text before it is returned.
//!
//! # Example
//!
//! ```ignore
//! use tether_core::git::{RepoConfig, RepoManager};
//! use tether_core::{Target, Workspace};
//!
//! let repos = RepoManager::new(Workspace::new("/srv/tether"), RepoConfig::default());
//! let target = Target::new("acme", "widgets")?;
//! let outcome = repos.clone_or_pull(&target, credential.as_ref()).await?;
//! let commits = repos.get_commit_history(&target, 20).await?;
//! ```

pub mod history;
pub mod repo;

use std::fmt;
use std::path::Path;
use std::process::Stdio;

use thiserror::Error;
use tokio::process::Command;

pub use history::{parse_commit_log, CommitRecord};
pub use repo::{
    CloneAction, CloneOutcome, CommitIdentity, CommitOutcome, RepoConfig, RepoManager,
    RollbackOutcome,
};

// ============================================================================
// ERROR TYPE
// ============================================================================

/// Error type for repository operations.
#[derive(Error, Debug)]
pub enum GitError {
    /// Command failed to execute (e.g., git not found)
    #[error("Failed to run git: {0}")]
    CommandFailed(#[from] std::io::Error),

    /// Git command returned non-zero exit code
    #[error("Git error: {stderr}")]
    GitFailed {
        /// The stderr output from git
        stderr: String,
        /// The stdout output (sometimes contains useful info)
        stdout: String,
    },

    /// The target has no working copy yet
    #[error("Repository {0} has not been cloned")]
    NotCloned(String),

    /// A commit hash that is malformed or unknown
    #[error("Invalid commit: {0}")]
    InvalidCommit(String),

    /// Path-related error
    #[error("Path error: {0}")]
    PathError(String),
}

impl GitError {
    /// Replace every occurrence of `secret` in the error text.
    pub fn redact(self, secret: Option<&Credential>) -> Self {
        let Some(secret) = secret.map(Credential::expose).filter(|s| !s.is_empty()) else {
            return self;
        };
        match self {
            GitError::GitFailed { stderr, stdout } => GitError::GitFailed {
                stderr: stderr.replace(secret, "***"),
                stdout: stdout.replace(secret, "***"),
            },
            other => other,
        }
    }
}

// ============================================================================
// CREDENTIAL
// ============================================================================

/// Access token used to authenticate against the remote.
///
/// `Debug` never prints the token.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(***)")
    }
}

// ============================================================================
// OUTPUT TYPE
// ============================================================================

/// Output from a git command.
#[derive(Debug)]
pub struct GitOutput {
    /// Whether the command succeeded (exit code 0)
    pub success: bool,
    /// Exit code, if the process exited normally
    pub code: Option<i32>,
    pub stdout: Vec<u8>,
    pub stderr: Vec<u8>,
}

impl GitOutput {
    /// Get stdout as a string (lossy UTF-8 conversion)
    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).to_string()
    }

    /// Get stderr as a string (lossy UTF-8 conversion)
    pub fn stderr_str(&self) -> String {
        String::from_utf8_lossy(&self.stderr).to_string()
    }

    fn into_error(self) -> GitError {
        GitError::GitFailed {
            stderr: String::from_utf8_lossy(&self.stderr).trim().to_string(),
            stdout: String::from_utf8_lossy(&self.stdout).trim().to_string(),
        }
    }
}

// ============================================================================
// COMMON UTILITIES
// ============================================================================

/// Run a git command asynchronously and return the output.
///
/// Interactive credential prompts are disabled so a bad token fails fast
/// instead of blocking the daemon.
pub async fn run_git(args: &[&str], cwd: &Path) -> Result<GitOutput, GitError> {
    let output = Command::new("git")
        .args(args)
        .current_dir(cwd)
        .env("GIT_TERMINAL_PROMPT", "0")
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .output()
        .await?;

    Ok(GitOutput {
        success: output.status.success(),
        code: output.status.code(),
        stdout: output.stdout,
        stderr: output.stderr,
    })
}

/// Run a git command and return trimmed stdout, or `GitFailed` with stderr.
pub async fn run_git_success(args: &[&str], cwd: &Path) -> Result<String, GitError> {
    let output = run_git(args, cwd).await?;

    if output.success {
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    } else {
        Err(output.into_error())
    }
}

/// Check if a git ref resolves to a commit.
pub async fn commit_exists(rev: &str, cwd: &Path) -> bool {
    let object = format!("{rev}^{{commit}}");
    run_git(&["rev-parse", "--verify", "--quiet", &object], cwd)
        .await
        .map(|o| o.success)
        .unwrap_or(false)
}

/// Get the current branch name, or "HEAD" if detached.
pub async fn get_current_branch(cwd: &Path) -> Result<String, GitError> {
    run_git_success(&["rev-parse", "--abbrev-ref", "HEAD"], cwd).await
}

/// Check if a path is the root of a git working copy.
///
/// This is synchronous since it's just a filesystem check.
pub fn is_git_repo(path: &Path) -> bool {
    path.join(".git").exists()
}

/// Whether `hash` looks like an abbreviated or full commit id.
pub fn is_commit_hash(hash: &str) -> bool {
    (4..=40).contains(&hash.len()) && hash.chars().all(|c| c.is_ascii_hexdigit())
}

// ============================================================================
// TESTS
// ============================================================================

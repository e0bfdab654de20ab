//! Commit history and commit diffs.
//!
//! Both operations are read-only projections of the working copy and are
//! regenerated on every call.

use super::{commit_exists, is_commit_hash, is_git_repo, run_git, GitError};
use serde::Serialize;
use std::path::Path;

const FIELD_SEP: char = '\x1f';
const RECORD_SEP: char = '\x1e';

/// `git log` format: hash, short hash, subject, author, ISO-8601 author date.
const LOG_FORMAT: &str = "--format=%H%x1f%h%x1f%s%x1f%an%x1f%aI%x1e";

/// One entry of a target's commit history.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CommitRecord {
    pub hash: String,
    pub short_hash: String,
    /// First line of the commit message
    pub message: String,
    /// Author date, ISO-8601
    pub date: String,
    pub author: String,
}

/// Parse the output of `git log` produced with [`LOG_FORMAT`].
pub fn parse_commit_log(stdout: &str) -> Vec<CommitRecord> {
    stdout
        .split(RECORD_SEP)
        .filter_map(|record| {
            let record = record.trim_start_matches(['\r', '\n']);
            if record.is_empty() {
                return None;
            }
            let mut fields = record.split(FIELD_SEP);
            let hash = fields.next()?.to_string();
            let short_hash = fields.next()?.to_string();
            let message = fields.next()?.to_string();
            let author = fields.next()?.to_string();
            let date = fields.next()?.trim_end().to_string();
            Some(CommitRecord {
                hash,
                short_hash,
                message,
                date,
                author,
            })
        })
        .collect()
}

/// List up to `limit` most recent commits, newest first.
///
/// Returns an empty list when the path is not a working copy or the
/// repository has no commits yet.
pub async fn commit_history(path: &Path, limit: usize) -> Result<Vec<CommitRecord>, GitError> {
    if !is_git_repo(path) {
        return Ok(Vec::new());
    }

    let limit = limit.to_string();
    let output = run_git(&["log", "-n", &limit, LOG_FORMAT], path).await?;

    if !output.success {
        // Freshly initialised repositories have no HEAD to walk.
        if output.stderr_str().contains("does not have any commits") {
            return Ok(Vec::new());
        }
        return Err(output.into_error());
    }

    Ok(parse_commit_log(&output.stdout_str()))
}

/// Textual diff between `hash` and its first parent.
///
/// Root commits are diffed against the empty tree.
pub async fn commit_diff(path: &Path, hash: &str) -> Result<String, GitError> {
    if !is_commit_hash(hash) {
        return Err(GitError::InvalidCommit(hash.to_string()));
    }
    if !commit_exists(hash, path).await {
        return Err(GitError::InvalidCommit(format!("{hash} not found")));
    }

    let parent = format!("{hash}^");
    let output = if commit_exists(&parent, path).await {
        run_git(&["diff", &parent, hash], path).await?
    } else {
        run_git(&["show", "--format=", "--patch", hash], path).await?
    };

    if output.success {
        Ok(output.stdout_str())
    } else {
        Err(output.into_error())
    }
}

// ============================================================================
// TESTS
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::git::tests::{git, seed_remote};
    use tempfile::tempdir;

    #[test]
    fn parse_commit_log_basic() {
        let stdout = "aaaa1111\x1faaaa\x1fSecond\x1fAlice\x1f2026-01-02T10:00:00+00:00\x1e\n\
                      bbbb2222\x1fbbbb\x1fFirst\x1fBob\x1f2026-01-01T10:00:00+00:00\x1e\n";
        let commits = parse_commit_log(stdout);

        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].hash, "aaaa1111");
        assert_eq!(commits[0].short_hash, "aaaa");
        assert_eq!(commits[0].message, "Second");
        assert_eq!(commits[0].author, "Alice");
        assert_eq!(commits[0].date, "2026-01-02T10:00:00+00:00");
        assert_eq!(commits[1].author, "Bob");
    }

    #[test]
    fn parse_commit_log_empty() {
        assert!(parse_commit_log("").is_empty());
        assert!(parse_commit_log("\n").is_empty());
    }

    #[test]
    fn parse_commit_log_skips_truncated_records() {
        let commits = parse_commit_log("abc\x1fab\x1e");
        assert!(commits.is_empty());
    }

    #[test]
    fn commit_record_uses_camel_case() {
        let record = CommitRecord {
            hash: "a".into(),
            short_hash: "a".into(),
            message: "m".into(),
            date: "d".into(),
            author: "x".into(),
        };
        let json = serde_json::to_string(&record).unwrap();
        assert!(json.contains("shortHash"));
    }

    #[tokio::test]
    async fn history_of_missing_repo_is_empty() {
        let dir = tempdir().unwrap();
        let commits = commit_history(&dir.path().join("nope"), 10).await.unwrap();
        assert!(commits.is_empty());
    }

    #[tokio::test]
    async fn history_and_diff_of_real_repo() {
        let base = tempdir().unwrap();
        let remote = seed_remote(base.path(), "acme", "widgets");
        let work = tempdir().unwrap();
        git(&["clone", "-q", remote.to_str().unwrap(), "."], work.path());
        std::fs::write(work.path().join("LICENSE"), "MIT\n").unwrap();
        git(&["add", "-A"], work.path());
        git(&["commit", "-q", "-m", "Add license\n\nLong body"], work.path());

        let commits = commit_history(work.path(), 10).await.unwrap();
        assert_eq!(commits.len(), 2);
        assert_eq!(commits[0].message, "Add license");
        assert_eq!(commits[0].author, "Fixture");
        assert_eq!(commits[1].message, "Initial commit");

        let limited = commit_history(work.path(), 1).await.unwrap();
        assert_eq!(limited.len(), 1);

        let diff = commit_diff(work.path(), &commits[0].hash).await.unwrap();
        assert!(diff.contains("+MIT"));
        assert!(!diff.contains("# seed"));

        // Root commit diffs against the empty tree
        let root = commit_diff(work.path(), &commits[1].short_hash).await.unwrap();
        assert!(root.contains("+# seed"));
    }

    #[tokio::test]
    async fn diff_rejects_bad_hashes() {
        let base = tempdir().unwrap();
        let remote = seed_remote(base.path(), "acme", "widgets");
        let work = tempdir().unwrap();
        git(&["clone", "-q", remote.to_str().unwrap(), "."], work.path());

        assert!(matches!(
            commit_diff(work.path(), "--stat").await,
            Err(GitError::InvalidCommit(_))
        ));
        assert!(matches!(
            commit_diff(work.path(), "deadbeefdeadbeef").await,
            Err(GitError::InvalidCommit(_))
        ));
    }
}

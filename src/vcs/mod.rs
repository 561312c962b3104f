//! Version control state machine driven by the edit stream.
//!
//! Tracks a status per file and an in-memory commit log:
//! - `untracked` / `unstaged` / `staged` / clean file states
//! - Immutable, content-addressed commits (most recent first)
//! - Branch labels

pub mod machine;

pub use machine::VersionControl;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// Name of the branch every repository starts on
pub const DEFAULT_BRANCH: &str = "main";

/// Errors from version control operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum VcsError {
    #[error("Nothing to stage in {0}")]
    NothingToStage(String),

    #[error("{0} is already staged")]
    AlreadyStaged(String),

    #[error("{0} is not staged")]
    NotStaged(String),

    #[error("Nothing to commit")]
    NothingToCommit,

    #[error("Commit message must not be empty")]
    EmptyMessage,

    #[error("Branch already exists: {0}")]
    BranchExists(String),

    #[error("Branch not found: {0}")]
    BranchNotFound(String),

    #[error("Invalid branch name: {0:?}")]
    InvalidBranchName(String),
}

pub type VcsResult<T> = Result<T, VcsError>;

/// Status of a single file
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileStatus {
    /// Never committed and not staged
    Untracked,
    /// Changed since it was last staged or committed
    Unstaged,
    /// Queued for the next commit
    Staged,
    /// Matches the last commit
    Clean,
}

/// An immutable entry of the commit log
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GitCommit {
    id: String,
    message: String,
    author: String,
    timestamp: DateTime<Utc>,
    files: Vec<String>,
}

impl GitCommit {
    /// Build a commit whose id is derived from its parent and its own content
    pub(crate) fn new(
        parent: Option<&str>,
        message: impl Into<String>,
        author: impl Into<String>,
        timestamp: DateTime<Utc>,
        files: Vec<String>,
    ) -> Self {
        let message = message.into();
        let author = author.into();

        let mut hasher = Sha256::new();
        hasher.update(parent.unwrap_or_default().as_bytes());
        hasher.update(b"\n");
        hasher.update(message.as_bytes());
        hasher.update(b"\n");
        hasher.update(author.as_bytes());
        hasher.update(b"\n");
        hasher.update(timestamp.timestamp_millis().to_be_bytes());
        for file in &files {
            hasher.update(b"\n");
            hasher.update(file.as_bytes());
        }
        let id = hex::encode(hasher.finalize());

        Self {
            id,
            message,
            author,
            timestamp,
            files,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// First seven hex digits of the id
    pub fn short_id(&self) -> &str {
        &self.id[..7]
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn author(&self) -> &str {
        &self.author
    }

    pub fn timestamp(&self) -> DateTime<Utc> {
        self.timestamp
    }

    pub fn files(&self) -> &[String] {
        &self.files
    }
}

/// Snapshot of the repository state
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct GitStatus {
    pub staged: Vec<String>,
    pub unstaged: Vec<String>,
    pub untracked: Vec<String>,
    pub current_branch: String,
    pub branches: Vec<String>,
    /// Most recent first
    pub commits: Vec<GitCommit>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_commit_id_is_content_derived() {
        let ts = Utc::now();
        let files = vec!["a.rs".to_string()];
        let a = GitCommit::new(None, "init", "alice", ts, files.clone());
        let b = GitCommit::new(None, "init", "alice", ts, files.clone());
        let c = GitCommit::new(Some(a.id()), "init", "alice", ts, files);

        assert_eq!(a.id(), b.id());
        assert_ne!(a.id(), c.id());
        assert_eq!(a.id().len(), 64);
        assert_eq!(a.short_id().len(), 7);
    }

    #[test]
    fn test_status_serializes_camel_case() {
        let status = GitStatus {
            staged: vec![],
            unstaged: vec!["a.rs".into()],
            untracked: vec![],
            current_branch: DEFAULT_BRANCH.into(),
            branches: vec![DEFAULT_BRANCH.into()],
            commits: vec![],
        };
        let json = serde_json::to_value(&status).unwrap();
        assert_eq!(json["currentBranch"], "main");
        assert_eq!(json["unstaged"][0], "a.rs");
    }
}

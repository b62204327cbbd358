//! Access to the external git repository that build files are synced with.
//!
//! The sync engine only talks to [`Repository`]; credentials are owned by
//! whoever constructs the implementation.

pub mod git;
pub mod memory;

pub use git::{Credentials, GitRepository};
pub use memory::MemoryRepository;

use serde::{Deserialize, Serialize};
use thiserror::Error;

pub type RepoResult<T> = std::result::Result<T, RepositoryError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RepositoryErrorKind {
    /// Network hiccup or lock contention; worth retrying.
    Transient,
    Authentication,
    NotFound,
    /// Remote refused the update (e.g. non-fast-forward).
    Rejected,
    Other,
}

#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[error("repository access failed ({kind:?}): {message}")]
pub struct RepositoryError {
    pub kind: RepositoryErrorKind,
    pub message: String,
}

impl RepositoryError {
    pub fn new(kind: RepositoryErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::new(RepositoryErrorKind::NotFound, message)
    }

    pub fn is_transient(&self) -> bool {
        self.kind == RepositoryErrorKind::Transient
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FetchedTree {
    pub commit: String,
    /// Every file path in the tree at `commit`.
    pub paths: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathChangeKind {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PathChange {
    pub path: String,
    pub kind: PathChangeKind,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum FileChange {
    Write { path: String, contents: Vec<u8> },
    Delete { path: String },
}

impl FileChange {
    pub fn path(&self) -> &str {
        match self {
            FileChange::Write { path, .. } | FileChange::Delete { path } => path,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Capabilities {
    pub can_push: bool,
    pub can_create_pr: bool,
}

/// Blocking repository operations. Implementations must be shareable across
/// the server's worker threads.
pub trait Repository: Send + Sync {
    /// Stable identifier used to key locks and links.
    fn id(&self) -> &str;

    fn fetch(&self, branch: &str) -> RepoResult<FetchedTree>;

    fn diff_tree(&self, from_commit: &str, to_commit: &str) -> RepoResult<Vec<PathChange>>;

    fn read_file(&self, commit: &str, path: &str) -> RepoResult<Vec<u8>>;

    fn commit_and_push(
        &self,
        branch: &str,
        changes: &[FileChange],
        message: &str,
    ) -> RepoResult<String>;

    fn capabilities(&self) -> Capabilities;
}

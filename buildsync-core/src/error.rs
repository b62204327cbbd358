use crate::frontmatter::FrontmatterError;
use crate::repository::RepositoryError;
use thiserror::Error;
use uuid::Uuid;

pub type Result<T> = std::result::Result<T, Error>;

#[derive(Error, Debug)]
pub enum Error {
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Config error: {0}")]
    Config(#[from] toml::de::Error),

    #[error("Concurrent version on entity {entity_id}: expected version {expected}, found {actual}")]
    ConcurrentVersion {
        entity_id: Uuid,
        expected: u32,
        actual: u32,
    },

    #[error("Entity not found: {0}")]
    EntityNotFound(String),

    #[error("Version {version} not found for entity {entity_id}")]
    VersionNotFound { entity_id: Uuid, version: u32 },

    #[error("Build not found: {0}")]
    BuildNotFound(String),

    #[error("Git link not found: {0}")]
    LinkNotFound(String),

    #[error(transparent)]
    Frontmatter(#[from] FrontmatterError),

    #[error(transparent)]
    RepositoryAccess(#[from] RepositoryError),

    #[error("Unsupported operation: {0}")]
    Unsupported(String),

    #[error("Diff does not apply to field {field}: {reason}")]
    DiffMismatch { field: String, reason: String },

    #[error("Sync already in progress for repository: {0}")]
    SyncInProgress(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),
}

impl Error {
    pub fn is_not_found(&self) -> bool {
        matches!(
            self,
            Error::EntityNotFound(_)
                | Error::VersionNotFound { .. }
                | Error::BuildNotFound(_)
                | Error::LinkNotFound(_)
        )
    }

    /// Whether the same call may succeed when retried against fresh state.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::ConcurrentVersion { .. } => true,
            Error::RepositoryAccess(e) => e.is_transient(),
            _ => false,
        }
    }
}

//! # buildsync-core
//!
//! Core library for buildsync - versioned builds of configuration entities
//! kept in step with files in a git repository.
//!
//! This crate provides the data model, the append-only version store, field
//! diffing, frontmatter encoding and the pull/push engine. The server and
//! CLI crates are thin layers over it.

pub mod clock;
pub mod config;
pub mod conflict;
pub mod diff;
pub mod error;
pub mod frontmatter;
pub mod models;
pub mod repository;
pub mod rollback;
pub mod storage;
pub mod sync;
pub mod versions;

pub use clock::{Clock, ManualClock, SystemClock};
pub use config::{EngineConfig, SyncConfig, VersioningConfig};
pub use conflict::{ConflictReport, ConflictResolver, Resolution};
pub use error::{Error, Result};
pub use models::{
    Build, BuildSource, ChangeKind, DiffRecord, Entity, EntityState, Field, FieldChange, GitLink,
    LinkStatus,
};
pub use repository::{GitRepository, MemoryRepository, Repository};
pub use rollback::RollbackManager;
pub use storage::Storage;
pub use sync::{GitSyncOrchestrator, PushOutcome, RepoLocks, SyncPhase, SyncReport};
pub use versions::{VersionRequest, VersionStore};

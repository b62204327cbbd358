pub mod diff;
pub mod entity;
pub mod finalize;
pub mod log;
pub mod rollback;
pub mod serve;
pub mod show;
pub mod status;
pub mod sync;

use anyhow::{bail, Result};
use buildsync_core::repository::Credentials;
use buildsync_core::{
    Entity, EngineConfig, GitRepository, Storage, SyncConfig, SystemClock, VersionStore,
};
use chrono::{DateTime, Local, Utc};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use uuid::Uuid;

pub const WORKSPACE_DIR: &str = ".buildsync";

pub fn get_workspace_dir(custom_path: Option<PathBuf>) -> Result<PathBuf> {
    match custom_path {
        Some(path) => Ok(path),
        None => Ok(std::env::current_dir()?.join(WORKSPACE_DIR)),
    }
}

/// The `.buildsync` directory: database plus optional `config.toml`.
pub struct Workspace {
    pub dir: PathBuf,
    pub config: EngineConfig,
}

impl Workspace {
    /// Opens an existing workspace.
    pub fn open(custom_path: Option<PathBuf>) -> Result<Self> {
        let dir = get_workspace_dir(custom_path)?;
        if !dir.join("buildsync.db").exists() {
            bail!("No buildsync workspace found. Run 'buildsync create' or 'buildsync pull' first.");
        }
        Self::load(dir)
    }

    /// Opens the workspace, creating the directory if needed.
    pub fn open_or_init(custom_path: Option<PathBuf>) -> Result<Self> {
        let dir = get_workspace_dir(custom_path)?;
        std::fs::create_dir_all(&dir)?;
        Self::load(dir)
    }

    fn load(dir: PathBuf) -> Result<Self> {
        let config = EngineConfig::load_or_default(dir.join("config.toml"))?;
        Ok(Self { dir, config })
    }

    pub fn db_path(&self) -> PathBuf {
        self.dir.join("buildsync.db")
    }

    pub fn store(&self) -> Result<VersionStore> {
        let storage = Storage::new(self.db_path())?;
        Ok(VersionStore::new(
            storage,
            Arc::new(SystemClock),
            self.config.versioning.clone(),
        ))
    }
}

/// Looks an entity up by id, falling back to its name.
pub fn find_entity(store: &VersionStore, key: &str) -> Result<Entity> {
    if let Ok(id) = Uuid::parse_str(key) {
        return Ok(store.get_entity(&id)?);
    }
    match store.storage().find_entity_by_name(key)? {
        Some(entity) => Ok(entity),
        None => bail!("No entity named '{}'", key),
    }
}

pub fn default_author() -> String {
    std::env::var("BUILDSYNC_AUTHOR")
        .or_else(|_| std::env::var("USER"))
        .unwrap_or_else(|_| "cli-user".to_string())
}

/// Opens a local clone. The id defaults to the clone's directory name.
///
/// Credentials come from `BUILDSYNC_GIT_TOKEN` (and optionally
/// `BUILDSYNC_GIT_USER`), then the SSH agent, then git's defaults.
pub fn open_repository(
    path: &Path,
    repo_id: Option<String>,
    config: &SyncConfig,
) -> Result<GitRepository> {
    let path = std::fs::canonicalize(path)?;
    let id = match repo_id {
        Some(id) => id,
        None => path
            .file_name()
            .and_then(|n| n.to_str())
            .map(str::to_string)
            .unwrap_or_else(|| "origin".to_string()),
    };

    let credentials = match std::env::var("BUILDSYNC_GIT_TOKEN") {
        Ok(token) => Credentials::Token {
            username: std::env::var("BUILDSYNC_GIT_USER")
                .unwrap_or_else(|_| "x-access-token".to_string()),
            token,
        },
        Err(_) if std::env::var_os("SSH_AUTH_SOCK").is_some() => Credentials::SshAgent,
        Err(_) => Credentials::Default,
    };

    Ok(GitRepository::open(id, path)?
        .with_credentials(credentials)
        .with_author(&config.author, format!("{}@buildsync.local", config.author)))
}

pub fn format_time(time: &DateTime<Utc>) -> String {
    time.with_timezone(&Local)
        .format("%Y-%m-%d %H:%M:%S")
        .to_string()
}

use crate::api::{create_router, AppState};
use crate::sweeper::spawn_sweeper;
use buildsync_core::{
    EngineConfig, GitSyncOrchestrator, Repository, Storage, SystemClock, VersionStore,
};
use std::collections::HashMap;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;
use tower_http::trace::TraceLayer;
use tracing::info;

pub struct BuildsyncServer {
    config: EngineConfig,
    store: Arc<Mutex<VersionStore>>,
    repositories: HashMap<String, Arc<dyn Repository>>,
}

impl BuildsyncServer {
    pub fn new(db_path: PathBuf, config: EngineConfig) -> anyhow::Result<Self> {
        let storage = Storage::new(&db_path)?;
        info!("Opened database at {:?}", db_path);
        Ok(Self::with_storage(storage, config))
    }

    pub fn with_storage(storage: Storage, config: EngineConfig) -> Self {
        let store = VersionStore::new(
            storage,
            Arc::new(SystemClock),
            config.versioning.clone(),
        );
        Self {
            config,
            store: Arc::new(Mutex::new(store)),
            repositories: HashMap::new(),
        }
    }

    /// Makes `repo` available to the pull/push routes under its id.
    pub fn with_repository(mut self, repo: Arc<dyn Repository>) -> Self {
        self.repositories.insert(repo.id().to_string(), repo);
        self
    }

    pub fn repository_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.repositories.keys().cloned().collect();
        ids.sort();
        ids
    }

    fn app_state(&self, shutdown: CancellationToken) -> AppState {
        let sync = GitSyncOrchestrator::new(Arc::clone(&self.store), self.config.sync.clone());
        AppState {
            store: Arc::clone(&self.store),
            sync: Arc::new(sync),
            repositories: Arc::new(self.repositories.clone()),
            shutdown,
        }
    }

    pub async fn serve(self, addr: SocketAddr) -> anyhow::Result<()> {
        let shutdown = CancellationToken::new();
        let sweeper = spawn_sweeper(
            Arc::clone(&self.store),
            self.config.versioning.sweep_interval(),
            shutdown.clone(),
        );

        let app = create_router(self.app_state(shutdown.clone())).layer(TraceLayer::new_for_http());

        info!("Server listening on {}", addr);
        info!("Repositories: {:?}", self.repository_ids());

        let listener = tokio::net::TcpListener::bind(addr).await?;
        let signal = shutdown.clone();
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = tokio::signal::ctrl_c().await;
                info!("Shutting down");
                signal.cancel();
            })
            .await?;

        shutdown.cancel();
        sweeper.await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use buildsync_core::MemoryRepository;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_server_creation() {
        let db_dir = TempDir::new().unwrap();
        let db_path = db_dir.path().join("test.db");

        let server = BuildsyncServer::new(db_path, EngineConfig::default())
            .unwrap()
            .with_repository(Arc::new(MemoryRepository::new("analytics")));

        assert_eq!(server.repository_ids(), vec!["analytics".to_string()]);
        let state = server.app_state(CancellationToken::new());
        assert!(state.repositories.contains_key("analytics"));
    }
}

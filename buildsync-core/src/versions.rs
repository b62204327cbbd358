//! Append-only build history per entity.
//!
//! Every append runs in one transaction and checks the caller's expected
//! version first. Manual edits start out pending; further edits by the same
//! author fold into the pending build until the idle window passes and
//! [`VersionStore::finalize_idle`] seals it.

use crate::clock::Clock;
use crate::config::VersioningConfig;
use crate::diff;
use crate::error::{Error, Result};
use crate::models::{Build, BuildSource, DiffRecord, Entity, EntityState};
use crate::storage::Storage;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VersionRequest {
    pub entity_id: Uuid,
    /// Latest version the caller based the diff on.
    pub expected_version: u32,
    pub diff: DiffRecord,
    pub source: BuildSource,
    pub author: String,
    #[serde(default)]
    pub rollback_of: Option<u32>,
}

impl VersionRequest {
    pub fn new(
        entity_id: Uuid,
        expected_version: u32,
        diff: DiffRecord,
        source: BuildSource,
        author: impl Into<String>,
    ) -> Self {
        Self {
            entity_id,
            expected_version,
            diff,
            source,
            author: author.into(),
            rollback_of: None,
        }
    }

    pub fn with_rollback_of(mut self, version: u32) -> Self {
        self.rollback_of = Some(version);
        self
    }
}

pub struct VersionStore {
    storage: Storage,
    clock: Arc<dyn Clock>,
    config: VersioningConfig,
}

impl VersionStore {
    pub fn new(storage: Storage, clock: Arc<dyn Clock>, config: VersioningConfig) -> Self {
        Self {
            storage,
            clock,
            config,
        }
    }

    pub fn storage(&self) -> &Storage {
        &self.storage
    }

    pub fn config(&self) -> &VersioningConfig {
        &self.config
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    pub fn get_entity(&self, entity_id: &Uuid) -> Result<Entity> {
        self.storage.get_entity(entity_id)
    }

    pub fn list_entities(&self) -> Result<Vec<Entity>> {
        self.storage.list_entities()
    }

    /// Creates an entity together with its finalized version 1.
    pub fn create_entity(
        &self,
        name: &str,
        state: EntityState,
        source: BuildSource,
        author: &str,
    ) -> Result<(Entity, Build)> {
        self.create_entity_and(name, state, source, author, |_, _| Ok(()))
    }

    /// Like [`VersionStore::create_entity`], running `on_commit` inside the
    /// same transaction as the first build.
    pub fn create_entity_and<F>(
        &self,
        name: &str,
        state: EntityState,
        source: BuildSource,
        author: &str,
        on_commit: F,
    ) -> Result<(Entity, Build)>
    where
        F: FnOnce(&Storage, &Build) -> Result<()>,
    {
        let now = self.clock.now();
        let entity = Entity::new(name, now);
        let request = VersionRequest::new(
            entity.id,
            0,
            diff::diff(&EntityState::default(), &state),
            source,
            author,
        );

        let build = self.storage.atomically(|storage| {
            storage.insert_entity(&entity)?;
            let build = self.append(&request)?;
            on_commit(storage, &build)?;
            Ok(build)
        })?;

        let entity = self.storage.get_entity(&entity.id)?;
        Ok((entity, build))
    }

    /// Manual edit: diffs the current state against `new_state` and appends.
    pub fn edit(
        &self,
        entity_id: &Uuid,
        expected_version: u32,
        new_state: &EntityState,
        author: &str,
    ) -> Result<Build> {
        let entity = self.storage.get_entity(entity_id)?;
        let request = VersionRequest::new(
            *entity_id,
            expected_version,
            diff::diff(&entity.state, new_state),
            BuildSource::Manual,
            author,
        );
        self.create_version(&request)
    }

    pub fn create_version(&self, request: &VersionRequest) -> Result<Build> {
        self.storage.atomically(|_| self.append(request))
    }

    /// Moves the entity to `target`, re-reading the current state and retrying
    /// on concurrent appends up to `max_version_retries` times.
    pub fn commit_state(
        &self,
        entity_id: &Uuid,
        target: &EntityState,
        source: BuildSource,
        author: &str,
        rollback_of: Option<u32>,
    ) -> Result<Build> {
        self.commit_state_and(entity_id, target, source, author, rollback_of, |_, _| Ok(()))
    }

    /// Like [`VersionStore::commit_state`], running `on_commit` inside the
    /// transaction that appends the build.
    pub fn commit_state_and<F>(
        &self,
        entity_id: &Uuid,
        target: &EntityState,
        source: BuildSource,
        author: &str,
        rollback_of: Option<u32>,
        mut on_commit: F,
    ) -> Result<Build>
    where
        F: FnMut(&Storage, &Build) -> Result<()>,
    {
        let mut attempt = 0;
        loop {
            let entity = self.storage.get_entity(entity_id)?;
            let mut request = VersionRequest::new(
                *entity_id,
                entity.latest_version,
                diff::diff(&entity.state, target),
                source,
                author,
            );
            request.rollback_of = rollback_of;

            let result = self.storage.atomically(|storage| {
                let build = self.append(&request)?;
                on_commit(storage, &build)?;
                Ok(build)
            });

            match result {
                Err(err @ Error::ConcurrentVersion { .. }) => {
                    if attempt >= self.config.max_version_retries {
                        return Err(err);
                    }
                    attempt += 1;
                    warn!(entity_id = %entity_id, attempt, "concurrent version, retrying");
                }
                other => return other,
            }
        }
    }

    fn append(&self, request: &VersionRequest) -> Result<Build> {
        let mut entity = self.storage.get_entity(&request.entity_id)?;
        if entity.latest_version != request.expected_version {
            return Err(Error::ConcurrentVersion {
                entity_id: entity.id,
                expected: request.expected_version,
                actual: entity.latest_version,
            });
        }

        let new_state = diff::apply(&entity.state, &request.diff)?;
        let now = self.clock.now();
        let latest = self.storage.latest_build(&entity.id)?;

        if let Some(mut pending) = latest.filter(|b| !b.finalized) {
            if self.folds_into(&pending, request, now) {
                let base = self.previous_snapshot(&entity.id, pending.version)?;
                pending.diff = diff::diff(&base, &new_state);
                pending.snapshot = new_state.clone();
                pending.updated_at = now;
                self.storage.update_pending_build(&pending)?;

                entity.state = new_state;
                entity.updated_at = now;
                self.storage.update_entity(&entity)?;

                debug!(entity_id = %entity.id, version = pending.version, "folded edit into pending build");
                return Ok(pending);
            }
            self.storage.mark_finalized(&pending.id)?;
        }

        let version = entity.latest_version + 1;
        let finalized = version == 1
            || request.source == BuildSource::Git
            || request.rollback_of.is_some()
            || self.config.idle_window_secs == 0;

        let build = Build {
            id: Uuid::new_v4(),
            entity_id: entity.id,
            version,
            diff: request.diff.clone(),
            snapshot: new_state.clone(),
            source: request.source,
            finalized,
            author: request.author.clone(),
            rollback_of: request.rollback_of,
            created_at: now,
            updated_at: now,
        };
        self.storage.insert_build(&build)?;

        entity.state = new_state;
        entity.latest_build_id = Some(build.id);
        entity.latest_version = version;
        entity.updated_at = now;
        self.storage.update_entity(&entity)?;

        info!(
            entity_id = %entity.id,
            version,
            source = build.source.as_str(),
            changes = build.diff.len(),
            finalized,
            "created build"
        );
        Ok(build)
    }

    /// Same author, manual on both sides, and still inside the idle window.
    fn folds_into(&self, pending: &Build, request: &VersionRequest, now: DateTime<Utc>) -> bool {
        now - pending.updated_at < self.config.idle_window()
            && pending.source == BuildSource::Manual
            && request.source == BuildSource::Manual
            && pending.author == request.author
            && pending.rollback_of.is_none()
            && request.rollback_of.is_none()
    }

    fn previous_snapshot(&self, entity_id: &Uuid, version: u32) -> Result<EntityState> {
        if version <= 1 {
            return Ok(EntityState::default());
        }
        Ok(self
            .storage
            .get_build_by_version(entity_id, version - 1)?
            .snapshot)
    }

    /// Seals a pending build. Finalizing an already finalized build is a no-op.
    pub fn finalize(&self, build_id: &Uuid) -> Result<Build> {
        let build = self.storage.get_build(build_id)?;
        if !build.finalized {
            self.storage.mark_finalized(build_id)?;
            info!(build_id = %build_id, version = build.version, "finalized build");
        }
        self.storage.get_build(build_id)
    }

    /// Finalizes the entity's latest build if it is still pending and returns
    /// its version. Later edits then start a new build instead of folding into
    /// one that has been handed to the repository.
    pub fn seal_latest(&self, entity_id: &Uuid) -> Result<u32> {
        let entity = self.storage.get_entity(entity_id)?;
        if let Some(pending) = self.storage.latest_build(entity_id)?.filter(|b| !b.finalized) {
            self.finalize(&pending.id)?;
        }
        Ok(entity.latest_version)
    }

    /// Finalizes every pending build whose last edit is older than the idle window.
    pub fn finalize_idle(&self) -> Result<Vec<Uuid>> {
        let cutoff = self.clock.now() - self.config.idle_window();
        let mut finalized = Vec::new();
        for build in self.storage.pending_builds_before(cutoff)? {
            if self.storage.mark_finalized(&build.id)? {
                finalized.push(build.id);
            }
        }
        if !finalized.is_empty() {
            info!(count = finalized.len(), "auto-finalized idle builds");
        }
        Ok(finalized)
    }

    pub fn list_versions(&self, entity_id: &Uuid) -> Result<Vec<Build>> {
        self.storage.get_entity(entity_id)?;
        self.storage.list_builds(entity_id)
    }

    pub fn get_build(&self, build_id: &Uuid) -> Result<Build> {
        self.storage.get_build(build_id)
    }

    /// Snapshot served from the per-build cache.
    pub fn get_contents(&self, entity_id: &Uuid, version: u32) -> Result<EntityState> {
        Ok(self.storage.get_build_by_version(entity_id, version)?.snapshot)
    }

    /// Snapshot rebuilt by folding every diff from version 1 up to `version`.
    pub fn replay_contents(&self, entity_id: &Uuid, version: u32) -> Result<EntityState> {
        let builds = self.storage.list_builds(entity_id)?;
        if !builds.iter().any(|b| b.version == version) {
            return Err(Error::VersionNotFound {
                entity_id: *entity_id,
                version,
            });
        }
        builds
            .iter()
            .take_while(|b| b.version <= version)
            .try_fold(EntityState::default(), |state, build| {
                diff::apply(&state, &build.diff)
            })
    }

    pub fn diff_versions(&self, entity_id: &Uuid, from: u32, to: u32) -> Result<DiffRecord> {
        let old = self.get_contents(entity_id, from)?;
        let new = self.get_contents(entity_id, to)?;
        Ok(diff::diff(&old, &new))
    }

    /// Applies each request independently; one entity's failure never affects another.
    pub fn bulk_create(&self, requests: &[VersionRequest]) -> Vec<Result<Build>> {
        requests
            .iter()
            .map(|request| {
                let result = self.create_version(request);
                if let Err(err) = &result {
                    warn!(entity_id = %request.entity_id, error = %err, "bulk version rejected");
                }
                result
            })
            .collect()
    }
}

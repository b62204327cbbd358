//! Divergence between local builds and the linked repository file.
//!
//! A link remembers the state both sides last agreed on (`synced_version` and
//! `synced_hash`). When both sides moved away from it to different places the
//! link is parked as conflicted with the remote state attached, and nothing
//! is applied until someone picks a side.

use crate::diff;
use crate::error::{Error, Result};
use crate::models::{
    Build, BuildSource, DiffRecord, Entity, EntityState, GitLink, LinkStatus, PendingConflict,
};
use crate::versions::VersionStore;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConflictReport {
    pub entity_id: Uuid,
    pub path: String,
    pub remote_commit: String,
    /// Synced state to the current local state.
    pub local: DiffRecord,
    /// Synced state to the remote file.
    pub remote: DiffRecord,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Resolution {
    /// Keep the local state and treat the remote commit as seen.
    KeepLocal,
    /// Append a build that moves the entity to the remote state.
    TakeRemote,
}

impl Resolution {
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "keep_local" | "keep-local" | "local" => Some(Resolution::KeepLocal),
            "take_remote" | "take-remote" | "remote" => Some(Resolution::TakeRemote),
            _ => None,
        }
    }
}

/// Outcome of comparing a pulled file with the local entity.
#[derive(Debug, Clone, PartialEq)]
pub enum Assessment {
    /// Remote matches the synced state or the local state; nothing to apply.
    UpToDate,
    /// Only the local side moved. The link advances, the local edits stay.
    LocalAhead,
    /// Only the remote side moved.
    ApplyRemote,
    Conflict(ConflictReport),
}

pub struct ConflictResolver<'a> {
    store: &'a VersionStore,
}

impl<'a> ConflictResolver<'a> {
    pub fn new(store: &'a VersionStore) -> Self {
        Self { store }
    }

    /// State the link last agreed on with the repository.
    pub fn synced_state(&self, link: &GitLink) -> Result<EntityState> {
        if link.synced_version == 0 {
            return Ok(EntityState::default());
        }
        self.store.get_contents(&link.entity_id, link.synced_version)
    }

    pub fn assess(
        &self,
        link: &GitLink,
        entity: &Entity,
        remote_commit: &str,
        remote_state: &EntityState,
    ) -> Result<Assessment> {
        if *remote_state == entity.state {
            return Ok(Assessment::UpToDate);
        }

        let synced = self.synced_state(link)?;
        let local_changed = entity.state.content_hash() != link.synced_hash;
        let remote_changed = *remote_state != synced;

        Ok(match (local_changed, remote_changed) {
            (false, false) => Assessment::UpToDate,
            (true, false) => Assessment::LocalAhead,
            (false, true) => Assessment::ApplyRemote,
            (true, true) => Assessment::Conflict(ConflictReport {
                entity_id: entity.id,
                path: link.path.clone(),
                remote_commit: remote_commit.to_string(),
                local: diff::diff(&synced, &entity.state),
                remote: diff::diff(&synced, remote_state),
            }),
        })
    }

    /// Parks the link as conflicted. No build is created.
    pub fn mark_conflicted(
        &self,
        link: &mut GitLink,
        report: &ConflictReport,
        remote_state: &EntityState,
    ) -> Result<()> {
        link.status = LinkStatus::Conflicted;
        link.conflict = Some(PendingConflict {
            remote_commit: report.remote_commit.clone(),
            remote_state: remote_state.clone(),
            detected_at: self.store.clock().now(),
        });
        self.store.storage().upsert_link(link)?;

        warn!(
            entity_id = %link.entity_id,
            path = %link.path,
            remote_commit = %report.remote_commit,
            local_changes = report.local.len(),
            remote_changes = report.remote.len(),
            "sync conflict detected"
        );
        Ok(())
    }

    /// Rebuilds the report for a link that is currently conflicted.
    pub fn report(&self, entity_id: &Uuid) -> Result<ConflictReport> {
        let (link, pending) = self.conflicted_link(entity_id)?;
        let entity = self.store.get_entity(entity_id)?;
        let synced = self.synced_state(&link)?;
        Ok(ConflictReport {
            entity_id: *entity_id,
            path: link.path.clone(),
            remote_commit: pending.remote_commit.clone(),
            local: diff::diff(&synced, &entity.state),
            remote: diff::diff(&synced, &pending.remote_state),
        })
    }

    pub fn list_conflicts(&self) -> Result<Vec<ConflictReport>> {
        self.store
            .storage()
            .links_with_status(LinkStatus::Conflicted)?
            .iter()
            .map(|link| self.report(&link.entity_id))
            .collect()
    }

    /// Applies the chosen side and returns the link to `Linked`.
    ///
    /// Returns the build created for [`Resolution::TakeRemote`] when the
    /// remote state differs from the local one.
    pub fn resolve(
        &self,
        entity_id: &Uuid,
        resolution: Resolution,
        author: &str,
    ) -> Result<Option<Build>> {
        let (mut link, pending) = self.conflicted_link(entity_id)?;

        let build = match resolution {
            Resolution::KeepLocal => {
                let version = self.store.seal_latest(entity_id)?;
                let entity = self.store.get_entity(entity_id)?;
                link.mark_synced(pending.remote_commit.clone(), version, &entity.state);
                self.store.storage().upsert_link(&link)?;
                None
            }
            Resolution::TakeRemote => {
                let entity = self.store.get_entity(entity_id)?;
                if entity.state == pending.remote_state {
                    let version = self.store.seal_latest(entity_id)?;
                    link.mark_synced(pending.remote_commit.clone(), version, &entity.state);
                    self.store.storage().upsert_link(&link)?;
                    None
                } else {
                    let build = self.store.commit_state_and(
                        entity_id,
                        &pending.remote_state,
                        BuildSource::Git,
                        author,
                        None,
                        |storage, build| {
                            link.mark_synced(
                                pending.remote_commit.clone(),
                                build.version,
                                &build.snapshot,
                            );
                            storage.upsert_link(&link)
                        },
                    )?;
                    Some(build)
                }
            }
        };

        info!(
            entity_id = %entity_id,
            resolution = ?resolution,
            remote_commit = %pending.remote_commit,
            "resolved conflict"
        );
        Ok(build)
    }

    fn conflicted_link(&self, entity_id: &Uuid) -> Result<(GitLink, PendingConflict)> {
        let link = self
            .store
            .storage()
            .get_link(entity_id)?
            .ok_or_else(|| Error::LinkNotFound(entity_id.to_string()))?;
        match (&link.status, &link.conflict) {
            (LinkStatus::Conflicted, Some(pending)) => {
                let pending = pending.clone();
                Ok((link, pending))
            }
            _ => Err(Error::InvalidOperation(format!(
                "entity {} has no pending conflict",
                entity_id
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::VersioningConfig;
    use crate::storage::Storage;
    use chrono::Utc;
    use std::sync::Arc;

    fn store() -> VersionStore {
        let config = VersioningConfig {
            idle_window_secs: 0,
            ..VersioningConfig::default()
        };
        VersionStore::new(
            Storage::in_memory().unwrap(),
            Arc::new(ManualClock::new(Utc::now())),
            config,
        )
    }

    fn synced_entity(store: &VersionStore, state: EntityState) -> (Entity, GitLink) {
        let (entity, build) = store
            .create_entity("orders", state, BuildSource::Git, "git-sync")
            .unwrap();
        let mut link = GitLink::new(entity.id, "analytics", "main", "models/orders.sql");
        link.mark_synced("c1", build.version, &build.snapshot);
        store.storage().upsert_link(&link).unwrap();
        (entity, link)
    }

    #[test]
    fn test_assess_each_side() {
        let store = store();
        let base = EntityState::default().with_labels(["a"]);
        let (entity, link) = synced_entity(&store, base.clone());
        let resolver = ConflictResolver::new(&store);

        let remote = base.clone().with_labels(["a", "c"]);
        assert_eq!(
            resolver.assess(&link, &entity, "c2", &base).unwrap(),
            Assessment::UpToDate
        );
        assert_eq!(
            resolver.assess(&link, &entity, "c2", &remote).unwrap(),
            Assessment::ApplyRemote
        );

        store
            .edit(&entity.id, 1, &base.clone().with_labels(["a", "b"]), "alice")
            .unwrap();
        let entity = store.get_entity(&entity.id).unwrap();
        assert_eq!(
            resolver.assess(&link, &entity, "c2", &base).unwrap(),
            Assessment::LocalAhead
        );

        match resolver.assess(&link, &entity, "c2", &remote).unwrap() {
            Assessment::Conflict(report) => {
                assert_eq!(report.remote_commit, "c2");
                assert_eq!(report.local.len(), 1);
                assert_eq!(report.local.changes[0].new.as_deref(), Some("b"));
                assert_eq!(report.remote.changes[0].new.as_deref(), Some("c"));
            }
            other => panic!("expected conflict, got {:?}", other),
        }
    }

    #[test]
    fn test_resolve_take_remote() {
        let store = store();
        let base = EntityState::default().with_labels(["a"]);
        let (entity, mut link) = synced_entity(&store, base.clone());
        store
            .edit(&entity.id, 1, &base.clone().with_labels(["a", "b"]), "alice")
            .unwrap();
        let entity = store.get_entity(&entity.id).unwrap();

        let resolver = ConflictResolver::new(&store);
        let remote = base.clone().with_labels(["a", "c"]);
        let report = match resolver.assess(&link, &entity, "c2", &remote).unwrap() {
            Assessment::Conflict(report) => report,
            other => panic!("expected conflict, got {:?}", other),
        };
        resolver.mark_conflicted(&mut link, &report, &remote).unwrap();
        assert_eq!(store.list_versions(&entity.id).unwrap().len(), 2);
        assert_eq!(resolver.list_conflicts().unwrap(), vec![report]);

        let build = resolver
            .resolve(&entity.id, Resolution::TakeRemote, "alice")
            .unwrap()
            .unwrap();
        assert_eq!(build.version, 3);
        assert_eq!(build.source, BuildSource::Git);
        assert_eq!(build.snapshot, remote);

        let link = store.storage().get_link(&entity.id).unwrap().unwrap();
        assert!(link.is_linked());
        assert_eq!(link.last_synced_commit.as_deref(), Some("c2"));
        assert_eq!(link.synced_version, 3);
        assert!(link.conflict.is_none());
    }

    #[test]
    fn test_resolve_keep_local() {
        let store = store();
        let base = EntityState::default().with_status("draft");
        let (entity, mut link) = synced_entity(&store, base.clone());
        let local = base.clone().with_status("published");
        store.edit(&entity.id, 1, &local, "alice").unwrap();
        let entity = store.get_entity(&entity.id).unwrap();

        let resolver = ConflictResolver::new(&store);
        let remote = base.with_status("archived");
        let report = match resolver.assess(&link, &entity, "c2", &remote).unwrap() {
            Assessment::Conflict(report) => report,
            other => panic!("expected conflict, got {:?}", other),
        };
        resolver.mark_conflicted(&mut link, &report, &remote).unwrap();

        let build = resolver
            .resolve(&entity.id, Resolution::KeepLocal, "alice")
            .unwrap();
        assert!(build.is_none());
        assert_eq!(store.get_entity(&entity.id).unwrap().state, local);

        let link = store.storage().get_link(&entity.id).unwrap().unwrap();
        assert!(link.is_linked());
        assert_eq!(link.last_synced_commit.as_deref(), Some("c2"));
        assert_eq!(link.synced_hash, local.content_hash());

        let err = resolver
            .resolve(&entity.id, Resolution::KeepLocal, "alice")
            .unwrap_err();
        assert!(matches!(err, Error::InvalidOperation(_)));
    }

    #[test]
    fn test_resolution_parse() {
        assert_eq!(Resolution::parse("keep-local"), Some(Resolution::KeepLocal));
        assert_eq!(Resolution::parse("remote"), Some(Resolution::TakeRemote));
        assert_eq!(Resolution::parse("merge"), None);
    }
}

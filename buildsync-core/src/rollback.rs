use crate::diff;
use crate::error::Result;
use crate::models::{Build, BuildSource, DiffRecord};
use crate::versions::VersionStore;
use tracing::info;
use uuid::Uuid;

/// Restores an entity to an earlier version by appending a new build.
///
/// History is never rewritten: the rollback build carries the diff from the
/// current state to the target and records which version it restored.
pub struct RollbackManager<'a> {
    store: &'a VersionStore,
}

impl<'a> RollbackManager<'a> {
    pub fn new(store: &'a VersionStore) -> Self {
        Self { store }
    }

    /// Diff the rollback would apply, without writing anything.
    pub fn preview(&self, entity_id: &Uuid, target_version: u32) -> Result<DiffRecord> {
        let entity = self.store.get_entity(entity_id)?;
        let target = self.store.get_contents(entity_id, target_version)?;
        Ok(diff::diff(&entity.state, &target))
    }

    pub fn rollback(&self, entity_id: &Uuid, target_version: u32, author: &str) -> Result<Build> {
        self.store.get_entity(entity_id)?;
        let target = self.store.get_contents(entity_id, target_version)?;

        let build = self.store.commit_state(
            entity_id,
            &target,
            BuildSource::Manual,
            author,
            Some(target_version),
        )?;

        info!(
            entity_id = %entity_id,
            target_version,
            new_version = build.version,
            changes = build.diff.len(),
            "rolled back entity"
        );
        Ok(build)
    }
}

use crate::error::{Error, Result};
use crate::models::{Build, BuildSource, Entity, GitLink, LinkStatus};
use chrono::{DateTime, Utc};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use serde::de::DeserializeOwned;
use std::path::Path;
use uuid::Uuid;

const SCHEMA_VERSION: i32 = 1;

const ENTITY_COLUMNS: &str =
    "id, name, state, latest_build_id, latest_version, created_at, updated_at";
const BUILD_COLUMNS: &str = "id, entity_id, version, diff, snapshot, source, finalized, author,
     rollback_of, created_at, updated_at";
const LINK_COLUMNS: &str = "entity_id, repo_id, branch, path, last_synced_commit, synced_version,
     synced_hash, status, extra, conflict";

pub struct Storage {
    conn: Connection,
}

impl Storage {
    pub fn new<P: AsRef<Path>>(db_path: P) -> Result<Self> {
        let conn = Connection::open(db_path)?;
        let mut storage = Self { conn };
        storage.initialize()?;
        Ok(storage)
    }

    pub fn in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let mut storage = Self { conn };
        storage.initialize()?;
        Ok(storage)
    }

    fn initialize(&mut self) -> Result<()> {
        self.conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS schema_version (
                version INTEGER PRIMARY KEY
            );

            CREATE TABLE IF NOT EXISTS entities (
                id TEXT PRIMARY KEY,
                name TEXT NOT NULL,
                state TEXT NOT NULL,
                latest_build_id TEXT,
                latest_version INTEGER NOT NULL,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS builds (
                id TEXT PRIMARY KEY,
                entity_id TEXT NOT NULL,
                version INTEGER NOT NULL,
                diff TEXT NOT NULL,
                snapshot TEXT NOT NULL,
                source TEXT NOT NULL,
                finalized INTEGER NOT NULL,
                author TEXT NOT NULL,
                rollback_of INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE (entity_id, version),
                FOREIGN KEY (entity_id) REFERENCES entities(id)
            );

            CREATE TABLE IF NOT EXISTS git_links (
                entity_id TEXT PRIMARY KEY,
                repo_id TEXT NOT NULL,
                branch TEXT NOT NULL,
                path TEXT NOT NULL,
                last_synced_commit TEXT,
                synced_version INTEGER NOT NULL,
                synced_hash TEXT NOT NULL,
                status TEXT NOT NULL,
                extra TEXT NOT NULL,
                conflict TEXT,
                UNIQUE (repo_id, branch, path),
                FOREIGN KEY (entity_id) REFERENCES entities(id)
            );

            CREATE INDEX IF NOT EXISTS idx_entities_name ON entities(name);
            CREATE INDEX IF NOT EXISTS idx_builds_pending ON builds(finalized, updated_at);
            CREATE INDEX IF NOT EXISTS idx_links_repo ON git_links(repo_id, branch);
            "#,
        )?;

        let version: Option<i32> = self
            .conn
            .query_row("SELECT version FROM schema_version", [], |row| row.get(0))
            .optional()?;

        if version.is_none() {
            self.conn.execute(
                "INSERT INTO schema_version (version) VALUES (?1)",
                params![SCHEMA_VERSION],
            )?;
        }

        Ok(())
    }

    /// Runs `f` inside one SQLite transaction; any error rolls everything back.
    pub fn atomically<T>(&self, f: impl FnOnce(&Self) -> Result<T>) -> Result<T> {
        let tx = self.conn.unchecked_transaction()?;
        let out = f(self)?;
        tx.commit()?;
        Ok(out)
    }

    // Entity operations
    pub fn insert_entity(&self, entity: &Entity) -> Result<()> {
        self.conn.execute(
            "INSERT INTO entities (id, name, state, latest_build_id, latest_version, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                entity.id.to_string(),
                entity.name,
                serde_json::to_string(&entity.state)?,
                entity.latest_build_id.map(|id| id.to_string()),
                entity.latest_version,
                entity.created_at.to_rfc3339(),
                entity.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    pub fn update_entity(&self, entity: &Entity) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE entities SET name = ?1, state = ?2, latest_build_id = ?3, latest_version = ?4,
                                 updated_at = ?5
             WHERE id = ?6",
            params![
                entity.name,
                serde_json::to_string(&entity.state)?,
                entity.latest_build_id.map(|id| id.to_string()),
                entity.latest_version,
                entity.updated_at.to_rfc3339(),
                entity.id.to_string(),
            ],
        )?;
        if updated == 0 {
            return Err(Error::EntityNotFound(entity.id.to_string()));
        }
        Ok(())
    }

    pub fn get_entity(&self, id: &Uuid) -> Result<Entity> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM entities WHERE id = ?1", ENTITY_COLUMNS),
                params![id.to_string()],
                entity_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::EntityNotFound(id.to_string()))
    }

    pub fn find_entity_by_name(&self, name: &str) -> Result<Option<Entity>> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM entities WHERE name = ?1 ORDER BY created_at LIMIT 1",
                    ENTITY_COLUMNS
                ),
                params![name],
                entity_from_row,
            )
            .optional()?)
    }

    pub fn list_entities(&self) -> Result<Vec<Entity>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM entities ORDER BY name",
            ENTITY_COLUMNS
        ))?;
        let entities = stmt
            .query_map([], entity_from_row)?
            .collect::<rusqlite::Result<Vec<Entity>>>()?;
        Ok(entities)
    }

    // Build operations
    pub fn insert_build(&self, build: &Build) -> Result<()> {
        self.conn.execute(
            "INSERT INTO builds (id, entity_id, version, diff, snapshot, source, finalized, author,
                                 rollback_of, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                build.id.to_string(),
                build.entity_id.to_string(),
                build.version,
                serde_json::to_string(&build.diff)?,
                serde_json::to_string(&build.snapshot)?,
                build.source.as_str(),
                build.finalized as i32,
                build.author,
                build.rollback_of,
                build.created_at.to_rfc3339(),
                build.updated_at.to_rfc3339(),
            ],
        )?;
        Ok(())
    }

    /// Rewrites a build that is still pending. Finalized rows are never touched.
    pub fn update_pending_build(&self, build: &Build) -> Result<()> {
        let updated = self.conn.execute(
            "UPDATE builds SET diff = ?1, snapshot = ?2, finalized = ?3, updated_at = ?4
             WHERE id = ?5 AND finalized = 0",
            params![
                serde_json::to_string(&build.diff)?,
                serde_json::to_string(&build.snapshot)?,
                build.finalized as i32,
                build.updated_at.to_rfc3339(),
                build.id.to_string(),
            ],
        )?;
        if updated == 0 {
            return Err(Error::InvalidOperation(format!(
                "build {} is not pending",
                build.id
            )));
        }
        Ok(())
    }

    pub fn mark_finalized(&self, id: &Uuid) -> Result<bool> {
        let updated = self.conn.execute(
            "UPDATE builds SET finalized = 1 WHERE id = ?1 AND finalized = 0",
            params![id.to_string()],
        )?;
        Ok(updated > 0)
    }

    pub fn get_build(&self, id: &Uuid) -> Result<Build> {
        self.conn
            .query_row(
                &format!("SELECT {} FROM builds WHERE id = ?1", BUILD_COLUMNS),
                params![id.to_string()],
                build_from_row,
            )
            .optional()?
            .ok_or_else(|| Error::BuildNotFound(id.to_string()))
    }

    pub fn get_build_by_version(&self, entity_id: &Uuid, version: u32) -> Result<Build> {
        self.conn
            .query_row(
                &format!(
                    "SELECT {} FROM builds WHERE entity_id = ?1 AND version = ?2",
                    BUILD_COLUMNS
                ),
                params![entity_id.to_string(), version],
                build_from_row,
            )
            .optional()?
            .ok_or(Error::VersionNotFound {
                entity_id: *entity_id,
                version,
            })
    }

    pub fn list_builds(&self, entity_id: &Uuid) -> Result<Vec<Build>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM builds WHERE entity_id = ?1 ORDER BY version ASC",
            BUILD_COLUMNS
        ))?;
        let builds = stmt
            .query_map(params![entity_id.to_string()], build_from_row)?
            .collect::<rusqlite::Result<Vec<Build>>>()?;
        Ok(builds)
    }

    pub fn latest_build(&self, entity_id: &Uuid) -> Result<Option<Build>> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM builds WHERE entity_id = ?1 ORDER BY version DESC LIMIT 1",
                    BUILD_COLUMNS
                ),
                params![entity_id.to_string()],
                build_from_row,
            )
            .optional()?)
    }

    /// Pending builds last touched at or before `cutoff`.
    pub fn pending_builds_before(&self, cutoff: DateTime<Utc>) -> Result<Vec<Build>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM builds WHERE finalized = 0 ORDER BY updated_at ASC",
            BUILD_COLUMNS
        ))?;
        let builds = stmt
            .query_map([], build_from_row)?
            .collect::<rusqlite::Result<Vec<Build>>>()?;
        Ok(builds
            .into_iter()
            .filter(|b| b.updated_at <= cutoff)
            .collect())
    }

    // Git link operations
    pub fn upsert_link(&self, link: &GitLink) -> Result<()> {
        let conflict = link
            .conflict
            .as_ref()
            .map(serde_json::to_string)
            .transpose()?;
        self.conn.execute(
            "INSERT INTO git_links (entity_id, repo_id, branch, path, last_synced_commit, synced_version,
                                    synced_hash, status, extra, conflict)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
             ON CONFLICT(entity_id) DO UPDATE SET
                repo_id = excluded.repo_id,
                branch = excluded.branch,
                path = excluded.path,
                last_synced_commit = excluded.last_synced_commit,
                synced_version = excluded.synced_version,
                synced_hash = excluded.synced_hash,
                status = excluded.status,
                extra = excluded.extra,
                conflict = excluded.conflict",
            params![
                link.entity_id.to_string(),
                link.repo_id,
                link.branch,
                link.path,
                link.last_synced_commit,
                link.synced_version,
                link.synced_hash,
                link.status.as_str(),
                serde_json::to_string(&link.extra)?,
                conflict,
            ],
        )?;
        Ok(())
    }

    pub fn get_link(&self, entity_id: &Uuid) -> Result<Option<GitLink>> {
        Ok(self
            .conn
            .query_row(
                &format!("SELECT {} FROM git_links WHERE entity_id = ?1", LINK_COLUMNS),
                params![entity_id.to_string()],
                link_from_row,
            )
            .optional()?)
    }

    pub fn find_link_by_path(
        &self,
        repo_id: &str,
        branch: &str,
        path: &str,
    ) -> Result<Option<GitLink>> {
        Ok(self
            .conn
            .query_row(
                &format!(
                    "SELECT {} FROM git_links WHERE repo_id = ?1 AND branch = ?2 AND path = ?3",
                    LINK_COLUMNS
                ),
                params![repo_id, branch, path],
                link_from_row,
            )
            .optional()?)
    }

    pub fn links_for_repo(&self, repo_id: &str, branch: &str) -> Result<Vec<GitLink>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM git_links WHERE repo_id = ?1 AND branch = ?2 ORDER BY path",
            LINK_COLUMNS
        ))?;
        let links = stmt
            .query_map(params![repo_id, branch], link_from_row)?
            .collect::<rusqlite::Result<Vec<GitLink>>>()?;
        Ok(links)
    }

    pub fn links_with_status(&self, status: LinkStatus) -> Result<Vec<GitLink>> {
        let mut stmt = self.conn.prepare(&format!(
            "SELECT {} FROM git_links WHERE status = ?1 ORDER BY repo_id, path",
            LINK_COLUMNS
        ))?;
        let links = stmt
            .query_map(params![status.as_str()], link_from_row)?
            .collect::<rusqlite::Result<Vec<GitLink>>>()?;
        Ok(links)
    }
}

// Row helpers
fn conversion_error(idx: usize, err: impl std::error::Error + Send + Sync + 'static) -> rusqlite::Error {
    rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(err))
}

fn uuid_at(row: &Row, idx: usize) -> rusqlite::Result<Uuid> {
    let raw: String = row.get(idx)?;
    Uuid::parse_str(&raw).map_err(|e| conversion_error(idx, e))
}

fn time_at(row: &Row, idx: usize) -> rusqlite::Result<DateTime<Utc>> {
    let raw: String = row.get(idx)?;
    DateTime::parse_from_rfc3339(&raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| conversion_error(idx, e))
}

fn json_at<T: DeserializeOwned>(row: &Row, idx: usize) -> rusqlite::Result<T> {
    let raw: String = row.get(idx)?;
    serde_json::from_str(&raw).map_err(|e| conversion_error(idx, e))
}

#[derive(Debug, thiserror::Error)]
#[error("unknown value '{0}'")]
struct UnknownValue(String);

fn entity_from_row(row: &Row) -> rusqlite::Result<Entity> {
    let latest_build_id: Option<String> = row.get(3)?;
    Ok(Entity {
        id: uuid_at(row, 0)?,
        name: row.get(1)?,
        state: json_at(row, 2)?,
        latest_build_id: latest_build_id
            .map(|raw| Uuid::parse_str(&raw).map_err(|e| conversion_error(3, e)))
            .transpose()?,
        latest_version: row.get(4)?,
        created_at: time_at(row, 5)?,
        updated_at: time_at(row, 6)?,
    })
}

fn build_from_row(row: &Row) -> rusqlite::Result<Build> {
    let source: String = row.get(5)?;
    let finalized: i32 = row.get(6)?;
    Ok(Build {
        id: uuid_at(row, 0)?,
        entity_id: uuid_at(row, 1)?,
        version: row.get(2)?,
        diff: json_at(row, 3)?,
        snapshot: json_at(row, 4)?,
        source: BuildSource::parse(&source)
            .ok_or_else(|| conversion_error(5, UnknownValue(source.clone())))?,
        finalized: finalized != 0,
        author: row.get(7)?,
        rollback_of: row.get(8)?,
        created_at: time_at(row, 9)?,
        updated_at: time_at(row, 10)?,
    })
}

fn link_from_row(row: &Row) -> rusqlite::Result<GitLink> {
    let status: String = row.get(7)?;
    let conflict: Option<String> = row.get(9)?;
    Ok(GitLink {
        entity_id: uuid_at(row, 0)?,
        repo_id: row.get(1)?,
        branch: row.get(2)?,
        path: row.get(3)?,
        last_synced_commit: row.get(4)?,
        synced_version: row.get(5)?,
        synced_hash: row.get(6)?,
        status: LinkStatus::parse(&status)
            .ok_or_else(|| conversion_error(7, UnknownValue(status.clone())))?,
        extra: json_at(row, 8)?,
        conflict: conflict
            .map(|raw| serde_json::from_str(&raw).map_err(|e| conversion_error(9, e)))
            .transpose()?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{DiffRecord, EntityState};
    use chrono::Duration;

    fn build_for(entity: &Entity, version: u32, finalized: bool) -> Build {
        Build {
            id: Uuid::new_v4(),
            entity_id: entity.id,
            version,
            diff: DiffRecord::default(),
            snapshot: EntityState::default().with_status("draft"),
            source: BuildSource::Manual,
            finalized,
            author: "alice".into(),
            rollback_of: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn test_storage_initialization() {
        let storage = Storage::in_memory().unwrap();
        assert!(storage.conn.is_autocommit());
        assert!(storage.list_entities().unwrap().is_empty());
    }

    #[test]
    fn test_entity_crud() {
        let storage = Storage::in_memory().unwrap();
        let mut entity = Entity::new("orders", Utc::now());
        entity.state = EntityState::default().with_labels(["core"]);

        storage.insert_entity(&entity).unwrap();
        let retrieved = storage.get_entity(&entity.id).unwrap();
        assert_eq!(retrieved.name, "orders");
        assert_eq!(retrieved.state, entity.state);

        entity.latest_version = 2;
        storage.update_entity(&entity).unwrap();
        assert_eq!(storage.get_entity(&entity.id).unwrap().latest_version, 2);
        assert!(storage.find_entity_by_name("orders").unwrap().is_some());

        let missing = storage.get_entity(&Uuid::new_v4()).unwrap_err();
        assert!(missing.is_not_found());
    }

    #[test]
    fn test_builds_unique_per_version() {
        let storage = Storage::in_memory().unwrap();
        let entity = Entity::new("orders", Utc::now());
        storage.insert_entity(&entity).unwrap();

        storage.insert_build(&build_for(&entity, 1, true)).unwrap();
        assert!(storage.insert_build(&build_for(&entity, 1, true)).is_err());
        storage.insert_build(&build_for(&entity, 2, false)).unwrap();

        let builds = storage.list_builds(&entity.id).unwrap();
        assert_eq!(builds.iter().map(|b| b.version).collect::<Vec<_>>(), vec![1, 2]);
        assert_eq!(storage.latest_build(&entity.id).unwrap().unwrap().version, 2);
        assert!(storage.get_build_by_version(&entity.id, 3).is_err());
    }

    #[test]
    fn test_finalized_builds_are_not_rewritten() {
        let storage = Storage::in_memory().unwrap();
        let entity = Entity::new("orders", Utc::now());
        storage.insert_entity(&entity).unwrap();
        let mut build = build_for(&entity, 1, false);
        storage.insert_build(&build).unwrap();

        assert_eq!(
            storage
                .pending_builds_before(Utc::now() + Duration::seconds(1))
                .unwrap()
                .len(),
            1
        );
        assert!(storage.mark_finalized(&build.id).unwrap());
        assert!(!storage.mark_finalized(&build.id).unwrap());

        build.snapshot = EntityState::default().with_status("published");
        assert!(storage.update_pending_build(&build).is_err());
        assert_eq!(
            storage.get_build(&build.id).unwrap().snapshot.status.as_deref(),
            Some("draft")
        );
    }

    #[test]
    fn test_atomically_rolls_back_on_error() {
        let storage = Storage::in_memory().unwrap();
        let entity = Entity::new("orders", Utc::now());

        let result: Result<()> = storage.atomically(|s| {
            s.insert_entity(&entity)?;
            Err(Error::InvalidOperation("boom".into()))
        });

        assert!(result.is_err());
        assert!(storage.get_entity(&entity.id).is_err());
    }

    #[test]
    fn test_link_queries() {
        let storage = Storage::in_memory().unwrap();
        let entity = Entity::new("x", Utc::now());
        storage.insert_entity(&entity).unwrap();

        let mut link = GitLink::new(entity.id, "analytics", "main", "models/x.sql");
        link.extra.insert("owner".into(), "team".into());
        storage.upsert_link(&link).unwrap();

        let by_path = storage
            .find_link_by_path("analytics", "main", "models/x.sql")
            .unwrap()
            .unwrap();
        assert_eq!(by_path.entity_id, entity.id);
        assert_eq!(by_path.extra.get("owner").map(String::as_str), Some("team"));

        link.status = LinkStatus::Unlinked;
        storage.upsert_link(&link).unwrap();
        assert_eq!(
            storage.get_link(&entity.id).unwrap().unwrap().status,
            LinkStatus::Unlinked
        );
        assert_eq!(storage.links_for_repo("analytics", "main").unwrap().len(), 1);
        assert_eq!(storage.links_with_status(LinkStatus::Unlinked).unwrap().len(), 1);
        assert!(storage.links_for_repo("analytics", "dev").unwrap().is_empty());
    }
}

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BuildSource {
    Manual,
    Git,
}

impl BuildSource {
    pub fn as_str(&self) -> &str {
        match self {
            BuildSource::Manual => "manual",
            BuildSource::Git => "git",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "manual" => Some(BuildSource::Manual),
            "git" => Some(BuildSource::Git),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkStatus {
    Linked,
    Unlinked,
    Conflicted,
}

impl LinkStatus {
    pub fn as_str(&self) -> &str {
        match self {
            LinkStatus::Linked => "linked",
            LinkStatus::Unlinked => "unlinked",
            LinkStatus::Conflicted => "conflicted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "linked" => Some(LinkStatus::Linked),
            "unlinked" => Some(LinkStatus::Unlinked),
            "conflicted" => Some(LinkStatus::Conflicted),
            _ => None,
        }
    }
}

/// The versioned fields of an entity, in diff order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Field {
    Text,
    Status,
    LoadMode,
    Category,
    Removed,
    References,
    Labels,
}

impl Field {
    pub const SCALARS: [Field; 5] = [
        Field::Text,
        Field::Status,
        Field::LoadMode,
        Field::Category,
        Field::Removed,
    ];
    pub const SETS: [Field; 2] = [Field::References, Field::Labels];

    pub fn as_str(&self) -> &'static str {
        match self {
            Field::Text => "text",
            Field::Status => "status",
            Field::LoadMode => "load_mode",
            Field::Category => "category",
            Field::Removed => "removed",
            Field::References => "references",
            Field::Labels => "labels",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "text" => Some(Field::Text),
            "status" => Some(Field::Status),
            "load_mode" => Some(Field::LoadMode),
            "category" => Some(Field::Category),
            "removed" => Some(Field::Removed),
            "references" => Some(Field::References),
            "labels" => Some(Field::Labels),
            _ => None,
        }
    }

    pub fn is_set(&self) -> bool {
        matches!(self, Field::References | Field::Labels)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

impl ChangeKind {
    pub fn inverse(self) -> Self {
        match self {
            ChangeKind::Added => ChangeKind::Removed,
            ChangeKind::Removed => ChangeKind::Added,
            ChangeKind::Modified => ChangeKind::Modified,
        }
    }
}

/// One field-level change. For set fields `old`/`new` carry the single element
/// that was removed/added.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldChange {
    pub field: Field,
    pub kind: ChangeKind,
    pub old: Option<String>,
    pub new: Option<String>,
}

impl FieldChange {
    pub fn new(field: Field, old: Option<String>, new: Option<String>) -> Self {
        let kind = match (&old, &new) {
            (None, Some(_)) => ChangeKind::Added,
            (Some(_), None) => ChangeKind::Removed,
            _ => ChangeKind::Modified,
        };
        Self {
            field,
            kind,
            old,
            new,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffRecord {
    pub changes: Vec<FieldChange>,
}

impl DiffRecord {
    pub fn is_empty(&self) -> bool {
        self.changes.is_empty()
    }

    pub fn len(&self) -> usize {
        self.changes.len()
    }

    pub fn fields(&self) -> BTreeSet<Field> {
        self.changes.iter().map(|c| c.field).collect()
    }
}

/// Field snapshot of an entity at one point in its history.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EntityState {
    pub text: Option<String>,
    pub status: Option<String>,
    pub load_mode: Option<String>,
    pub category: Option<String>,
    pub references: BTreeSet<String>,
    pub labels: BTreeSet<String>,
    pub removed: bool,
}

impl EntityState {
    pub fn with_text(mut self, text: impl Into<String>) -> Self {
        self.text = Some(text.into());
        self
    }

    pub fn with_status(mut self, status: impl Into<String>) -> Self {
        self.status = Some(status.into());
        self
    }

    pub fn with_load_mode(mut self, load_mode: impl Into<String>) -> Self {
        self.load_mode = Some(load_mode.into());
        self
    }

    pub fn with_category(mut self, category: impl Into<String>) -> Self {
        self.category = Some(category.into());
        self
    }

    pub fn with_references<I, S>(mut self, references: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.references = references.into_iter().map(Into::into).collect();
        self
    }

    pub fn with_labels<I, S>(mut self, labels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.labels = labels.into_iter().map(Into::into).collect();
        self
    }

    pub fn scalar(&self, field: Field) -> Option<String> {
        match field {
            Field::Text => self.text.clone(),
            Field::Status => self.status.clone(),
            Field::LoadMode => self.load_mode.clone(),
            Field::Category => self.category.clone(),
            Field::Removed => self.removed.then(|| "true".to_string()),
            Field::References | Field::Labels => None,
        }
    }

    pub fn set_scalar(&mut self, field: Field, value: Option<String>) {
        match field {
            Field::Text => self.text = value,
            Field::Status => self.status = value,
            Field::LoadMode => self.load_mode = value,
            Field::Category => self.category = value,
            Field::Removed => self.removed = value.is_some(),
            Field::References | Field::Labels => {}
        }
    }

    pub fn set_field(&self, field: Field) -> Option<&BTreeSet<String>> {
        match field {
            Field::References => Some(&self.references),
            Field::Labels => Some(&self.labels),
            _ => None,
        }
    }

    pub fn set_field_mut(&mut self, field: Field) -> Option<&mut BTreeSet<String>> {
        match field {
            Field::References => Some(&mut self.references),
            Field::Labels => Some(&mut self.labels),
            _ => None,
        }
    }

    /// SHA-256 over the canonical JSON form of the snapshot.
    pub fn content_hash(&self) -> String {
        use sha2::{Digest, Sha256};
        let canonical = serde_json::to_vec(self).unwrap_or_default();
        let mut hasher = Sha256::new();
        hasher.update(&canonical);
        hex::encode(hasher.finalize())
    }
}

/// Current mutable state of a versioned build definition.
///
/// `latest_build_id` is a plain identifier into the build chain owned by the
/// version store; the entity never owns its builds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entity {
    pub id: Uuid,
    pub name: String,
    pub state: EntityState,
    pub latest_build_id: Option<Uuid>,
    pub latest_version: u32,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Entity {
    pub fn new(name: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: Uuid::new_v4(),
            name: name.into(),
            state: EntityState::default(),
            latest_build_id: None,
            latest_version: 0,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Immutable (once finalized) version snapshot of an entity.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Build {
    pub id: Uuid,
    pub entity_id: Uuid,
    pub version: u32,
    pub diff: DiffRecord,
    pub snapshot: EntityState,
    pub source: BuildSource,
    pub finalized: bool,
    pub author: String,
    pub rollback_of: Option<u32>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Remote change held back while a link is conflicted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingConflict {
    pub remote_commit: String,
    pub remote_state: EntityState,
    pub detected_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GitLink {
    pub entity_id: Uuid,
    pub repo_id: String,
    pub branch: String,
    pub path: String,
    pub last_synced_commit: Option<String>,
    /// Build version that matched the file at `last_synced_commit`.
    pub synced_version: u32,
    pub synced_hash: String,
    pub status: LinkStatus,
    /// Unrecognized frontmatter keys from the last pulled file, written back on push.
    pub extra: BTreeMap<String, String>,
    pub conflict: Option<PendingConflict>,
}

impl GitLink {
    pub fn new(
        entity_id: Uuid,
        repo_id: impl Into<String>,
        branch: impl Into<String>,
        path: impl Into<String>,
    ) -> Self {
        Self {
            entity_id,
            repo_id: repo_id.into(),
            branch: branch.into(),
            path: path.into(),
            last_synced_commit: None,
            synced_version: 0,
            synced_hash: EntityState::default().content_hash(),
            status: LinkStatus::Linked,
            extra: BTreeMap::new(),
            conflict: None,
        }
    }

    pub fn mark_synced(&mut self, commit: impl Into<String>, version: u32, state: &EntityState) {
        self.last_synced_commit = Some(commit.into());
        self.synced_version = version;
        self.synced_hash = state.content_hash();
        self.status = LinkStatus::Linked;
        self.conflict = None;
    }

    pub fn is_linked(&self) -> bool {
        self.status == LinkStatus::Linked
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_entity_creation() {
        let now = Utc::now();
        let entity = Entity::new("orders", now);

        assert_eq!(entity.name, "orders");
        assert_eq!(entity.latest_version, 0);
        assert!(entity.latest_build_id.is_none());
        assert_eq!(entity.state, EntityState::default());
    }

    #[test]
    fn test_state_scalar_accessors() {
        let mut state = EntityState::default().with_status("draft");
        assert_eq!(state.scalar(Field::Status), Some("draft".to_string()));
        assert_eq!(state.scalar(Field::Removed), None);

        state.set_scalar(Field::Removed, Some("true".to_string()));
        assert!(state.removed);
        state.set_scalar(Field::Status, None);
        assert!(state.status.is_none());
    }

    #[test]
    fn test_content_hash_tracks_fields() {
        let a = EntityState::default().with_labels(["core"]);
        let b = EntityState::default().with_labels(["core"]);
        let c = EntityState::default().with_labels(["core", "finance"]);

        assert_eq!(a.content_hash(), b.content_hash());
        assert_ne!(a.content_hash(), c.content_hash());
        assert_eq!(a.content_hash().len(), 64);
    }

    #[test]
    fn test_field_change_kind() {
        let added = FieldChange::new(Field::Status, None, Some("active".into()));
        let removed = FieldChange::new(Field::Status, Some("active".into()), None);
        let modified = FieldChange::new(Field::Status, Some("a".into()), Some("b".into()));

        assert_eq!(added.kind, ChangeKind::Added);
        assert_eq!(removed.kind, ChangeKind::Removed);
        assert_eq!(modified.kind, ChangeKind::Modified);
        assert_eq!(ChangeKind::Added.inverse(), ChangeKind::Removed);
    }

    #[test]
    fn test_link_mark_synced() {
        let state = EntityState::default().with_status("active");
        let mut link = GitLink::new(Uuid::new_v4(), "repo", "main", "models/x.sql");
        link.status = LinkStatus::Conflicted;

        link.mark_synced("abc123", 3, &state);

        assert!(link.is_linked());
        assert_eq!(link.last_synced_commit.as_deref(), Some("abc123"));
        assert_eq!(link.synced_version, 3);
        assert_eq!(link.synced_hash, state.content_hash());
    }
}

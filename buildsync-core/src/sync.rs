//! Pull and push between the version store and a git repository.
//!
//! A pull fetches the branch tip, works out which linked paths changed since
//! each link's last synced commit, and turns every changed file into at most
//! one build. Each file is applied in its own transaction: one bad file is
//! recorded as a failure and the rest of the job carries on.

use crate::config::SyncConfig;
use crate::conflict::{Assessment, ConflictReport, ConflictResolver, Resolution};
use crate::error::{Error, Result};
use crate::frontmatter::{self, FrontmatterFields};
use crate::models::{Build, BuildSource, EntityState, GitLink, LinkStatus};
use crate::repository::{
    FetchedTree, FileChange, PathChangeKind, RepoResult, Repository, RepositoryErrorKind,
};
use crate::versions::VersionStore;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncPhase {
    Idle,
    Fetching,
    DiffingTree,
    ApplyingChanges,
    Completed,
    PartiallyFailed,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncFailure {
    pub path: Option<String>,
    pub entity_id: Option<Uuid>,
    pub error: String,
}

impl SyncFailure {
    fn new(path: Option<&str>, entity_id: Option<Uuid>, error: &Error) -> Self {
        Self {
            path: path.map(str::to_string),
            entity_id,
            error: error.to_string(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AppliedChange {
    pub path: String,
    pub entity_id: Uuid,
    pub kind: PathChangeKind,
    /// Version created, or `None` when the link only advanced.
    pub version: Option<u32>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncReport {
    pub job_id: Uuid,
    pub repo_id: String,
    pub branch: String,
    pub commit: Option<String>,
    pub phase: SyncPhase,
    pub applied: Vec<AppliedChange>,
    pub conflicts: Vec<ConflictReport>,
    pub failures: Vec<SyncFailure>,
    pub cancelled: bool,
    pub started_at: DateTime<Utc>,
    pub finished_at: Option<DateTime<Utc>>,
}

impl SyncReport {
    pub fn builds_created(&self) -> usize {
        self.applied.iter().filter(|c| c.version.is_some()).count()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushOutcome {
    /// Commit created on the branch, if anything was written.
    pub commit: Option<String>,
    pub pushed: Vec<Uuid>,
    pub failures: Vec<SyncFailure>,
    /// Entities held back because the file also changed upstream.
    #[serde(default)]
    pub conflicts: Vec<ConflictReport>,
}

/// One sync job per repository at a time.
#[derive(Default)]
pub struct RepoLocks {
    active: Mutex<HashSet<String>>,
}

pub struct RepoLockGuard<'a> {
    locks: &'a RepoLocks,
    repo_id: String,
}

impl RepoLocks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn try_acquire(&self, repo_id: &str) -> Result<RepoLockGuard<'_>> {
        let mut active = self.active.lock().unwrap_or_else(|e| e.into_inner());
        if !active.insert(repo_id.to_string()) {
            return Err(Error::SyncInProgress(repo_id.to_string()));
        }
        Ok(RepoLockGuard {
            locks: self,
            repo_id: repo_id.to_string(),
        })
    }

    pub fn is_locked(&self, repo_id: &str) -> bool {
        self.active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(repo_id)
    }
}

impl Drop for RepoLockGuard<'_> {
    fn drop(&mut self) {
        self.locks
            .active
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.repo_id);
    }
}

enum Action {
    Added,
    Modified,
    Removed,
    /// Path untouched since the link's commit; only the commit moves.
    Advance,
}

struct WorkItem {
    path: String,
    action: Action,
    link: Option<GitLink>,
}

enum ItemOutcome {
    Applied(AppliedChange),
    Conflict(ConflictReport),
    Unchanged,
}

struct SyncJob {
    report: SyncReport,
}

impl SyncJob {
    fn new(repo_id: &str, branch: &str, now: DateTime<Utc>) -> Self {
        Self {
            report: SyncReport {
                job_id: Uuid::new_v4(),
                repo_id: repo_id.to_string(),
                branch: branch.to_string(),
                commit: None,
                phase: SyncPhase::Idle,
                applied: Vec::new(),
                conflicts: Vec::new(),
                failures: Vec::new(),
                cancelled: false,
                started_at: now,
                finished_at: None,
            },
        }
    }

    fn enter(&mut self, phase: SyncPhase) {
        debug!(
            job_id = %self.report.job_id,
            from = ?self.report.phase,
            to = ?phase,
            "sync phase"
        );
        self.report.phase = phase;
    }

    fn finish(mut self, now: DateTime<Utc>) -> SyncReport {
        let phase = if self.report.failures.is_empty() && !self.report.cancelled {
            SyncPhase::Completed
        } else {
            SyncPhase::PartiallyFailed
        };
        self.enter(phase);
        self.report.finished_at = Some(now);
        self.report
    }
}

pub struct GitSyncOrchestrator {
    store: Arc<Mutex<VersionStore>>,
    config: SyncConfig,
    locks: Arc<RepoLocks>,
}

impl GitSyncOrchestrator {
    pub fn new(store: Arc<Mutex<VersionStore>>, config: SyncConfig) -> Self {
        Self {
            store,
            config,
            locks: Arc::new(RepoLocks::new()),
        }
    }

    /// Shares repository locks with other orchestrators over the same store.
    pub fn with_locks(mut self, locks: Arc<RepoLocks>) -> Self {
        self.locks = locks;
        self
    }

    pub fn config(&self) -> &SyncConfig {
        &self.config
    }

    pub fn locks(&self) -> &Arc<RepoLocks> {
        &self.locks
    }

    fn store(&self) -> MutexGuard<'_, VersionStore> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Brings local builds up to the branch tip.
    ///
    /// Fails outright only when the repository is busy or cannot be fetched;
    /// per-file problems end up in the report.
    pub fn pull(
        &self,
        repo: &dyn Repository,
        branch: &str,
        cancel: &CancellationToken,
    ) -> Result<SyncReport> {
        let _guard = self.locks.try_acquire(repo.id())?;
        let mut job = SyncJob::new(repo.id(), branch, self.store().clock().now());
        info!(job_id = %job.report.job_id, repo = repo.id(), branch, "starting pull");

        job.enter(SyncPhase::Fetching);
        let tree = self.with_retries("fetch", || repo.fetch(branch))?;
        job.report.commit = Some(tree.commit.clone());

        job.enter(SyncPhase::DiffingTree);
        let work = self.plan(repo, branch, &tree, &mut job.report.failures)?;

        job.enter(SyncPhase::ApplyingChanges);
        for item in work {
            if cancel.is_cancelled() {
                warn!(job_id = %job.report.job_id, "pull cancelled");
                job.report.cancelled = true;
                break;
            }

            let entity_id = item.link.as_ref().map(|l| l.entity_id);
            let path = item.path.clone();
            match self.apply_item(repo, &tree.commit, branch, item) {
                Ok(ItemOutcome::Applied(change)) => job.report.applied.push(change),
                Ok(ItemOutcome::Conflict(report)) => job.report.conflicts.push(report),
                Ok(ItemOutcome::Unchanged) => {}
                Err(err) => {
                    warn!(path = %path, error = %err, "skipping file");
                    job.report.failures.push(SyncFailure::new(Some(path.as_str()), entity_id, &err));
                }
            }
        }

        let report = job.finish(self.store().clock().now());
        info!(
            job_id = %report.job_id,
            commit = ?report.commit,
            phase = ?report.phase,
            builds = report.builds_created(),
            conflicts = report.conflicts.len(),
            failures = report.failures.len(),
            "pull finished"
        );
        Ok(report)
    }

    /// Writes the current state of `entity_ids` to `branch` in one commit.
    pub fn push(
        &self,
        repo: &dyn Repository,
        entity_ids: &[Uuid],
        branch: &str,
    ) -> Result<PushOutcome> {
        if !repo.capabilities().can_push {
            return Err(Error::Unsupported(format!(
                "repository {} does not accept pushes",
                repo.id()
            )));
        }
        let _guard = self.locks.try_acquire(repo.id())?;
        let tip = match self.with_retries("fetch", || repo.fetch(branch)) {
            Ok(tree) => Some(tree),
            Err(Error::RepositoryAccess(err)) if err.kind == RepositoryErrorKind::NotFound => None,
            Err(err) => return Err(err),
        };

        let mut changes = Vec::new();
        let mut staged = Vec::new();
        let mut failures = Vec::new();
        let mut conflicts = Vec::new();
        let mut claimed: HashSet<String> = HashSet::new();
        {
            let store = self.store();
            for entity_id in entity_ids {
                match self.stage(&store, repo, tip.as_ref(), branch, entity_id) {
                    Ok(Staged::Conflict(report)) => {
                        let err = Error::InvalidOperation(format!(
                            "{} changed upstream in {}; resolve the conflict first",
                            report.path, report.remote_commit
                        ));
                        failures.push(SyncFailure::new(Some(report.path.as_str()), Some(*entity_id), &err));
                        conflicts.push(report);
                    }
                    Ok(Staged::Ready { change, link, version, state }) => {
                        if !claimed.insert(link.path.clone()) {
                            let err = Error::InvalidOperation(format!(
                                "path {} is already part of this push",
                                link.path
                            ));
                            failures.push(SyncFailure::new(Some(link.path.as_str()), Some(*entity_id), &err));
                            continue;
                        }
                        changes.push(change);
                        staged.push((link, version, state));
                    }
                    Err(err) => {
                        warn!(entity_id = %entity_id, error = %err, "not pushing entity");
                        failures.push(SyncFailure::new(None, Some(*entity_id), &err));
                    }
                }
            }
        }

        if changes.is_empty() {
            return Ok(PushOutcome {
                commit: None,
                pushed: Vec::new(),
                failures,
                conflicts,
            });
        }

        let message = commit_message(&changes);
        let commit = self.with_retries("push", || repo.commit_and_push(branch, &changes, &message))?;

        let store = self.store();
        let mut pushed = Vec::new();
        for (mut link, version, state) in staged {
            link.mark_synced(commit.clone(), version, &state);
            match store.storage().upsert_link(&link) {
                Ok(()) => pushed.push(link.entity_id),
                Err(err) => {
                    error!(entity_id = %link.entity_id, error = %err, "failed to record pushed link");
                    failures.push(SyncFailure::new(Some(link.path.as_str()), Some(link.entity_id), &err));
                }
            }
        }

        info!(repo = repo.id(), branch, commit = %commit, entities = pushed.len(), "pushed builds");
        Ok(PushOutcome {
            commit: Some(commit),
            pushed,
            failures,
            conflicts,
        })
    }

    pub fn resolve_conflict(
        &self,
        entity_id: &Uuid,
        resolution: Resolution,
        author: &str,
    ) -> Result<Option<Build>> {
        let store = self.store();
        ConflictResolver::new(&store).resolve(entity_id, resolution, author)
    }

    pub fn list_conflicts(&self) -> Result<Vec<ConflictReport>> {
        let store = self.store();
        ConflictResolver::new(&store).list_conflicts()
    }

    /// Links an entity to a path, or re-links an unlinked one.
    ///
    /// The link starts with no synced commit, so the next pull treats the
    /// file at `path` as a remote edit of the entity's current state.
    pub fn link(&self, entity_id: &Uuid, repo_id: &str, branch: &str, path: &str) -> Result<GitLink> {
        let store = self.store();
        let entity = store.get_entity(entity_id)?;
        if let Some(existing) = store.storage().find_link_by_path(repo_id, branch, path)? {
            if existing.entity_id != *entity_id {
                return Err(Error::InvalidOperation(format!(
                    "{} is already linked to entity {}",
                    path, existing.entity_id
                )));
            }
        }

        let mut link = GitLink::new(*entity_id, repo_id, branch, path);
        if let Some(previous) = store.storage().get_link(entity_id)? {
            link.extra = previous.extra;
        }
        link.synced_version = store.seal_latest(entity_id)?;
        link.synced_hash = entity.state.content_hash();
        store.storage().upsert_link(&link)?;
        info!(entity_id = %entity_id, repo = repo_id, branch, path, "linked entity");
        Ok(link)
    }

    /// Detaches the entity; later pulls and pushes leave it alone.
    pub fn unlink(&self, entity_id: &Uuid) -> Result<GitLink> {
        let store = self.store();
        let mut link = store
            .storage()
            .get_link(entity_id)?
            .ok_or_else(|| Error::LinkNotFound(entity_id.to_string()))?;
        link.status = LinkStatus::Unlinked;
        link.conflict = None;
        store.storage().upsert_link(&link)?;
        info!(entity_id = %entity_id, path = %link.path, "unlinked entity");
        Ok(link)
    }

    fn with_retries<T>(&self, what: &str, mut op: impl FnMut() -> RepoResult<T>) -> Result<T> {
        let mut attempt = 0;
        loop {
            match op() {
                Ok(value) => return Ok(value),
                Err(err) if err.is_transient() && attempt < self.config.fetch_retries => {
                    let delay = self.config.backoff(attempt);
                    attempt += 1;
                    warn!(
                        operation = what,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "transient repository error, retrying"
                    );
                    thread::sleep(delay);
                }
                Err(err) => {
                    error!(operation = what, error = %err, "repository access failed");
                    return Err(err.into());
                }
            }
        }
    }

    /// Decides what to do with every tracked path.
    fn plan(
        &self,
        repo: &dyn Repository,
        branch: &str,
        tree: &FetchedTree,
        failures: &mut Vec<SyncFailure>,
    ) -> Result<Vec<WorkItem>> {
        let links = self.store().storage().links_for_repo(repo.id(), branch)?;
        let linked_paths: HashSet<&str> = links.iter().map(|l| l.path.as_str()).collect();
        let tip_paths: BTreeSet<&str> = tree.paths.iter().map(String::as_str).collect();

        let mut work = Vec::new();
        let mut by_commit: BTreeMap<&str, Vec<&GitLink>> = BTreeMap::new();
        for link in links.iter().filter(|l| l.status != LinkStatus::Unlinked) {
            match link.last_synced_commit.as_deref() {
                Some(commit) if commit == tree.commit => {}
                Some(commit) => by_commit.entry(commit).or_default().push(link),
                None if tip_paths.contains(link.path.as_str()) => work.push(WorkItem {
                    path: link.path.clone(),
                    action: Action::Modified,
                    link: Some(link.clone()),
                }),
                None => {}
            }
        }

        for (commit, group) in by_commit {
            let changes = match repo.diff_tree(commit, &tree.commit) {
                Ok(changes) => changes,
                Err(err) => {
                    let err = Error::from(err);
                    for link in group {
                        failures.push(SyncFailure::new(Some(link.path.as_str()), Some(link.entity_id), &err));
                    }
                    continue;
                }
            };
            let changed: HashMap<&str, PathChangeKind> =
                changes.iter().map(|c| (c.path.as_str(), c.kind)).collect();

            for link in group {
                let action = match changed.get(link.path.as_str()) {
                    Some(PathChangeKind::Removed) => Action::Removed,
                    // a file reappearing at a linked path edits the entity
                    Some(PathChangeKind::Added) | Some(PathChangeKind::Modified) => Action::Modified,
                    None => Action::Advance,
                };
                work.push(WorkItem {
                    path: link.path.clone(),
                    action,
                    link: Some(link.clone()),
                });
            }
        }

        for path in tip_paths {
            if !linked_paths.contains(path) && self.config.tracks(path) {
                work.push(WorkItem {
                    path: path.to_string(),
                    action: Action::Added,
                    link: None,
                });
            }
        }

        work.sort_by(|a, b| a.path.cmp(&b.path));
        debug!(items = work.len(), "planned pull");
        Ok(work)
    }

    fn apply_item(
        &self,
        repo: &dyn Repository,
        commit: &str,
        branch: &str,
        item: WorkItem,
    ) -> Result<ItemOutcome> {
        match (item.action, item.link) {
            (Action::Added, _) => self.apply_added(repo, commit, branch, &item.path),
            (Action::Modified, Some(link)) => {
                let (remote_state, extra) = self.read_remote(repo, commit, &item.path)?;
                self.apply_remote(commit, link, remote_state, extra, PathChangeKind::Modified)
            }
            (Action::Removed, Some(link)) => {
                let store = self.store();
                let synced = ConflictResolver::new(&store).synced_state(&link)?;
                drop(store);
                let remote_state = EntityState {
                    removed: true,
                    ..synced
                };
                let extra = link.extra.clone();
                self.apply_remote(commit, link, remote_state, extra, PathChangeKind::Removed)
            }
            (Action::Advance, Some(mut link)) => {
                if link.is_linked() {
                    link.last_synced_commit = Some(commit.to_string());
                    self.store().storage().upsert_link(&link)?;
                }
                Ok(ItemOutcome::Unchanged)
            }
            (_, None) => Err(Error::LinkNotFound(item.path)),
        }
    }

    fn apply_added(
        &self,
        repo: &dyn Repository,
        commit: &str,
        branch: &str,
        path: &str,
    ) -> Result<ItemOutcome> {
        let (state, extra) = self.read_remote(repo, commit, path)?;
        let name = Path::new(path)
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or(path)
            .to_string();

        let store = self.store();
        let (entity, build) = store.create_entity_and(
            &name,
            state,
            BuildSource::Git,
            &self.config.author,
            |storage, build| {
                let mut link = GitLink::new(build.entity_id, repo.id(), branch, path);
                link.extra = extra;
                link.mark_synced(commit, build.version, &build.snapshot);
                storage.upsert_link(&link)
            },
        )?;

        info!(entity_id = %entity.id, path, "created entity from repository");
        Ok(ItemOutcome::Applied(AppliedChange {
            path: path.to_string(),
            entity_id: entity.id,
            kind: PathChangeKind::Added,
            version: Some(build.version),
        }))
    }

    fn apply_remote(
        &self,
        commit: &str,
        mut link: GitLink,
        remote_state: EntityState,
        extra: BTreeMap<String, String>,
        kind: PathChangeKind,
    ) -> Result<ItemOutcome> {
        let store = self.store();
        let entity = store.get_entity(&link.entity_id)?;
        let resolver = ConflictResolver::new(&store);

        let applied = |version| {
            ItemOutcome::Applied(AppliedChange {
                path: link.path.clone(),
                entity_id: link.entity_id,
                kind,
                version,
            })
        };

        match resolver.assess(&link, &entity, commit, &remote_state)? {
            Assessment::Conflict(report) => {
                resolver.mark_conflicted(&mut link, &report, &remote_state)?;
                Ok(ItemOutcome::Conflict(report))
            }
            Assessment::UpToDate => {
                let outcome = applied(None);
                let version = store.seal_latest(&entity.id)?;
                link.extra = extra;
                link.mark_synced(commit, version, &entity.state);
                store.storage().upsert_link(&link)?;
                Ok(outcome)
            }
            Assessment::LocalAhead => {
                let outcome = applied(None);
                link.extra = extra;
                link.last_synced_commit = Some(commit.to_string());
                store.storage().upsert_link(&link)?;
                debug!(entity_id = %link.entity_id, "local edits ahead of repository");
                Ok(outcome)
            }
            Assessment::ApplyRemote => {
                let entity_id = link.entity_id;
                let path = link.path.clone();
                let build = store.commit_state_and(
                    &entity_id,
                    &remote_state,
                    BuildSource::Git,
                    &self.config.author,
                    None,
                    |storage, build| {
                        link.extra = extra.clone();
                        link.mark_synced(commit, build.version, &build.snapshot);
                        storage.upsert_link(&link)
                    },
                )?;
                Ok(ItemOutcome::Applied(AppliedChange {
                    path,
                    entity_id,
                    kind,
                    version: Some(build.version),
                }))
            }
        }
    }

    fn read_remote(
        &self,
        repo: &dyn Repository,
        commit: &str,
        path: &str,
    ) -> Result<(EntityState, BTreeMap<String, String>)> {
        let bytes = repo.read_file(commit, path)?;
        let contents = String::from_utf8(bytes)
            .map_err(|_| Error::InvalidOperation(format!("{} is not valid UTF-8", path)))?;
        let (fields, body) = frontmatter::parse(path, &contents)?;
        Ok(fields.into_state(body))
    }

    /// Builds the file change for one entity, unless the linked file moved
    /// upstream since it was last synced.
    fn stage(
        &self,
        store: &VersionStore,
        repo: &dyn Repository,
        tip: Option<&FetchedTree>,
        branch: &str,
        entity_id: &Uuid,
    ) -> Result<Staged> {
        let repo_id = repo.id();
        let entity = store.get_entity(entity_id)?;
        let mut link = match store.storage().get_link(entity_id)? {
            Some(link) => {
                match link.status {
                    LinkStatus::Unlinked => {
                        return Err(Error::InvalidOperation(format!(
                            "entity {} is unlinked",
                            entity_id
                        )))
                    }
                    LinkStatus::Conflicted => {
                        return Err(Error::InvalidOperation(format!(
                            "entity {} has an unresolved conflict",
                            entity_id
                        )))
                    }
                    LinkStatus::Linked => {}
                }
                if link.repo_id != repo_id || link.branch != branch {
                    return Err(Error::InvalidOperation(format!(
                        "entity {} is linked to {}@{}",
                        entity_id, link.repo_id, link.branch
                    )));
                }
                link
            }
            None => {
                let path = self.config.default_path(&entity.name);
                if let Some(other) = store.storage().find_link_by_path(repo_id, branch, &path)? {
                    return Err(Error::InvalidOperation(format!(
                        "{} is already linked to entity {}",
                        path, other.entity_id
                    )));
                }
                if tip.is_some_and(|t| t.paths.iter().any(|p| *p == path)) {
                    return Err(Error::InvalidOperation(format!(
                        "{} already exists in {}; link the entity to it instead",
                        path, repo_id
                    )));
                }
                GitLink::new(*entity_id, repo_id, branch, path)
            }
        };

        if let Some(tree) = tip {
            if let Some(remote_state) = self.upstream_state(store, repo, tree, &link)? {
                let resolver = ConflictResolver::new(store);
                match resolver.assess(&link, &entity, &tree.commit, &remote_state)? {
                    Assessment::Conflict(report) => {
                        resolver.mark_conflicted(&mut link, &report, &remote_state)?;
                        return Ok(Staged::Conflict(report));
                    }
                    Assessment::ApplyRemote => {
                        return Err(Error::InvalidOperation(format!(
                            "{} has upstream changes in {}; pull first",
                            link.path, tree.commit
                        )))
                    }
                    Assessment::UpToDate | Assessment::LocalAhead => {}
                }
            }
        }

        let change = if entity.state.removed {
            FileChange::Delete {
                path: link.path.clone(),
            }
        } else {
            let fields = FrontmatterFields::from_state(&entity.state, link.extra.clone());
            let body = entity.state.text.as_deref().unwrap_or_default();
            FileChange::Write {
                path: link.path.clone(),
                contents: frontmatter::serialize(&fields, body).into_bytes(),
            }
        };

        let version = store.seal_latest(entity_id)?;
        Ok(Staged::Ready {
            change,
            link,
            version,
            state: entity.state,
        })
    }

    /// Remote state of the linked file when it changed after the link's
    /// synced commit, or `None` when the file is as it was last synced.
    fn upstream_state(
        &self,
        store: &VersionStore,
        repo: &dyn Repository,
        tree: &FetchedTree,
        link: &GitLink,
    ) -> Result<Option<EntityState>> {
        let kind = match link.last_synced_commit.as_deref() {
            Some(commit) if commit == tree.commit => return Ok(None),
            Some(commit) => repo
                .diff_tree(commit, &tree.commit)?
                .into_iter()
                .find(|c| c.path == link.path)
                .map(|c| c.kind),
            None if tree.paths.contains(&link.path) => Some(PathChangeKind::Modified),
            None => None,
        };

        match kind {
            None => Ok(None),
            Some(PathChangeKind::Removed) => {
                let synced = ConflictResolver::new(store).synced_state(link)?;
                Ok(Some(EntityState {
                    removed: true,
                    ..synced
                }))
            }
            Some(_) => {
                let (state, _) = self.read_remote(repo, &tree.commit, &link.path)?;
                Ok(Some(state))
            }
        }
    }
}

enum Staged {
    Ready {
        change: FileChange,
        link: GitLink,
        version: u32,
        state: EntityState,
    },
    Conflict(ConflictReport),
}

fn commit_message(changes: &[FileChange]) -> String {
    let mut message = format!("buildsync: update {} file(s)\n\n", changes.len());
    for change in changes {
        match change {
            FileChange::Write { path, .. } => message.push_str(&format!("- write {}\n", path)),
            FileChange::Delete { path } => message.push_str(&format!("- delete {}\n", path)),
        }
    }
    message
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::VersioningConfig;
    use crate::models::{ChangeKind, Field};
    use crate::repository::{Capabilities, MemoryRepository, RepositoryError, RepositoryErrorKind};
    use crate::storage::Storage;

    const BRANCH: &str = "main";

    fn orchestrator() -> (GitSyncOrchestrator, Arc<Mutex<VersionStore>>) {
        orchestrator_with_idle_window(0)
    }

    fn orchestrator_with_idle_window(
        idle_window_secs: u64,
    ) -> (GitSyncOrchestrator, Arc<Mutex<VersionStore>>) {
        let versioning = VersioningConfig {
            idle_window_secs,
            ..VersioningConfig::default()
        };
        let store = Arc::new(Mutex::new(VersionStore::new(
            Storage::in_memory().unwrap(),
            Arc::new(ManualClock::new(Utc::now())),
            versioning,
        )));
        let config = SyncConfig {
            backoff_base_ms: 1,
            ..SyncConfig::default()
        };
        (GitSyncOrchestrator::new(store.clone(), config), store)
    }

    fn file(labels: &str) -> String {
        format!("---\nstatus: draft\nlabels: [{}]\n---\nselect 1\n", labels)
    }

    fn pull(sync: &GitSyncOrchestrator, repo: &MemoryRepository) -> SyncReport {
        sync.pull(repo, BRANCH, &CancellationToken::new()).unwrap()
    }

    fn entity_at(store: &Arc<Mutex<VersionStore>>, path: &str) -> Uuid {
        store
            .lock()
            .unwrap()
            .storage()
            .find_link_by_path("analytics", BRANCH, path)
            .unwrap()
            .unwrap()
            .entity_id
    }

    #[test]
    fn test_pull_creates_then_updates_entities() {
        let (sync, store) = orchestrator();
        let repo = MemoryRepository::new("analytics");
        repo.write_file(BRANCH, "models/orders.sql", &file("a"));

        let report = pull(&sync, &repo);
        assert_eq!(report.phase, SyncPhase::Completed);
        assert_eq!(report.builds_created(), 1);
        assert_eq!(report.applied[0].kind, PathChangeKind::Added);

        let id = entity_at(&store, "models/orders.sql");
        {
            let store = store.lock().unwrap();
            let entity = store.get_entity(&id).unwrap();
            assert_eq!(entity.name, "orders");
            assert_eq!(entity.state.text.as_deref(), Some("select 1\n"));
        }

        let tip = repo.write_file(BRANCH, "models/orders.sql", &file("a, b"));
        let report = pull(&sync, &repo);
        assert_eq!(report.builds_created(), 1);

        let store = store.lock().unwrap();
        let builds = store.list_versions(&id).unwrap();
        assert_eq!(builds.len(), 2);
        assert_eq!(builds[1].source, BuildSource::Git);
        assert_eq!(builds[1].diff.changes.len(), 1);
        assert_eq!(builds[1].diff.changes[0].field, Field::Labels);
        assert_eq!(builds[1].diff.changes[0].kind, ChangeKind::Added);

        let link = store.storage().get_link(&id).unwrap().unwrap();
        assert_eq!(link.last_synced_commit, Some(tip));
        assert_eq!(link.synced_version, 2);
    }

    #[test]
    fn test_second_pull_is_idempotent() {
        let (sync, _store) = orchestrator();
        let repo = MemoryRepository::new("analytics");
        repo.write_file(BRANCH, "models/a.sql", &file("a"));
        repo.write_file(BRANCH, "models/b.sql", &file("b"));

        assert_eq!(pull(&sync, &repo).builds_created(), 2);
        let again = pull(&sync, &repo);
        assert_eq!(again.builds_created(), 0);
        assert!(again.applied.is_empty());
        assert_eq!(again.phase, SyncPhase::Completed);
    }

    #[test]
    fn test_diverged_edits_become_conflict() {
        let (sync, store) = orchestrator();
        let repo = MemoryRepository::new("analytics");
        repo.write_file(BRANCH, "models/orders.sql", &file("a"));
        pull(&sync, &repo);
        let id = entity_at(&store, "models/orders.sql");

        {
            let store = store.lock().unwrap();
            let current = store.get_entity(&id).unwrap().state;
            let mut local = current.clone();
            local.labels.insert("b".into());
            store.edit(&id, 1, &local, "alice").unwrap();
        }
        let remote_commit = repo.write_file(BRANCH, "models/orders.sql", &file("a, c"));

        let report = pull(&sync, &repo);
        assert_eq!(report.builds_created(), 0);
        assert_eq!(report.conflicts.len(), 1);
        let conflict = &report.conflicts[0];
        assert_eq!(conflict.remote_commit, remote_commit);
        assert_eq!(conflict.local.changes[0].new.as_deref(), Some("b"));
        assert_eq!(conflict.remote.changes[0].new.as_deref(), Some("c"));

        {
            let store = store.lock().unwrap();
            assert_eq!(store.list_versions(&id).unwrap().len(), 2);
            let link = store.storage().get_link(&id).unwrap().unwrap();
            assert_eq!(link.status, LinkStatus::Conflicted);
        }

        // still conflicted, still no build
        let again = pull(&sync, &repo);
        assert_eq!(again.builds_created(), 0);
        assert_eq!(again.conflicts.len(), 1);

        let build = sync
            .resolve_conflict(&id, Resolution::TakeRemote, "alice")
            .unwrap()
            .unwrap();
        assert_eq!(build.version, 3);
        assert!(build.snapshot.labels.contains("c"));
        assert!(!build.snapshot.labels.contains("b"));
        assert!(sync.list_conflicts().unwrap().is_empty());
        assert_eq!(pull(&sync, &repo).builds_created(), 0);
    }

    #[test]
    fn test_local_edit_survives_unrelated_remote_commit() {
        let (sync, store) = orchestrator();
        let repo = MemoryRepository::new("analytics");
        repo.write_file(BRANCH, "models/orders.sql", &file("a"));
        pull(&sync, &repo);
        let id = entity_at(&store, "models/orders.sql");

        {
            let store = store.lock().unwrap();
            let mut local = store.get_entity(&id).unwrap().state;
            local.status = Some("published".into());
            store.edit(&id, 1, &local, "alice").unwrap();
        }
        repo.write_file(BRANCH, "models/other.sql", &file("z"));

        let report = pull(&sync, &repo);
        assert!(report.conflicts.is_empty());
        let store = store.lock().unwrap();
        assert_eq!(
            store.get_entity(&id).unwrap().state.status.as_deref(),
            Some("published")
        );
    }

    #[test]
    fn test_removed_file_soft_deletes_entity() {
        let (sync, store) = orchestrator();
        let repo = MemoryRepository::new("analytics");
        repo.write_file(BRANCH, "models/orders.sql", &file("a"));
        pull(&sync, &repo);
        let id = entity_at(&store, "models/orders.sql");

        repo.delete_file(BRANCH, "models/orders.sql");
        let report = pull(&sync, &repo);
        assert_eq!(report.applied[0].kind, PathChangeKind::Removed);

        let store = store.lock().unwrap();
        let entity = store.get_entity(&id).unwrap();
        assert!(entity.state.removed);
        assert_eq!(entity.latest_version, 2);
        assert!(!store.get_contents(&id, 1).unwrap().removed);
    }

    #[test]
    fn test_malformed_file_fails_alone() {
        let (sync, store) = orchestrator();
        let repo = MemoryRepository::new("analytics");
        repo.write_file(BRANCH, "models/bad.sql", "---\nlabels: [a, b\n---\n");
        repo.write_file(BRANCH, "models/good.sql", &file("a"));

        let report = pull(&sync, &repo);
        assert_eq!(report.phase, SyncPhase::PartiallyFailed);
        assert_eq!(report.failures.len(), 1);
        assert_eq!(report.failures[0].path.as_deref(), Some("models/bad.sql"));
        assert_eq!(report.builds_created(), 1);
        assert_eq!(store.lock().unwrap().list_entities().unwrap().len(), 1);
    }

    #[test]
    fn test_unlinked_entity_is_left_alone() {
        let (sync, store) = orchestrator();
        let repo = MemoryRepository::new("analytics");
        repo.write_file(BRANCH, "models/orders.sql", &file("a"));
        pull(&sync, &repo);
        let id = entity_at(&store, "models/orders.sql");

        sync.unlink(&id).unwrap();
        repo.write_file(BRANCH, "models/orders.sql", &file("a, b"));
        let report = pull(&sync, &repo);
        assert_eq!(report.builds_created(), 0);
        assert_eq!(store.lock().unwrap().list_versions(&id).unwrap().len(), 1);

        let outcome = sync.push(&repo, &[id], BRANCH).unwrap();
        assert!(outcome.commit.is_none());
        assert_eq!(outcome.failures.len(), 1);
    }

    #[test]
    fn test_unlinked_entity_ignores_upstream_delete() {
        let (sync, store) = orchestrator();
        let repo = MemoryRepository::new("analytics");
        repo.write_file(BRANCH, "models/orders.sql", &file("a"));
        pull(&sync, &repo);
        let id = entity_at(&store, "models/orders.sql");

        sync.unlink(&id).unwrap();
        repo.delete_file(BRANCH, "models/orders.sql");
        let report = pull(&sync, &repo);
        assert_eq!(report.builds_created(), 0);
        assert!(report.applied.is_empty());
        assert!(report.failures.is_empty());

        let store = store.lock().unwrap();
        let entity = store.get_entity(&id).unwrap();
        assert!(!entity.state.removed);
        assert_eq!(store.list_versions(&id).unwrap().len(), 1);
        let link = store.storage().get_link(&id).unwrap().unwrap();
        assert_eq!(link.status, LinkStatus::Unlinked);
    }

    #[test]
    fn test_push_holds_back_entity_changed_upstream() {
        let (sync, store) = orchestrator();
        let repo = MemoryRepository::new("analytics");
        repo.write_file(BRANCH, "models/orders.sql", &file("a"));
        pull(&sync, &repo);
        let id = entity_at(&store, "models/orders.sql");

        let upstream = repo.write_file(BRANCH, "models/orders.sql", &file("a, c"));
        {
            let store = store.lock().unwrap();
            let mut local = store.get_entity(&id).unwrap().state;
            local.labels.insert("b".into());
            store.edit(&id, 1, &local, "alice").unwrap();
        }

        let outcome = sync.push(&repo, &[id], BRANCH).unwrap();
        assert!(outcome.commit.is_none());
        assert!(outcome.pushed.is_empty());
        assert_eq!(outcome.failures.len(), 1);
        assert_eq!(outcome.conflicts.len(), 1);
        assert_eq!(outcome.conflicts[0].remote_commit, upstream);
        assert_eq!(outcome.conflicts[0].local.changes[0].new.as_deref(), Some("b"));
        assert_eq!(outcome.conflicts[0].remote.changes[0].new.as_deref(), Some("c"));
        assert_eq!(repo.file_at_head(BRANCH, "models/orders.sql").unwrap(), file("a, c"));
        assert!(repo.pushed_messages().is_empty());

        let link = store.lock().unwrap().storage().get_link(&id).unwrap().unwrap();
        assert_eq!(link.status, LinkStatus::Conflicted);
        assert_eq!(sync.list_conflicts().unwrap().len(), 1);
    }

    #[test]
    fn test_push_refuses_to_overwrite_unpulled_edit() {
        let (sync, store) = orchestrator();
        let repo = MemoryRepository::new("analytics");
        repo.write_file(BRANCH, "models/orders.sql", &file("a"));
        pull(&sync, &repo);
        let id = entity_at(&store, "models/orders.sql");

        repo.write_file(BRANCH, "models/orders.sql", &file("a, c"));
        let outcome = sync.push(&repo, &[id], BRANCH).unwrap();
        assert!(outcome.commit.is_none());
        assert_eq!(outcome.failures.len(), 1);
        assert!(outcome.conflicts.is_empty());
        assert_eq!(repo.file_at_head(BRANCH, "models/orders.sql").unwrap(), file("a, c"));

        let report = pull(&sync, &repo);
        assert_eq!(report.builds_created(), 1);
        assert!(store.lock().unwrap().get_entity(&id).unwrap().state.labels.contains("c"));
    }

    #[test]
    fn test_pushed_version_stays_the_sync_baseline() {
        let (sync, store) = orchestrator_with_idle_window(300);
        let repo = MemoryRepository::new("analytics");
        repo.write_file(BRANCH, "models/orders.sql", &file("a"));
        pull(&sync, &repo);
        let id = entity_at(&store, "models/orders.sql");

        let edit = |label: &str| {
            let store = store.lock().unwrap();
            let entity = store.get_entity(&id).unwrap();
            let mut local = entity.state.clone();
            local.labels.insert(label.to_string());
            let build = store.edit(&id, entity.latest_version, &local, "alice").unwrap();
            build
        };

        let pushed = edit("b");
        assert!(!pushed.finalized);
        let outcome = sync.push(&repo, &[id], BRANCH).unwrap();
        assert_eq!(outcome.pushed, vec![id]);

        let after = edit("d");
        assert_eq!(after.version, 3);
        {
            let store = store.lock().unwrap();
            assert!(store.get_build(&pushed.id).unwrap().finalized);
            let link = store.storage().get_link(&id).unwrap().unwrap();
            assert_eq!(link.synced_version, 2);
        }

        repo.write_file(BRANCH, "models/orders.sql", &file("a, b, c"));
        let report = pull(&sync, &repo);
        assert_eq!(report.conflicts.len(), 1);
        let conflict = &report.conflicts[0];
        assert_eq!(conflict.local.len(), 1);
        assert_eq!(conflict.local.changes[0].new.as_deref(), Some("d"));
        assert_eq!(conflict.remote.len(), 1);
        assert_eq!(conflict.remote.changes[0].new.as_deref(), Some("c"));
    }

    #[test]
    fn test_cancelled_pull_applies_nothing() {
        let (sync, store) = orchestrator();
        let repo = MemoryRepository::new("analytics");
        repo.write_file(BRANCH, "models/a.sql", &file("a"));

        let cancel = CancellationToken::new();
        cancel.cancel();
        let report = sync.pull(&repo, BRANCH, &cancel).unwrap();
        assert!(report.cancelled);
        assert_eq!(report.phase, SyncPhase::PartiallyFailed);
        assert!(store.lock().unwrap().list_entities().unwrap().is_empty());

        let report = pull(&sync, &repo);
        assert_eq!(report.builds_created(), 1);
    }

    #[test]
    fn test_transient_fetch_is_retried() {
        let (sync, _store) = orchestrator();
        let repo = MemoryRepository::new("analytics");
        repo.write_file(BRANCH, "models/a.sql", &file("a"));
        repo.fail_next_fetch(RepositoryError::new(RepositoryErrorKind::Transient, "reset"));
        repo.fail_next_fetch(RepositoryError::new(RepositoryErrorKind::Transient, "reset"));

        let report = pull(&sync, &repo);
        assert_eq!(report.builds_created(), 1);
        assert_eq!(repo.fetch_count(), 3);
    }

    #[test]
    fn test_authentication_failure_is_fatal() {
        let (sync, _store) = orchestrator();
        let repo = MemoryRepository::new("analytics");
        repo.write_file(BRANCH, "models/a.sql", &file("a"));
        repo.fail_next_fetch(RepositoryError::new(
            RepositoryErrorKind::Authentication,
            "bad token",
        ));

        let err = sync
            .pull(&repo, BRANCH, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::RepositoryAccess(_)));
        assert_eq!(repo.fetch_count(), 1);
        assert!(!sync.locks().is_locked("analytics"));
    }

    #[test]
    fn test_concurrent_job_on_same_repo_is_rejected() {
        let (sync, _store) = orchestrator();
        let repo = MemoryRepository::new("analytics");
        repo.write_file(BRANCH, "models/a.sql", &file("a"));

        let _held = sync.locks().try_acquire("analytics").unwrap();
        let err = sync
            .pull(&repo, BRANCH, &CancellationToken::new())
            .unwrap_err();
        assert!(matches!(err, Error::SyncInProgress(_)));
    }

    #[test]
    fn test_push_writes_files_and_links() {
        let (sync, store) = orchestrator();
        let repo = MemoryRepository::new("analytics");
        repo.write_file(BRANCH, "README.md", "docs");

        let id = {
            let store = store.lock().unwrap();
            let state = EntityState::default()
                .with_status("draft")
                .with_labels(["a"])
                .with_text("select 1\n");
            store
                .create_entity("orders", state, BuildSource::Manual, "alice")
                .unwrap()
                .0
                .id
        };

        let outcome = sync.push(&repo, &[id], BRANCH).unwrap();
        assert_eq!(outcome.pushed, vec![id]);
        assert!(outcome.failures.is_empty());
        let written = repo.file_at_head(BRANCH, "models/orders.sql").unwrap();
        assert!(written.contains("status: draft"));

        // the pushed commit is already in sync
        let report = sync
            .pull(&repo, BRANCH, &CancellationToken::new())
            .unwrap();
        assert_eq!(report.builds_created(), 1); // README.md only
        assert_eq!(store.lock().unwrap().list_versions(&id).unwrap().len(), 1);
    }

    #[test]
    fn test_push_without_capability_is_unsupported() {
        let (sync, store) = orchestrator();
        let repo = MemoryRepository::new("analytics").with_capabilities(Capabilities {
            can_push: false,
            can_create_pr: false,
        });
        let id = store
            .lock()
            .unwrap()
            .create_entity("orders", EntityState::default(), BuildSource::Manual, "alice")
            .unwrap()
            .0
            .id;

        let err = sync.push(&repo, &[id], BRANCH).unwrap_err();
        assert!(matches!(err, Error::Unsupported(_)));
        assert!(repo.pushed_messages().is_empty());
    }
}

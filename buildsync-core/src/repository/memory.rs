use super::{
    Capabilities, FetchedTree, FileChange, PathChange, PathChangeKind, RepoResult, Repository,
    RepositoryError,
};
use sha2::{Digest, Sha256};
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Mutex, MutexGuard};

type Files = BTreeMap<String, Vec<u8>>;

#[derive(Default)]
struct State {
    commits: HashMap<String, Files>,
    branches: HashMap<String, String>,
    counter: u64,
    fetch_failures: VecDeque<RepositoryError>,
    push_failures: VecDeque<RepositoryError>,
    fetches: usize,
    pushes: Vec<String>,
}

/// In-process repository with a linear history per branch.
///
/// Upstream edits are simulated with [`MemoryRepository::commit_files`];
/// failures can be queued to exercise retry handling.
pub struct MemoryRepository {
    id: String,
    capabilities: Capabilities,
    state: Mutex<State>,
}

impl MemoryRepository {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            capabilities: Capabilities {
                can_push: true,
                can_create_pr: false,
            },
            state: Mutex::new(State::default()),
        }
    }

    pub fn with_capabilities(mut self, capabilities: Capabilities) -> Self {
        self.capabilities = capabilities;
        self
    }

    /// Records an upstream commit on `branch` and returns its id.
    pub fn commit_files(&self, branch: &str, changes: &[FileChange]) -> String {
        let mut state = self.lock();
        Self::apply(&mut state, branch, changes)
    }

    pub fn write_file(&self, branch: &str, path: &str, contents: &str) -> String {
        self.commit_files(
            branch,
            &[FileChange::Write {
                path: path.to_string(),
                contents: contents.as_bytes().to_vec(),
            }],
        )
    }

    pub fn delete_file(&self, branch: &str, path: &str) -> String {
        self.commit_files(
            branch,
            &[FileChange::Delete {
                path: path.to_string(),
            }],
        )
    }

    pub fn head(&self, branch: &str) -> Option<String> {
        self.lock().branches.get(branch).cloned()
    }

    pub fn file_at_head(&self, branch: &str, path: &str) -> Option<String> {
        let state = self.lock();
        let head = state.branches.get(branch)?;
        let bytes = state.commits.get(head)?.get(path)?;
        String::from_utf8(bytes.clone()).ok()
    }

    pub fn fail_next_fetch(&self, error: RepositoryError) {
        self.lock().fetch_failures.push_back(error);
    }

    pub fn fail_next_push(&self, error: RepositoryError) {
        self.lock().push_failures.push_back(error);
    }

    pub fn fetch_count(&self) -> usize {
        self.lock().fetches
    }

    pub fn pushed_messages(&self) -> Vec<String> {
        self.lock().pushes.clone()
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn apply(state: &mut State, branch: &str, changes: &[FileChange]) -> String {
        let mut files = state
            .branches
            .get(branch)
            .and_then(|head| state.commits.get(head))
            .cloned()
            .unwrap_or_default();

        for change in changes {
            match change {
                FileChange::Write { path, contents } => {
                    files.insert(path.clone(), contents.clone());
                }
                FileChange::Delete { path } => {
                    files.remove(path);
                }
            }
        }

        state.counter += 1;
        let mut hasher = Sha256::new();
        hasher.update(branch.as_bytes());
        hasher.update(state.counter.to_be_bytes());
        let id = hex::encode(hasher.finalize())[..40].to_string();

        state.commits.insert(id.clone(), files);
        state.branches.insert(branch.to_string(), id.clone());
        id
    }

    fn files<'a>(state: &'a State, commit: &str) -> RepoResult<&'a Files> {
        state
            .commits
            .get(commit)
            .ok_or_else(|| RepositoryError::not_found(format!("commit {}", commit)))
    }
}

impl Repository for MemoryRepository {
    fn id(&self) -> &str {
        &self.id
    }

    fn fetch(&self, branch: &str) -> RepoResult<FetchedTree> {
        let mut state = self.lock();
        state.fetches += 1;
        if let Some(err) = state.fetch_failures.pop_front() {
            return Err(err);
        }
        let commit = state
            .branches
            .get(branch)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found(format!("branch {}", branch)))?;
        let paths = Self::files(&state, &commit)?.keys().cloned().collect();
        Ok(FetchedTree { commit, paths })
    }

    fn diff_tree(&self, from_commit: &str, to_commit: &str) -> RepoResult<Vec<PathChange>> {
        let state = self.lock();
        let from = Self::files(&state, from_commit)?;
        let to = Self::files(&state, to_commit)?;

        let mut changes = Vec::new();
        for (path, contents) in to {
            match from.get(path) {
                None => changes.push(PathChange {
                    path: path.clone(),
                    kind: PathChangeKind::Added,
                }),
                Some(old) if old != contents => changes.push(PathChange {
                    path: path.clone(),
                    kind: PathChangeKind::Modified,
                }),
                Some(_) => {}
            }
        }
        for path in from.keys().filter(|p| !to.contains_key(*p)) {
            changes.push(PathChange {
                path: path.clone(),
                kind: PathChangeKind::Removed,
            });
        }
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(changes)
    }

    fn read_file(&self, commit: &str, path: &str) -> RepoResult<Vec<u8>> {
        let state = self.lock();
        Self::files(&state, commit)?
            .get(path)
            .cloned()
            .ok_or_else(|| RepositoryError::not_found(format!("{} at {}", path, commit)))
    }

    fn commit_and_push(
        &self,
        branch: &str,
        changes: &[FileChange],
        message: &str,
    ) -> RepoResult<String> {
        let mut state = self.lock();
        if let Some(err) = state.push_failures.pop_front() {
            return Err(err);
        }
        state.pushes.push(message.to_string());
        Ok(Self::apply(&mut state, branch, changes))
    }

    fn capabilities(&self) -> Capabilities {
        self.capabilities
    }
}

use super::{
    Capabilities, FetchedTree, FileChange, PathChange, PathChangeKind, RepoResult, Repository,
    RepositoryError, RepositoryErrorKind,
};
use git2::{build::TreeUpdateBuilder, Delta, ErrorClass, ErrorCode, ObjectType, Oid};
use std::cell::RefCell;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Credential material handed in by the caller; never persisted here.
#[derive(Debug, Clone)]
pub enum Credentials {
    Token { username: String, token: String },
    SshAgent,
    Default,
}

/// A local clone whose `origin` remote is the sync target.
///
/// Pushes go through a private `refs/buildsync/<branch>` ref so the checked-out
/// branch of the clone is never touched.
pub struct GitRepository {
    id: String,
    path: PathBuf,
    remote: String,
    credentials: Credentials,
    author_name: String,
    author_email: String,
}

impl GitRepository {
    pub fn open(id: impl Into<String>, path: impl Into<PathBuf>) -> RepoResult<Self> {
        let path = path.into();
        git2::Repository::open(&path).map_err(map_git)?;
        Ok(Self {
            id: id.into(),
            path,
            remote: "origin".to_string(),
            credentials: Credentials::Default,
            author_name: "buildsync".to_string(),
            author_email: "buildsync@localhost".to_string(),
        })
    }

    pub fn with_credentials(mut self, credentials: Credentials) -> Self {
        self.credentials = credentials;
        self
    }

    pub fn with_remote(mut self, remote: impl Into<String>) -> Self {
        self.remote = remote.into();
        self
    }

    pub fn with_author(mut self, name: impl Into<String>, email: impl Into<String>) -> Self {
        self.author_name = name.into();
        self.author_email = email.into();
        self
    }

    fn repo(&self) -> RepoResult<git2::Repository> {
        git2::Repository::open(&self.path).map_err(map_git)
    }

    fn tracking_ref(&self, branch: &str) -> String {
        format!("refs/remotes/{}/{}", self.remote, branch)
    }

    fn tree_at<'r>(repo: &'r git2::Repository, commit: &str) -> RepoResult<git2::Tree<'r>> {
        let oid = Oid::from_str(commit).map_err(map_git)?;
        repo.find_commit(oid)
            .and_then(|c| c.tree())
            .map_err(map_git)
    }
}

fn callbacks<'a>(credentials: &Credentials) -> git2::RemoteCallbacks<'a> {
    let credentials = credentials.clone();
    let mut callbacks = git2::RemoteCallbacks::new();
    callbacks.credentials(move |_url, username_from_url, allowed| match &credentials {
        Credentials::Token { username, token } if allowed.is_user_pass_plaintext() => {
            git2::Cred::userpass_plaintext(username, token)
        }
        Credentials::SshAgent if allowed.is_ssh_key() => {
            git2::Cred::ssh_key_from_agent(username_from_url.unwrap_or("git"))
        }
        _ => git2::Cred::default(),
    });
    callbacks
}

fn map_git(err: git2::Error) -> RepositoryError {
    let kind = match (err.code(), err.class()) {
        (ErrorCode::Auth, _) | (ErrorCode::Certificate, _) => RepositoryErrorKind::Authentication,
        (ErrorCode::NotFound, _) => RepositoryErrorKind::NotFound,
        (ErrorCode::NotFastForward, _) => RepositoryErrorKind::Rejected,
        (ErrorCode::Locked, _) => RepositoryErrorKind::Transient,
        (_, ErrorClass::Net) | (_, ErrorClass::Http) | (_, ErrorClass::Ssh) => {
            RepositoryErrorKind::Transient
        }
        _ => RepositoryErrorKind::Other,
    };
    RepositoryError::new(kind, err.message())
}

fn path_string(path: Option<&Path>) -> Option<String> {
    path.map(|p| p.to_string_lossy().replace('\\', "/"))
}

impl Repository for GitRepository {
    fn id(&self) -> &str {
        &self.id
    }

    fn fetch(&self, branch: &str) -> RepoResult<FetchedTree> {
        let repo = self.repo()?;
        let mut remote = repo.find_remote(&self.remote).map_err(map_git)?;
        let refspec = format!("+refs/heads/{}:{}", branch, self.tracking_ref(branch));

        let mut options = git2::FetchOptions::new();
        options.remote_callbacks(callbacks(&self.credentials));
        remote
            .fetch(&[refspec.as_str()], Some(&mut options), None)
            .map_err(map_git)?;

        let oid = repo
            .refname_to_id(&self.tracking_ref(branch))
            .map_err(map_git)?;
        let tree = repo
            .find_commit(oid)
            .and_then(|c| c.tree())
            .map_err(map_git)?;

        let mut paths = Vec::new();
        tree.walk(git2::TreeWalkMode::PreOrder, |root, entry| {
            if entry.kind() == Some(ObjectType::Blob) {
                if let Some(name) = entry.name() {
                    paths.push(format!("{}{}", root, name));
                }
            }
            git2::TreeWalkResult::Ok
        })
        .map_err(map_git)?;
        paths.sort();

        debug!(branch, commit = %oid, files = paths.len(), "fetched remote tree");
        Ok(FetchedTree {
            commit: oid.to_string(),
            paths,
        })
    }

    fn diff_tree(&self, from_commit: &str, to_commit: &str) -> RepoResult<Vec<PathChange>> {
        let repo = self.repo()?;
        let from = Self::tree_at(&repo, from_commit)?;
        let to = Self::tree_at(&repo, to_commit)?;
        let diff = repo
            .diff_tree_to_tree(Some(&from), Some(&to), None)
            .map_err(map_git)?;

        let mut changes = Vec::new();
        for delta in diff.deltas() {
            let old_path = path_string(delta.old_file().path());
            let new_path = path_string(delta.new_file().path());
            let mut push = |path: Option<String>, kind| {
                if let Some(path) = path {
                    changes.push(PathChange { path, kind });
                }
            };
            match delta.status() {
                Delta::Added | Delta::Copied => push(new_path, PathChangeKind::Added),
                Delta::Deleted => push(old_path, PathChangeKind::Removed),
                Delta::Modified | Delta::Typechange => push(new_path, PathChangeKind::Modified),
                Delta::Renamed => {
                    push(old_path, PathChangeKind::Removed);
                    push(new_path, PathChangeKind::Added);
                }
                _ => {}
            }
        }
        changes.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(changes)
    }

    fn read_file(&self, commit: &str, path: &str) -> RepoResult<Vec<u8>> {
        let repo = self.repo()?;
        let tree = Self::tree_at(&repo, commit)?;
        let entry = tree.get_path(Path::new(path)).map_err(map_git)?;
        let blob = entry
            .to_object(&repo)
            .and_then(|o| o.peel_to_blob())
            .map_err(map_git)?;
        Ok(blob.content().to_vec())
    }

    fn commit_and_push(
        &self,
        branch: &str,
        changes: &[FileChange],
        message: &str,
    ) -> RepoResult<String> {
        let repo = self.repo()?;
        let tracking = self.tracking_ref(branch);
        let parent = match repo.refname_to_id(&tracking) {
            Ok(oid) => Some(repo.find_commit(oid).map_err(map_git)?),
            Err(_) => None,
        };

        let base_tree = match &parent {
            Some(commit) => commit.tree().map_err(map_git)?,
            None => {
                let empty = repo
                    .treebuilder(None)
                    .and_then(|b| b.write())
                    .map_err(map_git)?;
                repo.find_tree(empty).map_err(map_git)?
            }
        };

        let mut builder = TreeUpdateBuilder::new();
        for change in changes {
            match change {
                FileChange::Write { path, contents } => {
                    let blob = repo.blob(contents).map_err(map_git)?;
                    builder.upsert(path.as_str(), blob, git2::FileMode::Blob);
                }
                FileChange::Delete { path } => {
                    builder.remove(path.as_str());
                }
            }
        }
        let tree_oid = builder.create_updated(&repo, &base_tree).map_err(map_git)?;
        let tree = repo.find_tree(tree_oid).map_err(map_git)?;

        let signature =
            git2::Signature::now(&self.author_name, &self.author_email).map_err(map_git)?;
        let parents: Vec<&git2::Commit> = parent.iter().collect();
        let oid = repo
            .commit(None, &signature, &signature, message, &tree, &parents)
            .map_err(map_git)?;

        let push_ref = format!("refs/buildsync/{}", branch);
        repo.reference(&push_ref, oid, true, message)
            .map_err(map_git)?;

        let rejection: RefCell<Option<String>> = RefCell::new(None);
        {
            let mut remote = repo.find_remote(&self.remote).map_err(map_git)?;
            let mut remote_callbacks = callbacks(&self.credentials);
            remote_callbacks.push_update_reference(|_refname, status| {
                if let Some(msg) = status {
                    *rejection.borrow_mut() = Some(msg.to_string());
                }
                Ok(())
            });
            let mut options = git2::PushOptions::new();
            options.remote_callbacks(remote_callbacks);

            let refspec = format!("{}:refs/heads/{}", push_ref, branch);
            remote
                .push(&[refspec.as_str()], Some(&mut options))
                .map_err(map_git)?;
        }
        if let Some(msg) = rejection.into_inner() {
            return Err(RepositoryError::new(RepositoryErrorKind::Rejected, msg));
        }

        repo.reference(&tracking, oid, true, "buildsync push")
            .map_err(map_git)?;
        Ok(oid.to_string())
    }

    fn capabilities(&self) -> Capabilities {
        let can_push = self
            .repo()
            .ok()
            .and_then(|repo| {
                let remote = repo.find_remote(&self.remote).ok()?;
                let has_url = remote.pushurl().or(remote.url()).is_some();
                Some(has_url)
            })
            .unwrap_or(false);
        Capabilities {
            can_push,
            can_create_pr: false,
        }
    }
}

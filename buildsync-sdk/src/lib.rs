//! # buildsync-sdk
//!
//! Blocking client for the buildsync server.
//!
//! ## Example
//!
//! ```no_run
//! use buildsync_sdk::BuildsyncClient;
//! use buildsync_core::EntityState;
//!
//! let client = BuildsyncClient::new("http://localhost:3030", "etl-bot");
//!
//! let entity = client
//!     .create_entity("orders", EntityState::default().with_status("draft"))
//!     .unwrap();
//! client
//!     .edit(&entity.id, 1, &EntityState::default().with_status("published"))
//!     .unwrap();
//!
//! let report = client.pull("analytics", "main").unwrap();
//! println!("{} builds from {:?}", report.builds_created(), report.commit);
//! ```

use anyhow::{bail, Result};
use buildsync_core::sync::PushOutcome;
use buildsync_core::{
    Build, ConflictReport, DiffRecord, Entity, EntityState, GitLink, Resolution, SyncReport,
    VersionRequest,
};
use reqwest::blocking::{RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Clone)]
pub struct BuildsyncClient {
    base_url: String,
    author: String,
    client: reqwest::blocking::Client,
}

#[derive(Serialize)]
struct CreateEntityRequest<'a> {
    name: &'a str,
    state: &'a EntityState,
    author: &'a str,
}

#[derive(Deserialize)]
struct CreatedEntity {
    entity: Entity,
}

#[derive(Serialize)]
struct EditRequest<'a> {
    expected_version: u32,
    state: &'a EntityState,
    author: &'a str,
}

#[derive(Serialize)]
struct RollbackRequest<'a> {
    target_version: u32,
    author: &'a str,
}

#[derive(Serialize)]
struct ResolveRequest<'a> {
    resolution: Resolution,
    author: &'a str,
}

#[derive(Serialize)]
struct LinkRequest<'a> {
    repo_id: &'a str,
    branch: &'a str,
    path: &'a str,
}

#[derive(Serialize)]
struct PullRequest<'a> {
    branch: &'a str,
}

#[derive(Serialize)]
struct PushRequest<'a> {
    branch: &'a str,
    entity_ids: &'a [Uuid],
}

/// Error payload returned by the server for any failed request.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerError {
    pub kind: String,
    pub error: String,
}

/// One entry of a bulk append response.
#[derive(Debug, Clone, Deserialize)]
pub struct BulkItem {
    pub entity_id: Uuid,
    pub build: Option<Build>,
    pub error: Option<ServerError>,
}

impl BuildsyncClient {
    /// Create a new client
    ///
    /// # Arguments
    ///
    /// * `base_url` - Base URL of the buildsync server (e.g., "http://localhost:3030")
    /// * `author` - Recorded as the author of every build this client creates
    pub fn new(base_url: impl Into<String>, author: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            author: author.into(),
            client: reqwest::blocking::Client::new(),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.base_url, path)
    }

    fn send<T: DeserializeOwned>(&self, request: RequestBuilder) -> Result<T> {
        let response = request.send()?;
        Self::decode(response)
    }

    fn decode<T: DeserializeOwned>(response: Response) -> Result<T> {
        let status = response.status();
        if status.is_success() {
            return Ok(response.json()?);
        }
        match response.json::<ServerError>() {
            Ok(err) => bail!("{} ({}): {}", status, err.kind, err.error),
            Err(_) => bail!("request failed with status {}", status),
        }
    }

    pub fn list_entities(&self) -> Result<Vec<Entity>> {
        self.send(self.client.get(self.url("/entities")))
    }

    pub fn get_entity(&self, id: &Uuid) -> Result<Entity> {
        self.send(self.client.get(self.url(&format!("/entities/{}", id))))
    }

    /// Create an entity with its first version
    pub fn create_entity(&self, name: &str, state: EntityState) -> Result<Entity> {
        let request = CreateEntityRequest {
            name,
            state: &state,
            author: &self.author,
        };
        let created: CreatedEntity =
            self.send(self.client.post(self.url("/entities")).json(&request))?;
        Ok(created.entity)
    }

    /// Replace the entity's state, based on `expected_version`
    pub fn edit(&self, id: &Uuid, expected_version: u32, state: &EntityState) -> Result<Build> {
        let request = EditRequest {
            expected_version,
            state,
            author: &self.author,
        };
        self.send(
            self.client
                .put(self.url(&format!("/entities/{}", id)))
                .json(&request),
        )
    }

    pub fn list_versions(&self, id: &Uuid) -> Result<Vec<Build>> {
        self.send(self.client.get(self.url(&format!("/entities/{}/versions", id))))
    }

    pub fn get_contents(&self, id: &Uuid, version: u32) -> Result<EntityState> {
        self.send(
            self.client
                .get(self.url(&format!("/entities/{}/versions/{}", id, version))),
        )
    }

    pub fn diff(&self, id: &Uuid, from: u32, to: u32) -> Result<DiffRecord> {
        self.send(
            self.client
                .get(self.url(&format!("/entities/{}/diff", id)))
                .query(&[("from", from), ("to", to)]),
        )
    }

    pub fn rollback(&self, id: &Uuid, target_version: u32) -> Result<Build> {
        let request = RollbackRequest {
            target_version,
            author: &self.author,
        };
        self.send(
            self.client
                .post(self.url(&format!("/entities/{}/rollback", id)))
                .json(&request),
        )
    }

    /// Append many versions; each request succeeds or fails on its own
    pub fn bulk_create(&self, requests: &[VersionRequest]) -> Result<Vec<BulkItem>> {
        self.send(self.client.post(self.url("/builds/bulk")).json(requests))
    }

    pub fn finalize(&self, build_id: &Uuid) -> Result<Build> {
        self.send(
            self.client
                .post(self.url(&format!("/builds/{}/finalize", build_id))),
        )
    }

    pub fn pull(&self, repo_id: &str, branch: &str) -> Result<SyncReport> {
        self.send(
            self.client
                .post(self.url(&format!("/repos/{}/pull", repo_id)))
                .json(&PullRequest { branch }),
        )
    }

    pub fn push(&self, repo_id: &str, branch: &str, entity_ids: &[Uuid]) -> Result<PushOutcome> {
        self.send(
            self.client
                .post(self.url(&format!("/repos/{}/push", repo_id)))
                .json(&PushRequest { branch, entity_ids }),
        )
    }

    pub fn conflicts(&self) -> Result<Vec<ConflictReport>> {
        self.send(self.client.get(self.url("/conflicts")))
    }

    pub fn resolve(&self, id: &Uuid, resolution: Resolution) -> Result<Option<Build>> {
        let request = ResolveRequest {
            resolution,
            author: &self.author,
        };
        self.send(
            self.client
                .post(self.url(&format!("/entities/{}/resolve", id)))
                .json(&request),
        )
    }

    pub fn link(&self, id: &Uuid, repo_id: &str, branch: &str, path: &str) -> Result<GitLink> {
        self.send(
            self.client
                .post(self.url(&format!("/entities/{}/link", id)))
                .json(&LinkRequest {
                    repo_id,
                    branch,
                    path,
                }),
        )
    }

    pub fn unlink(&self, id: &Uuid) -> Result<GitLink> {
        self.send(
            self.client
                .delete(self.url(&format!("/entities/{}/link", id))),
        )
    }

    /// Check server health
    pub fn health_check(&self) -> Result<bool> {
        let response = self.client.get(self.url("/health")).send()?;
        Ok(response.status().is_success())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_creation() {
        let client = BuildsyncClient::new("http://localhost:3030/", "etl-bot");
        assert_eq!(client.base_url, "http://localhost:3030");
        assert_eq!(client.author, "etl-bot");
        assert_eq!(
            client.url("/entities"),
            "http://localhost:3030/entities"
        );
    }

    #[test]
    fn test_server_error_shape() {
        let err: ServerError =
            serde_json::from_str(r#"{"kind":"concurrent_version","error":"stale"}"#).unwrap();
        assert_eq!(err.kind, "concurrent_version");
    }
}

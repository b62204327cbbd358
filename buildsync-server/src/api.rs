use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use buildsync_core::{
    Build, ConflictReport, DiffRecord, Entity, EntityState, Error, GitLink, GitSyncOrchestrator,
    Repository, Resolution, RollbackManager, SyncReport, VersionRequest, VersionStore,
};
use buildsync_core::sync::PushOutcome;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};
use thiserror::Error as ThisError;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<Mutex<VersionStore>>,
    pub sync: Arc<GitSyncOrchestrator>,
    pub repositories: Arc<HashMap<String, Arc<dyn Repository>>>,
    /// Cancelled on shutdown; running pulls stop after the current file.
    pub shutdown: CancellationToken,
}

impl AppState {
    fn store(&self) -> MutexGuard<'_, VersionStore> {
        self.store.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn repository(&self, repo_id: &str) -> Result<Arc<dyn Repository>, ApiError> {
        self.repositories.get(repo_id).cloned().ok_or_else(|| {
            ApiError::new(
                StatusCode::NOT_FOUND,
                "not_found",
                format!("Unknown repository: {}", repo_id),
            )
        })
    }
}

#[derive(Debug, ThisError)]
#[error("{message}")]
pub struct ApiError {
    pub status: StatusCode,
    pub kind: &'static str,
    pub message: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorBody {
    pub kind: String,
    pub error: String,
}

impl ApiError {
    pub fn new(status: StatusCode, kind: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            kind,
            message: message.into(),
        }
    }

    fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "bad_request", message)
    }

    fn body(&self) -> ErrorBody {
        ErrorBody {
            kind: self.kind.to_string(),
            error: self.message.clone(),
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        let (status, kind) = match &err {
            e if e.is_not_found() => (StatusCode::NOT_FOUND, "not_found"),
            Error::ConcurrentVersion { .. } => (StatusCode::CONFLICT, "concurrent_version"),
            Error::DiffMismatch { .. } => (StatusCode::CONFLICT, "diff_mismatch"),
            Error::SyncInProgress(_) => (StatusCode::CONFLICT, "sync_in_progress"),
            Error::InvalidOperation(_) => (StatusCode::CONFLICT, "invalid_operation"),
            Error::Frontmatter(_) => (StatusCode::UNPROCESSABLE_ENTITY, "frontmatter"),
            Error::Unsupported(_) => (StatusCode::NOT_IMPLEMENTED, "unsupported"),
            Error::RepositoryAccess(_) => (StatusCode::BAD_GATEWAY, "repository_access"),
            _ => (StatusCode::INTERNAL_SERVER_ERROR, "internal"),
        };
        Self::new(status, kind, err.to_string())
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, "internal", err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status, Json(self.body())).into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health_check))
        .route("/entities", get(list_entities).post(create_entity))
        .route("/entities/:id", get(get_entity).put(edit_entity))
        .route("/entities/:id/versions", get(list_versions))
        .route("/entities/:id/versions/:version", get(get_contents))
        .route("/entities/:id/diff", get(diff_versions))
        .route("/entities/:id/rollback", post(rollback))
        .route("/entities/:id/resolve", post(resolve_conflict))
        .route("/entities/:id/link", post(link_entity).delete(unlink_entity))
        .route("/builds/bulk", post(bulk_create))
        .route("/builds/:id/finalize", post(finalize_build))
        .route("/conflicts", get(list_conflicts))
        .route("/repos/:repo/pull", post(pull))
        .route("/repos/:repo/push", post(push))
        .with_state(state)
}

fn parse_id(id: &str) -> Result<Uuid, ApiError> {
    Uuid::parse_str(id).map_err(|_| ApiError::bad_request("Invalid UUID"))
}

async fn health_check() -> impl IntoResponse {
    Json(serde_json::json!({"status": "ok"}))
}

async fn list_entities(State(state): State<AppState>) -> ApiResult<Vec<Entity>> {
    Ok(Json(state.store().list_entities()?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreateEntityRequest {
    pub name: String,
    #[serde(default)]
    pub state: EntityState,
    pub author: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CreatedEntity {
    pub entity: Entity,
    pub build: Build,
}

async fn create_entity(
    State(state): State<AppState>,
    Json(req): Json<CreateEntityRequest>,
) -> Result<(StatusCode, Json<CreatedEntity>), ApiError> {
    let (entity, build) = state.store().create_entity(
        &req.name,
        req.state,
        buildsync_core::BuildSource::Manual,
        &req.author,
    )?;
    Ok((StatusCode::CREATED, Json(CreatedEntity { entity, build })))
}

async fn get_entity(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Entity> {
    let id = parse_id(&id)?;
    Ok(Json(state.store().get_entity(&id)?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct EditRequest {
    pub expected_version: u32,
    pub state: EntityState,
    pub author: String,
}

async fn edit_entity(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<EditRequest>,
) -> ApiResult<Build> {
    let id = parse_id(&id)?;
    let build = state
        .store()
        .edit(&id, req.expected_version, &req.state, &req.author)?;
    Ok(Json(build))
}

async fn list_versions(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<Vec<Build>> {
    let id = parse_id(&id)?;
    Ok(Json(state.store().list_versions(&id)?))
}

async fn get_contents(
    State(state): State<AppState>,
    Path((id, version)): Path<(String, u32)>,
) -> ApiResult<EntityState> {
    let id = parse_id(&id)?;
    Ok(Json(state.store().get_contents(&id, version)?))
}

#[derive(Debug, Deserialize)]
struct DiffQuery {
    from: u32,
    to: u32,
}

async fn diff_versions(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<DiffQuery>,
) -> ApiResult<DiffRecord> {
    let id = parse_id(&id)?;
    Ok(Json(state.store().diff_versions(&id, query.from, query.to)?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct RollbackRequest {
    pub target_version: u32,
    pub author: String,
}

async fn rollback(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<RollbackRequest>,
) -> ApiResult<Build> {
    let id = parse_id(&id)?;
    let store = state.store();
    let build = RollbackManager::new(&store).rollback(&id, req.target_version, &req.author)?;
    Ok(Json(build))
}

/// Outcome for one request of a bulk append, in request order.
#[derive(Debug, Serialize, Deserialize)]
pub struct BulkItem {
    pub entity_id: Uuid,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub build: Option<Build>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<ErrorBody>,
}

async fn bulk_create(
    State(state): State<AppState>,
    Json(requests): Json<Vec<VersionRequest>>,
) -> ApiResult<Vec<BulkItem>> {
    let results = state.store().bulk_create(&requests);
    let items = requests
        .iter()
        .zip(results)
        .map(|(request, result)| match result {
            Ok(build) => BulkItem {
                entity_id: request.entity_id,
                build: Some(build),
                error: None,
            },
            Err(err) => BulkItem {
                entity_id: request.entity_id,
                build: None,
                error: Some(ApiError::from(err).body()),
            },
        })
        .collect();
    Ok(Json(items))
}

async fn finalize_build(State(state): State<AppState>, Path(id): Path<String>) -> ApiResult<Build> {
    let id = parse_id(&id)?;
    Ok(Json(state.store().finalize(&id)?))
}

async fn list_conflicts(State(state): State<AppState>) -> ApiResult<Vec<ConflictReport>> {
    Ok(Json(state.sync.list_conflicts()?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ResolveRequest {
    pub resolution: Resolution,
    pub author: String,
}

async fn resolve_conflict(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<ResolveRequest>,
) -> ApiResult<Option<Build>> {
    let id = parse_id(&id)?;
    Ok(Json(state.sync.resolve_conflict(&id, req.resolution, &req.author)?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct LinkRequest {
    pub repo_id: String,
    pub branch: String,
    pub path: String,
}

async fn link_entity(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<LinkRequest>,
) -> ApiResult<GitLink> {
    let id = parse_id(&id)?;
    Ok(Json(state.sync.link(&id, &req.repo_id, &req.branch, &req.path)?))
}

async fn unlink_entity(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> ApiResult<GitLink> {
    let id = parse_id(&id)?;
    Ok(Json(state.sync.unlink(&id)?))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PullRequest {
    pub branch: String,
}

async fn pull(
    State(state): State<AppState>,
    Path(repo_id): Path<String>,
    Json(req): Json<PullRequest>,
) -> ApiResult<SyncReport> {
    let repo = state.repository(&repo_id)?;
    let sync = Arc::clone(&state.sync);
    let cancel = state.shutdown.child_token();

    let report =
        tokio::task::spawn_blocking(move || sync.pull(repo.as_ref(), &req.branch, &cancel))
            .await??;
    Ok(Json(report))
}

#[derive(Debug, Serialize, Deserialize)]
pub struct PushRequest {
    pub branch: String,
    pub entity_ids: Vec<Uuid>,
}

async fn push(
    State(state): State<AppState>,
    Path(repo_id): Path<String>,
    Json(req): Json<PushRequest>,
) -> ApiResult<PushOutcome> {
    let repo = state.repository(&repo_id)?;
    let sync = Arc::clone(&state.sync);

    let outcome =
        tokio::task::spawn_blocking(move || sync.push(repo.as_ref(), &req.entity_ids, &req.branch))
            .await??;
    Ok(Json(outcome))
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::{to_bytes, Body};
    use axum::http::{header, Request};
    use buildsync_core::{ManualClock, MemoryRepository, Storage, SyncConfig, VersioningConfig};
    use chrono::Utc;
    use serde::de::DeserializeOwned;
    use tower::ServiceExt;

    fn state_with(repo: Arc<MemoryRepository>) -> AppState {
        let versioning = VersioningConfig {
            idle_window_secs: 0,
            ..VersioningConfig::default()
        };
        let store = Arc::new(Mutex::new(VersionStore::new(
            Storage::in_memory().unwrap(),
            Arc::new(ManualClock::new(Utc::now())),
            versioning,
        )));
        let sync = GitSyncOrchestrator::new(
            Arc::clone(&store),
            SyncConfig {
                backoff_base_ms: 1,
                ..SyncConfig::default()
            },
        );
        let mut repositories: HashMap<String, Arc<dyn Repository>> = HashMap::new();
        repositories.insert("analytics".to_string(), repo);
        AppState {
            store,
            sync: Arc::new(sync),
            repositories: Arc::new(repositories),
            shutdown: CancellationToken::new(),
        }
    }

    fn state() -> AppState {
        state_with(Arc::new(MemoryRepository::new("analytics")))
    }

    async fn send<T: DeserializeOwned>(
        app: &Router,
        method: &str,
        uri: &str,
        body: Option<serde_json::Value>,
    ) -> (StatusCode, T) {
        let request = Request::builder().method(method).uri(uri);
        let request = match body {
            Some(json) => request
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => request.body(Body::empty()).unwrap(),
        };
        let response = app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        (status, serde_json::from_slice(&bytes).unwrap())
    }

    async fn create(app: &Router, name: &str, status: &str) -> Uuid {
        let (code, created): (_, CreatedEntity) = send(
            app,
            "POST",
            "/entities",
            Some(serde_json::json!({
                "name": name,
                "state": { "status": status },
                "author": "alice",
            })),
        )
        .await;
        assert_eq!(code, StatusCode::CREATED);
        created.entity.id
    }

    #[tokio::test]
    async fn test_health_check() {
        let app = create_router(state());
        let (status, body): (_, serde_json::Value) = send(&app, "GET", "/health", None).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_edit_history_and_rollback() {
        let app = create_router(state());
        let id = create(&app, "orders", "draft").await;

        let (status, build): (_, Build) = send(
            &app,
            "PUT",
            &format!("/entities/{}", id),
            Some(serde_json::json!({
                "expected_version": 1,
                "state": { "status": "published" },
                "author": "alice",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(build.version, 2);

        let (_, diff): (_, DiffRecord) =
            send(&app, "GET", &format!("/entities/{}/diff?from=1&to=2", id), None).await;
        assert_eq!(diff.len(), 1);

        let (status, build): (_, Build) = send(
            &app,
            "POST",
            &format!("/entities/{}/rollback", id),
            Some(serde_json::json!({ "target_version": 1, "author": "bob" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(build.rollback_of, Some(1));
        assert_eq!(build.snapshot.status.as_deref(), Some("draft"));

        let (_, versions): (_, Vec<Build>) =
            send(&app, "GET", &format!("/entities/{}/versions", id), None).await;
        assert_eq!(versions.len(), 3);

        let (_, contents): (_, EntityState) =
            send(&app, "GET", &format!("/entities/{}/versions/2", id), None).await;
        assert_eq!(contents.status.as_deref(), Some("published"));
    }

    #[tokio::test]
    async fn test_error_status_mapping() {
        let app = create_router(state());
        let id = create(&app, "orders", "draft").await;

        let (status, body): (_, ErrorBody) = send(
            &app,
            "PUT",
            &format!("/entities/{}", id),
            Some(serde_json::json!({
                "expected_version": 5,
                "state": { "status": "published" },
                "author": "alice",
            })),
        )
        .await;
        assert_eq!(status, StatusCode::CONFLICT);
        assert_eq!(body.kind, "concurrent_version");

        let (status, body): (_, ErrorBody) =
            send(&app, "GET", &format!("/entities/{}/versions/9", id), None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.kind, "not_found");

        let (status, _): (_, ErrorBody) = send(&app, "GET", "/entities/not-a-uuid", None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn test_bulk_reports_each_request() {
        let app = create_router(state());
        let first = create(&app, "orders", "draft").await;
        let second = create(&app, "customers", "draft").await;

        let change = serde_json::json!({
            "changes": [{
                "field": "status",
                "kind": "modified",
                "old": "draft",
                "new": "published"
            }]
        });
        let (status, items): (_, Vec<BulkItem>) = send(
            &app,
            "POST",
            "/builds/bulk",
            Some(serde_json::json!([
                { "entity_id": first, "expected_version": 1, "diff": change, "source": "manual", "author": "alice" },
                { "entity_id": second, "expected_version": 4, "diff": change, "source": "manual", "author": "alice" },
            ])),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(items[0].build.as_ref().map(|b| b.version), Some(2));
        assert_eq!(
            items[1].error.as_ref().map(|e| e.kind.as_str()),
            Some("concurrent_version")
        );
    }

    #[tokio::test]
    async fn test_pull_and_push_through_api() {
        let repo = Arc::new(MemoryRepository::new("analytics"));
        repo.write_file("main", "models/orders.sql", "---\nstatus: draft\n---\nselect 1\n");
        let app = create_router(state_with(Arc::clone(&repo)));

        let (status, report): (_, SyncReport) = send(
            &app,
            "POST",
            "/repos/analytics/pull",
            Some(serde_json::json!({ "branch": "main" })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(report.builds_created(), 1);

        let id = create(&app, "customers", "draft").await;
        let (status, outcome): (_, PushOutcome) = send(
            &app,
            "POST",
            "/repos/analytics/push",
            Some(serde_json::json!({ "branch": "main", "entity_ids": [id] })),
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(outcome.pushed, vec![id]);
        assert!(repo.file_at_head("main", "models/customers.sql").is_some());

        let (status, body): (_, ErrorBody) = send(
            &app,
            "POST",
            "/repos/elsewhere/pull",
            Some(serde_json::json!({ "branch": "main" })),
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        assert_eq!(body.kind, "not_found");
    }
}

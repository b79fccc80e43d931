//! REST API handlers for workloads, groups and clusters.
//!
//! Each handler calls into the orchestrator and returns a JSON envelope.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use tracing::debug;

use accelgrid_orchestrator::{GridError, GroupSpec};
use accelgrid_state::{ScalingAction, WorkloadRequirement};

use crate::ApiState;

/// Response wrapper for consistent API format.
#[derive(serde::Serialize)]
pub(crate) struct ApiResponse<T: serde::Serialize> {
    success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<String>,
}

impl<T: serde::Serialize> ApiResponse<T> {
    pub(crate) fn ok(data: T) -> Json<Self> {
        Json(Self {
            success: true,
            data: Some(data),
            error: None,
        })
    }
}

pub(crate) fn error_response(msg: &str, status: StatusCode) -> impl IntoResponse {
    (
        status,
        Json(ApiResponse::<()> {
            success: false,
            data: None,
            error: Some(msg.to_string()),
        }),
    )
}

/// HTTP status for an orchestrator error.
pub(crate) fn status_for(e: &GridError) -> StatusCode {
    match e {
        GridError::Validation(_) => StatusCode::BAD_REQUEST,
        GridError::NotFound(_) => StatusCode::NOT_FOUND,
        GridError::Busy(_)
        | GridError::Conflict(_)
        | GridError::CooldownActive { .. }
        | GridError::InvalidTransition { .. } => StatusCode::CONFLICT,
        GridError::Capacity(_) | GridError::BudgetViolation { .. } => {
            StatusCode::UNPROCESSABLE_ENTITY
        }
        GridError::Provisioning { .. } => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

pub(crate) fn grid_error(e: GridError) -> Response {
    let status = status_for(&e);
    debug!(%status, error = %e, "request failed");
    error_response(&e.to_string(), status).into_response()
}

/// `?force=true` on deletes.
#[derive(Debug, Default, serde::Deserialize)]
pub struct ForceQuery {
    #[serde(default)]
    pub force: bool,
}

/// Body of `POST /groups/{id}/scale`.
#[derive(Debug, serde::Deserialize)]
pub struct ScaleGroupRequest {
    pub target_clusters: u32,
    #[serde(default)]
    pub force: bool,
}

/// Body of `POST /groups/{id}/clusters`; the group's node count if empty.
#[derive(Debug, Default, serde::Deserialize)]
pub struct AddClusterRequest {
    #[serde(default)]
    pub node_count: Option<u32>,
}

#[derive(Debug, serde::Deserialize)]
pub struct MigrateRequest {
    pub target_cluster: String,
}

// ── Workloads ──────────────────────────────────────────────────

/// POST /api/v1/workloads
pub async fn submit_workload(
    State(state): State<ApiState>,
    Json(req): Json<WorkloadRequirement>,
) -> impl IntoResponse {
    match state.orchestrator.submit_workload(req).await {
        Ok(decision) => {
            // Reuse is immediate; everything else waits on the provider.
            let status = match decision.action {
                ScalingAction::Reuse => StatusCode::OK,
                _ => StatusCode::ACCEPTED,
            };
            (status, ApiResponse::ok(decision)).into_response()
        }
        Err(e) => grid_error(e),
    }
}

/// POST /api/v1/workloads/evaluate
pub async fn evaluate_workload(
    State(state): State<ApiState>,
    Json(req): Json<WorkloadRequirement>,
) -> impl IntoResponse {
    match state.orchestrator.evaluate(&req) {
        Ok(decision) => ApiResponse::ok(decision).into_response(),
        Err(e) => grid_error(e),
    }
}

/// DELETE /api/v1/workloads/:id
pub async fn complete_workload(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.complete_workload(&id) {
        Ok(cluster_id) => ApiResponse::ok(serde_json::json!({
            "workload_id": id,
            "cluster_id": cluster_id,
        }))
        .into_response(),
        Err(e) => grid_error(e),
    }
}

/// POST /api/v1/workloads/:id/migrate
pub async fn migrate_workload(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<MigrateRequest>,
) -> impl IntoResponse {
    match state.orchestrator.migrate_workload(&id, &req.target_cluster) {
        Ok(migration) => ApiResponse::ok(migration).into_response(),
        Err(e) => grid_error(e),
    }
}

// ── Groups ─────────────────────────────────────────────────────

/// POST /api/v1/groups
pub async fn create_group(
    State(state): State<ApiState>,
    Json(spec): Json<GroupSpec>,
) -> impl IntoResponse {
    match state.orchestrator.create_group(spec).await {
        Ok(summary) => (StatusCode::CREATED, ApiResponse::ok(summary)).into_response(),
        Err(e) => grid_error(e),
    }
}

/// POST /api/v1/groups/:id/scale
pub async fn scale_group(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<ScaleGroupRequest>,
) -> impl IntoResponse {
    match state
        .orchestrator
        .scale_group(&id, req.target_clusters, req.force)
        .await
    {
        Ok(decisions) => (StatusCode::ACCEPTED, ApiResponse::ok(decisions)).into_response(),
        Err(e) => grid_error(e),
    }
}

/// POST /api/v1/groups/:id/clusters
pub async fn add_cluster(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Json(req): Json<AddClusterRequest>,
) -> impl IntoResponse {
    match state.orchestrator.add_cluster(&id, req.node_count).await {
        Ok(decision) => (StatusCode::ACCEPTED, ApiResponse::ok(decision)).into_response(),
        Err(e) => grid_error(e),
    }
}

/// POST /api/v1/groups/:id/consolidate
pub async fn consolidate_group(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.consolidate_group(&id).await {
        Ok(decisions) => (StatusCode::ACCEPTED, ApiResponse::ok(decisions)).into_response(),
        Err(e) => grid_error(e),
    }
}

/// GET /api/v1/groups
pub async fn list_groups(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.orchestrator.list_groups())
}

/// GET /api/v1/groups/:id
pub async fn get_group(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.get_group_status(&id) {
        Ok(summary) => ApiResponse::ok(summary).into_response(),
        Err(e) => grid_error(e),
    }
}

/// DELETE /api/v1/groups/:id
pub async fn delete_group(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(q): Query<ForceQuery>,
) -> impl IntoResponse {
    match state.orchestrator.delete_group(&id, q.force).await {
        Ok(decisions) => (StatusCode::ACCEPTED, ApiResponse::ok(decisions)).into_response(),
        Err(e) => grid_error(e),
    }
}

// ── Clusters ───────────────────────────────────────────────────

/// GET /api/v1/clusters/:id
pub async fn get_cluster(
    State(state): State<ApiState>,
    Path(id): Path<String>,
) -> impl IntoResponse {
    match state.orchestrator.get_cluster(&id) {
        Ok(cluster) => ApiResponse::ok(cluster).into_response(),
        Err(e) => grid_error(e),
    }
}

/// DELETE /api/v1/clusters/:id
pub async fn delete_cluster(
    State(state): State<ApiState>,
    Path(id): Path<String>,
    Query(q): Query<ForceQuery>,
) -> impl IntoResponse {
    match state.orchestrator.request_delete(&id, q.force).await {
        Ok(decision) => (StatusCode::ACCEPTED, ApiResponse::ok(decision)).into_response(),
        Err(e) => grid_error(e),
    }
}

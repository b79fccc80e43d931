//! Read-only status endpoints and the provider callback.

use axum::Json;
use axum::extract::{Path, Query, State};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use tracing::info;

use accelgrid_provision::ProvisionPhase;

use crate::ApiState;
use crate::handlers::{ApiResponse, grid_error};

#[derive(Debug, Default, serde::Deserialize)]
pub struct AuditQuery {
    /// Only records with a higher sequence number.
    pub since: Option<u64>,
}

/// GET /healthz
pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, "ok")
}

/// GET /api/v1/power
pub async fn power_view(State(state): State<ApiState>) -> impl IntoResponse {
    let view = state.orchestrator.power_view();
    ApiResponse::ok(serde_json::json!({
        "site_ceiling_watts": view.site_ceiling_watts,
        "site_committed_watts": view.site_committed(),
        "site_load_watts": view.site_load(),
        "stale": view.any_stale(),
        "groups": view.groups,
    }))
}

/// GET /api/v1/audit
pub async fn audit_log(
    State(state): State<ApiState>,
    Query(q): Query<AuditQuery>,
) -> impl IntoResponse {
    let records = match q.since {
        Some(after) => state.orchestrator.audit_since(after),
        None => state.orchestrator.audit_log(),
    };
    ApiResponse::ok(records)
}

/// GET /api/v1/operations
pub async fn list_operations(State(state): State<ApiState>) -> impl IntoResponse {
    ApiResponse::ok(state.orchestrator.operations())
}

/// POST /api/v1/provider/:instance_id/phase
pub async fn provider_phase(
    State(state): State<ApiState>,
    Path(instance_id): Path<String>,
    Json(phase): Json<ProvisionPhase>,
) -> impl IntoResponse {
    info!(instance = %instance_id, ?phase, "provider phase pushed");
    match state.orchestrator.notify_phase(&instance_id, phase) {
        Ok(status) => ApiResponse::ok(serde_json::json!({
            "instance_id": instance_id,
            "status": status,
        }))
        .into_response(),
        Err(e) => grid_error(e),
    }
}

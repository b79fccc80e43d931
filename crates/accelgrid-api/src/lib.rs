//! accelgrid-api — REST API for AccelGrid.
//!
//! Thin axum layer over [`GroupOrchestrator`]. Every response uses the
//! `{ success, data, error }` envelope.
//!
//! # API Routes
//!
//! | Method | Path | Description |
//! |---|---|---|
//! | POST | `/api/v1/workloads` | Submit a workload requirement |
//! | POST | `/api/v1/workloads/evaluate` | Dry-run a requirement |
//! | DELETE | `/api/v1/workloads/{id}` | Mark a workload finished |
//! | POST | `/api/v1/workloads/{id}/migrate` | Move a workload to another cluster |
//! | GET | `/api/v1/groups` | List groups |
//! | POST | `/api/v1/groups` | Declare a group with min/max clusters |
//! | GET | `/api/v1/groups/{id}` | Group status and metrics |
//! | DELETE | `/api/v1/groups/{id}?force=` | Delete every cluster in a group |
//! | POST | `/api/v1/groups/{id}/scale` | Resize to `target_clusters` |
//! | POST | `/api/v1/groups/{id}/clusters` | Add one cluster |
//! | POST | `/api/v1/groups/{id}/consolidate` | Consolidate now |
//! | GET | `/api/v1/clusters/{id}` | Cluster details |
//! | DELETE | `/api/v1/clusters/{id}?force=` | Drain and delete a cluster |
//! | GET | `/api/v1/power` | Power view |
//! | GET | `/api/v1/audit?since=` | Audit trail |
//! | GET | `/api/v1/operations` | Gateway operations in flight |
//! | POST | `/api/v1/provider/{instance_id}/phase` | Provider completion callback |
//! | GET | `/healthz` | Liveness |

pub mod handlers;
pub mod status_handlers;

use axum::Router;
use axum::routing::{delete, get, post};

use accelgrid_orchestrator::GroupOrchestrator;

/// Shared state for API handlers.
#[derive(Clone)]
pub struct ApiState {
    pub orchestrator: GroupOrchestrator,
}

/// Build the complete API router.
pub fn build_router(orchestrator: GroupOrchestrator) -> Router {
    let state = ApiState { orchestrator };

    let api_routes = Router::new()
        .route("/workloads", post(handlers::submit_workload))
        .route("/workloads/evaluate", post(handlers::evaluate_workload))
        .route("/workloads/{id}", delete(handlers::complete_workload))
        .route("/workloads/{id}/migrate", post(handlers::migrate_workload))
        .route("/groups", get(handlers::list_groups).post(handlers::create_group))
        .route("/groups/{id}", get(handlers::get_group).delete(handlers::delete_group))
        .route("/groups/{id}/scale", post(handlers::scale_group))
        .route("/groups/{id}/clusters", post(handlers::add_cluster))
        .route("/groups/{id}/consolidate", post(handlers::consolidate_group))
        .route("/clusters/{id}", get(handlers::get_cluster).delete(handlers::delete_cluster))
        .route("/power", get(status_handlers::power_view))
        .route("/audit", get(status_handlers::audit_log))
        .route("/operations", get(status_handlers::list_operations))
        .route("/provider/{instance_id}/phase", post(status_handlers::provider_phase))
        .with_state(state);

    Router::new()
        .nest("/api/v1", api_routes)
        .route("/healthz", get(status_handlers::healthz))
}

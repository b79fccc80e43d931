//! API regression tests.
//!
//! Drives the full router the daemon serves, backed by the simulated
//! gateways, through request/response round trips.

use std::sync::Arc;

use axum::Router;
use axum::body::{Body, to_bytes};
use axum::http::{Request, StatusCode};
use serde_json::{Value, json};
use tokio::sync::watch;
use tower::ServiceExt;

use accel_core::{GridConfig, ManualClock};
use accelgrid_api::build_router;
use accelgrid_orchestrator::GroupOrchestrator;
use accelgrid_power::SimulatedForecaster;
use accelgrid_provision::SimulatedGateway;
use accelgrid_state::ClusterTypeCatalog;

fn test_orchestrator() -> GroupOrchestrator {
    let (_tx, rx) = watch::channel(false);
    GroupOrchestrator::new(
        GridConfig::default(),
        ClusterTypeCatalog::builtin(),
        Arc::new(SimulatedGateway::new(0)),
        Arc::new(SimulatedForecaster::default()),
        Arc::new(ManualClock::new(1000)),
        rx,
    )
}

async fn send(router: &Router, method: &str, uri: &str, body: Option<Value>) -> (StatusCode, Value) {
    let builder = Request::builder().method(method).uri(uri);
    let req = match body {
        Some(body) => builder
            .header("content-type", "application/json")
            .body(Body::from(serde_json::to_vec(&body).unwrap()))
            .unwrap(),
        None => builder.body(Body::empty()).unwrap(),
    };
    let resp = router.clone().oneshot(req).await.unwrap();
    let status = resp.status();
    let bytes = to_bytes(resp.into_body(), usize::MAX).await.unwrap();
    let value = if bytes.is_empty() {
        Value::Null
    } else {
        serde_json::from_slice(&bytes).unwrap_or(Value::Null)
    };
    (status, value)
}

fn gpu_job(id: &str, gpus: u32, budget: f64) -> Value {
    json!({
        "workload_id": id,
        "demand": { "cpu": 0, "memory_gib": 0, "gpu": gpus, "npu": 0 },
        "gpu_required": true,
        "power_budget_watts": budget,
        "priority": 1
    })
}

#[tokio::test]
async fn healthz() {
    let router = build_router(test_orchestrator());
    let (status, _) = send(&router, "GET", "/healthz", None).await;
    assert_eq!(status, StatusCode::OK);
}

#[tokio::test]
async fn submit_creates_gpu_cluster() {
    let router = build_router(test_orchestrator());
    let (status, body) = send(&router, "POST", "/api/v1/workloads", Some(gpu_job("train", 4, 2000.0))).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["success"], true);
    assert_eq!(body["data"]["action"], "create");
    assert_eq!(body["data"]["cluster_type"], "gpu-intensive");
    assert_eq!(body["data"]["node_count"], 4);

    let (status, body) = send(&router, "GET", "/api/v1/groups/group-gpu-intensive", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["group"]["status"], "populating");

    let (status, body) = send(&router, "GET", "/api/v1/operations", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"][0]["op"], "create");
}

#[tokio::test]
async fn evaluate_does_not_change_inventory() {
    let router = build_router(test_orchestrator());
    let (status, body) = send(
        &router,
        "POST",
        "/api/v1/workloads/evaluate",
        Some(gpu_job("dry", 2, 1000.0)),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["action"], "create");

    let (_, body) = send(&router, "GET", "/api/v1/groups", None).await;
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn invalid_requirement_is_bad_request() {
    let router = build_router(test_orchestrator());
    let (status, body) = send(&router, "POST", "/api/v1/workloads", Some(gpu_job("zero", 0, 1000.0))).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["success"], false);
    assert!(body["error"].as_str().unwrap().contains("invalid requirement"));
}

#[tokio::test]
async fn budget_too_small_is_unprocessable() {
    let router = build_router(test_orchestrator());
    let (status, body) = send(&router, "POST", "/api/v1/workloads", Some(gpu_job("tiny", 4, 100.0))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    assert!(body["error"].as_str().unwrap().contains("insufficient capacity"));
}

#[tokio::test]
async fn unknown_resources_are_not_found() {
    let router = build_router(test_orchestrator());
    for uri in [
        "/api/v1/groups/group-cpu-only",
        "/api/v1/clusters/cpu-only-0001",
    ] {
        let (status, _) = send(&router, "GET", uri, None).await;
        assert_eq!(status, StatusCode::NOT_FOUND, "{uri}");
    }
    let (status, _) = send(&router, "DELETE", "/api/v1/workloads/ghost", None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn workload_lifecycle_and_cluster_delete() {
    let orchestrator = test_orchestrator();
    let router = build_router(orchestrator.clone());

    let (_, body) = send(&router, "POST", "/api/v1/workloads", Some(gpu_job("svc", 1, 500.0))).await;
    let cluster_id = body["data"]["cluster_id"].as_str().unwrap().to_string();
    orchestrator.tick().await;

    let (status, body) = send(&router, "GET", &format!("/api/v1/clusters/{cluster_id}"), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "active");

    let uri = format!("/api/v1/clusters/{cluster_id}");
    let (status, _) = send(&router, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::CONFLICT);

    let (status, body) = send(&router, "DELETE", "/api/v1/workloads/svc", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["cluster_id"], cluster_id.as_str());

    let (status, body) = send(&router, "DELETE", &uri, None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["data"]["action"], "delete");

    orchestrator.tick().await;
    let (status, _) = send(&router, "GET", &uri, None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, body) = send(&router, "GET", "/api/v1/audit", None).await;
    assert_eq!(status, StatusCode::OK);
    let events: Vec<&str> = body["data"]
        .as_array()
        .unwrap()
        .iter()
        .map(|r| r["event"].as_str().unwrap())
        .collect();
    assert_eq!(events, vec!["decision", "decision", "group_destroyed"]);
}

#[tokio::test]
async fn force_deletes_group() {
    let orchestrator = test_orchestrator();
    let router = build_router(orchestrator.clone());
    send(&router, "POST", "/api/v1/workloads", Some(gpu_job("a", 2, 1000.0))).await;
    orchestrator.tick().await;

    let (status, _) = send(&router, "DELETE", "/api/v1/groups/group-gpu-intensive", None).await;
    assert_eq!(status, StatusCode::CONFLICT);
    let (status, body) = send(
        &router,
        "DELETE",
        "/api/v1/groups/group-gpu-intensive?force=true",
        None,
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);

    orchestrator.tick().await;
    let (_, body) = send(&router, "GET", "/api/v1/groups", None).await;
    assert_eq!(body["data"], json!([]));
}

#[tokio::test]
async fn power_view_reports_commitments() {
    let orchestrator = test_orchestrator();
    let router = build_router(orchestrator.clone());
    send(&router, "POST", "/api/v1/workloads", Some(gpu_job("p", 2, 1000.0))).await;

    let (status, body) = send(&router, "GET", "/api/v1/power", None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["site_committed_watts"], 900.0);
    assert_eq!(body["data"]["site_ceiling_watts"], 20000.0);
}

#[tokio::test]
async fn provider_callback_completes_create() {
    let (_tx, rx) = watch::channel(false);
    let orchestrator = GroupOrchestrator::new(
        GridConfig::default(),
        ClusterTypeCatalog::builtin(),
        Arc::new(SimulatedGateway::new(10)),
        Arc::new(SimulatedForecaster::default()),
        Arc::new(ManualClock::new(1000)),
        rx,
    );
    let router = build_router(orchestrator.clone());
    let (_, body) = send(&router, "POST", "/api/v1/workloads", Some(gpu_job("cb", 1, 500.0))).await;
    let cluster_id = body["data"]["cluster_id"].as_str().unwrap().to_string();

    let (status, body) = send(
        &router,
        "POST",
        "/api/v1/provider/sim-0001/phase",
        Some(json!({ "phase": "ready", "node_count": 1 })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["status"], "active");
    assert_eq!(
        orchestrator.get_cluster(&cluster_id).unwrap().status.label(),
        "active"
    );
}

#[tokio::test]
async fn declared_group_commands() {
    let orchestrator = test_orchestrator();
    let router = build_router(orchestrator.clone());
    let group = "/api/v1/groups/group-gpu-intensive";

    let spec = json!({
        "type_id": "gpu-intensive",
        "min_clusters": 2,
        "max_clusters": 3,
        "node_count": 2
    });
    let (status, body) = send(&router, "POST", "/api/v1/groups", Some(spec)).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(body["data"]["group"]["policy"]["min_clusters"], 2);
    assert_eq!(body["data"]["clusters"].as_array().unwrap().len(), 2);
    assert_eq!(body["data"]["metrics"]["scaling_events"], 2);
    orchestrator.tick().await;

    let (status, body) = send(
        &router,
        "POST",
        &format!("{group}/scale"),
        Some(json!({ "target_clusters": 3 })),
    )
    .await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["data"].as_array().unwrap().len(), 1);
    assert_eq!(body["data"][0]["reason"]["code"], "explicit_scale");
    let (status, _) = send(&router, "POST", &format!("{group}/clusters"), Some(json!({}))).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);
    orchestrator.tick().await;

    let (status, body) = send(&router, "POST", "/api/v1/workloads", Some(gpu_job("job", 1, 500.0))).await;
    assert_eq!(status, StatusCode::OK);
    let source = body["data"]["cluster_id"].as_str().unwrap().to_string();
    let (_, body) = send(&router, "GET", group, None).await;
    let target = body["data"]["clusters"]
        .as_array()
        .unwrap()
        .iter()
        .map(|c| c["id"].as_str().unwrap().to_string())
        .find(|id| *id != source)
        .unwrap();

    let (status, body) = send(
        &router,
        "POST",
        "/api/v1/workloads/job/migrate",
        Some(json!({ "target_cluster": target })),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["from"], source.as_str());
    assert_eq!(body["data"]["to"], target.as_str());

    let (_, body) = send(&router, "GET", group, None).await;
    assert_eq!(body["data"]["metrics"]["migrations"], 1);
    assert_eq!(body["data"]["metrics"]["scaling_events"], 3);

    // Everything is inside its cooldown; nothing to drain yet.
    let (status, body) = send(&router, "POST", &format!("{group}/consolidate"), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
    assert_eq!(body["data"], json!([]));

    let (status, _) = send(&router, "DELETE", &format!("{group}?force=true"), None).await;
    assert_eq!(status, StatusCode::ACCEPTED);
}

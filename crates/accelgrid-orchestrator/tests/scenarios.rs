//! End-to-end orchestrator scenarios.
//!
//! Everything runs in-process against the simulated provisioning gateway
//! and forecaster, with a manual clock so cooldowns, backoff and sustain
//! windows are driven explicitly.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::watch;

use accel_core::{GridConfig, ManualClock, ResourceShape};
use accelgrid_orchestrator::{AuditEvent, GridError, GroupOrchestrator, GroupSpec, TickReport};
use accelgrid_power::SimulatedForecaster;
use accelgrid_provision::{GatewayError, ProvisionPhase, SimOp, SimulatedGateway};
use accelgrid_state::{
    CapacityReason, ClusterStatus, ClusterTypeCatalog, GroupStatus, ReasonCode, ScalingAction,
    WorkloadRequirement,
};

const GPU_GROUP: &str = "group-gpu-intensive";

struct Harness {
    orch: GroupOrchestrator,
    gateway: Arc<SimulatedGateway>,
    forecaster: Arc<SimulatedForecaster>,
    clock: Arc<ManualClock>,
    cancel: watch::Sender<bool>,
}

impl Harness {
    fn new(config: GridConfig) -> Self {
        Self::with_gateway(config, SimulatedGateway::new(0))
    }

    fn with_gateway(config: GridConfig, gateway: SimulatedGateway) -> Self {
        let gateway = Arc::new(gateway);
        let forecaster = Arc::new(SimulatedForecaster::default());
        let clock = Arc::new(ManualClock::new(1000));
        let (cancel, cancel_rx) = watch::channel(false);
        let orch = GroupOrchestrator::new(
            config,
            ClusterTypeCatalog::builtin(),
            gateway.clone(),
            forecaster.clone(),
            clock.clone(),
            cancel_rx,
        );
        Self {
            orch,
            gateway,
            forecaster,
            clock,
            cancel,
        }
    }

    async fn tick_after(&self, secs: u64) -> TickReport {
        self.clock.advance(secs);
        self.orch.tick().await
    }
}

fn config() -> GridConfig {
    let mut config = GridConfig::default();
    config.orchestrator.cooldown_period = "60s".to_string();
    config.power.violation_sustain = "60s".to_string();
    config.provisioning.max_retries = 2;
    config.provisioning.initial_backoff = "1s".to_string();
    config.provisioning.max_backoff = "4s".to_string();
    config.provisioning.call_timeout = "5s".to_string();
    config.provisioning.operation_timeout = "10m".to_string();
    config
}

fn gpu(id: &str, gpus: u32, budget: f64) -> WorkloadRequirement {
    WorkloadRequirement {
        workload_id: id.to_string(),
        demand: ResourceShape::new(0, 0, gpus, 0),
        gpu_required: true,
        npu_required: false,
        power_budget_watts: budget,
        priority: 1,
    }
}

#[tokio::test]
async fn scenario_a_empty_inventory_creates_gpu_cluster() {
    let h = Harness::new(config());
    let decision = h.orch.submit_workload(gpu("train", 4, 2000.0)).await.unwrap();
    assert_eq!(decision.action, ScalingAction::Create);
    assert_eq!(decision.cluster_type, "gpu-intensive");
    assert_eq!(decision.node_count, 4);
    assert!(!decision.stale_forecast);

    let cluster_id = decision.cluster_id.clone().unwrap();
    let cluster = h.orch.get_cluster(&cluster_id).unwrap();
    assert_eq!(cluster.status, ClusterStatus::Creating);
    assert_eq!(cluster.provider_id.as_deref(), Some("sim-0001"));
    assert_eq!(
        h.orch.get_group_status(GPU_GROUP).unwrap().group.status,
        GroupStatus::Populating
    );

    let report = h.orch.tick().await;
    assert_eq!(report.completed, vec![cluster_id.clone()]);
    let summary = h.orch.get_group_status(GPU_GROUP).unwrap();
    assert_eq!(summary.group.status, GroupStatus::Stable);
    assert_eq!(summary.capacity.gpu, 4);
    assert_eq!(summary.allocated.gpu, 4);
    assert_eq!(summary.committed_watts, 1800.0);
    assert_eq!(h.orch.get_cluster(&cluster_id).unwrap().status, ClusterStatus::Active);
}

#[tokio::test]
async fn scenario_b_group_near_ceiling_refuses_more_power() {
    let mut config = config();
    config.power.site_ceiling_watts = 5000.0;
    let h = Harness::new(config);

    // One 2-node GPU cluster, both GPUs free.
    h.orch
        .create_group(GroupSpec {
            type_id: "gpu-intensive".to_string(),
            min_clusters: 1,
            max_clusters: None,
            node_count: Some(2),
        })
        .await
        .unwrap();
    h.orch.tick().await;

    // The group is expected to draw 4500 W of the 5000 W ceiling.
    h.forecaster.set_prediction(GPU_GROUP, 4500.0, 1.0);
    let report = h.tick_after(10).await;
    assert!(report.violations.is_empty());
    assert_eq!(h.orch.power_view().site_load(), 4500.0);

    // Needs 600 W at most; the spare GPUs are off limits at 90%.
    let req = gpu("infer", 1, 600.0);
    match h.orch.evaluate(&req) {
        Err(GridError::Capacity(e)) => assert_eq!(e.code, CapacityReason::PowerCeilingReached),
        other => panic!("expected capacity error, got {other:?}"),
    }
    match h.orch.submit_workload(req.clone()).await {
        Err(GridError::Capacity(e)) => assert_eq!(e.code, CapacityReason::PowerCeilingReached),
        other => panic!("expected capacity error, got {other:?}"),
    }
    assert!(h.orch.get_group_status("group-hybrid-balanced").is_err());
    assert!(h.orch.snapshot().find_workload("infer").is_none());

    // Once the forecast drops the same request is served.
    h.forecaster.set_prediction(GPU_GROUP, 1000.0, 1.0);
    h.tick_after(10).await;
    let decision = h.orch.submit_workload(req).await.unwrap();
    assert_eq!(decision.group_id, GPU_GROUP);
}

#[tokio::test]
async fn scenario_c_idle_cluster_is_consolidated_away() {
    let h = Harness::new(config());
    let big = h.orch.submit_workload(gpu("big", 5, 5000.0)).await.unwrap();
    h.orch.tick().await;
    let mid = h.orch.submit_workload(gpu("mid", 4, 5000.0)).await.unwrap();
    h.orch.tick().await;
    let keep = big.cluster_id.unwrap();
    let idle = mid.cluster_id.unwrap();
    assert_ne!(keep, idle);

    h.orch.complete_workload("mid").unwrap();
    h.tick_after(30).await;
    h.tick_after(30).await;
    assert_eq!(
        h.orch.get_group_status(GPU_GROUP).unwrap().group.status,
        GroupStatus::Stable
    );

    let report = h.tick_after(30).await;
    let consolidations: Vec<_> = report
        .decisions
        .iter()
        .filter(|d| d.action == ScalingAction::Consolidate)
        .collect();
    assert_eq!(consolidations.len(), 1);
    assert_eq!(consolidations[0].cluster_id.as_deref(), Some(idle.as_str()));
    assert_eq!(
        h.orch.get_group_status(GPU_GROUP).unwrap().group.status,
        GroupStatus::Rebalancing
    );
    assert_eq!(h.orch.get_cluster(&idle).unwrap().status, ClusterStatus::Draining);

    h.tick_after(30).await;
    assert!(matches!(h.orch.get_cluster(&idle), Err(GridError::NotFound(_))));
    let summary = h.orch.get_group_status(GPU_GROUP).unwrap();
    assert_eq!(summary.group.status, GroupStatus::Stable);
    assert_eq!(summary.clusters.len(), 1);
    assert_eq!(summary.clusters[0].id, keep);
}

#[tokio::test]
async fn consolidation_never_drains_a_cluster_with_workloads() {
    let mut config = config();
    config.orchestrator.cooldown_period = "0s".to_string();
    config.orchestrator.max_clusters_per_group = 1;
    config.consolidation.low_utilization_threshold = 0.3;
    config.consolidation.observation_windows = 2;
    let h = Harness::new(config);

    h.orch.submit_workload(gpu("small", 1, 500.0)).await.unwrap();
    h.orch.tick().await;
    let grow = h.orch.submit_workload(gpu("burst", 3, 1500.0)).await.unwrap();
    assert_eq!(grow.action, ScalingAction::ScaleOut);
    assert_eq!(grow.node_count, 4);
    h.orch.tick().await;
    let cluster_id = grow.cluster_id.unwrap();
    assert_eq!(h.orch.get_cluster(&cluster_id).unwrap().node_count, 4);

    // 1 of 4 GPUs in use: below threshold, but nowhere to move "small".
    h.orch.complete_workload("burst").unwrap();
    for _ in 0..4 {
        let report = h.tick_after(30).await;
        assert!(report.decisions.is_empty());
    }
    let cluster = h.orch.get_cluster(&cluster_id).unwrap();
    assert_eq!(cluster.status, ClusterStatus::Active);
    assert!(cluster.workloads.contains_key("small"));
}

#[tokio::test]
async fn scaling_transitions_respect_cooldown() {
    let mut config = config();
    config.orchestrator.max_clusters_per_group = 1;
    let h = Harness::new(config);

    let created = h.orch.submit_workload(gpu("first", 2, 2000.0)).await.unwrap();
    h.orch.tick().await;

    h.clock.advance(10);
    match h.orch.submit_workload(gpu("second", 1, 500.0)).await {
        Err(GridError::Capacity(e)) => assert_eq!(e.code, CapacityReason::CooldownActive),
        other => panic!("expected capacity error inside cooldown, got {other:?}"),
    }

    h.clock.advance(50);
    let grown = h.orch.submit_workload(gpu("second", 1, 500.0)).await.unwrap();
    assert_eq!(grown.action, ScalingAction::ScaleOut);
    assert_eq!(grown.cluster_id, created.cluster_id);
    h.orch.tick().await;

    let cooldown = 60;
    let mut last: HashMap<String, u64> = HashMap::new();
    for record in h.orch.audit_log() {
        let AuditEvent::Decision { decision } = record.event else {
            continue;
        };
        if decision.action == ScalingAction::Reuse || decision.forced {
            continue;
        }
        let Some(cluster_id) = decision.cluster_id else {
            continue;
        };
        if let Some(previous) = last.insert(cluster_id, decision.timestamp) {
            assert!(decision.timestamp - previous >= cooldown);
        }
    }
    assert_eq!(last.len(), 1);
}

#[tokio::test]
async fn forced_correction_converges_under_ceiling() {
    let mut config = config();
    config.power.site_ceiling_watts = 5000.0;
    config.orchestrator.cooldown_period = "300s".to_string();
    config.consolidation.enabled = false;
    let h = Harness::new(config);

    let created = h.orch.submit_workload(gpu("batch", 8, 4000.0)).await.unwrap();
    assert_eq!(created.node_count, 8);
    let cluster_id = created.cluster_id.unwrap();
    h.orch.tick().await;
    h.orch.complete_workload("batch").unwrap();

    h.forecaster.set_prediction(GPU_GROUP, 5500.0, 1.0);
    let report = h.orch.tick().await;
    assert!(report.violations.is_empty(), "breach must be sustained first");

    let report = h.tick_after(60).await;
    assert!(!report.violations.is_empty());
    assert!(report.errors.is_empty(), "{:?}", report.errors);
    assert_eq!(report.decisions.len(), 1);
    let scale_in = &report.decisions[0];
    assert_eq!(scale_in.action, ScalingAction::ScaleIn);
    assert!(scale_in.forced);
    assert_eq!(scale_in.node_count, 2);
    // Inside the 300s cooldown of the create.
    assert!(scale_in.timestamp - created.timestamp < 300);
    assert_eq!(h.orch.get_cluster(&cluster_id).unwrap().status, ClusterStatus::Scaling);

    h.forecaster.clear_prediction(GPU_GROUP);
    let report = h.tick_after(60).await;
    assert!(report.violations.is_empty());
    assert_eq!(report.completed, vec![cluster_id.clone()]);

    let cluster = h.orch.get_cluster(&cluster_id).unwrap();
    assert_eq!(cluster.status, ClusterStatus::Active);
    assert_eq!(cluster.node_count, 2);
    let view = h.orch.power_view();
    for (group_id, group) in &view.groups {
        assert!(group.committed_watts <= group.ceiling_watts, "{group_id}");
    }
    assert!(view.site_committed() <= view.site_ceiling_watts);
}

#[tokio::test]
async fn create_failures_exhaust_retries_into_error() {
    let h = Harness::new(config());
    h.gateway.fail_next(SimOp::Create, 10);

    let decision = h.orch.submit_workload(gpu("doomed", 1, 500.0)).await.unwrap();
    let cluster_id = decision.cluster_id.unwrap();
    assert_eq!(h.gateway.calls(SimOp::Create), 1);
    assert_eq!(h.orch.get_cluster(&cluster_id).unwrap().status, ClusterStatus::Creating);

    // Backoff not elapsed yet.
    h.orch.tick().await;
    assert_eq!(h.gateway.calls(SimOp::Create), 1);

    h.tick_after(1).await;
    assert_eq!(h.gateway.calls(SimOp::Create), 2);

    let report = h.tick_after(2).await;
    assert_eq!(h.gateway.calls(SimOp::Create), 3);
    assert_eq!(report.failed, vec![cluster_id.clone()]);
    assert!(matches!(report.errors[0], GridError::Provisioning { .. }));

    let cluster = h.orch.get_cluster(&cluster_id).unwrap();
    assert_eq!(cluster.status, ClusterStatus::Error);
    assert!(cluster.last_error.is_some());
    assert!(cluster.workloads.is_empty());
    assert!(h.orch.audit_log().iter().any(|r| matches!(
        &r.event,
        AuditEvent::ClusterFailed { released, .. } if released == &vec!["doomed".to_string()]
    )));

    // Error clusters can be deleted; nothing exists on the provider side.
    let deleted = h.orch.request_delete(&cluster_id, false).await.unwrap();
    assert_eq!(deleted.action, ScalingAction::Delete);
    assert!(h.orch.get_cluster(&cluster_id).is_err());
    assert!(h.orch.get_group_status(GPU_GROUP).is_err());
}

#[tokio::test]
async fn stuck_operation_times_out_into_error() {
    let h = Harness::new(config());
    h.gateway.set_stuck(true);
    let decision = h.orch.submit_workload(gpu("slow", 1, 500.0)).await.unwrap();
    let cluster_id = decision.cluster_id.unwrap();

    let report = h.tick_after(300).await;
    assert!(report.failed.is_empty());
    assert_eq!(report.in_flight, 1);

    let report = h.tick_after(301).await;
    assert_eq!(report.failed, vec![cluster_id.clone()]);
    match &report.errors[0] {
        GridError::Provisioning { source, .. } => {
            assert!(matches!(source, GatewayError::Timeout(_)))
        }
        other => panic!("expected provisioning timeout, got {other:?}"),
    }
    assert_eq!(h.orch.get_cluster(&cluster_id).unwrap().status, ClusterStatus::Error);
}

#[tokio::test]
async fn forecast_outage_marks_decisions_stale() {
    let h = Harness::new(config());
    h.orch.submit_workload(gpu("a", 2, 2000.0)).await.unwrap();

    h.forecaster.set_available(false);
    let report = h.orch.tick().await;
    assert_eq!(report.stale_forecasts, 1);

    let decision = h.orch.submit_workload(gpu("b", 1, 1000.0)).await.unwrap();
    assert!(decision.stale_forecast);

    h.forecaster.set_available(true);
    let report = h.orch.tick().await;
    assert_eq!(report.stale_forecasts, 0);
    let decision = h.orch.evaluate(&gpu("c", 1, 1000.0)).unwrap();
    assert!(!decision.stale_forecast);
}

#[tokio::test]
async fn evaluation_is_idempotent_and_matches_submission() {
    let h = Harness::new(config());
    h.orch.submit_workload(gpu("warm", 2, 2000.0)).await.unwrap();
    h.orch.tick().await;

    let req = gpu("trial", 3, 2000.0);
    let first = h.orch.evaluate(&req).unwrap();
    let second = h.orch.evaluate(&req).unwrap();
    assert_eq!(first, second);

    let applied = h.orch.submit_workload(req.clone()).await.unwrap();
    assert_eq!(applied.action, first.action);
    assert_eq!(applied.cluster_type, first.cluster_type);
    assert_eq!(applied.node_count, first.node_count);

    match h.orch.submit_workload(req).await {
        Err(GridError::Conflict(_)) => {}
        other => panic!("duplicate submission must conflict, got {other:?}"),
    }
}

#[tokio::test]
async fn malformed_requirements_are_rejected() {
    let h = Harness::new(config());
    let mut req = gpu("bad", 0, 1000.0);
    assert!(matches!(
        h.orch.submit_workload(req.clone()).await,
        Err(GridError::Validation(_))
    ));
    req.demand.gpu = 1;
    req.power_budget_watts = -5.0;
    assert!(matches!(h.orch.evaluate(&req), Err(GridError::Validation(_))));
    assert!(h.orch.list_groups().is_empty());
}

#[tokio::test]
async fn delete_with_workloads_requires_force() {
    let h = Harness::new(config());
    let decision = h.orch.submit_workload(gpu("svc", 1, 500.0)).await.unwrap();
    let cluster_id = decision.cluster_id.unwrap();

    // Operation in flight.
    assert!(matches!(
        h.orch.request_delete(&cluster_id, true).await,
        Err(GridError::Busy(_))
    ));
    h.orch.tick().await;

    assert!(matches!(
        h.orch.request_delete(&cluster_id, false).await,
        Err(GridError::Conflict(_))
    ));
    let deleted = h.orch.request_delete(&cluster_id, true).await.unwrap();
    assert!(deleted.forced);
    assert_eq!(h.orch.get_cluster(&cluster_id).unwrap().status, ClusterStatus::Draining);
    assert!(h.orch.audit_log().iter().any(|r| matches!(
        &r.event,
        AuditEvent::Eviction { workloads, .. } if workloads == &vec!["svc".to_string()]
    )));

    h.tick_after(1).await;
    assert!(h.orch.get_cluster(&cluster_id).is_err());
    assert!(h.orch.list_groups().is_empty());
    assert_eq!(h.gateway.instance_count(), 0);
}

#[tokio::test]
async fn pushed_phase_completes_operation() {
    let h = Harness::with_gateway(config(), SimulatedGateway::new(100));
    let decision = h.orch.submit_workload(gpu("push", 2, 2000.0)).await.unwrap();
    let cluster_id = decision.cluster_id.unwrap();

    h.orch.tick().await;
    assert_eq!(h.orch.get_cluster(&cluster_id).unwrap().status, ClusterStatus::Creating);

    let status = h
        .orch
        .notify_phase("sim-0001", ProvisionPhase::Ready { node_count: 2 })
        .unwrap();
    assert_eq!(status, ClusterStatus::Active);
    assert!(h.orch.operations().is_empty());
    assert!(matches!(
        h.orch.notify_phase("sim-9999", ProvisionPhase::NotFound),
        Err(GridError::NotFound(_))
    ));
}

#[tokio::test]
async fn cancellation_leaves_operation_outstanding() {
    let h = Harness::new(config());
    h.cancel.send(true).unwrap();
    let decision = h.orch.submit_workload(gpu("late", 1, 500.0)).await.unwrap();
    let cluster_id = decision.cluster_id.unwrap();

    assert_eq!(h.gateway.calls(SimOp::Create), 0);
    let ops = h.orch.operations();
    assert_eq!(ops.len(), 1);
    assert_eq!(ops[0].cluster_id, cluster_id);
    assert!(ops[0].issued_at.is_none());
}

fn gpu_group(min: u32, max: Option<u32>, nodes: Option<u32>) -> GroupSpec {
    GroupSpec {
        type_id: "gpu-intensive".to_string(),
        min_clusters: min,
        max_clusters: max,
        node_count: nodes,
    }
}

fn live_clusters(h: &Harness) -> Vec<String> {
    h.orch
        .get_group_status(GPU_GROUP)
        .unwrap()
        .clusters
        .into_iter()
        .filter(|c| !matches!(c.status, ClusterStatus::Draining | ClusterStatus::Deleted))
        .map(|c| c.id)
        .collect()
}

#[tokio::test]
async fn declared_group_is_kept_at_its_minimum() {
    let h = Harness::new(config());
    let summary = h.orch.create_group(gpu_group(2, Some(3), Some(2))).await.unwrap();
    assert_eq!(summary.clusters.len(), 2);
    assert!(summary.clusters.iter().all(|c| c.node_count == 2));
    assert_eq!(summary.group.policy.map(|p| p.min_clusters), Some(2));
    assert_eq!(summary.metrics.scaling_events, 2);
    assert!(h.orch.audit_log().iter().any(|r| matches!(
        &r.event,
        AuditEvent::GroupCreated { group_id, .. } if group_id == GPU_GROUP
    )));

    match h.orch.create_group(gpu_group(1, None, None)).await {
        Err(GridError::Conflict(_)) => {}
        other => panic!("second declaration must conflict, got {other:?}"),
    }

    h.orch.tick().await;
    let members = live_clusters(&h);
    assert_eq!(members.len(), 2);

    // Dropping below the minimum is repaired on the next tick.
    h.orch.request_delete(&members[0], false).await.unwrap();
    let report = h.tick_after(10).await;
    let refill: Vec<_> = report
        .decisions
        .iter()
        .filter(|d| d.reason.code == ReasonCode::MinClusters)
        .collect();
    assert_eq!(refill.len(), 1);
    assert_eq!(refill[0].action, ScalingAction::Create);
    assert_eq!(refill[0].node_count, 2);

    h.tick_after(10).await;
    assert_eq!(live_clusters(&h).len(), 2);
    assert!(h.orch.get_cluster(&members[0]).is_err());
    assert_eq!(
        h.orch.get_group_status(GPU_GROUP).unwrap().group.status,
        GroupStatus::Stable
    );
}

#[tokio::test]
async fn empty_declared_group_survives_until_deleted() {
    let h = Harness::new(config());
    let summary = h.orch.create_group(gpu_group(0, Some(2), None)).await.unwrap();
    assert!(summary.clusters.is_empty());
    assert_eq!(summary.group.status, GroupStatus::Empty);

    h.tick_after(10).await;
    assert!(h.orch.get_group_status(GPU_GROUP).is_ok());

    let decisions = h.orch.delete_group(GPU_GROUP, false).await.unwrap();
    assert!(decisions.is_empty());
    assert!(h.orch.get_group_status(GPU_GROUP).is_err());
    assert!(h.orch.audit_log().iter().any(|r| matches!(
        &r.event,
        AuditEvent::GroupDestroyed { group_id } if group_id == GPU_GROUP
    )));
}

#[tokio::test]
async fn scale_group_to_explicit_cluster_counts() {
    let h = Harness::new(config());
    h.orch.create_group(gpu_group(0, Some(3), None)).await.unwrap();

    let grown = h.orch.scale_group(GPU_GROUP, 3, false).await.unwrap();
    assert_eq!(grown.len(), 3);
    assert!(grown
        .iter()
        .all(|d| d.action == ScalingAction::Create && d.reason.code == ReasonCode::ExplicitScale));
    match h.orch.scale_group(GPU_GROUP, 4, false).await {
        Err(GridError::Validation(_)) => {}
        other => panic!("target above max must be rejected, got {other:?}"),
    }
    h.orch.tick().await;

    // At the limit, so the workload lands on one of the three.
    let placed = h.orch.submit_workload(gpu("pinned", 1, 500.0)).await.unwrap();
    assert_eq!(placed.action, ScalingAction::Reuse);
    let busy = placed.cluster_id.unwrap();

    let shrunk = h.orch.scale_group(GPU_GROUP, 1, false).await.unwrap();
    assert_eq!(shrunk.len(), 2);
    assert!(shrunk.iter().all(|d| d.action == ScalingAction::Delete));
    assert!(shrunk.iter().all(|d| d.cluster_id.as_deref() != Some(busy.as_str())));

    match h.orch.scale_group(GPU_GROUP, 0, false).await {
        Err(GridError::Conflict(_)) => {}
        other => panic!("draining a busy cluster needs force, got {other:?}"),
    }

    h.tick_after(10).await;
    assert_eq!(live_clusters(&h), vec![busy.clone()]);
    let metrics = h.orch.get_group_status(GPU_GROUP).unwrap().metrics;
    assert_eq!(metrics.scaling_events, 5);
}

#[tokio::test]
async fn migrate_workload_between_clusters() {
    let h = Harness::new(config());
    h.orch.create_group(gpu_group(2, Some(2), Some(2))).await.unwrap();
    h.orch.tick().await;

    // Too small a budget for a hybrid node, so one of the two is reused.
    let placed = h.orch.submit_workload(gpu("job", 1, 500.0)).await.unwrap();
    assert_eq!(placed.action, ScalingAction::Reuse);
    let source = placed.cluster_id.unwrap();
    let target = live_clusters(&h)
        .into_iter()
        .find(|id| *id != source)
        .unwrap();

    let migration = h.orch.migrate_workload("job", &target).unwrap();
    assert_eq!(migration.from, source);
    assert_eq!(migration.to, target);
    assert!(h.orch.get_cluster(&target).unwrap().workloads.contains_key("job"));
    assert!(h.orch.get_cluster(&source).unwrap().workloads.is_empty());
    assert_eq!(h.orch.get_group_status(GPU_GROUP).unwrap().metrics.migrations, 1);

    assert!(matches!(
        h.orch.migrate_workload("job", &target),
        Err(GridError::Validation(_))
    ));
    assert!(matches!(
        h.orch.migrate_workload("ghost", &target),
        Err(GridError::NotFound(_))
    ));

    // Two GPUs do not fit next to "job".
    let wide = h.orch.submit_workload(gpu("wide", 2, 1000.0)).await.unwrap();
    assert_eq!(wide.cluster_id.as_deref(), Some(source.as_str()));
    match h.orch.migrate_workload("wide", &target) {
        Err(GridError::Capacity(e)) => assert_eq!(e.code, CapacityReason::NoFeasibleCandidate),
        other => panic!("expected capacity error, got {other:?}"),
    }
}

#[tokio::test]
async fn consolidate_group_on_request() {
    let h = Harness::new(config());
    h.orch.submit_workload(gpu("big", 5, 5000.0)).await.unwrap();
    h.orch.tick().await;
    let mid = h.orch.submit_workload(gpu("mid", 4, 5000.0)).await.unwrap();
    h.orch.tick().await;
    let idle = mid.cluster_id.unwrap();
    h.orch.complete_workload("mid").unwrap();

    h.clock.advance(60);
    let decisions = h.orch.consolidate_group(GPU_GROUP).await.unwrap();
    assert_eq!(decisions.len(), 1);
    assert_eq!(decisions[0].action, ScalingAction::Consolidate);
    assert_eq!(decisions[0].cluster_id.as_deref(), Some(idle.as_str()));
    assert!(matches!(
        h.orch.consolidate_group(GPU_GROUP).await,
        Err(GridError::Busy(_))
    ));

    h.tick_after(10).await;
    let summary = h.orch.get_group_status(GPU_GROUP).unwrap();
    assert_eq!(summary.clusters.len(), 1);
    assert_eq!(summary.metrics.consolidation_events, 1);
}

#[tokio::test]
async fn group_metrics_accrue_cost_per_hour() {
    let h = Harness::new(config());
    let created = h.orch.submit_workload(gpu("train", 2, 1000.0)).await.unwrap();
    assert_eq!(created.node_count, 2);
    h.orch.tick().await;

    h.tick_after(3600).await;
    let metrics = h.orch.get_group_status(GPU_GROUP).unwrap().metrics;
    assert_eq!(metrics.scaling_events, 1);
    assert!((metrics.cost_per_hour - 2.4).abs() < 1e-9);
    assert!((metrics.total_cost - 2.4).abs() < 1e-9, "{}", metrics.total_cost);
}

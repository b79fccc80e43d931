//! GroupOrchestrator — owns the inventory and drives every change to it.
//!
//! Upward requests (`submit_workload`, `request_delete`, ...) and the
//! periodic [`tick`](GroupOrchestrator::tick) both land here. Decisions are
//! computed on a snapshot and applied under ownership tokens; a decision
//! whose target moved on is re-evaluated on a fresh snapshot a bounded
//! number of times.

use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::watch;
use tracing::{debug, info, warn};

use accel_core::{Clock, GridConfig};
use accelgrid_placement::{CandidateKind, MatchResult, Matcher};
use accelgrid_power::{ForecastCache, ForecastEstimate, ForecastGateway, PowerBudgetGuard, PowerView};
use accelgrid_provision::{ProvisioningGateway, RetryPolicy};
use accelgrid_state::{
    ClusterId, ClusterInstance, ClusterStatus, ClusterTypeCatalog, DecisionReason, GroupId,
    GroupMetrics, GroupSummary, Inventory, InventorySnapshot, OwnershipToken, ReasonCode,
    ScalingAction, ScalingDecision, StateError, WorkloadAssignment, WorkloadId,
    WorkloadRequirement,
};

use crate::audit::{AuditEvent, AuditLog, AuditRecord};
use crate::error::{GridError, GridResult};
use crate::lifecycle;
use crate::ops::{InFlightOp, OpKind, OpSummary};
use crate::utilization::UtilizationTracker;

/// Re-evaluations allowed when the inventory changes under a decision.
const MAX_DECISION_ATTEMPTS: usize = 3;

pub(crate) fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

pub(crate) struct Inner {
    pub(crate) config: GridConfig,
    pub(crate) catalog: ClusterTypeCatalog,
    pub(crate) inventory: Inventory,
    pub(crate) matcher: Matcher,
    pub(crate) guard: Mutex<PowerBudgetGuard>,
    pub(crate) forecasts: ForecastCache,
    /// Estimates from the last tick, used by decisions between ticks.
    pub(crate) estimates: Mutex<HashMap<GroupId, ForecastEstimate>>,
    pub(crate) forecaster: Arc<dyn ForecastGateway>,
    pub(crate) provisioner: Arc<dyn ProvisioningGateway>,
    pub(crate) ops: Mutex<BTreeMap<ClusterId, InFlightOp>>,
    pub(crate) utilization: Mutex<UtilizationTracker>,
    pub(crate) audit: Mutex<AuditLog>,
    pub(crate) clock: Arc<dyn Clock>,
    pub(crate) cancel: watch::Receiver<bool>,
    pub(crate) retry: RetryPolicy,
    /// Serializes decide-and-apply so the power gate sees every admission.
    pub(crate) decisions: Mutex<()>,
    pub(crate) metrics: Mutex<BTreeMap<GroupId, GroupMetrics>>,
    /// Time of the last cost accrual.
    pub(crate) last_accrual: Mutex<Option<u64>>,
}

/// Cheap to clone; clones share state.
#[derive(Clone)]
pub struct GroupOrchestrator {
    pub(crate) inner: Arc<Inner>,
}

/// A decision that was written to the inventory.
struct Applied {
    decision: ScalingDecision,
    /// Cluster whose new operation should be driven right away.
    drive: Option<ClusterId>,
}

enum ApplyError {
    /// The snapshot no longer matches; decide again.
    Stale(String),
    Failed(GridError),
}

impl From<StateError> for ApplyError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::StaleRevision { .. } | StateError::NoRoom(_) => {
                ApplyError::Stale(e.to_string())
            }
            other => ApplyError::Failed(other.into()),
        }
    }
}

impl From<GridError> for ApplyError {
    fn from(e: GridError) -> Self {
        ApplyError::Failed(e)
    }
}

impl GroupOrchestrator {
    /// `cancel` interrupts outstanding gateway calls when it flips to `true`.
    pub fn new(
        config: GridConfig,
        catalog: ClusterTypeCatalog,
        provisioner: Arc<dyn ProvisioningGateway>,
        forecaster: Arc<dyn ForecastGateway>,
        clock: Arc<dyn Clock>,
        cancel: watch::Receiver<bool>,
    ) -> Self {
        let matcher = Matcher::from_config(&config);
        let guard = PowerBudgetGuard::new(config.power.clone());
        let utilization = UtilizationTracker::new(
            config.consolidation.low_utilization_threshold,
            config.consolidation.observation_windows,
        );
        let audit = AuditLog::new(config.orchestrator.audit_capacity);
        let retry = RetryPolicy::from_config(&config.provisioning);
        Self {
            inner: Arc::new(Inner {
                config,
                catalog,
                inventory: Inventory::new(),
                matcher,
                guard: Mutex::new(guard),
                forecasts: ForecastCache::new(),
                estimates: Mutex::new(HashMap::new()),
                forecaster,
                provisioner,
                ops: Mutex::new(BTreeMap::new()),
                utilization: Mutex::new(utilization),
                audit: Mutex::new(audit),
                clock,
                cancel,
                retry,
                decisions: Mutex::new(()),
                metrics: Mutex::new(BTreeMap::new()),
                last_accrual: Mutex::new(None),
            }),
        }
    }

    pub fn config(&self) -> &GridConfig {
        &self.inner.config
    }

    pub fn catalog(&self) -> &ClusterTypeCatalog {
        &self.inner.catalog
    }

    pub(crate) fn now(&self) -> u64 {
        self.inner.clock.now_secs()
    }

    // ── Queries ────────────────────────────────────────────────────

    pub fn snapshot(&self) -> InventorySnapshot {
        self.inner.inventory.snapshot()
    }

    pub fn get_group_status(&self, group_id: &str) -> GridResult<GroupSummary> {
        self.snapshot()
            .group_summary(group_id)
            .map(|s| self.with_metrics(s))
            .ok_or_else(|| GridError::NotFound(format!("group {group_id}")))
    }

    pub fn list_groups(&self) -> Vec<GroupSummary> {
        let snapshot = self.snapshot();
        snapshot
            .groups
            .keys()
            .filter_map(|id| snapshot.group_summary(id))
            .map(|s| self.with_metrics(s))
            .collect()
    }

    fn with_metrics(&self, mut summary: GroupSummary) -> GroupSummary {
        if let Some(m) = locked(&self.inner.metrics).get(&summary.group.id) {
            summary.metrics = m.clone();
        }
        summary
    }

    pub fn get_cluster(&self, cluster_id: &str) -> GridResult<ClusterInstance> {
        self.inner
            .inventory
            .cluster(cluster_id)
            .ok_or_else(|| GridError::NotFound(format!("cluster {cluster_id}")))
    }

    /// Power picture as the next decision would see it.
    pub fn power_view(&self) -> PowerView {
        self.view_for(&self.snapshot())
    }

    pub(crate) fn view_for(&self, snapshot: &InventorySnapshot) -> PowerView {
        let estimates = locked(&self.inner.estimates).clone();
        locked(&self.inner.guard).view(snapshot, &estimates)
    }

    pub fn audit_log(&self) -> Vec<AuditRecord> {
        locked(&self.inner.audit).records()
    }

    /// Audit records with a sequence number above `after`.
    pub fn audit_since(&self, after: u64) -> Vec<AuditRecord> {
        locked(&self.inner.audit).since(after)
    }

    pub fn operations(&self) -> Vec<OpSummary> {
        locked(&self.inner.ops)
            .iter()
            .map(|(id, op)| OpSummary {
                cluster_id: id.clone(),
                kind: op.kind,
                attempt: op.retry.attempt(),
                issued_at: op.issued_at,
                forced: op.forced,
            })
            .collect()
    }

    /// Append to the audit trail and bump the group's counters.
    pub(crate) fn record(&self, event: AuditEvent) {
        let now = self.now();
        {
            let mut metrics = locked(&self.inner.metrics);
            match &event {
                AuditEvent::Decision { decision } => {
                    let counted = match decision.action {
                        ScalingAction::Create
                        | ScalingAction::ScaleOut
                        | ScalingAction::ScaleIn
                        | ScalingAction::Delete => Some(false),
                        ScalingAction::Consolidate => Some(true),
                        ScalingAction::Reuse => None,
                    };
                    if let Some(consolidation) = counted {
                        let m = metrics.entry(decision.group_id.clone()).or_default();
                        if consolidation {
                            m.consolidation_events += 1;
                        } else {
                            m.scaling_events += 1;
                        }
                        m.last_event_at = Some(now);
                    }
                }
                AuditEvent::Migration { group_id, .. } => {
                    let m = metrics.entry(group_id.clone()).or_default();
                    m.migrations += 1;
                    m.last_event_at = Some(now);
                }
                AuditEvent::GroupDestroyed { group_id } => {
                    metrics.remove(group_id);
                }
                _ => {}
            }
        }
        locked(&self.inner.audit).record(now, event);
    }

    // ── Workloads ──────────────────────────────────────────────────

    /// Dry run: the decision `submit_workload` would apply right now.
    pub fn evaluate(&self, req: &WorkloadRequirement) -> GridResult<ScalingDecision> {
        req.validate()?;
        let snapshot = self.snapshot();
        let view = self.view_for(&snapshot);
        let result =
            self.inner
                .matcher
                .decide(req, &snapshot, &self.inner.catalog, &view, self.now())?;
        Ok(result.decision)
    }

    /// Place a workload: reuse, create or scale out, then start any
    /// gateway operation the decision needs.
    pub async fn submit_workload(&self, req: WorkloadRequirement) -> GridResult<ScalingDecision> {
        req.validate()?;
        let applied = self.decide_and_apply(&req)?;
        info!(
            workload = %req.workload_id,
            action = ?applied.decision.action,
            group = %applied.decision.group_id,
            cluster = applied.decision.cluster_id.as_deref().unwrap_or("-"),
            nodes = applied.decision.node_count,
            stale_forecast = applied.decision.stale_forecast,
            "workload placed"
        );
        if let Some(cluster_id) = applied.drive {
            self.drive_op(&cluster_id).await;
        }
        Ok(applied.decision)
    }

    fn decide_and_apply(&self, req: &WorkloadRequirement) -> GridResult<Applied> {
        let _serial = locked(&self.inner.decisions);
        for attempt in 1..=MAX_DECISION_ATTEMPTS {
            let now = self.now();
            let snapshot = self.snapshot();
            if let Some(c) = snapshot.find_workload(&req.workload_id) {
                return Err(GridError::Conflict(format!(
                    "workload {} is already placed on {}",
                    req.workload_id, c.id
                )));
            }
            let view = self.view_for(&snapshot);
            let result = self
                .inner
                .matcher
                .decide(req, &snapshot, &self.inner.catalog, &view, now)?;
            match self.apply(req, &snapshot, result, now) {
                Ok(applied) => {
                    self.record(AuditEvent::Decision {
                        decision: applied.decision.clone(),
                    });
                    return Ok(applied);
                }
                Err(ApplyError::Stale(why)) => {
                    debug!(workload = %req.workload_id, attempt, %why, "decision went stale, re-evaluating");
                }
                Err(ApplyError::Failed(e)) => return Err(e),
            }
        }
        warn!(workload = %req.workload_id, "inventory kept changing under the decision");
        Err(GridError::Conflict(format!(
            "inventory kept changing while placing {}",
            req.workload_id
        )))
    }

    fn apply(
        &self,
        req: &WorkloadRequirement,
        snapshot: &InventorySnapshot,
        result: MatchResult,
        now: u64,
    ) -> Result<Applied, ApplyError> {
        let inventory = &self.inner.inventory;
        let MatchResult {
            mut decision,
            candidate,
            expected_revision,
        } = result;
        let assignment = WorkloadAssignment {
            demand: req.demand,
            priority: req.priority,
            assigned_at: now,
        };
        let workload_id = req.workload_id.clone();

        match candidate.kind {
            CandidateKind::Reuse { cluster_id } => {
                let token = inventory.claim_cluster(&cluster_id)?;
                inventory.update_cluster(&token, &cluster_id, expected_revision, now, |c| {
                    if !c.spare().covers(&assignment.demand) {
                        return Err(StateError::NoRoom(c.id.clone()));
                    }
                    c.workloads.insert(workload_id, assignment);
                    Ok(())
                })?;
                Ok(Applied {
                    decision,
                    drive: None,
                })
            }
            CandidateKind::Create { type_id } => {
                let template = self
                    .inner
                    .catalog
                    .get(&type_id)
                    .ok_or_else(|| GridError::NotFound(format!("cluster type {type_id}")))?;
                let group_id = template.group_id();
                let token = inventory.claim_group(&group_id)?;
                let members = inventory.group(&group_id).map_or(0, |g| g.members.len());
                if members != snapshot.member_count(&group_id) {
                    return Err(ApplyError::Stale(format!("{group_id} membership changed")));
                }
                let cluster_id = inventory.next_cluster_id(&type_id);
                let mut cluster =
                    ClusterInstance::pending(cluster_id.clone(), template, decision.node_count, now);
                cluster.workloads.insert(workload_id, assignment);
                inventory.insert_cluster(&token, cluster, now)?;
                self.register_op(&cluster_id, OpKind::Create, false, now)?;
                decision.cluster_id = Some(cluster_id.clone());
                Ok(Applied {
                    decision,
                    drive: Some(cluster_id),
                })
            }
            CandidateKind::ScaleOut {
                cluster_id,
                from_nodes,
            } => {
                let token = inventory.claim_cluster(&cluster_id)?;
                let current = inventory
                    .cluster(&cluster_id)
                    .ok_or_else(|| ApplyError::Stale(format!("cluster {cluster_id} is gone")))?;
                lifecycle::ensure_settled(&current)?;
                lifecycle::ensure_cooldown(&current, now, self.cooldown_secs())?;
                self.ensure_no_op(&cluster_id)?;
                let target = decision.node_count;
                inventory.update_cluster(&token, &cluster_id, expected_revision, now, |c| {
                    lifecycle::begin_scaling(c, target, now);
                    c.workloads.insert(workload_id, assignment);
                    Ok(())
                })?;
                self.register_op(
                    &cluster_id,
                    OpKind::Resize {
                        from: from_nodes,
                        to: target,
                    },
                    false,
                    now,
                )?;
                Ok(Applied {
                    decision,
                    drive: Some(cluster_id),
                })
            }
        }
    }

    /// Remove a finished workload from its cluster. Returns the cluster.
    pub fn complete_workload(&self, workload_id: &str) -> GridResult<ClusterId> {
        let snapshot = self.snapshot();
        let cluster_id = snapshot
            .find_workload(workload_id)
            .map(|c| c.id.clone())
            .ok_or_else(|| GridError::NotFound(format!("workload {workload_id}")))?;
        let token = self.inner.inventory.claim_cluster(&cluster_id)?;
        self.inner
            .inventory
            .update_cluster(&token, &cluster_id, None, self.now(), |c| {
                c.workloads
                    .remove(workload_id)
                    .map(|_| ())
                    .ok_or_else(|| StateError::NotFound(format!("workload {workload_id}")))
            })?;
        info!(workload = %workload_id, cluster = %cluster_id, "workload completed");
        Ok(cluster_id)
    }

    // ── Deletion ───────────────────────────────────────────────────

    /// Drain and delete a cluster. Refused while workloads are assigned
    /// unless `force`, in which case they are evicted. Explicit deletes are
    /// not subject to cooldown.
    pub async fn request_delete(&self, cluster_id: &str, force: bool) -> GridResult<ScalingDecision> {
        let decision = {
            let token = self.inner.inventory.claim_cluster(cluster_id)?;
            let cluster = self.get_cluster(cluster_id)?;
            if !force && !cluster.workloads.is_empty() {
                return Err(GridError::Conflict(format!(
                    "cluster {cluster_id} still runs {} workloads",
                    cluster.workloads.len()
                )));
            }
            self.begin_delete(&token, &cluster, force, ReasonCode::ExplicitDelete)?
        };
        self.drive_op(cluster_id).await;
        Ok(decision)
    }

    /// Delete every member of a group. Checks all members before touching
    /// any of them. A declared group loses its policy so that it goes away
    /// with its last member; one with no members left is removed at once.
    pub async fn delete_group(&self, group_id: &str, force: bool) -> GridResult<Vec<ScalingDecision>> {
        let snapshot = self.snapshot();
        let Some(group) = snapshot.group(group_id) else {
            return Err(GridError::NotFound(format!("group {group_id}")));
        };
        let declared = group.policy.is_some();
        let members: Vec<ClusterInstance> = snapshot
            .members(group_id)
            .filter(|c| c.status != ClusterStatus::Deleted)
            .cloned()
            .collect();
        for c in &members {
            if !force && !c.workloads.is_empty() {
                return Err(GridError::Conflict(format!(
                    "cluster {} still runs {} workloads",
                    c.id,
                    c.workloads.len()
                )));
            }
            if c.status != ClusterStatus::Pending {
                lifecycle::ensure_settled(c)?;
            }
        }

        if declared {
            let now = self.now();
            let inventory = &self.inner.inventory;
            let group_token = inventory.claim_group(group_id)?;
            inventory.set_policy(&group_token, group_id, None, now)?;
            if snapshot.member_count(group_id) == 0 {
                inventory.remove_group(&group_token, group_id)?;
                self.forget_group(group_id);
                return Ok(Vec::new());
            }
        }

        let mut decisions = Vec::new();
        for c in &members {
            let token = self.inner.inventory.claim_cluster(&c.id)?;
            let current = self.get_cluster(&c.id)?;
            decisions.push(self.begin_delete(&token, &current, force, ReasonCode::ExplicitDelete)?);
        }
        for c in &members {
            self.drive_op(&c.id).await;
        }
        info!(group = %group_id, clusters = decisions.len(), "group deletion started");
        Ok(decisions)
    }

    pub(crate) fn begin_delete(
        &self,
        token: &OwnershipToken,
        cluster: &ClusterInstance,
        force: bool,
        code: ReasonCode,
    ) -> GridResult<ScalingDecision> {
        let now = self.now();
        match cluster.status {
            ClusterStatus::Active | ClusterStatus::Error => self.ensure_no_op(&cluster.id)?,
            // Never issued to the gateway; nothing to tear down.
            ClusterStatus::Pending => {
                locked(&self.inner.ops).remove(&cluster.id);
            }
            ClusterStatus::Deleted => {
                return Err(GridError::NotFound(format!("cluster {}", cluster.id)));
            }
            _ => lifecycle::ensure_settled(cluster)?,
        }

        let evicted = if cluster.status == ClusterStatus::Pending {
            self.inner
                .inventory
                .update_cluster(token, &cluster.id, None, now, |c| {
                    c.status = ClusterStatus::Deleted;
                    Ok(std::mem::take(&mut c.workloads).into_keys().collect::<Vec<WorkloadId>>())
                })?
        } else {
            let evicted = self
                .inner
                .inventory
                .update_cluster(token, &cluster.id, None, now, |c| {
                    Ok(lifecycle::begin_drain(c, now))
                })?;
            self.register_op(&cluster.id, OpKind::Delete, force, now)?;
            evicted
        };

        if !evicted.is_empty() {
            warn!(cluster = %cluster.id, evicted = evicted.len(), "workloads evicted by forced delete");
            self.record(AuditEvent::Eviction {
                cluster_id: cluster.id.clone(),
                workloads: evicted,
                reason: "forced delete".to_string(),
            });
        }
        let decision = ScalingDecision {
            action: ScalingAction::Delete,
            group_id: cluster.group_id.clone(),
            cluster_id: Some(cluster.id.clone()),
            cluster_type: cluster.type_id.clone(),
            node_count: 0,
            reason: DecisionReason {
                code,
                detail: format!("delete requested from {}", cluster.status),
            },
            workload_id: None,
            timestamp: now,
            stale_forecast: false,
            forced: force,
        };
        self.record(AuditEvent::Decision {
            decision: decision.clone(),
        });
        info!(cluster = %cluster.id, force, "cluster deletion started");
        Ok(decision)
    }

    // ── Operations ─────────────────────────────────────────────────

    /// Queue a gateway operation. A cluster carries at most one; an
    /// occupied slot is left alone and reported as a conflict.
    pub(crate) fn register_op(
        &self,
        cluster_id: &str,
        kind: OpKind,
        forced: bool,
        now: u64,
    ) -> GridResult<()> {
        let mut ops = locked(&self.inner.ops);
        if let Some(existing) = ops.get(cluster_id) {
            warn!(
                cluster = %cluster_id,
                existing = existing.kind.label(),
                requested = kind.label(),
                "operation already outstanding"
            );
            return Err(GridError::Conflict(format!(
                "cluster {cluster_id} already has a {} operation outstanding",
                existing.kind.label()
            )));
        }
        ops.insert(
            cluster_id.to_string(),
            InFlightOp::new(kind, self.inner.retry, now, forced),
        );
        Ok(())
    }

    /// Refuse to touch a cluster whose operation is still outstanding.
    /// Checked under the cluster's token, before the inventory changes.
    pub(crate) fn ensure_no_op(&self, cluster_id: &str) -> GridResult<()> {
        match locked(&self.inner.ops).get(cluster_id) {
            Some(op) => Err(GridError::Busy(format!(
                "cluster {cluster_id} has a {} operation outstanding",
                op.kind.label()
            ))),
            None => Ok(()),
        }
    }

    pub(crate) fn cooldown_secs(&self) -> u64 {
        self.inner.config.orchestrator.cooldown().as_secs()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use accel_core::ManualClock;
    use accelgrid_power::SimulatedForecaster;
    use accelgrid_provision::SimulatedGateway;

    fn orchestrator() -> GroupOrchestrator {
        let (_cancel, cancel_rx) = watch::channel(false);
        GroupOrchestrator::new(
            GridConfig::default(),
            ClusterTypeCatalog::builtin(),
            Arc::new(SimulatedGateway::new(0)),
            Arc::new(SimulatedForecaster::default()),
            Arc::new(ManualClock::new(100)),
            cancel_rx,
        )
    }

    #[test]
    fn second_operation_on_a_cluster_is_a_conflict() {
        let orch = orchestrator();
        orch.register_op("c1", OpKind::Create, false, 100).unwrap();

        let err = orch.register_op("c1", OpKind::Delete, true, 101).unwrap_err();
        assert!(matches!(err, GridError::Conflict(_)), "{err}");
        assert!(matches!(orch.ensure_no_op("c1"), Err(GridError::Busy(_))));

        let ops = orch.operations();
        assert_eq!(ops.len(), 1);
        assert_eq!(ops[0].kind, OpKind::Create);
        assert!(!ops[0].forced);

        assert!(orch.ensure_no_op("c2").is_ok());
        orch.register_op("c2", OpKind::Delete, false, 102).unwrap();
        assert_eq!(orch.operations().len(), 2);
    }

    #[test]
    fn decisions_feed_group_metrics() {
        let orch = orchestrator();
        let decision = |action| ScalingDecision {
            action,
            group_id: "group-gpu-intensive".to_string(),
            cluster_id: Some("c1".to_string()),
            cluster_type: "gpu-intensive".to_string(),
            node_count: 1,
            reason: DecisionReason {
                code: ReasonCode::ExplicitScale,
                detail: String::new(),
            },
            workload_id: None,
            timestamp: 100,
            stale_forecast: false,
            forced: false,
        };
        for action in [ScalingAction::Create, ScalingAction::Reuse, ScalingAction::Consolidate] {
            orch.record(AuditEvent::Decision {
                decision: decision(action),
            });
        }
        let metrics = locked(&orch.inner.metrics)["group-gpu-intensive"].clone();
        assert_eq!(metrics.scaling_events, 1);
        assert_eq!(metrics.consolidation_events, 1);
        assert_eq!(metrics.last_event_at, Some(100));

        orch.record(AuditEvent::GroupDestroyed {
            group_id: "group-gpu-intensive".to_string(),
        });
        assert!(locked(&orch.inner.metrics).is_empty());
    }
}

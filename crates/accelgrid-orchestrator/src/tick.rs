//! The periodic control loop.
//!
//! One tick:
//!
//! 1. snapshot the inventory, accrue group costs and refresh per-group
//!    forecasts concurrently;
//! 2. evaluate the power guard and issue forced scale-ins for sustained
//!    violations;
//! 3. record a utilization window and consolidate groups whose clusters
//!    stayed under the threshold long enough;
//! 4. top declared groups back up to their minimum cluster count;
//! 5. drive every outstanding gateway operation one step;
//! 6. sweep deleted clusters and close finished rebalancing passes.

use std::collections::{HashMap, HashSet};
use std::time::Duration;

use tokio::sync::watch;
use tokio::task::JoinSet;
use tracing::{debug, error, info, warn};

use accelgrid_power::{BudgetScope, BudgetViolation, ClusterFeatures, ForecastEstimate};
use accelgrid_state::{
    ClusterId, ClusterStatus, DecisionReason, GroupId, InventorySnapshot, ReasonCode,
    ScalingAction, ScalingDecision, StateError,
};

use crate::audit::AuditEvent;
use crate::error::GridError;
use crate::lifecycle;
use crate::orchestrator::{locked, GroupOrchestrator};
use crate::ops::{OpKind, OpProgress};
use crate::planning::{self, ConsolidationPlan};

/// What one tick did.
#[derive(Debug, Default)]
pub struct TickReport {
    pub at: u64,
    /// Inventory version after the tick.
    pub version: u64,
    pub stale_forecasts: usize,
    pub violations: Vec<BudgetViolation>,
    /// Decisions taken autonomously (forced scale-ins, consolidations).
    pub decisions: Vec<ScalingDecision>,
    /// Clusters whose operation finished this tick.
    pub completed: Vec<ClusterId>,
    /// Clusters that entered `Error` this tick.
    pub failed: Vec<ClusterId>,
    pub in_flight: usize,
    pub errors: Vec<GridError>,
}

impl GroupOrchestrator {
    /// Run ticks every `interval` until `shutdown` flips.
    pub async fn run(&self, interval: Duration, mut shutdown: watch::Receiver<bool>) {
        info!(?interval, "orchestrator loop started");
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    let report = self.tick().await;
                    for e in &report.errors {
                        error!(error = %e, "tick error");
                    }
                    debug!(
                        version = report.version,
                        decisions = report.decisions.len(),
                        completed = report.completed.len(),
                        in_flight = report.in_flight,
                        "tick finished"
                    );
                }
                _ = shutdown.changed() => {
                    info!("orchestrator loop shutting down");
                    break;
                }
            }
        }
    }

    pub async fn tick(&self) -> TickReport {
        let now = self.now();
        let snapshot = self.snapshot();
        let mut report = TickReport {
            at: now,
            ..Default::default()
        };
        self.accrue_costs(&snapshot, now);

        let estimates = self.refresh_forecasts(&snapshot, now).await;
        report.stale_forecasts = estimates.values().filter(|e| e.stale).count();

        let violations = {
            let mut guard = locked(&self.inner.guard);
            let view = guard.view(&snapshot, &estimates);
            guard.observe(&view, now)
        };
        // Group scopes come before the site; shedding done for a group
        // counts toward the site's excess.
        let mut shed = 0.0;
        for violation in &violations {
            self.record(AuditEvent::BudgetViolation {
                violation: violation.clone(),
            });
            let excess = match violation.scope {
                BudgetScope::Site => violation.excess_watts() - shed,
                BudgetScope::Group(_) => violation.excess_watts(),
            };
            if excess <= 0.0 {
                debug!(scope = %violation.scope, "excess already covered this tick");
                continue;
            }
            shed += self.correct(violation, excess, &snapshot, now, &mut report);
        }
        report.violations = violations;

        if self.inner.config.consolidation.enabled {
            let sustained = locked(&self.inner.utilization).observe(&snapshot);
            for (group_id, low) in sustained {
                let decisions = self.consolidate(&snapshot, &group_id, &low, now);
                report.decisions.extend(decisions);
            }
        }

        for group_id in snapshot.groups.keys() {
            let decisions = self.replenish_group(group_id, &mut report.errors);
            report.decisions.extend(decisions);
        }

        self.reconcile(&mut report).await;
        self.sweep(now);

        report.in_flight = locked(&self.inner.ops).len();
        report.version = self.inner.inventory.version();
        report
    }

    // ── Forecasts ──────────────────────────────────────────────────

    async fn refresh_forecasts(
        &self,
        snapshot: &InventorySnapshot,
        now: u64,
    ) -> HashMap<GroupId, ForecastEstimate> {
        let horizon = self.inner.config.forecast.horizon();
        let call_timeout = self.inner.config.forecast.call_timeout();

        let mut tasks = JoinSet::new();
        for (group_id, group) in &snapshot.groups {
            let members: Vec<_> = snapshot.members(group_id).collect();
            let features = ClusterFeatures {
                group_id: group_id.clone(),
                kind: group.group_type,
                clusters: members.len(),
                nodes: members.iter().map(|c| c.node_count).sum(),
                committed_watts: snapshot.committed_watts(group_id),
                utilization: snapshot
                    .group_allocated(group_id)
                    .dominant_share(&snapshot.group_capacity(group_id)),
                timestamp: now,
            };
            let this = self.clone();
            tasks.spawn(async move {
                let estimate = this
                    .inner
                    .forecasts
                    .refresh(this.inner.forecaster.as_ref(), &features, horizon, call_timeout)
                    .await;
                (features.group_id, estimate)
            });
        }

        let mut estimates = HashMap::new();
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((group_id, estimate)) => {
                    estimates.insert(group_id, estimate);
                }
                Err(e) => error!(error = %e, "forecast task failed"),
            }
        }
        *locked(&self.inner.estimates) = estimates.clone();
        estimates
    }

    // ── Forced corrections ─────────────────────────────────────────

    /// Issue forced scale-ins shedding `excess` watts. Returns the watts
    /// actually scheduled for shedding.
    fn correct(
        &self,
        violation: &BudgetViolation,
        excess: f64,
        snapshot: &InventorySnapshot,
        now: u64,
        report: &mut TickReport,
    ) -> f64 {
        let busy: HashSet<ClusterId> = locked(&self.inner.ops).keys().cloned().collect();
        let plan = planning::plan_forced_scale_in(
            &violation.scope,
            excess,
            snapshot,
            &self.inner.catalog,
            &busy,
        );
        let mut shed = 0.0;

        for correction in plan.corrections {
            let inventory = &self.inner.inventory;
            let Ok(token) = inventory.claim_cluster(&correction.cluster_id) else {
                warn!(cluster = %correction.cluster_id, "cluster busy, correction deferred");
                continue;
            };
            if let Err(e) = self.ensure_no_op(&correction.cluster_id) {
                warn!(cluster = %correction.cluster_id, error = %e, "correction deferred");
                continue;
            }
            let to = correction.to_nodes;
            let planned = correction.evictions.clone();
            // Workloads may have arrived since the snapshot; evict again
            // against live state.
            let applied = inventory.update_cluster(&token, &correction.cluster_id, None, now, |c| {
                if c.status != ClusterStatus::Active {
                    return Err(StateError::Busy(format!("cluster {} is {}", c.id, c.status)));
                }
                for w in &planned {
                    c.workloads.remove(w);
                }
                let extra = planning::evictions_to_fit(&c.workloads, &c.node_shape.scale(to));
                for w in &extra {
                    c.workloads.remove(w);
                }
                let from = c.node_count;
                lifecycle::begin_scaling(c, to, now);
                let mut evicted = planned.clone();
                evicted.extend(extra);
                Ok((from, evicted))
            });
            let (from, evicted) = match applied {
                Ok(out) => out,
                Err(e) => {
                    warn!(cluster = %correction.cluster_id, error = %e, "correction skipped");
                    continue;
                }
            };
            if let Err(e) =
                self.register_op(&correction.cluster_id, OpKind::Resize { from, to }, true, now)
            {
                report.errors.push(e);
                continue;
            }
            shed += correction.shed_watts;

            if !evicted.is_empty() {
                warn!(cluster = %correction.cluster_id, evicted = evicted.len(), "workloads evicted by power correction");
                self.record(AuditEvent::Eviction {
                    cluster_id: correction.cluster_id.clone(),
                    workloads: evicted,
                    reason: format!("power correction on {}", violation.scope),
                });
            }
            let Some(cluster) = snapshot.cluster(&correction.cluster_id) else {
                continue;
            };
            let decision = ScalingDecision {
                action: ScalingAction::ScaleIn,
                group_id: cluster.group_id.clone(),
                cluster_id: Some(correction.cluster_id.clone()),
                cluster_type: cluster.type_id.clone(),
                node_count: to,
                reason: DecisionReason {
                    code: ReasonCode::BudgetCorrection,
                    detail: format!(
                        "{} at {:.0} W over {:.0} W ceiling, shedding {:.0} W",
                        violation.scope,
                        violation.load_watts,
                        violation.ceiling_watts,
                        correction.shed_watts
                    ),
                },
                workload_id: None,
                timestamp: now,
                stale_forecast: violation.stale,
                forced: true,
            };
            info!(cluster = %correction.cluster_id, from, to, "forced scale-in issued");
            self.record(AuditEvent::Decision {
                decision: decision.clone(),
            });
            report.decisions.push(decision);
        }

        if plan.unresolved_watts > 0.0 {
            error!(
                scope = %violation.scope,
                unresolved = plan.unresolved_watts,
                "power correction cannot reach target this tick"
            );
            report.errors.push(GridError::BudgetViolation {
                scope: violation.scope.to_string(),
                load_watts: violation.load_watts,
                ceiling_watts: violation.ceiling_watts,
            });
        }
        shed
    }

    // ── Consolidation ──────────────────────────────────────────────

    /// Drain what can be drained among `low`, moving their workloads onto
    /// the rest of the group first. Returns the consolidation decisions.
    pub(crate) fn consolidate(
        &self,
        snapshot: &InventorySnapshot,
        group_id: &str,
        low: &[ClusterId],
        now: u64,
    ) -> Vec<ScalingDecision> {
        let mut decisions = Vec::new();
        if snapshot.group(group_id).is_none_or(|g| g.rebalancing) {
            return decisions;
        }
        let floor = snapshot.min_clusters_for(
            group_id,
            self.inner.config.orchestrator.min_clusters_per_group,
        );
        let plan = planning::plan_consolidation(
            snapshot,
            group_id,
            low,
            floor,
            self.cooldown_secs(),
            now,
        );
        if plan.is_empty() {
            debug!(group = %group_id, "no cluster can be drained");
            return decisions;
        }
        let Ok(group_token) = self.inner.inventory.claim_group(group_id) else {
            debug!(group = %group_id, "group busy, consolidation deferred");
            return decisions;
        };
        if let Err(e) = self
            .inner
            .inventory
            .set_rebalancing(&group_token, group_id, true, now)
        {
            warn!(group = %group_id, error = %e, "could not start rebalancing");
            return decisions;
        }
        info!(group = %group_id, moves = plan.moves.len(), drains = plan.drains.len(), "consolidating group");

        let blocked = self.apply_moves(&plan, now);
        for cluster_id in plan.drains.iter().filter(|id| !blocked.contains(*id)) {
            match self.drain_empty(snapshot, cluster_id, now) {
                Ok(decision) => {
                    self.record(AuditEvent::Decision {
                        decision: decision.clone(),
                    });
                    decisions.push(decision);
                }
                Err(e) => warn!(cluster = %cluster_id, error = %e, "drain skipped"),
            }
        }
        if decisions.is_empty() {
            // Nothing is draining; leave the group as it was.
            if let Err(e) = self
                .inner
                .inventory
                .set_rebalancing(&group_token, group_id, false, now)
            {
                warn!(group = %group_id, error = %e, "could not clear rebalancing");
            }
        }
        decisions
    }

    /// Apply the planned moves. Returns the sources that could not be
    /// emptied.
    fn apply_moves(&self, plan: &ConsolidationPlan, now: u64) -> HashSet<ClusterId> {
        let inventory = &self.inner.inventory;
        let mut blocked = HashSet::new();
        for m in &plan.moves {
            if blocked.contains(&m.from) {
                continue;
            }
            let moved = inventory.claim_cluster(&m.from).and_then(|from| {
                let to = inventory.claim_cluster(&m.to)?;
                inventory.move_workload(&from, &to, &m.from, &m.to, &m.workload_id, now)
            });
            if let Err(e) = moved {
                warn!(workload = %m.workload_id, from = %m.from, to = %m.to, error = %e, "workload move failed");
                blocked.insert(m.from.clone());
            }
        }
        blocked
    }

    /// Move an empty Active cluster to `Draining` and queue its delete.
    fn drain_empty(
        &self,
        snapshot: &InventorySnapshot,
        cluster_id: &str,
        now: u64,
    ) -> Result<ScalingDecision, GridError> {
        let inventory = &self.inner.inventory;
        let token = inventory.claim_cluster(cluster_id)?;
        let current = self.get_cluster(cluster_id)?;
        lifecycle::ensure_settled(&current)?;
        lifecycle::ensure_cooldown(&current, now, self.cooldown_secs())?;
        self.ensure_no_op(cluster_id)?;
        inventory.update_cluster(&token, cluster_id, None, now, |c| {
            if !c.workloads.is_empty() {
                return Err(StateError::Busy(format!(
                    "cluster {} still has {} workloads",
                    c.id,
                    c.workloads.len()
                )));
            }
            lifecycle::begin_drain(c, now);
            Ok(())
        })?;
        self.register_op(cluster_id, OpKind::Delete, false, now)?;

        let utilization = snapshot.cluster(cluster_id).map_or(0.0, |c| c.utilization());
        Ok(ScalingDecision {
            action: ScalingAction::Consolidate,
            group_id: current.group_id.clone(),
            cluster_id: Some(cluster_id.to_string()),
            cluster_type: current.type_id.clone(),
            node_count: 0,
            reason: DecisionReason {
                code: ReasonCode::LowUtilization,
                detail: format!(
                    "utilization {:.0}% for {} windows",
                    utilization * 100.0,
                    self.inner.config.consolidation.observation_windows
                ),
            },
            workload_id: None,
            timestamp: now,
            stale_forecast: false,
            forced: false,
        })
    }

    // ── Reconcile and sweep ────────────────────────────────────────

    async fn reconcile(&self, report: &mut TickReport) {
        let ids: Vec<ClusterId> = locked(&self.inner.ops).keys().cloned().collect();
        let mut tasks = JoinSet::new();
        for id in ids {
            let this = self.clone();
            tasks.spawn(async move {
                let progress = this.drive_op(&id).await;
                (id, progress)
            });
        }
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((id, Some(OpProgress::Completed))) => report.completed.push(id),
                Ok((id, Some(OpProgress::Failed(e)))) => {
                    report.failed.push(id);
                    report.errors.push(e);
                }
                Ok(_) => {}
                Err(e) => error!(error = %e, "reconcile task failed"),
            }
        }
    }

    fn sweep(&self, now: u64) {
        let inventory = &self.inner.inventory;
        let snapshot = inventory.snapshot();

        for cluster in snapshot
            .clusters
            .values()
            .filter(|c| c.status == ClusterStatus::Deleted)
        {
            let (Ok(token), Ok(group_token)) = (
                inventory.claim_cluster(&cluster.id),
                inventory.claim_group(&cluster.group_id),
            ) else {
                continue;
            };
            self.remove_deleted(&token, &group_token, &cluster.id, now);
        }

        let snapshot = inventory.snapshot();
        for group in snapshot.groups.values().filter(|g| g.rebalancing) {
            let draining = snapshot
                .members(&group.id)
                .any(|c| c.status == ClusterStatus::Draining);
            if draining {
                continue;
            }
            let Ok(group_token) = inventory.claim_group(&group.id) else {
                continue;
            };
            match inventory.set_rebalancing(&group_token, &group.id, false, now) {
                Ok(status) => info!(group = %group.id, %status, "consolidation finished"),
                Err(e) => warn!(group = %group.id, error = %e, "could not clear rebalancing"),
            }
        }
    }
}

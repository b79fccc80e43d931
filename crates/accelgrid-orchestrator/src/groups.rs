//! Declared groups and operator commands.
//!
//! Groups normally appear with their first placed cluster. Declaring one
//! with a [`GroupSpec`] pins min/max cluster bounds to it: the tick keeps
//! it at or above its minimum, and the matcher never grows it past its
//! maximum. Operators can also resize a group to an explicit cluster
//! count, add a single cluster, move a workload between clusters or
//! consolidate a group on demand. Explicit commands skip cooldown.

use std::cmp::Reverse;

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use accelgrid_state::{
    CapacityError, CapacityReason, ClusterGroup, ClusterId, ClusterInstance, ClusterStatus,
    ClusterTypeId, DecisionReason, GroupPolicy, GroupSummary, InventorySnapshot, ReasonCode,
    ScalingAction, ScalingDecision, StateError, ValidationError, WorkloadId,
};

use crate::audit::AuditEvent;
use crate::error::{GridError, GridResult};
use crate::lifecycle;
use crate::orchestrator::{locked, GroupOrchestrator};
use crate::ops::OpKind;

/// Request to declare a group for a cluster template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GroupSpec {
    pub type_id: ClusterTypeId,
    #[serde(default)]
    pub min_clusters: u32,
    /// `[orchestrator] max_clusters_per_group` when unset.
    #[serde(default)]
    pub max_clusters: Option<u32>,
    /// Node count of clusters created on the group's behalf.
    #[serde(default)]
    pub node_count: Option<u32>,
}

/// A completed workload move.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Migration {
    pub workload_id: WorkloadId,
    pub from: ClusterId,
    pub to: ClusterId,
    pub timestamp: u64,
}

impl GroupOrchestrator {
    /// Declare a group and start the clusters its minimum calls for. An
    /// implicit group of the same template adopts the policy instead.
    pub async fn create_group(&self, spec: GroupSpec) -> GridResult<GroupSummary> {
        let template = self
            .inner
            .catalog
            .get(&spec.type_id)
            .ok_or_else(|| GridError::NotFound(format!("cluster type {}", spec.type_id)))?;
        let policy = GroupPolicy {
            min_clusters: spec.min_clusters,
            max_clusters: spec
                .max_clusters
                .unwrap_or(self.inner.config.orchestrator.max_clusters_per_group),
            node_count: spec.node_count,
        };
        policy.validate(template)?;
        let group_id = template.group_id();
        let now = self.now();

        {
            let inventory = &self.inner.inventory;
            let token = inventory.claim_group(&group_id)?;
            match inventory.group(&group_id) {
                Some(group) if group.policy.is_some() => {
                    return Err(GridError::Conflict(format!("group {group_id} is already declared")));
                }
                Some(group) => {
                    if group.members.len() > policy.max_clusters as usize {
                        return Err(GridError::Conflict(format!(
                            "group {group_id} already has {} clusters, above max_clusters {}",
                            group.members.len(),
                            policy.max_clusters
                        )));
                    }
                    inventory.set_policy(&token, &group_id, Some(policy), now)?;
                }
                None => {
                    inventory.create_group(&token, ClusterGroup::declared(template, policy, now), now)?;
                }
            }
        }
        info!(
            group = %group_id,
            min = policy.min_clusters,
            max = policy.max_clusters,
            "group declared"
        );
        self.record(AuditEvent::GroupCreated {
            group_id: group_id.clone(),
            policy,
        });

        let mut errors = Vec::new();
        let started = self.replenish_group(&group_id, &mut errors);
        for e in &errors {
            warn!(group = %group_id, error = %e, "group declared below its minimum");
        }
        self.drive_all(&started).await;
        self.get_group_status(&group_id)
    }

    /// Grow or shrink a group to `target` live clusters.
    ///
    /// Growth checks the power gate for every added cluster up front.
    /// Shrinking picks failed clusters first, then the emptiest and
    /// newest; clusters still running workloads need `force`.
    pub async fn scale_group(
        &self,
        group_id: &str,
        target: u32,
        force: bool,
    ) -> GridResult<Vec<ScalingDecision>> {
        let snapshot = self.snapshot();
        let group = snapshot
            .group(group_id)
            .ok_or_else(|| GridError::NotFound(format!("group {group_id}")))?;
        if group.rebalancing {
            return Err(GridError::Busy(format!("group {group_id} is rebalancing")));
        }
        let min = snapshot.min_clusters_for(group_id, 0);
        let max = snapshot.max_clusters_for(group_id, self.inner.config.orchestrator.max_clusters_per_group);
        if target < min || target > max {
            return Err(ValidationError::new(format!(
                "target_clusters {target} is outside {min}..={max} for {group_id}"
            ))
            .into());
        }

        let live: Vec<&ClusterInstance> = snapshot.live_members(group_id).collect();
        let current = live.len() as u32;
        let detail = format!("{group_id} scaled from {current} to {target} clusters");
        let mut decisions = Vec::new();

        if target > current {
            let template = self
                .inner
                .catalog
                .get(&group.type_id)
                .ok_or_else(|| GridError::NotFound(format!("cluster type {}", group.type_id)))?;
            let nodes = group.policy.map_or(template.min_nodes, |p| p.nodes_for(template));
            let added = template.power_for(nodes) * f64::from(target - current);
            let admission = self.view_for(&snapshot).admit(group_id, added);
            if !admission.admitted {
                return Err(CapacityError::new(
                    CapacityReason::PowerCeilingReached,
                    format!(
                        "{} more clusters would put {group_id} at {:.0} W against {:.0} W",
                        target - current,
                        admission.load_watts,
                        admission.limit_watts
                    ),
                )
                .into());
            }
            for _ in current..target {
                decisions.push(self.create_member(group_id, None, ReasonCode::ExplicitScale, &detail)?);
            }
        } else if target < current {
            let mut victims = live;
            victims.sort_by_key(|c| {
                (
                    c.status != ClusterStatus::Error,
                    c.workloads.len(),
                    Reverse(c.created_at),
                    c.id.clone(),
                )
            });
            victims.truncate((current - target) as usize);
            for c in &victims {
                if !force && !c.workloads.is_empty() {
                    return Err(GridError::Conflict(format!(
                        "cluster {} still runs {} workloads",
                        c.id,
                        c.workloads.len()
                    )));
                }
                if !matches!(c.status, ClusterStatus::Pending | ClusterStatus::Error) {
                    lifecycle::ensure_settled(c)?;
                }
            }
            for c in &victims {
                let token = self.inner.inventory.claim_cluster(&c.id)?;
                let cluster = self.get_cluster(&c.id)?;
                decisions.push(self.begin_delete(&token, &cluster, force, ReasonCode::ExplicitScale)?);
            }
        }

        info!(group = %group_id, from = current, to = target, "group scaled");
        self.drive_all(&decisions).await;
        Ok(decisions)
    }

    /// Add one cluster to a group, at `node_count` nodes or the group's
    /// default size.
    pub async fn add_cluster(&self, group_id: &str, node_count: Option<u32>) -> GridResult<ScalingDecision> {
        let decision = self.create_member(
            group_id,
            node_count,
            ReasonCode::ExplicitScale,
            &format!("cluster added to {group_id}"),
        )?;
        self.drive_all(std::slice::from_ref(&decision)).await;
        Ok(decision)
    }

    /// Move a workload onto another Active cluster with room for it.
    pub fn migrate_workload(&self, workload_id: &str, target_id: &str) -> GridResult<Migration> {
        let inventory = &self.inner.inventory;
        let source_id = self
            .snapshot()
            .find_workload(workload_id)
            .map(|c| c.id.clone())
            .ok_or_else(|| GridError::NotFound(format!("workload {workload_id}")))?;
        if source_id == target_id {
            return Err(ValidationError::new(format!(
                "workload {workload_id} already runs on {target_id}"
            ))
            .into());
        }

        let from_token = inventory.claim_cluster(&source_id)?;
        let to_token = inventory.claim_cluster(target_id)?;
        let source = self.get_cluster(&source_id)?;
        let target = self.get_cluster(target_id)?;
        if !matches!(source.status, ClusterStatus::Active | ClusterStatus::Error) {
            return Err(GridError::Busy(format!("cluster {source_id} is {}", source.status)));
        }
        if target.status != ClusterStatus::Active {
            return Err(GridError::Conflict(format!(
                "cluster {target_id} is {}, not active",
                target.status
            )));
        }

        let now = self.now();
        match inventory.move_workload(&from_token, &to_token, &source_id, target_id, workload_id, now) {
            Ok(()) => {}
            Err(StateError::NoRoom(what)) => {
                return Err(CapacityError::new(
                    CapacityReason::NoFeasibleCandidate,
                    format!("no room on {what}"),
                )
                .into());
            }
            Err(e) => return Err(e.into()),
        }

        info!(workload = %workload_id, from = %source_id, to = %target_id, "workload migrated");
        self.record(AuditEvent::Migration {
            workload_id: workload_id.to_string(),
            group_id: target.group_id.clone(),
            from: source_id.clone(),
            to: target_id.to_string(),
        });
        Ok(Migration {
            workload_id: workload_id.to_string(),
            from: source_id,
            to: target_id.to_string(),
            timestamp: now,
        })
    }

    /// Consolidate a group now, over every Active member below the
    /// utilization threshold, without waiting for sustained windows.
    pub async fn consolidate_group(&self, group_id: &str) -> GridResult<Vec<ScalingDecision>> {
        let snapshot = self.snapshot();
        let group = snapshot
            .group(group_id)
            .ok_or_else(|| GridError::NotFound(format!("group {group_id}")))?;
        if group.rebalancing {
            return Err(GridError::Busy(format!("group {group_id} is already rebalancing")));
        }
        let threshold = self.inner.config.consolidation.low_utilization_threshold;
        let low: Vec<ClusterId> = snapshot
            .members(group_id)
            .filter(|c| c.status == ClusterStatus::Active && c.utilization() < threshold)
            .map(|c| c.id.clone())
            .collect();
        let decisions = self.consolidate(&snapshot, group_id, &low, self.now());
        info!(group = %group_id, drained = decisions.len(), "consolidation requested");
        self.drive_all(&decisions).await;
        Ok(decisions)
    }

    // ── Internals ──────────────────────────────────────────────────

    /// Start the clusters a declared group is missing to reach its
    /// minimum. Stops at the first failure, which lands in `errors`.
    pub(crate) fn replenish_group(
        &self,
        group_id: &str,
        errors: &mut Vec<GridError>,
    ) -> Vec<ScalingDecision> {
        let snapshot = self.snapshot();
        let mut decisions = Vec::new();
        let Some(group) = snapshot.group(group_id) else {
            return decisions;
        };
        let Some(policy) = group.policy else {
            return decisions;
        };
        if group.rebalancing {
            return decisions;
        }
        let live = snapshot.live_members(group_id).count() as u32;
        if live >= policy.min_clusters {
            return decisions;
        }
        let detail = format!("{group_id} has {live} of {} minimum clusters", policy.min_clusters);
        for _ in live..policy.min_clusters {
            match self.create_member(group_id, None, ReasonCode::MinClusters, &detail) {
                Ok(decision) => decisions.push(decision),
                Err(e) => {
                    warn!(group = %group_id, error = %e, "could not replenish group");
                    errors.push(e);
                    break;
                }
            }
        }
        decisions
    }

    /// Insert a Pending cluster into a group and queue its create. Holds
    /// the decision lock so the power gate sees it like any placement.
    fn create_member(
        &self,
        group_id: &str,
        node_count: Option<u32>,
        code: ReasonCode,
        detail: &str,
    ) -> GridResult<ScalingDecision> {
        let _serial = locked(&self.inner.decisions);
        let now = self.now();
        let snapshot = self.snapshot();
        let group = snapshot
            .group(group_id)
            .ok_or_else(|| GridError::NotFound(format!("group {group_id}")))?;
        let template = self
            .inner
            .catalog
            .get(&group.type_id)
            .ok_or_else(|| GridError::NotFound(format!("cluster type {}", group.type_id)))?;
        let nodes = node_count
            .or(group.policy.and_then(|p| p.node_count))
            .unwrap_or(template.min_nodes);
        if nodes < template.min_nodes || nodes > template.max_nodes {
            return Err(ValidationError::new(format!(
                "node_count {nodes} is outside {}..={} for {}",
                template.min_nodes, template.max_nodes, template.id
            ))
            .into());
        }

        let limit = snapshot.max_clusters_for(group_id, self.inner.config.orchestrator.max_clusters_per_group);
        if snapshot.member_count(group_id) >= limit as usize {
            return Err(CapacityError::new(
                CapacityReason::ClusterLimitReached,
                format!("{group_id} is at its limit of {limit} clusters"),
            )
            .into());
        }
        let watts = template.power_for(nodes);
        let admission = self.view_for(&snapshot).admit(group_id, watts);
        if !admission.admitted {
            return Err(CapacityError::new(
                CapacityReason::PowerCeilingReached,
                format!(
                    "{watts:.0} W more would put {group_id} at {:.0} W against {:.0} W",
                    admission.load_watts, admission.limit_watts
                ),
            )
            .into());
        }

        let inventory = &self.inner.inventory;
        let token = inventory.claim_group(group_id)?;
        let cluster_id = inventory.next_cluster_id(&template.id);
        let cluster = ClusterInstance::pending(cluster_id.clone(), template, nodes, now);
        inventory.insert_cluster(&token, cluster, now)?;
        self.register_op(&cluster_id, OpKind::Create, false, now)?;
        debug!(group = %group_id, cluster = %cluster_id, nodes, ?code, "group member created");

        let decision = ScalingDecision {
            action: ScalingAction::Create,
            group_id: group_id.to_string(),
            cluster_id: Some(cluster_id),
            cluster_type: template.id.clone(),
            node_count: nodes,
            reason: DecisionReason {
                code,
                detail: detail.to_string(),
            },
            workload_id: None,
            timestamp: now,
            stale_forecast: admission.stale,
            forced: false,
        };
        self.record(AuditEvent::Decision {
            decision: decision.clone(),
        });
        Ok(decision)
    }

    async fn drive_all(&self, decisions: &[ScalingDecision]) {
        for cluster_id in decisions.iter().filter_map(|d| d.cluster_id.as_deref()) {
            self.drive_op(cluster_id).await;
        }
    }

    /// Charge every group for the time since the last accrual at the rate
    /// it had then, and take the new rate from the current members.
    /// Pending and deleted clusters cost nothing.
    pub(crate) fn accrue_costs(&self, snapshot: &InventorySnapshot, now: u64) {
        let elapsed = locked(&self.inner.last_accrual)
            .replace(now)
            .map_or(0, |last| now.saturating_sub(last));
        let hours = elapsed as f64 / 3600.0;

        let mut metrics = locked(&self.inner.metrics);
        for group_id in snapshot.groups.keys() {
            let rate: f64 = snapshot
                .members(group_id)
                .filter(|c| !matches!(c.status, ClusterStatus::Pending | ClusterStatus::Deleted))
                .filter_map(|c| {
                    let template = self.inner.catalog.get(&c.type_id)?;
                    Some(template.cost.hourly_cost_per_node * f64::from(c.node_count))
                })
                .sum();
            let m = metrics.entry(group_id.clone()).or_default();
            m.total_cost += m.cost_per_hour * hours;
            m.cost_per_hour = rate;
        }
    }
}

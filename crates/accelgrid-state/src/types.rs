//! Domain types for the AccelGrid inventory.
//!
//! These types represent cluster templates, cluster instances, groups,
//! workload requirements and the scaling decisions produced for them.
//! All types are serializable to/from JSON for the API surface.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

use serde::{Deserialize, Serialize};

use accel_core::{AcceleratorKind, CostProfile, ResourceShape};

use crate::error::ValidationError;

/// Unique identifier for a cluster template.
pub type ClusterTypeId = String;

/// Unique identifier for a cluster instance (assigned by the orchestrator).
pub type ClusterId = String;

/// Unique identifier for a cluster group.
pub type GroupId = String;

/// Unique identifier for a workload.
pub type WorkloadId = String;

// ── Cluster templates ──────────────────────────────────────────────

/// A cluster template: what one node looks like and what it costs.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterType {
    pub id: ClusterTypeId,
    pub kind: AcceleratorKind,
    /// Resources of a single node.
    pub shape: ResourceShape,
    pub cost: CostProfile,
    pub min_nodes: u32,
    pub max_nodes: u32,
}

impl ClusterType {
    /// Id of the group that pools clusters of this type.
    pub fn group_id(&self) -> GroupId {
        group_id_for(&self.id)
    }

    pub fn capacity(&self, nodes: u32) -> ResourceShape {
        self.shape.scale(nodes)
    }

    pub fn power_for(&self, nodes: u32) -> f64 {
        self.cost.watts_per_node * f64::from(nodes)
    }

    pub fn cost_per_unit(&self) -> f64 {
        self.cost.cost_per_unit(&self.shape)
    }

    /// Whether this template carries every accelerator the requirement needs.
    pub fn supports(&self, req: &WorkloadRequirement) -> bool {
        let needs_gpu = req.gpu_required || req.demand.gpu > 0;
        let needs_npu = req.npu_required || req.demand.npu > 0;
        (!needs_gpu || self.shape.gpu > 0) && (!needs_npu || self.shape.npu > 0)
    }

    /// Nodes needed to hold `demand`, clamped below by `min_nodes`.
    ///
    /// Returns `None` when some demanded dimension is absent from the
    /// node shape.
    pub fn nodes_for(&self, demand: &ResourceShape) -> Option<u32> {
        let mut nodes = self.min_nodes.max(1);
        for (per_node, wanted) in self.shape.dims(demand) {
            if wanted == 0 {
                continue;
            }
            if per_node == 0 {
                return None;
            }
            nodes = nodes.max(wanted.div_ceil(per_node));
        }
        Some(nodes)
    }
}

/// Group id convention: one group per cluster type.
pub fn group_id_for(type_id: &str) -> GroupId {
    format!("group-{type_id}")
}

// ── Cluster instances ──────────────────────────────────────────────

/// Lifecycle status of a cluster instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClusterStatus {
    /// Decided and reserved, create not yet issued.
    Pending,
    Creating,
    Active,
    Scaling,
    Draining,
    Deleted,
    Error,
}

impl ClusterStatus {
    /// States with an operation outstanding against the gateway.
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            ClusterStatus::Pending
                | ClusterStatus::Creating
                | ClusterStatus::Scaling
                | ClusterStatus::Draining
        )
    }

    /// Whether the lifecycle allows `self → to`.
    pub fn can_transition_to(&self, to: ClusterStatus) -> bool {
        use ClusterStatus::*;
        matches!(
            (self, to),
            (Pending, Creating)
                | (Pending, Deleted)
                | (Creating, Active)
                | (Creating, Error)
                | (Active, Scaling)
                | (Active, Draining)
                | (Scaling, Active)
                | (Scaling, Error)
                | (Draining, Deleted)
                | (Draining, Error)
                | (Error, Draining)
        )
    }

    pub fn label(&self) -> &'static str {
        match self {
            ClusterStatus::Pending => "pending",
            ClusterStatus::Creating => "creating",
            ClusterStatus::Active => "active",
            ClusterStatus::Scaling => "scaling",
            ClusterStatus::Draining => "draining",
            ClusterStatus::Deleted => "deleted",
            ClusterStatus::Error => "error",
        }
    }
}

impl fmt::Display for ClusterStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// A workload placed on a cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkloadAssignment {
    pub demand: ResourceShape,
    pub priority: u32,
    pub assigned_at: u64,
}

/// Runtime state of a single cluster.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterInstance {
    pub id: ClusterId,
    pub type_id: ClusterTypeId,
    pub kind: AcceleratorKind,
    pub group_id: GroupId,
    pub node_count: u32,
    /// Node count a resize in flight is heading to.
    pub target_node_count: Option<u32>,
    pub status: ClusterStatus,
    /// Id returned by the provisioning gateway once it accepted the create.
    pub provider_id: Option<String>,
    /// Per-node resources, copied from the template at creation.
    pub node_shape: ResourceShape,
    pub watts_per_node: f64,
    pub workloads: BTreeMap<WorkloadId, WorkloadAssignment>,
    /// Unix seconds.
    pub created_at: u64,
    /// Last time a scaling transition was initiated (creation counts).
    pub last_scaled_at: u64,
    /// Last status change of any kind.
    pub last_transition_at: u64,
    /// Bumped on every mutation; used to detect stale snapshots.
    pub revision: u64,
    pub last_error: Option<String>,
}

impl ClusterInstance {
    /// A freshly decided cluster, not yet issued to the gateway.
    pub fn pending(id: ClusterId, cluster_type: &ClusterType, node_count: u32, now: u64) -> Self {
        Self {
            id,
            type_id: cluster_type.id.clone(),
            kind: cluster_type.kind,
            group_id: cluster_type.group_id(),
            node_count,
            target_node_count: None,
            status: ClusterStatus::Pending,
            provider_id: None,
            node_shape: cluster_type.shape,
            watts_per_node: cluster_type.cost.watts_per_node,
            workloads: BTreeMap::new(),
            created_at: now,
            last_scaled_at: now,
            last_transition_at: now,
            revision: 0,
            last_error: None,
        }
    }

    pub fn capacity(&self) -> ResourceShape {
        self.node_shape.scale(self.node_count)
    }

    pub fn allocated(&self) -> ResourceShape {
        self.workloads
            .values()
            .fold(ResourceShape::ZERO, |acc, w| acc.saturating_add(&w.demand))
    }

    pub fn spare(&self) -> ResourceShape {
        self.capacity().saturating_sub(&self.allocated())
    }

    /// Dominant-share utilization in 0.0..=1.0 (may exceed 1.0 transiently
    /// after a forced shrink).
    pub fn utilization(&self) -> f64 {
        self.allocated().dominant_share(&self.capacity())
    }

    pub fn active_workloads(&self) -> usize {
        self.workloads.len()
    }

    /// Power committed to this cluster. While a resize is in flight the
    /// larger of current and target is held.
    pub fn estimated_power_watts(&self) -> f64 {
        match self.status {
            ClusterStatus::Deleted => 0.0,
            _ => {
                let nodes = self
                    .target_node_count
                    .map_or(self.node_count, |t| t.max(self.node_count));
                self.watts_per_node * f64::from(nodes)
            }
        }
    }

    /// Seconds since the last initiated scaling transition.
    pub fn since_last_scaled(&self, now: u64) -> u64 {
        now.saturating_sub(self.last_scaled_at)
    }
}

// ── Groups ────────────────────────────────────────────────────────

/// Lifecycle status of a cluster group.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GroupStatus {
    Empty,
    Populating,
    Stable,
    Rebalancing,
}

impl GroupStatus {
    pub fn label(&self) -> &'static str {
        match self {
            GroupStatus::Empty => "empty",
            GroupStatus::Populating => "populating",
            GroupStatus::Stable => "stable",
            GroupStatus::Rebalancing => "rebalancing",
        }
    }
}

impl fmt::Display for GroupStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// Bounds an operator declared for a group.
///
/// Groups that only ever came into being through workload placement have
/// no policy and fall back to the `[orchestrator]` defaults.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct GroupPolicy {
    /// The group is topped back up to this many clusters.
    pub min_clusters: u32,
    pub max_clusters: u32,
    /// Node count of clusters created to reach `min_clusters`; the
    /// template's `min_nodes` when unset.
    #[serde(default)]
    pub node_count: Option<u32>,
}

impl GroupPolicy {
    pub fn validate(&self, template: &ClusterType) -> Result<(), ValidationError> {
        if self.max_clusters == 0 {
            return Err(ValidationError::new("max_clusters must be at least 1"));
        }
        if self.min_clusters > self.max_clusters {
            return Err(ValidationError::new("min_clusters is above max_clusters"));
        }
        if let Some(nodes) = self.node_count {
            if nodes < template.min_nodes || nodes > template.max_nodes {
                return Err(ValidationError::new(format!(
                    "node_count {nodes} is outside {}..={} for {}",
                    template.min_nodes, template.max_nodes, template.id
                )));
            }
        }
        Ok(())
    }

    /// Nodes for a cluster created on the group's behalf.
    pub fn nodes_for(&self, template: &ClusterType) -> u32 {
        self.node_count.unwrap_or(template.min_nodes)
    }
}

/// A pool of clusters of one type managed as a capacity unit.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClusterGroup {
    pub id: GroupId,
    pub group_type: AcceleratorKind,
    pub type_id: ClusterTypeId,
    pub members: BTreeSet<ClusterId>,
    /// Derived from member states and `rebalancing`; kept current by the
    /// inventory on every mutation.
    pub status: GroupStatus,
    /// Set while a consolidation pass has drains outstanding.
    pub rebalancing: bool,
    /// Declared bounds. A group with a policy outlives its last member.
    #[serde(default)]
    pub policy: Option<GroupPolicy>,
    pub created_at: u64,
    pub updated_at: u64,
    pub revision: u64,
}

impl ClusterGroup {
    /// A group for the type of `first_member`; status is filled in by the
    /// inventory once the member is added.
    pub fn for_member(first_member: &ClusterInstance, now: u64) -> Self {
        Self {
            id: first_member.group_id.clone(),
            group_type: first_member.kind,
            type_id: first_member.type_id.clone(),
            members: BTreeSet::new(),
            status: GroupStatus::Empty,
            rebalancing: false,
            policy: None,
            created_at: now,
            updated_at: now,
            revision: 0,
        }
    }

    /// An empty group declared for `template` ahead of any placement.
    pub fn declared(template: &ClusterType, policy: GroupPolicy, now: u64) -> Self {
        Self {
            id: template.group_id(),
            group_type: template.kind,
            type_id: template.id.clone(),
            members: BTreeSet::new(),
            status: GroupStatus::Empty,
            rebalancing: false,
            policy: Some(policy),
            created_at: now,
            updated_at: now,
            revision: 0,
        }
    }
}

/// Running counters of one group.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct GroupMetrics {
    /// Creates, scale-outs, scale-ins and deletes applied to members.
    pub scaling_events: u64,
    /// Clusters drained by consolidation.
    pub consolidation_events: u64,
    pub migrations: u64,
    /// Accrued provider cost, in the catalog's currency.
    pub total_cost: f64,
    /// Cost rate of the members as of the last accrual.
    pub cost_per_hour: f64,
    pub last_event_at: Option<u64>,
}

// ── Workloads and decisions ───────────────────────────────────────

/// What a workload needs from the fleet.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct WorkloadRequirement {
    pub workload_id: WorkloadId,
    #[serde(default)]
    pub demand: ResourceShape,
    #[serde(default)]
    pub gpu_required: bool,
    #[serde(default)]
    pub npu_required: bool,
    /// Maximum power the workload may cause to be committed, in watts.
    pub power_budget_watts: f64,
    /// Lower value = more important.
    #[serde(default)]
    pub priority: u32,
}

impl WorkloadRequirement {
    /// Reject malformed requirements before any matching happens.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.workload_id.trim().is_empty() {
            return Err(ValidationError::new("workload_id must not be empty"));
        }
        if !self.power_budget_watts.is_finite() || self.power_budget_watts <= 0.0 {
            return Err(ValidationError::new("power_budget_watts must be positive"));
        }
        if self.demand.is_zero() {
            return Err(ValidationError::new("demand must request at least one resource"));
        }
        if self.gpu_required && self.demand.gpu == 0 {
            return Err(ValidationError::new("gpu_required set but demand.gpu is 0"));
        }
        if self.npu_required && self.demand.npu == 0 {
            return Err(ValidationError::new("npu_required set but demand.npu is 0"));
        }
        Ok(())
    }
}

/// The kind of change a decision makes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScalingAction {
    /// Place the workload on an existing cluster's spare capacity.
    Reuse,
    Create,
    ScaleOut,
    ScaleIn,
    Consolidate,
    Delete,
}

/// Why a decision was made.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReasonCode {
    SpareCapacity,
    BestFitTemplate,
    ScaleOutNearestMatch,
    LowUtilization,
    BudgetCorrection,
    ExplicitDelete,
    /// Operator asked for a cluster count.
    ExplicitScale,
    /// Group fell below its declared minimum.
    MinClusters,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct DecisionReason {
    pub code: ReasonCode,
    pub detail: String,
}

/// A decision emitted by the matcher or the orchestrator.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ScalingDecision {
    pub action: ScalingAction,
    pub group_id: GroupId,
    /// Target cluster; `None` for a create that has not been applied yet.
    pub cluster_id: Option<ClusterId>,
    pub cluster_type: ClusterTypeId,
    /// Node count the target cluster ends up with.
    pub node_count: u32,
    pub reason: DecisionReason,
    pub workload_id: Option<WorkloadId>,
    /// Unix seconds.
    pub timestamp: u64,
    /// Set when the power gate ran on a stale forecast.
    pub stale_forecast: bool,
    /// Set on budget-violation corrections that bypass cooldown.
    pub forced: bool,
}

/// Why no candidate could take a workload.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CapacityReason {
    NoCompatibleType,
    RequirementBudgetTooSmall,
    PowerCeilingReached,
    ClusterLimitReached,
    /// The only clusters that could grow scaled too recently.
    CooldownActive,
    NoFeasibleCandidate,
}

impl CapacityReason {
    pub fn label(&self) -> &'static str {
        match self {
            CapacityReason::NoCompatibleType => "no_compatible_type",
            CapacityReason::RequirementBudgetTooSmall => "requirement_budget_too_small",
            CapacityReason::PowerCeilingReached => "power_ceiling_reached",
            CapacityReason::ClusterLimitReached => "cluster_limit_reached",
            CapacityReason::CooldownActive => "cooldown_active",
            CapacityReason::NoFeasibleCandidate => "no_feasible_candidate",
        }
    }
}

impl fmt::Display for CapacityReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

//! Pure planners for the autonomous actions of a tick.
//!
//! Both planners read a snapshot and return what should change; the
//! orchestrator applies the plan under ownership tokens and re-checks each
//! step against live state.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use serde::Serialize;

use accel_core::ResourceShape;
use accelgrid_power::BudgetScope;
use accelgrid_state::{
    ClusterId, ClusterInstance, ClusterStatus, ClusterTypeCatalog, GroupId, InventorySnapshot,
    WorkloadAssignment, WorkloadId,
};

const WATT_EPSILON: f64 = 1e-6;

// ── Forced scale-in ───────────────────────────────────────────────

/// One cluster shrink issued to bring a scope under its ceiling.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Correction {
    pub cluster_id: ClusterId,
    pub from_nodes: u32,
    pub to_nodes: u32,
    /// Lowest-priority workloads removed so the rest fit.
    pub evictions: Vec<WorkloadId>,
    pub shed_watts: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CorrectionPlan {
    pub corrections: Vec<Correction>,
    /// Excess the plan could not remove (every cluster at its floor or busy).
    pub unresolved_watts: f64,
}

/// Plan shrinks that shed `excess_watts` within `scope`.
///
/// Clusters are taken fewest workloads first, then lowest utilization,
/// then id. The first pass only removes nodes nothing is using; the second
/// goes down to each template's `min_nodes` and evicts the least important
/// workloads that no longer fit. Clusters with an operation in flight
/// (`busy`) are left alone.
pub fn plan_forced_scale_in(
    scope: &BudgetScope,
    excess_watts: f64,
    snapshot: &InventorySnapshot,
    catalog: &ClusterTypeCatalog,
    busy: &HashSet<ClusterId>,
) -> CorrectionPlan {
    let mut clusters: Vec<&ClusterInstance> = snapshot
        .clusters
        .values()
        .filter(|c| c.status == ClusterStatus::Active && !busy.contains(&c.id))
        .filter(|c| match scope {
            BudgetScope::Site => true,
            BudgetScope::Group(id) => &c.group_id == id,
        })
        .collect();
    clusters.sort_by(|a, b| {
        a.workloads
            .len()
            .cmp(&b.workloads.len())
            .then(a.utilization().total_cmp(&b.utilization()))
            .then(a.id.cmp(&b.id))
    });

    let min_nodes = |c: &ClusterInstance| {
        catalog
            .get(&c.type_id)
            .map_or(1, |t| t.min_nodes.max(1))
            .min(c.node_count)
    };

    let mut remaining = excess_watts;
    let mut targets: BTreeMap<&str, u32> = BTreeMap::new();

    // Pass 1: idle nodes only.
    for c in &clusters {
        if remaining <= WATT_EPSILON {
            break;
        }
        let floor = nodes_to_hold(&c.node_shape, &c.allocated(), min_nodes(c)).min(c.node_count);
        let shed = (c.node_count - floor).min(nodes_for_watts(remaining, c.watts_per_node));
        if shed == 0 {
            continue;
        }
        targets.insert(c.id.as_str(), c.node_count - shed);
        remaining -= f64::from(shed) * c.watts_per_node;
    }

    // Pass 2: down to min_nodes, evicting.
    for c in &clusters {
        if remaining <= WATT_EPSILON {
            break;
        }
        let current = targets.get(c.id.as_str()).copied().unwrap_or(c.node_count);
        let floor = min_nodes(c);
        if current <= floor {
            continue;
        }
        let shed = (current - floor).min(nodes_for_watts(remaining, c.watts_per_node));
        targets.insert(c.id.as_str(), current - shed);
        remaining -= f64::from(shed) * c.watts_per_node;
    }

    let corrections = clusters
        .iter()
        .filter_map(|c| {
            let to = *targets.get(c.id.as_str())?;
            Some(Correction {
                cluster_id: c.id.clone(),
                from_nodes: c.node_count,
                to_nodes: to,
                evictions: evictions_to_fit(&c.workloads, &c.node_shape.scale(to)),
                shed_watts: f64::from(c.node_count - to) * c.watts_per_node,
            })
        })
        .collect();

    CorrectionPlan {
        corrections,
        unresolved_watts: remaining.max(0.0),
    }
}

/// Workloads to remove so the rest fit in `capacity`: lowest priority
/// (highest value) first, larger first within a priority.
pub fn evictions_to_fit(
    workloads: &BTreeMap<WorkloadId, WorkloadAssignment>,
    capacity: &ResourceShape,
) -> Vec<WorkloadId> {
    let mut allocated = workloads
        .values()
        .fold(ResourceShape::ZERO, |acc, w| acc.saturating_add(&w.demand));
    if capacity.covers(&allocated) {
        return Vec::new();
    }

    let mut order: Vec<(&WorkloadId, &WorkloadAssignment)> = workloads.iter().collect();
    order.sort_by(|(a_id, a), (b_id, b)| {
        b.priority
            .cmp(&a.priority)
            .then(b.demand.weighted_units().total_cmp(&a.demand.weighted_units()))
            .then(a_id.cmp(b_id))
    });

    let mut evicted = Vec::new();
    for (id, w) in order {
        if capacity.covers(&allocated) {
            break;
        }
        allocated = allocated.saturating_sub(&w.demand);
        evicted.push(id.clone());
    }
    evicted
}

fn nodes_to_hold(shape: &ResourceShape, demand: &ResourceShape, floor: u32) -> u32 {
    shape
        .dims(demand)
        .iter()
        .fold(floor.max(1), |nodes, &(per_node, wanted)| {
            if wanted == 0 || per_node == 0 {
                nodes
            } else {
                nodes.max(wanted.div_ceil(per_node))
            }
        })
}

fn nodes_for_watts(watts: f64, per_node: f64) -> u32 {
    if per_node <= 0.0 || watts <= 0.0 {
        return 0;
    }
    let nodes = (watts / per_node).ceil();
    if nodes >= f64::from(u32::MAX) {
        u32::MAX
    } else {
        nodes as u32
    }
}

// ── Consolidation ─────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct WorkloadMove {
    pub workload_id: WorkloadId,
    pub from: ClusterId,
    pub to: ClusterId,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ConsolidationPlan {
    pub group_id: GroupId,
    pub moves: Vec<WorkloadMove>,
    /// Clusters to drain once their workloads have moved.
    pub drains: Vec<ClusterId>,
}

impl ConsolidationPlan {
    pub fn is_empty(&self) -> bool {
        self.drains.is_empty()
    }
}

/// Pack the workloads of under-utilized clusters onto the rest of the
/// group and drain the clusters that end up empty.
///
/// Sources are tried emptiest first; their workloads are placed first-fit
/// decreasing onto the fullest remaining members. A source whose workloads
/// do not all fit is left alone. A cluster that receives workloads is never
/// drained in the same pass, and the group keeps at least `min_clusters`
/// Active members. Sources inside their cooldown are skipped.
pub fn plan_consolidation(
    snapshot: &InventorySnapshot,
    group_id: &str,
    low: &[ClusterId],
    min_clusters: u32,
    cooldown_secs: u64,
    now: u64,
) -> ConsolidationPlan {
    let mut plan = ConsolidationPlan {
        group_id: group_id.to_string(),
        ..Default::default()
    };
    let active: Vec<&ClusterInstance> = snapshot
        .members(group_id)
        .filter(|c| c.status == ClusterStatus::Active)
        .collect();
    let max_drains = active.len().saturating_sub(min_clusters as usize);
    if max_drains == 0 {
        return plan;
    }

    let mut sources: Vec<&ClusterInstance> = active
        .iter()
        .copied()
        .filter(|c| low.contains(&c.id))
        .filter(|c| c.since_last_scaled(now) >= cooldown_secs)
        .collect();
    sources.sort_by(|a, b| {
        a.utilization()
            .total_cmp(&b.utilization())
            .then(a.id.cmp(&b.id))
    });

    let mut spare: BTreeMap<&str, ResourceShape> =
        active.iter().map(|c| (c.id.as_str(), c.spare())).collect();
    let mut receiving: BTreeSet<&str> = BTreeSet::new();
    let mut draining: BTreeSet<&str> = BTreeSet::new();

    for source in sources {
        if draining.len() >= max_drains {
            break;
        }
        if receiving.contains(source.id.as_str()) {
            continue;
        }

        let mut targets: Vec<&ClusterInstance> = active
            .iter()
            .copied()
            .filter(|c| c.id != source.id && !draining.contains(c.id.as_str()))
            .collect();
        targets.sort_by(|a, b| {
            b.utilization()
                .total_cmp(&a.utilization())
                .then(a.id.cmp(&b.id))
        });

        let mut workloads: Vec<(&WorkloadId, &WorkloadAssignment)> =
            source.workloads.iter().collect();
        workloads.sort_by(|(a_id, a), (b_id, b)| {
            b.demand
                .weighted_units()
                .total_cmp(&a.demand.weighted_units())
                .then(a_id.cmp(b_id))
        });

        let mut trial = spare.clone();
        let mut moves = Vec::new();
        let mut placed_all = true;
        for (workload_id, assignment) in workloads {
            let target = targets
                .iter()
                .find(|t| trial.get(t.id.as_str()).is_some_and(|s| s.covers(&assignment.demand)));
            let Some(target) = target else {
                placed_all = false;
                break;
            };
            if let Some(s) = trial.get_mut(target.id.as_str()) {
                *s = s.saturating_sub(&assignment.demand);
            }
            moves.push(WorkloadMove {
                workload_id: workload_id.clone(),
                from: source.id.clone(),
                to: target.id.clone(),
            });
        }
        if !placed_all {
            continue;
        }

        spare = trial;
        for m in &moves {
            if let Some(t) = targets.iter().find(|t| t.id == m.to) {
                receiving.insert(t.id.as_str());
            }
        }
        draining.insert(source.id.as_str());
        plan.moves.extend(moves);
        plan.drains.push(source.id.clone());
    }
    plan
}

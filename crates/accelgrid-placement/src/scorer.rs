//! Candidate scoring for workload matching.
//!
//! Every candidate (reuse an existing cluster, create from a template,
//! scale out an existing cluster) is scored 0–100 on four components:
//! - **Capacity fit** (best-fit): dominant-share utilization after placement
//! - **Idle**: share of the resulting capacity left unused, inverted
//! - **Cost**: cheapest compatible cost-per-unit relative to this one
//! - **Headroom**: power left under the scale-out limit after the change

use std::cmp::Ordering;

use serde::Serialize;

use accel_core::config::MatchWeights;
use accel_core::ResourceShape;
use accelgrid_power::PowerView;
use accelgrid_state::{ClusterId, ClusterTypeId, GroupId};

/// What accepting a candidate would do.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum CandidateKind {
    Reuse { cluster_id: ClusterId },
    Create { type_id: ClusterTypeId },
    ScaleOut { cluster_id: ClusterId, from_nodes: u32 },
}

impl CandidateKind {
    pub fn cluster_id(&self) -> Option<&ClusterId> {
        match self {
            CandidateKind::Reuse { cluster_id } | CandidateKind::ScaleOut { cluster_id, .. } => {
                Some(cluster_id)
            }
            CandidateKind::Create { .. } => None,
        }
    }
}

/// Resource picture of a candidate after the workload is placed.
#[derive(Debug, Clone)]
pub struct CandidateInput {
    pub group_id: GroupId,
    pub capacity_after: ResourceShape,
    pub allocated_after: ResourceShape,
    /// Change in idle capacity, in weighted units. Negative when the
    /// workload soaks up existing idle capacity.
    pub idle_delta: f64,
    pub cost_per_unit: f64,
    /// Power newly committed by this candidate.
    pub added_watts: f64,
}

/// Individual score components for debugging.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ScoreBreakdown {
    pub capacity_fit: f64,
    pub idle: f64,
    pub cost: f64,
    pub headroom: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct CandidateScore {
    pub kind: CandidateKind,
    pub group_id: GroupId,
    pub type_id: ClusterTypeId,
    /// Node count of the target cluster after the change.
    pub node_count: u32,
    /// Composite score, 0.0..=100.0 (higher = better).
    pub score: f64,
    pub breakdown: ScoreBreakdown,
    pub idle_delta: f64,
    pub cost_per_unit: f64,
    /// Draw attributed to the workload; compared with its power budget.
    pub attributable_watts: f64,
    pub added_watts: f64,
    /// Creation time of the target cluster (0 for a new one); older wins ties.
    pub created_at: u64,
    pub stale_forecast: bool,
}

/// Score one candidate. `best_cost_per_unit` is the lowest cost-per-unit
/// among compatible templates.
pub fn score_candidate(
    input: &CandidateInput,
    best_cost_per_unit: f64,
    power: &PowerView,
    weights: &MatchWeights,
) -> (f64, ScoreBreakdown) {
    let capacity_fit =
        (input.allocated_after.dominant_share(&input.capacity_after).min(1.0) * 100.0).max(0.0);

    let capacity_units = input.capacity_after.weighted_units();
    let idle_units = input
        .capacity_after
        .saturating_sub(&input.allocated_after)
        .weighted_units();
    let idle = if capacity_units > 0.0 {
        (1.0 - idle_units / capacity_units).clamp(0.0, 1.0) * 100.0
    } else {
        0.0
    };

    let cost = if input.cost_per_unit > 0.0 && input.cost_per_unit.is_finite() {
        (best_cost_per_unit / input.cost_per_unit).clamp(0.0, 1.0) * 100.0
    } else if input.cost_per_unit == 0.0 {
        100.0
    } else {
        0.0
    };

    let headroom = headroom_score(power, &input.group_id, input.added_watts);

    let score = weights.capacity_fit * capacity_fit
        + weights.idle * idle
        + weights.cost * cost
        + weights.headroom * headroom;
    let total_weight = weights.capacity_fit + weights.idle + weights.cost + weights.headroom;
    let score = if total_weight > 0.0 {
        score / total_weight
    } else {
        0.0
    };

    (
        score,
        ScoreBreakdown {
            capacity_fit,
            idle,
            cost,
            headroom,
        },
    )
}

/// Power left below the scale-out limit after adding `added_watts`, taking
/// the tighter of the group and site limits.
fn headroom_score(power: &PowerView, group_id: &str, added_watts: f64) -> f64 {
    let group = power.group(group_id);
    let group_limit = power.scale_out_threshold * group.ceiling_watts;
    let site_limit = power.scale_out_threshold * power.site_ceiling_watts;
    let ratio = |used: f64, limit: f64| if limit > 0.0 { used / limit } else { 1.0 };
    let worst = ratio(group.load() + added_watts, group_limit)
        .max(ratio(power.site_load() + added_watts, site_limit));
    (1.0 - worst).clamp(0.0, 1.0) * 100.0
}

/// Order: score desc, then idle delta asc, then cost-per-unit asc, then
/// oldest cluster, then id.
pub fn compare_candidates(a: &CandidateScore, b: &CandidateScore) -> Ordering {
    b.score
        .total_cmp(&a.score)
        .then_with(|| a.idle_delta.total_cmp(&b.idle_delta))
        .then_with(|| a.cost_per_unit.total_cmp(&b.cost_per_unit))
        .then_with(|| a.created_at.cmp(&b.created_at))
        .then_with(|| tie_id(a).cmp(tie_id(b)))
}

fn tie_id(c: &CandidateScore) -> &str {
    match &c.kind {
        CandidateKind::Reuse { cluster_id } | CandidateKind::ScaleOut { cluster_id, .. } => {
            cluster_id
        }
        CandidateKind::Create { type_id } => type_id,
    }
}

/// Sort candidates best first.
pub fn rank(candidates: &mut [CandidateScore]) {
    candidates.sort_by(compare_candidates);
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;
    use accel_core::config::PowerConfig;
    use accelgrid_power::PowerBudgetGuard;
    use accelgrid_state::InventorySnapshot;

    fn empty_view() -> PowerView {
        PowerBudgetGuard::new(PowerConfig::default()).view(&InventorySnapshot::default(), &HashMap::new())
    }

    fn input(capacity: ResourceShape, allocated: ResourceShape, cost: f64) -> CandidateInput {
        CandidateInput {
            group_id: "group-gpu-intensive".to_string(),
            capacity_after: capacity,
            allocated_after: allocated,
            idle_delta: capacity.saturating_sub(&allocated).weighted_units(),
            cost_per_unit: cost,
            added_watts: 0.0,
        }
    }

    fn scored(kind: CandidateKind, score: f64, idle: f64, cost: f64, created_at: u64) -> CandidateScore {
        CandidateScore {
            kind,
            group_id: "g".to_string(),
            type_id: "t".to_string(),
            node_count: 1,
            score,
            breakdown: ScoreBreakdown {
                capacity_fit: 0.0,
                idle: 0.0,
                cost: 0.0,
                headroom: 0.0,
            },
            idle_delta: idle,
            cost_per_unit: cost,
            attributable_watts: 0.0,
            added_watts: 0.0,
            created_at,
            stale_forecast: false,
        }
    }

    #[test]
    fn tight_fit_scores_higher() {
        let weights = MatchWeights::default();
        let view = empty_view();
        let demand = ResourceShape::new(0, 0, 4, 0);
        let tight = input(ResourceShape::new(32, 256, 4, 0), demand, 0.4);
        let loose = input(ResourceShape::new(64, 512, 8, 0), demand, 0.4);
        let (tight_score, tb) = score_candidate(&tight, 0.4, &view, &weights);
        let (loose_score, lb) = score_candidate(&loose, 0.4, &view, &weights);
        assert_eq!(tb.capacity_fit, 100.0);
        assert_eq!(lb.capacity_fit, 50.0);
        assert!(tight_score > loose_score);
        assert_eq!(tb.cost, 100.0);
        assert_eq!(tb.headroom, 100.0);
    }

    #[test]
    fn expensive_candidate_loses_cost_points() {
        let weights = MatchWeights::default();
        let view = empty_view();
        let c = input(ResourceShape::new(8, 64, 1, 0), ResourceShape::new(0, 0, 1, 0), 0.8);
        let (_, b) = score_candidate(&c, 0.4, &view, &weights);
        assert!((b.cost - 50.0).abs() < 1e-9);
    }

    #[test]
    fn headroom_shrinks_with_added_power() {
        let weights = MatchWeights::default();
        let view = empty_view(); // limit = 0.85 × 20 kW = 17 kW
        let mut c = input(ResourceShape::new(8, 64, 1, 0), ResourceShape::new(0, 0, 1, 0), 0.4);
        c.added_watts = 8500.0;
        let (_, b) = score_candidate(&c, 0.4, &view, &weights);
        assert!((b.headroom - 50.0).abs() < 1e-9);
    }

    #[test]
    fn ranking_tie_breaks() {
        let reuse = |id: &str| CandidateKind::Reuse {
            cluster_id: id.to_string(),
        };
        let mut cands = vec![
            scored(reuse("c-old"), 80.0, 1.0, 0.5, 10),
            scored(reuse("c-cheap"), 80.0, 1.0, 0.3, 50),
            scored(reuse("c-tight"), 80.0, 0.5, 0.9, 90),
            scored(reuse("c-best"), 90.0, 9.0, 9.0, 99),
            scored(reuse("c-young"), 80.0, 1.0, 0.5, 20),
        ];
        rank(&mut cands);
        let order: Vec<_> = cands.iter().map(|c| tie_id(c).to_string()).collect();
        assert_eq!(order, ["c-best", "c-tight", "c-cheap", "c-old", "c-young"]);
    }
}

//! Matcher — turns a workload requirement into a scaling decision.
//!
//! Pure function of the requirement, an inventory snapshot, the catalog and
//! a power view: the same inputs always produce the same decision.
//!
//! Selection policy, in order:
//! 1. Reuse an Active cluster whose spare capacity covers the demand and
//!    whose fit score reaches `reuse_fit_threshold`. A group or site that is
//!    already past the scale-out threshold takes no new work, reused or not.
//! 2. Create a cluster from the best-fit compatible template.
//! 3. Scale out the nearest-matching Active cluster that is out of cooldown.
//!    A cluster that already has room but scored below the reuse threshold
//!    is taken as-is at this stage.
//!
//! If nothing is feasible the result is a [`CapacityError`] with the most
//! specific reason seen.

use serde::Serialize;
use tracing::debug;

use accel_core::config::{GridConfig, MatchWeights};
use accel_core::ResourceShape;
use accelgrid_power::PowerView;
use accelgrid_state::{
    CapacityError, CapacityReason, ClusterInstance, ClusterStatus, ClusterType,
    ClusterTypeCatalog, DecisionReason, InventorySnapshot, ReasonCode, ScalingAction,
    ScalingDecision, WorkloadRequirement,
};

use crate::scorer::{rank, score_candidate, CandidateInput, CandidateKind, CandidateScore};

/// A decision plus what the orchestrator needs to apply it safely.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct MatchResult {
    pub decision: ScalingDecision,
    pub candidate: CandidateScore,
    /// Revision of the target cluster in the snapshot the decision used.
    pub expected_revision: Option<u64>,
}

#[derive(Debug, Clone)]
pub struct Matcher {
    weights: MatchWeights,
    reuse_fit_threshold: f64,
    max_clusters_per_group: u32,
    cooldown_secs: u64,
}

/// Rejections collected while evaluating candidates.
#[derive(Debug, Default)]
struct Rejections {
    budget_too_small: u32,
    power_ceiling: u32,
    cooldown: u32,
    cluster_limit: u32,
    node_bounds: u32,
}

impl Rejections {
    fn into_error(self, workload_id: &str, budget: f64) -> CapacityError {
        let detail = format!(
            "workload {workload_id} (budget {budget:.0} W): {} over power ceiling, {} in cooldown, \
             {} at cluster limit, {} over requirement budget, {} beyond node bounds",
            self.power_ceiling,
            self.cooldown,
            self.cluster_limit,
            self.budget_too_small,
            self.node_bounds
        );
        let code = if self.power_ceiling > 0 {
            CapacityReason::PowerCeilingReached
        } else if self.cooldown > 0 {
            CapacityReason::CooldownActive
        } else if self.cluster_limit > 0 {
            CapacityReason::ClusterLimitReached
        } else if self.budget_too_small > 0 {
            CapacityReason::RequirementBudgetTooSmall
        } else {
            CapacityReason::NoFeasibleCandidate
        };
        CapacityError::new(code, detail)
    }
}

impl Matcher {
    pub fn new(
        weights: MatchWeights,
        reuse_fit_threshold: f64,
        max_clusters_per_group: u32,
        cooldown_secs: u64,
    ) -> Self {
        Self {
            weights,
            reuse_fit_threshold,
            max_clusters_per_group,
            cooldown_secs,
        }
    }

    pub fn from_config(config: &GridConfig) -> Self {
        Self::new(
            config.matcher.weights.clone(),
            config.matcher.reuse_fit_threshold,
            config.orchestrator.max_clusters_per_group,
            config.orchestrator.cooldown().as_secs(),
        )
    }

    /// Decide how to serve `req`. Never returns a no-op.
    pub fn decide(
        &self,
        req: &WorkloadRequirement,
        snapshot: &InventorySnapshot,
        catalog: &ClusterTypeCatalog,
        power: &PowerView,
        now: u64,
    ) -> Result<MatchResult, CapacityError> {
        let compatible: Vec<&ClusterType> = catalog.iter().filter(|t| t.supports(req)).collect();
        if compatible.is_empty() {
            return Err(CapacityError::new(
                CapacityReason::NoCompatibleType,
                format!("no template carries the accelerators workload {} needs", req.workload_id),
            ));
        }
        let best_cost = compatible
            .iter()
            .map(|t| t.cost_per_unit())
            .min_by(|a, b| a.total_cmp(b))
            .unwrap_or(f64::INFINITY);

        let mut rejections = Rejections::default();

        // Active clusters of a compatible template, with that template.
        let clusters: Vec<(&ClusterInstance, &ClusterType)> = snapshot
            .clusters
            .values()
            .filter(|c| c.status == ClusterStatus::Active)
            .filter_map(|c| {
                compatible
                    .iter()
                    .find(|t| t.id == c.type_id)
                    .map(|t| (c, *t))
            })
            .collect();

        // 1. Reuse.
        let mut roomy = Vec::new();
        for (cluster, template) in &clusters {
            if !cluster.spare().covers(&req.demand) {
                continue;
            }
            if !power.admit(&cluster.group_id, 0.0).admitted {
                rejections.power_ceiling += 1;
                continue;
            }
            let candidate = self.reuse_candidate(req, cluster, template, best_cost, power);
            if candidate.attributable_watts > req.power_budget_watts {
                rejections.budget_too_small += 1;
                continue;
            }
            roomy.push(candidate);
        }
        rank(&mut roomy);
        if let Some(best) = roomy.iter().find(|c| c.score >= self.reuse_fit_threshold) {
            return Ok(self.finish(req, snapshot, best.clone(), now));
        }

        // 2. Create.
        let mut creates = Vec::new();
        for template in &compatible {
            let group_id = template.group_id();
            let limit = snapshot.max_clusters_for(&group_id, self.max_clusters_per_group);
            if snapshot.member_count(&group_id) >= limit as usize {
                rejections.cluster_limit += 1;
                continue;
            }
            let Some(nodes) = template.nodes_for(&req.demand) else {
                continue;
            };
            if nodes > template.max_nodes {
                rejections.node_bounds += 1;
                continue;
            }
            let watts = template.power_for(nodes);
            if watts > req.power_budget_watts {
                rejections.budget_too_small += 1;
                continue;
            }
            let admission = power.admit(&group_id, watts);
            if !admission.admitted {
                rejections.power_ceiling += 1;
                continue;
            }
            let capacity = template.capacity(nodes);
            let input = CandidateInput {
                group_id: group_id.clone(),
                capacity_after: capacity,
                allocated_after: req.demand,
                idle_delta: capacity.saturating_sub(&req.demand).weighted_units(),
                cost_per_unit: template.cost_per_unit(),
                added_watts: watts,
            };
            let (score, breakdown) = score_candidate(&input, best_cost, power, &self.weights);
            creates.push(CandidateScore {
                kind: CandidateKind::Create {
                    type_id: template.id.clone(),
                },
                group_id,
                type_id: template.id.clone(),
                node_count: nodes,
                score,
                breakdown,
                idle_delta: input.idle_delta,
                cost_per_unit: input.cost_per_unit,
                attributable_watts: watts,
                added_watts: watts,
                created_at: 0,
                stale_forecast: admission.stale,
            });
        }
        rank(&mut creates);
        if let Some(best) = creates.into_iter().next() {
            return Ok(self.finish(req, snapshot, best, now));
        }

        // 3. Scale out the nearest match, or take a roomy cluster as-is.
        let mut fallbacks = roomy;
        for (cluster, template) in &clusters {
            if cluster.spare().covers(&req.demand) {
                continue;
            }
            if cluster.since_last_scaled(now) < self.cooldown_secs {
                rejections.cooldown += 1;
                continue;
            }
            let needed = cluster.allocated().saturating_add(&req.demand);
            let Some(target) = template.nodes_for(&needed) else {
                continue;
            };
            let target = target.max(cluster.node_count + 1);
            if target > template.max_nodes {
                rejections.node_bounds += 1;
                continue;
            }
            let added = target - cluster.node_count;
            let added_watts = cluster.watts_per_node * f64::from(added);
            if added_watts > req.power_budget_watts {
                rejections.budget_too_small += 1;
                continue;
            }
            let admission = power.admit(&cluster.group_id, added_watts);
            if !admission.admitted {
                rejections.power_ceiling += 1;
                continue;
            }
            let capacity = cluster.node_shape.scale(target);
            let idle_before = cluster.spare().weighted_units();
            let idle_after = capacity.saturating_sub(&needed).weighted_units();
            let input = CandidateInput {
                group_id: cluster.group_id.clone(),
                capacity_after: capacity,
                allocated_after: needed,
                idle_delta: idle_after - idle_before,
                cost_per_unit: template.cost_per_unit(),
                added_watts,
            };
            let (score, breakdown) = score_candidate(&input, best_cost, power, &self.weights);
            fallbacks.push(CandidateScore {
                kind: CandidateKind::ScaleOut {
                    cluster_id: cluster.id.clone(),
                    from_nodes: cluster.node_count,
                },
                group_id: cluster.group_id.clone(),
                type_id: cluster.type_id.clone(),
                node_count: target,
                score,
                breakdown,
                idle_delta: input.idle_delta,
                cost_per_unit: input.cost_per_unit,
                attributable_watts: added_watts,
                added_watts,
                created_at: cluster.created_at,
                stale_forecast: admission.stale,
            });
        }
        rank(&mut fallbacks);
        if let Some(best) = fallbacks.into_iter().next() {
            return Ok(self.finish(req, snapshot, best, now));
        }

        let err = rejections.into_error(&req.workload_id, req.power_budget_watts);
        debug!(workload = %req.workload_id, code = %err.code, detail = %err.detail, "no feasible candidate");
        Err(err)
    }

    fn reuse_candidate(
        &self,
        req: &WorkloadRequirement,
        cluster: &ClusterInstance,
        template: &ClusterType,
        best_cost: f64,
        power: &PowerView,
    ) -> CandidateScore {
        let capacity = cluster.capacity();
        let allocated_after = cluster.allocated().saturating_add(&req.demand);
        let input = CandidateInput {
            group_id: cluster.group_id.clone(),
            capacity_after: capacity,
            allocated_after,
            idle_delta: -bounded_units(&req.demand, &capacity),
            cost_per_unit: template.cost_per_unit(),
            added_watts: 0.0,
        };
        let (score, breakdown) = score_candidate(&input, best_cost, power, &self.weights);
        let share = req.demand.dominant_share(&capacity).min(1.0);
        let group = power.group(&cluster.group_id);
        CandidateScore {
            kind: CandidateKind::Reuse {
                cluster_id: cluster.id.clone(),
            },
            group_id: cluster.group_id.clone(),
            type_id: cluster.type_id.clone(),
            node_count: cluster.node_count,
            score,
            breakdown,
            idle_delta: input.idle_delta,
            cost_per_unit: input.cost_per_unit,
            attributable_watts: share * cluster.estimated_power_watts(),
            added_watts: 0.0,
            created_at: cluster.created_at,
            stale_forecast: group.stale || power.any_stale(),
        }
    }

    fn finish(
        &self,
        req: &WorkloadRequirement,
        snapshot: &InventorySnapshot,
        candidate: CandidateScore,
        now: u64,
    ) -> MatchResult {
        let (action, code, cluster_id) = match &candidate.kind {
            CandidateKind::Reuse { cluster_id } => (
                ScalingAction::Reuse,
                ReasonCode::SpareCapacity,
                Some(cluster_id.clone()),
            ),
            CandidateKind::Create { .. } => {
                (ScalingAction::Create, ReasonCode::BestFitTemplate, None)
            }
            CandidateKind::ScaleOut { cluster_id, .. } => (
                ScalingAction::ScaleOut,
                ReasonCode::ScaleOutNearestMatch,
                Some(cluster_id.clone()),
            ),
        };
        let expected_revision = cluster_id
            .as_deref()
            .and_then(|id| snapshot.cluster(id))
            .map(|c| c.revision);
        let detail = format!(
            "score {:.1} (fit {:.1}, idle {:.1}, cost {:.1}, headroom {:.1}), {} nodes, {:.0} W",
            candidate.score,
            candidate.breakdown.capacity_fit,
            candidate.breakdown.idle,
            candidate.breakdown.cost,
            candidate.breakdown.headroom,
            candidate.node_count,
            candidate.attributable_watts,
        );
        debug!(
            workload = %req.workload_id,
            ?action,
            template = %candidate.type_id,
            cluster = ?cluster_id,
            nodes = candidate.node_count,
            score = candidate.score,
            "workload matched"
        );
        MatchResult {
            decision: ScalingDecision {
                action,
                group_id: candidate.group_id.clone(),
                cluster_id,
                cluster_type: candidate.type_id.clone(),
                node_count: candidate.node_count,
                reason: DecisionReason { code, detail },
                workload_id: Some(req.workload_id.clone()),
                timestamp: now,
                stale_forecast: candidate.stale_forecast,
                forced: false,
            },
            candidate,
            expected_revision,
        }
    }
}

/// Weighted size of `demand`, counting only dimensions `capacity` has.
fn bounded_units(demand: &ResourceShape, capacity: &ResourceShape) -> f64 {
    let mut clipped = *demand;
    if capacity.cpu == 0 {
        clipped.cpu = 0;
    }
    if capacity.memory_gib == 0 {
        clipped.memory_gib = 0;
    }
    if capacity.gpu == 0 {
        clipped.gpu = 0;
    }
    if capacity.npu == 0 {
        clipped.npu = 0;
    }
    clipped.weighted_units()
}

//! PowerBudgetGuard — committed and forecast power against ceilings.
//!
//! Two asymmetric thresholds give hysteresis:
//!
//! ```text
//! load(scope)  = max(committed, worst_case_forecast)
//!
//! admit        : load + added <= scale_out_threshold × ceiling   (e.g. 85%)
//! violation    : load > ceiling, sustained for violation_sustain
//! correct to   : scale_in_threshold × ceiling                     (e.g. 60%)
//! ```
//!
//! Each group is checked against its own ceiling and the site is checked
//! against the site ceiling; a change must pass both.

use std::collections::{BTreeMap, HashMap};
use std::fmt;

use serde::Serialize;
use tracing::{debug, info, warn};

use accel_core::config::PowerConfig;
use accelgrid_state::{GroupId, InventorySnapshot};

use crate::forecast::ForecastEstimate;

/// What a ceiling applies to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case", tag = "scope", content = "id")]
pub enum BudgetScope {
    Site,
    Group(GroupId),
}

impl fmt::Display for BudgetScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BudgetScope::Site => f.write_str("site"),
            BudgetScope::Group(id) => write!(f, "group/{id}"),
        }
    }
}

/// Power picture of one group.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct GroupPower {
    pub committed_watts: f64,
    pub worst_case_watts: f64,
    pub ceiling_watts: f64,
    pub stale: bool,
}

impl GroupPower {
    pub fn load(&self) -> f64 {
        self.committed_watts.max(self.worst_case_watts)
    }
}

/// Outcome of asking whether extra draw fits.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Admission {
    pub admitted: bool,
    /// The scope that refused, if any.
    pub blocked_by: Option<BudgetScope>,
    pub load_watts: f64,
    pub limit_watts: f64,
    /// The estimate behind the check came from a stale forecast.
    pub stale: bool,
}

/// Immutable power view built once per tick or request.
#[derive(Debug, Clone, Serialize)]
pub struct PowerView {
    pub groups: BTreeMap<GroupId, GroupPower>,
    pub site_ceiling_watts: f64,
    pub scale_out_threshold: f64,
    pub scale_in_threshold: f64,
    #[serde(skip)]
    group_ceilings: HashMap<GroupId, f64>,
}

impl PowerView {
    /// Group power, or an empty entry for a group that does not exist yet.
    pub fn group(&self, group_id: &str) -> GroupPower {
        self.groups.get(group_id).cloned().unwrap_or_else(|| GroupPower {
            ceiling_watts: self.ceiling_for(group_id),
            ..GroupPower::default()
        })
    }

    pub fn ceiling_for(&self, group_id: &str) -> f64 {
        self.group_ceilings
            .get(group_id)
            .copied()
            .unwrap_or(self.site_ceiling_watts)
    }

    pub fn site_load(&self) -> f64 {
        self.groups.values().map(GroupPower::load).sum()
    }

    pub fn site_committed(&self) -> f64 {
        self.groups.values().map(|g| g.committed_watts).sum()
    }

    pub fn any_stale(&self) -> bool {
        self.groups.values().any(|g| g.stale)
    }

    /// Load and ceiling of a scope.
    pub fn scope_load(&self, scope: &BudgetScope) -> (f64, f64) {
        match scope {
            BudgetScope::Site => (self.site_load(), self.site_ceiling_watts),
            BudgetScope::Group(id) => {
                let g = self.group(id);
                (g.load(), g.ceiling_watts)
            }
        }
    }

    /// Whether `added_watts` more can be committed to `group_id`.
    pub fn admit(&self, group_id: &str, added_watts: f64) -> Admission {
        let group = self.group(group_id);
        let stale = group.stale || self.any_stale();

        let group_load = group.load() + added_watts;
        let group_limit = self.scale_out_threshold * group.ceiling_watts;
        if group_load > group_limit {
            return Admission {
                admitted: false,
                blocked_by: Some(BudgetScope::Group(group_id.to_string())),
                load_watts: group_load,
                limit_watts: group_limit,
                stale,
            };
        }

        let site_load = self.site_load() + added_watts;
        let site_limit = self.scale_out_threshold * self.site_ceiling_watts;
        if site_load > site_limit {
            return Admission {
                admitted: false,
                blocked_by: Some(BudgetScope::Site),
                load_watts: site_load,
                limit_watts: site_limit,
                stale,
            };
        }

        Admission {
            admitted: true,
            blocked_by: None,
            load_watts: group_load,
            limit_watts: group_limit,
            stale,
        }
    }
}

/// A sustained ceiling breach that requires a forced correction.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BudgetViolation {
    pub scope: BudgetScope,
    pub load_watts: f64,
    pub committed_watts: f64,
    pub ceiling_watts: f64,
    /// Load the correction must bring the scope down to.
    pub target_watts: f64,
    /// Unix seconds the breach was first observed.
    pub since: u64,
    pub stale: bool,
}

impl BudgetViolation {
    /// Committed draw that has to be shed to reach the target.
    pub fn excess_watts(&self) -> f64 {
        (self.load_watts - self.target_watts).max(0.0)
    }
}

#[derive(Debug, Clone, Copy)]
struct BreachState {
    since: u64,
    /// Set when a correction was issued; cleared on convergence.
    correcting_since: Option<u64>,
}

pub struct PowerBudgetGuard {
    config: PowerConfig,
    breaches: HashMap<BudgetScope, BreachState>,
}

impl PowerBudgetGuard {
    pub fn new(config: PowerConfig) -> Self {
        Self {
            config,
            breaches: HashMap::new(),
        }
    }

    pub fn config(&self) -> &PowerConfig {
        &self.config
    }

    /// Build the power view for a snapshot. Groups without an estimate are
    /// judged on committed draw alone.
    pub fn view(
        &self,
        snapshot: &InventorySnapshot,
        estimates: &HashMap<GroupId, ForecastEstimate>,
    ) -> PowerView {
        let mut groups = BTreeMap::new();
        for group_id in snapshot.groups.keys() {
            let estimate = estimates.get(group_id);
            groups.insert(
                group_id.clone(),
                GroupPower {
                    committed_watts: snapshot.committed_watts(group_id),
                    worst_case_watts: estimate.map_or(0.0, ForecastEstimate::worst_case),
                    ceiling_watts: self.config.ceiling_for(group_id),
                    stale: estimate.is_some_and(|e| e.stale),
                },
            );
        }
        PowerView {
            groups,
            site_ceiling_watts: self.config.site_ceiling_watts,
            scale_out_threshold: self.config.scale_out_threshold,
            scale_in_threshold: self.config.scale_in_threshold,
            group_ceilings: self.config.group_ceilings.clone(),
        }
    }

    /// Feed one observation; returns breaches that need a correction now.
    ///
    /// A breach fires once it has lasted `violation_sustain`. While its
    /// correction is in progress it does not fire again, unless it is still
    /// breached a full sustain window after the correction was issued.
    pub fn observe(&mut self, view: &PowerView, now: u64) -> Vec<BudgetViolation> {
        let sustain = self.config.violation_sustain().as_secs();
        let mut scopes: Vec<BudgetScope> = view
            .groups
            .keys()
            .map(|id| BudgetScope::Group(id.clone()))
            .collect();
        scopes.push(BudgetScope::Site);

        // Forget breaches on groups that no longer exist.
        self.breaches.retain(|scope, _| match scope {
            BudgetScope::Site => true,
            BudgetScope::Group(id) => view.groups.contains_key(id),
        });

        let mut fired = Vec::new();
        for scope in scopes {
            let (load, ceiling) = view.scope_load(&scope);
            if load <= ceiling {
                if let Some(state) = self.breaches.remove(&scope) {
                    if state.correcting_since.is_some() {
                        info!(%scope, load, ceiling, "power correction converged");
                    } else {
                        debug!(%scope, load, ceiling, "power breach cleared before sustain");
                    }
                }
                continue;
            }

            let state = self.breaches.entry(scope.clone()).or_insert_with(|| {
                warn!(%scope, load, ceiling, "power ceiling breached");
                BreachState {
                    since: now,
                    correcting_since: None,
                }
            });

            let due = match state.correcting_since {
                Some(issued) => now.saturating_sub(issued) >= sustain,
                None => now.saturating_sub(state.since) >= sustain,
            };
            if !due {
                continue;
            }
            state.correcting_since = Some(now);

            let (committed, stale) = match &scope {
                BudgetScope::Site => (view.site_committed(), view.any_stale()),
                BudgetScope::Group(id) => {
                    let g = view.group(id);
                    (g.committed_watts, g.stale)
                }
            };
            let violation = BudgetViolation {
                scope: scope.clone(),
                load_watts: load,
                committed_watts: committed,
                ceiling_watts: ceiling,
                target_watts: self.config.scale_in_threshold * ceiling,
                since: state.since,
                stale,
            };
            warn!(
                %scope,
                load,
                ceiling,
                target = violation.target_watts,
                "sustained power violation, forcing scale-in"
            );
            fired.push(violation);
        }
        fired
    }

    /// Whether a correction for `scope` is outstanding.
    pub fn is_correcting(&self, scope: &BudgetScope) -> bool {
        self.breaches
            .get(scope)
            .is_some_and(|s| s.correcting_since.is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::forecast::PowerForecast;
    use accelgrid_state::{ClusterInstance, ClusterStatus, ClusterTypeCatalog, Inventory};

    fn config(site: f64) -> PowerConfig {
        PowerConfig {
            site_ceiling_watts: site,
            violation_sustain: "60s".to_string(),
            ..PowerConfig::default()
        }
    }

    /// An inventory holding one Active cluster of `type_id` per entry.
    fn inventory(clusters: &[(&str, u32)]) -> Inventory {
        let catalog = ClusterTypeCatalog::builtin();
        let inv = Inventory::new();
        for (type_id, nodes) in clusters {
            let t = catalog.get(type_id).unwrap();
            let mut c = ClusterInstance::pending(inv.next_cluster_id(type_id), t, *nodes, 0);
            c.status = ClusterStatus::Active;
            let token = inv.claim_group(&c.group_id).unwrap();
            inv.insert_cluster(&token, c, 0).unwrap();
        }
        inv
    }

    fn estimate(predicted: f64, confidence: f64, stale: bool) -> ForecastEstimate {
        ForecastEstimate {
            forecast: PowerForecast {
                timestamp: 0,
                predicted_watts: predicted,
                confidence,
            },
            stale,
        }
    }

    #[test]
    fn admits_below_scale_out_threshold() {
        let inv = inventory(&[("gpu-intensive", 4)]); // 1800 W
        let guard = PowerBudgetGuard::new(config(5000.0));
        let view = guard.view(&inv.snapshot(), &HashMap::new());
        assert!(view.admit("group-gpu-intensive", 2000.0).admitted); // 3800 <= 4250
        let refused = view.admit("group-gpu-intensive", 2500.0);
        assert!(!refused.admitted);
        assert_eq!(
            refused.blocked_by,
            Some(BudgetScope::Group("group-gpu-intensive".to_string()))
        );
    }

    #[test]
    fn ninety_percent_load_rejects_600w() {
        // 10 gpu nodes = 4500 W = 90% of 5000 W.
        let inv = inventory(&[("gpu-intensive", 10)]);
        let guard = PowerBudgetGuard::new(config(5000.0));
        let view = guard.view(&inv.snapshot(), &HashMap::new());
        assert!(!view.admit("group-gpu-intensive", 600.0).admitted);
        // The site ceiling blocks other groups too.
        let other = view.admit("group-hybrid-balanced", 600.0);
        assert!(!other.admitted);
        assert_eq!(other.blocked_by, Some(BudgetScope::Site));
    }

    #[test]
    fn worst_case_forecast_counts_when_higher() {
        let inv = inventory(&[("gpu-intensive", 2)]); // 900 W
        let guard = PowerBudgetGuard::new(config(5000.0));
        let mut estimates = HashMap::new();
        estimates.insert("group-gpu-intensive".to_string(), estimate(3000.0, 0.75, false));
        let view = guard.view(&inv.snapshot(), &estimates);
        let g = view.group("group-gpu-intensive");
        assert_eq!(g.load(), 3750.0);
        assert!(!view.admit("group-gpu-intensive", 600.0).admitted);
    }

    #[test]
    fn group_ceiling_is_checked_separately() {
        let inv = inventory(&[("gpu-intensive", 4), ("cpu-only", 1)]);
        let mut cfg = config(20_000.0);
        cfg.group_ceilings.insert("group-gpu-intensive".to_string(), 2000.0);
        let guard = PowerBudgetGuard::new(cfg);
        let view = guard.view(&inv.snapshot(), &HashMap::new());
        assert!(!view.admit("group-gpu-intensive", 100.0).admitted);
        assert!(view.admit("group-cpu-only", 100.0).admitted);
    }

    #[test]
    fn stale_estimate_marks_admission() {
        let inv = inventory(&[("gpu-intensive", 1)]);
        let guard = PowerBudgetGuard::new(config(5000.0));
        let mut estimates = HashMap::new();
        estimates.insert("group-gpu-intensive".to_string(), estimate(450.0, 1.0, true));
        let view = guard.view(&inv.snapshot(), &estimates);
        let a = view.admit("group-gpu-intensive", 450.0);
        assert!(a.admitted);
        assert!(a.stale);
    }

    #[test]
    fn violation_fires_after_sustain_then_waits() {
        let inv = inventory(&[("gpu-intensive", 12)]); // 5400 W
        let mut guard = PowerBudgetGuard::new(config(5000.0));
        let view = guard.view(&inv.snapshot(), &HashMap::new());

        assert!(guard.observe(&view, 0).is_empty());
        assert!(guard.observe(&view, 30).is_empty());
        let fired = guard.observe(&view, 60);
        // Both the group (ceiling = site) and the site breach.
        assert_eq!(fired.len(), 2);
        let group = fired
            .iter()
            .find(|v| v.scope == BudgetScope::Group("group-gpu-intensive".to_string()))
            .unwrap();
        assert_eq!(group.target_watts, 3000.0);
        assert_eq!(group.excess_watts(), 2400.0);
        assert!(guard.is_correcting(&group.scope));

        // In progress: no re-trigger inside the next window.
        assert!(guard.observe(&view, 90).is_empty());
        // Still breached a full window later: fire again.
        assert_eq!(guard.observe(&view, 120).len(), 2);
    }

    #[test]
    fn breach_clears_when_load_drops() {
        let hot = inventory(&[("gpu-intensive", 12)]);
        let cool = inventory(&[("gpu-intensive", 4)]);
        let mut guard = PowerBudgetGuard::new(config(5000.0));
        let hot_view = guard.view(&hot.snapshot(), &HashMap::new());
        let cool_view = guard.view(&cool.snapshot(), &HashMap::new());

        assert!(guard.observe(&hot_view, 0).is_empty());
        assert!(guard.observe(&cool_view, 30).is_empty());
        // The sustain window restarts.
        assert!(guard.observe(&hot_view, 70).is_empty());
        assert!(!guard.observe(&hot_view, 130).is_empty());
        assert!(guard.observe(&cool_view, 140).is_empty());
        assert!(!guard.is_correcting(&BudgetScope::Site));
    }
}

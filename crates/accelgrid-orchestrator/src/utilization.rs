//! Consecutive low-utilization windows per cluster.
//!
//! Utilization is the dominant share of a cluster's allocated workload
//! demand over its capacity. One tick is one observation window.

use std::collections::{BTreeMap, HashMap};

use tracing::debug;

use accelgrid_state::{ClusterId, ClusterStatus, GroupId, InventorySnapshot};

#[derive(Debug)]
pub struct UtilizationTracker {
    threshold: f64,
    windows: u32,
    low_streak: HashMap<ClusterId, u32>,
}

impl UtilizationTracker {
    pub fn new(threshold: f64, windows: u32) -> Self {
        Self {
            threshold,
            windows: windows.max(1),
            low_streak: HashMap::new(),
        }
    }

    /// Record one window. Returns, per group, the Active clusters that have
    /// now been under the threshold for the configured number of windows.
    pub fn observe(&mut self, snapshot: &InventorySnapshot) -> BTreeMap<GroupId, Vec<ClusterId>> {
        self.low_streak.retain(|id, _| {
            snapshot
                .cluster(id)
                .is_some_and(|c| c.status == ClusterStatus::Active)
        });

        let mut sustained: BTreeMap<GroupId, Vec<ClusterId>> = BTreeMap::new();
        for cluster in snapshot.clusters.values() {
            if cluster.status != ClusterStatus::Active {
                continue;
            }
            let utilization = cluster.utilization();
            if utilization >= self.threshold {
                self.low_streak.remove(&cluster.id);
                continue;
            }
            let streak = self.low_streak.entry(cluster.id.clone()).or_insert(0);
            *streak += 1;
            debug!(cluster = %cluster.id, utilization, streak = *streak, "low utilization window");
            if *streak >= self.windows {
                sustained
                    .entry(cluster.group_id.clone())
                    .or_default()
                    .push(cluster.id.clone());
            }
        }
        sustained
    }

    pub fn streak(&self, cluster_id: &str) -> u32 {
        self.low_streak.get(cluster_id).copied().unwrap_or(0)
    }

    pub fn reset(&mut self, cluster_id: &str) {
        self.low_streak.remove(cluster_id);
    }
}

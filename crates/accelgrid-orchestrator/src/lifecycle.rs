//! Lifecycle gates applied before a cluster transition is initiated.

use accelgrid_state::{ClusterInstance, ClusterStatus, WorkloadId};

use crate::error::{GridError, GridResult};

/// Fail with `Busy` while an operation is outstanding on the cluster.
pub fn ensure_settled(cluster: &ClusterInstance) -> GridResult<()> {
    if cluster.status.is_transitional() {
        return Err(GridError::Busy(format!(
            "cluster {} is {}",
            cluster.id, cluster.status
        )));
    }
    Ok(())
}

/// Non-forced scaling transitions must be `cooldown_secs` apart.
pub fn ensure_cooldown(cluster: &ClusterInstance, now: u64, cooldown_secs: u64) -> GridResult<()> {
    let elapsed = cluster.since_last_scaled(now);
    if elapsed < cooldown_secs {
        return Err(GridError::CooldownActive {
            cluster_id: cluster.id.clone(),
            remaining_secs: cooldown_secs - elapsed,
        });
    }
    Ok(())
}

/// Start a resize toward `target` nodes.
pub fn begin_scaling(cluster: &mut ClusterInstance, target: u32, now: u64) {
    cluster.status = ClusterStatus::Scaling;
    cluster.target_node_count = Some(target);
    cluster.last_scaled_at = now;
    cluster.last_error = None;
}

/// Start draining; returns the workloads that were still assigned.
pub fn begin_drain(cluster: &mut ClusterInstance, now: u64) -> Vec<WorkloadId> {
    cluster.status = ClusterStatus::Draining;
    cluster.target_node_count = None;
    cluster.last_scaled_at = now;
    std::mem::take(&mut cluster.workloads).into_keys().collect()
}

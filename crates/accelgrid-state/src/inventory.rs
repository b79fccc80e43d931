//! Inventory — in-memory cluster and group state with single-writer
//! ownership tokens.
//!
//! Reads go through [`Inventory::snapshot`], which clones a consistent view
//! under a short read lock. Every mutation names the entity it touches and
//! must present the [`OwnershipToken`] for that entity; tokens are handed
//! out at most once per entity and released on drop. The internal lock is
//! never held across an await point.
//!
//! Each mutation bumps the cluster's `revision` and the inventory `version`.
//! Callers that decided against a snapshot pass the revision they saw and
//! get [`StateError::StaleRevision`] if the entity moved on.

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::fmt;
use std::sync::{Arc, Mutex, PoisonError, RwLock};

use accel_core::ResourceShape;
use serde::Serialize;
use tracing::debug;

use crate::error::{StateError, StateResult};
use crate::types::*;

/// An entity that mutations are serialized on.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum EntityRef {
    Cluster(ClusterId),
    Group(GroupId),
}

impl fmt::Display for EntityRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntityRef::Cluster(id) => write!(f, "cluster/{id}"),
            EntityRef::Group(id) => write!(f, "group/{id}"),
        }
    }
}

type OwnerSet = Arc<Mutex<HashSet<EntityRef>>>;

/// Exclusive right to mutate one entity. Released when dropped.
#[derive(Debug)]
pub struct OwnershipToken {
    entity: EntityRef,
    owners: OwnerSet,
}

impl OwnershipToken {
    pub fn entity(&self) -> &EntityRef {
        &self.entity
    }

    fn expect_entity(&self, target: &EntityRef) -> StateResult<()> {
        if &self.entity == target {
            Ok(())
        } else {
            Err(StateError::WrongToken {
                held: self.entity.to_string(),
                target: target.to_string(),
            })
        }
    }
}

impl Drop for OwnershipToken {
    fn drop(&mut self) {
        self.owners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&self.entity);
    }
}

#[derive(Debug, Default)]
struct InventoryState {
    clusters: BTreeMap<ClusterId, ClusterInstance>,
    groups: BTreeMap<GroupId, ClusterGroup>,
    version: u64,
    next_seq: u64,
}

impl InventoryState {
    fn refresh_group(&mut self, group_id: &str, now: u64) {
        let Some(group) = self.groups.get(group_id) else {
            return;
        };
        let status = derive_group_status(group, &self.clusters);
        if let Some(group) = self.groups.get_mut(group_id) {
            if group.status != status {
                debug!(group = %group_id, from = %group.status, to = %status, "group status changed");
                group.status = status;
            }
            group.updated_at = now;
            group.revision += 1;
        }
    }
}

fn derive_group_status(
    group: &ClusterGroup,
    clusters: &BTreeMap<ClusterId, ClusterInstance>,
) -> GroupStatus {
    if group.members.is_empty() {
        return GroupStatus::Empty;
    }
    if group.rebalancing {
        return GroupStatus::Rebalancing;
    }
    let populating = group
        .members
        .iter()
        .filter_map(|id| clusters.get(id))
        .any(|c| matches!(c.status, ClusterStatus::Pending | ClusterStatus::Creating));
    if populating {
        GroupStatus::Populating
    } else {
        GroupStatus::Stable
    }
}

/// Result of removing a cluster from the inventory.
#[derive(Debug, Clone)]
pub struct Removal {
    pub cluster: ClusterInstance,
    /// The cluster was the group's last member; the group no longer exists.
    pub group_destroyed: bool,
}

/// Shared handle to the cluster inventory.
#[derive(Clone, Default)]
pub struct Inventory {
    state: Arc<RwLock<InventoryState>>,
    owners: OwnerSet,
}

impl Inventory {
    pub fn new() -> Self {
        Self::default()
    }

    // ── Ownership ──────────────────────────────────────────────────

    /// Take the single-writer token for `entity`, or fail with `Busy`.
    pub fn claim(&self, entity: EntityRef) -> StateResult<OwnershipToken> {
        let mut owners = self.owners.lock().unwrap_or_else(PoisonError::into_inner);
        if !owners.insert(entity.clone()) {
            return Err(StateError::Busy(entity.to_string()));
        }
        Ok(OwnershipToken {
            entity,
            owners: Arc::clone(&self.owners),
        })
    }

    pub fn claim_cluster(&self, id: &str) -> StateResult<OwnershipToken> {
        self.claim(EntityRef::Cluster(id.to_string()))
    }

    pub fn claim_group(&self, id: &str) -> StateResult<OwnershipToken> {
        self.claim(EntityRef::Group(id.to_string()))
    }

    pub fn is_claimed(&self, entity: &EntityRef) -> bool {
        self.owners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(entity)
    }

    // ── Reads ──────────────────────────────────────────────────────

    /// Consistent copy of the whole inventory.
    pub fn snapshot(&self) -> InventorySnapshot {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        InventorySnapshot {
            version: state.version,
            clusters: state.clusters.clone(),
            groups: state.groups.clone(),
        }
    }

    pub fn version(&self) -> u64 {
        self.state.read().unwrap_or_else(PoisonError::into_inner).version
    }

    pub fn cluster(&self, id: &str) -> Option<ClusterInstance> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.clusters.get(id).cloned()
    }

    pub fn group(&self, id: &str) -> Option<ClusterGroup> {
        let state = self.state.read().unwrap_or_else(PoisonError::into_inner);
        state.groups.get(id).cloned()
    }

    // ── Writes ─────────────────────────────────────────────────────

    /// Allocate the next cluster id for a template, e.g. `gpu-intensive-000003`.
    pub fn next_cluster_id(&self, type_id: &str) -> ClusterId {
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        state.next_seq += 1;
        format!("{type_id}-{:06}", state.next_seq)
    }

    /// Add a new cluster to its group, creating the group on first member.
    pub fn insert_cluster(
        &self,
        group_token: &OwnershipToken,
        cluster: ClusterInstance,
        now: u64,
    ) -> StateResult<()> {
        group_token.expect_entity(&EntityRef::Group(cluster.group_id.clone()))?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.clusters.contains_key(&cluster.id) {
            return Err(StateError::Duplicate(cluster.id));
        }
        let group_id = cluster.group_id.clone();
        let cluster_id = cluster.id.clone();
        let group = state.groups.entry(group_id.clone()).or_insert_with(|| {
            debug!(group = %group_id, "group created");
            ClusterGroup::for_member(&cluster, now)
        });
        group.members.insert(cluster_id.clone());
        state.clusters.insert(cluster_id.clone(), cluster);
        state.refresh_group(&group_id, now);
        state.version += 1;
        debug!(cluster = %cluster_id, group = %group_id, "cluster added to inventory");
        Ok(())
    }

    /// Mutate a cluster through `f`.
    ///
    /// `f` works on a copy; nothing is written if it fails. A status change
    /// made by `f` is checked against the lifecycle table. When
    /// `expected_revision` is given it must match the stored revision.
    pub fn update_cluster<R>(
        &self,
        token: &OwnershipToken,
        cluster_id: &str,
        expected_revision: Option<u64>,
        now: u64,
        f: impl FnOnce(&mut ClusterInstance) -> StateResult<R>,
    ) -> StateResult<R> {
        token.expect_entity(&EntityRef::Cluster(cluster_id.to_string()))?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let current = state
            .clusters
            .get(cluster_id)
            .ok_or_else(|| StateError::NotFound(format!("cluster {cluster_id}")))?;
        if let Some(expected) = expected_revision {
            if current.revision != expected {
                return Err(StateError::StaleRevision {
                    id: cluster_id.to_string(),
                    expected,
                    actual: current.revision,
                });
            }
        }

        let mut updated = current.clone();
        let from = current.status;
        let out = f(&mut updated)?;
        if updated.status != from {
            if !from.can_transition_to(updated.status) {
                return Err(StateError::InvalidTransition {
                    id: cluster_id.to_string(),
                    from,
                    to: updated.status,
                });
            }
            updated.last_transition_at = now;
            debug!(cluster = %cluster_id, %from, to = %updated.status, "cluster transition");
        }
        updated.revision = current.revision + 1;
        let group_id = updated.group_id.clone();
        state.clusters.insert(cluster_id.to_string(), updated);
        state.refresh_group(&group_id, now);
        state.version += 1;
        Ok(out)
    }

    /// Move a workload between two clusters in one step.
    pub fn move_workload(
        &self,
        from_token: &OwnershipToken,
        to_token: &OwnershipToken,
        from_id: &str,
        to_id: &str,
        workload_id: &str,
        now: u64,
    ) -> StateResult<()> {
        from_token.expect_entity(&EntityRef::Cluster(from_id.to_string()))?;
        to_token.expect_entity(&EntityRef::Cluster(to_id.to_string()))?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);

        let target = state
            .clusters
            .get(to_id)
            .ok_or_else(|| StateError::NotFound(format!("cluster {to_id}")))?;
        if !state.clusters.contains_key(from_id) {
            return Err(StateError::NotFound(format!("cluster {from_id}")));
        }
        let target_spare = target.spare();
        let assignment = state
            .clusters
            .get(from_id)
            .and_then(|c| c.workloads.get(workload_id))
            .cloned()
            .ok_or_else(|| StateError::NotFound(format!("workload {workload_id} on {from_id}")))?;
        if !target_spare.covers(&assignment.demand) {
            return Err(StateError::NoRoom(format!("{to_id} for workload {workload_id}")));
        }

        let mut touched = BTreeSet::new();
        if let Some(source) = state.clusters.get_mut(from_id) {
            source.workloads.remove(workload_id);
            source.revision += 1;
            touched.insert(source.group_id.clone());
        }
        if let Some(target) = state.clusters.get_mut(to_id) {
            target.workloads.insert(workload_id.to_string(), assignment);
            target.revision += 1;
            touched.insert(target.group_id.clone());
        }
        for group_id in &touched {
            state.refresh_group(group_id, now);
        }
        state.version += 1;
        debug!(workload = %workload_id, from = %from_id, to = %to_id, at = now, "workload moved");
        Ok(())
    }

    /// Remove a `Deleted` cluster. Destroys its group if it was the last
    /// member and the group has no declared policy.
    pub fn remove_cluster(
        &self,
        cluster_token: &OwnershipToken,
        group_token: &OwnershipToken,
        cluster_id: &str,
        now: u64,
    ) -> StateResult<Removal> {
        cluster_token.expect_entity(&EntityRef::Cluster(cluster_id.to_string()))?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let cluster = state
            .clusters
            .get(cluster_id)
            .ok_or_else(|| StateError::NotFound(format!("cluster {cluster_id}")))?;
        group_token.expect_entity(&EntityRef::Group(cluster.group_id.clone()))?;
        if cluster.status != ClusterStatus::Deleted {
            return Err(StateError::InvalidTransition {
                id: cluster_id.to_string(),
                from: cluster.status,
                to: ClusterStatus::Deleted,
            });
        }

        let Some(cluster) = state.clusters.remove(cluster_id) else {
            return Err(StateError::NotFound(format!("cluster {cluster_id}")));
        };
        let mut group_destroyed = false;
        if let Some(group) = state.groups.get_mut(&cluster.group_id) {
            group.members.remove(cluster_id);
            // Declared groups stay until deleted explicitly.
            if group.members.is_empty() && group.policy.is_none() {
                group_destroyed = true;
            }
        }
        if group_destroyed {
            state.groups.remove(&cluster.group_id);
            debug!(group = %cluster.group_id, "group empty, destroyed");
        } else {
            state.refresh_group(&cluster.group_id, now);
        }
        state.version += 1;
        debug!(cluster = %cluster_id, "cluster removed from inventory");
        Ok(Removal {
            cluster,
            group_destroyed,
        })
    }

    /// Register a group ahead of its first member.
    pub fn create_group(
        &self,
        group_token: &OwnershipToken,
        group: ClusterGroup,
        now: u64,
    ) -> StateResult<()> {
        group_token.expect_entity(&EntityRef::Group(group.id.clone()))?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        if state.groups.contains_key(&group.id) {
            return Err(StateError::Duplicate(group.id));
        }
        let group_id = group.id.clone();
        state.groups.insert(group_id.clone(), group);
        state.refresh_group(&group_id, now);
        state.version += 1;
        debug!(group = %group_id, "group declared");
        Ok(())
    }

    /// Replace a group's declared policy. Clearing it lets the group be
    /// destroyed with its last member.
    pub fn set_policy(
        &self,
        group_token: &OwnershipToken,
        group_id: &str,
        policy: Option<GroupPolicy>,
        now: u64,
    ) -> StateResult<()> {
        group_token.expect_entity(&EntityRef::Group(group_id.to_string()))?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let group = state
            .groups
            .get_mut(group_id)
            .ok_or_else(|| StateError::NotFound(format!("group {group_id}")))?;
        group.policy = policy;
        state.refresh_group(group_id, now);
        state.version += 1;
        Ok(())
    }

    /// Drop a group that has no members left.
    pub fn remove_group(&self, group_token: &OwnershipToken, group_id: &str) -> StateResult<ClusterGroup> {
        group_token.expect_entity(&EntityRef::Group(group_id.to_string()))?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let group = state
            .groups
            .get(group_id)
            .ok_or_else(|| StateError::NotFound(format!("group {group_id}")))?;
        if !group.members.is_empty() {
            return Err(StateError::NotEmpty(group_id.to_string()));
        }
        let Some(group) = state.groups.remove(group_id) else {
            return Err(StateError::NotFound(format!("group {group_id}")));
        };
        state.version += 1;
        debug!(group = %group_id, "group removed");
        Ok(group)
    }

    /// Set or clear the group's rebalancing flag. Returns the new status.
    pub fn set_rebalancing(
        &self,
        group_token: &OwnershipToken,
        group_id: &str,
        rebalancing: bool,
        now: u64,
    ) -> StateResult<GroupStatus> {
        group_token.expect_entity(&EntityRef::Group(group_id.to_string()))?;
        let mut state = self.state.write().unwrap_or_else(PoisonError::into_inner);
        let group = state
            .groups
            .get_mut(group_id)
            .ok_or_else(|| StateError::NotFound(format!("group {group_id}")))?;
        group.rebalancing = rebalancing;
        state.refresh_group(group_id, now);
        state.version += 1;
        Ok(state
            .groups
            .get(group_id)
            .map_or(GroupStatus::Empty, |g| g.status))
    }
}

/// A point-in-time copy of the inventory.
#[derive(Debug, Clone, Default, Serialize)]
pub struct InventorySnapshot {
    pub version: u64,
    pub clusters: BTreeMap<ClusterId, ClusterInstance>,
    pub groups: BTreeMap<GroupId, ClusterGroup>,
}

impl InventorySnapshot {
    pub fn cluster(&self, id: &str) -> Option<&ClusterInstance> {
        self.clusters.get(id)
    }

    pub fn group(&self, id: &str) -> Option<&ClusterGroup> {
        self.groups.get(id)
    }

    /// Members of a group in id order; empty for an unknown group.
    pub fn members<'a>(&'a self, group_id: &str) -> impl Iterator<Item = &'a ClusterInstance> + 'a {
        self.groups
            .get(group_id)
            .into_iter()
            .flat_map(|g| g.members.iter())
            .filter_map(|id| self.clusters.get(id))
    }

    pub fn member_count(&self, group_id: &str) -> usize {
        self.groups.get(group_id).map_or(0, |g| g.members.len())
    }

    /// Members that are not on their way out (`Draining`/`Deleted`).
    /// Failed clusters count: they still hold their nodes.
    pub fn live_members<'a>(&'a self, group_id: &str) -> impl Iterator<Item = &'a ClusterInstance> + 'a {
        self.members(group_id)
            .filter(|c| !matches!(c.status, ClusterStatus::Draining | ClusterStatus::Deleted))
    }

    /// Cluster limit of a group: its policy, else `default`.
    pub fn max_clusters_for(&self, group_id: &str, default: u32) -> u32 {
        self.groups
            .get(group_id)
            .and_then(|g| g.policy)
            .map_or(default, |p| p.max_clusters)
    }

    /// Cluster floor of a group: its policy, else `default`.
    pub fn min_clusters_for(&self, group_id: &str, default: u32) -> u32 {
        self.groups
            .get(group_id)
            .and_then(|g| g.policy)
            .map_or(default, |p| p.min_clusters)
    }

    /// Sum of member capacities.
    pub fn group_capacity(&self, group_id: &str) -> ResourceShape {
        self.members(group_id)
            .filter(|c| c.status != ClusterStatus::Deleted)
            .fold(ResourceShape::ZERO, |acc, c| acc.saturating_add(&c.capacity()))
    }

    pub fn group_allocated(&self, group_id: &str) -> ResourceShape {
        self.members(group_id)
            .fold(ResourceShape::ZERO, |acc, c| acc.saturating_add(&c.allocated()))
    }

    /// Power committed to a group's members.
    pub fn committed_watts(&self, group_id: &str) -> f64 {
        self.members(group_id).map(|c| c.estimated_power_watts()).sum()
    }

    /// Power committed across every group.
    pub fn site_committed_watts(&self) -> f64 {
        self.clusters.values().map(|c| c.estimated_power_watts()).sum()
    }

    /// The cluster a workload is currently assigned to.
    pub fn find_workload(&self, workload_id: &str) -> Option<&ClusterInstance> {
        self.clusters
            .values()
            .find(|c| c.workloads.contains_key(workload_id))
    }

    /// Derived view of one group for the upward API.
    pub fn group_summary(&self, group_id: &str) -> Option<GroupSummary> {
        let group = self.groups.get(group_id)?;
        Some(GroupSummary {
            group: group.clone(),
            capacity: self.group_capacity(group_id),
            allocated: self.group_allocated(group_id),
            committed_watts: self.committed_watts(group_id),
            clusters: self.members(group_id).cloned().collect(),
            metrics: GroupMetrics::default(),
        })
    }
}

/// A group with its derived aggregates and member clusters.
#[derive(Debug, Clone, Serialize)]
pub struct GroupSummary {
    pub group: ClusterGroup,
    pub capacity: ResourceShape,
    pub allocated: ResourceShape,
    pub committed_watts: f64,
    pub clusters: Vec<ClusterInstance>,
    /// Filled in by the orchestrator, which keeps the counters.
    pub metrics: GroupMetrics,
}

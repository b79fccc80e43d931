//! Driving gateway operations to completion.
//!
//! An operation is first *issued* (create/resize/delete call, retried with
//! backoff) and then *polled* until the provider reports the end state or
//! the operation deadline passes. Every call is bounded by the provisioning
//! call timeout and the orchestrator's cancellation signal. The cluster's
//! ownership token is held for the whole step, so a cluster is never driven
//! by two tasks at once.

use tracing::{debug, error, info, warn};

use accelgrid_provision::{bounded_call, GatewayError, ProvisionPhase, RetryVerdict};
use accelgrid_state::{ClusterInstance, ClusterStatus, OwnershipToken, WorkloadId};

use crate::audit::AuditEvent;
use crate::error::{GridError, GridResult};
use crate::orchestrator::{locked, GroupOrchestrator};
use crate::ops::{InFlightOp, OpKind, OpProgress};

impl GroupOrchestrator {
    /// Advance the operation outstanding on `cluster_id`, if any. Returns
    /// `None` when there is nothing to do or another task holds the cluster.
    pub(crate) async fn drive_op(&self, cluster_id: &str) -> Option<OpProgress> {
        let inner = &self.inner;
        let mut op = locked(&inner.ops).get(cluster_id).cloned()?;
        let token = match inner.inventory.claim_cluster(cluster_id) {
            Ok(token) => token,
            Err(_) => {
                debug!(cluster = %cluster_id, "cluster busy, operation left for next tick");
                return None;
            }
        };
        let Some(cluster) = inner.inventory.cluster(cluster_id) else {
            locked(&inner.ops).remove(cluster_id);
            return None;
        };

        let now = self.now();
        let progress = if op.issued_at.is_none() {
            self.issue(&token, &cluster, &mut op, now).await
        } else {
            self.poll(&token, &cluster, &mut op, now).await
        };
        self.settle(cluster_id, op, &progress);
        Some(progress)
    }

    /// Completion pushed by the gateway instead of polled.
    pub fn notify_phase(&self, provider_id: &str, phase: ProvisionPhase) -> GridResult<ClusterStatus> {
        let snapshot = self.snapshot();
        let cluster = snapshot
            .clusters
            .values()
            .find(|c| c.provider_id.as_deref() == Some(provider_id))
            .cloned()
            .ok_or_else(|| GridError::NotFound(format!("provider instance {provider_id}")))?;
        let token = self.inner.inventory.claim_cluster(&cluster.id)?;
        let mut op = locked(&self.inner.ops)
            .get(&cluster.id)
            .cloned()
            .ok_or_else(|| {
                GridError::Conflict(format!("no operation in flight on {}", cluster.id))
            })?;

        let progress = self.apply_phase(&token, &cluster, &mut op, phase, self.now());
        self.settle(&cluster.id, op, &progress);
        drop(token);
        if let OpProgress::Failed(e) = progress {
            return Err(e);
        }
        Ok(self
            .inner
            .inventory
            .cluster(&cluster.id)
            .map_or(ClusterStatus::Deleted, |c| c.status))
    }

    fn settle(&self, cluster_id: &str, op: InFlightOp, progress: &OpProgress) {
        let mut ops = locked(&self.inner.ops);
        match progress {
            OpProgress::Waiting => {
                ops.insert(cluster_id.to_string(), op);
            }
            OpProgress::Completed | OpProgress::Failed(_) => {
                ops.remove(cluster_id);
            }
        }
    }

    async fn issue(
        &self,
        token: &OwnershipToken,
        cluster: &ClusterInstance,
        op: &mut InFlightOp,
        now: u64,
    ) -> OpProgress {
        if now < op.next_attempt_at {
            return OpProgress::Waiting;
        }
        let inner = &self.inner;
        let call_timeout = inner.config.provisioning.call_timeout();
        let mut cancel = inner.cancel.clone();

        let result: Result<Option<String>, GatewayError> = match op.kind {
            OpKind::Create => {
                if cluster.status == ClusterStatus::Pending {
                    let moved = inner.inventory.update_cluster(token, &cluster.id, None, now, |c| {
                        c.status = ClusterStatus::Creating;
                        Ok(())
                    });
                    if let Err(e) = moved {
                        warn!(cluster = %cluster.id, error = %e, "could not start create");
                        return OpProgress::Waiting;
                    }
                }
                match inner.catalog.get(&cluster.type_id) {
                    Some(template) => bounded_call(
                        inner.provisioner.create(template, cluster.node_count),
                        call_timeout,
                        &mut cancel,
                    )
                    .await
                    .map(Some),
                    None => Err(GatewayError::Rejected(format!(
                        "cluster type {} is not in the catalog",
                        cluster.type_id
                    ))),
                }
            }
            OpKind::Resize { to, .. } => match cluster.provider_id.as_deref() {
                Some(pid) => bounded_call(inner.provisioner.resize(pid, to), call_timeout, &mut cancel)
                    .await
                    .map(|()| None),
                None => Err(GatewayError::NotFound(cluster.id.clone())),
            },
            OpKind::Delete => match cluster.provider_id.as_deref() {
                Some(pid) => bounded_call(inner.provisioner.delete(pid), call_timeout, &mut cancel)
                    .await
                    .map(|()| None),
                // Never created on the provider side.
                None => return self.finish_delete(token, cluster, now),
            },
        };

        match result {
            Ok(provider_id) => {
                if let Some(pid) = provider_id {
                    let stored = inner.inventory.update_cluster(token, &cluster.id, None, now, |c| {
                        c.provider_id = Some(pid.clone());
                        Ok(())
                    });
                    if let Err(e) = stored {
                        error!(cluster = %cluster.id, provider_id = %pid, error = %e, "could not record provider id");
                    }
                }
                op.issued_at = Some(now);
                op.deadline = now.saturating_add(inner.config.provisioning.operation_timeout().as_secs());
                info!(cluster = %cluster.id, op = op.kind.label(), attempt = op.retry.attempt(), "operation issued");
                OpProgress::Waiting
            }
            Err(GatewayError::Cancelled) => {
                debug!(cluster = %cluster.id, "operation call cancelled");
                OpProgress::Waiting
            }
            Err(e) => self.attempt_failed(token, cluster, op, e, now),
        }
    }

    async fn poll(
        &self,
        token: &OwnershipToken,
        cluster: &ClusterInstance,
        op: &mut InFlightOp,
        now: u64,
    ) -> OpProgress {
        let Some(pid) = cluster.provider_id.clone() else {
            return self.fail_op(
                token,
                cluster,
                op,
                GatewayError::NotFound(cluster.id.clone()),
                now,
            );
        };
        let mut cancel = self.inner.cancel.clone();
        let call_timeout = self.inner.config.provisioning.call_timeout();
        match bounded_call(self.inner.provisioner.status(&pid), call_timeout, &mut cancel).await {
            Ok(phase) => self.apply_phase(token, cluster, op, phase, now),
            Err(GatewayError::Cancelled) => OpProgress::Waiting,
            Err(e) => {
                warn!(cluster = %cluster.id, error = %e, "status poll failed");
                self.check_deadline(token, cluster, op, now)
            }
        }
    }

    fn apply_phase(
        &self,
        token: &OwnershipToken,
        cluster: &ClusterInstance,
        op: &mut InFlightOp,
        phase: ProvisionPhase,
        now: u64,
    ) -> OpProgress {
        match (op.kind, phase) {
            (OpKind::Delete, ProvisionPhase::NotFound) => self.finish_delete(token, cluster, now),
            (OpKind::Create | OpKind::Resize { .. }, ProvisionPhase::Ready { node_count }) => {
                self.finish_scaling(token, cluster, op, node_count, now)
            }
            (OpKind::Create | OpKind::Resize { .. }, ProvisionPhase::NotFound) => self.fail_op(
                token,
                cluster,
                op,
                GatewayError::NotFound(cluster.provider_id.clone().unwrap_or_default()),
                now,
            ),
            (_, ProvisionPhase::Failed { reason }) => {
                op.issued_at = None;
                self.attempt_failed(token, cluster, op, GatewayError::Unavailable(reason), now)
            }
            _ => self.check_deadline(token, cluster, op, now),
        }
    }

    fn check_deadline(
        &self,
        token: &OwnershipToken,
        cluster: &ClusterInstance,
        op: &mut InFlightOp,
        now: u64,
    ) -> OpProgress {
        if now < op.deadline {
            return OpProgress::Waiting;
        }
        let timeout = self.inner.config.provisioning.operation_timeout();
        self.fail_op(token, cluster, op, GatewayError::Timeout(timeout), now)
    }

    fn attempt_failed(
        &self,
        token: &OwnershipToken,
        cluster: &ClusterInstance,
        op: &mut InFlightOp,
        err: GatewayError,
        now: u64,
    ) -> OpProgress {
        let verdict = if err.is_retriable() {
            op.retry.record_failure()
        } else {
            RetryVerdict::Exhausted
        };
        match verdict {
            RetryVerdict::RetryAfter(delay) => {
                op.next_attempt_at = now.saturating_add(delay.as_secs().max(1));
                warn!(
                    cluster = %cluster.id,
                    op = op.kind.label(),
                    error = %err,
                    failures = op.retry.failures(),
                    retry_at = op.next_attempt_at,
                    "operation failed, will retry"
                );
                OpProgress::Waiting
            }
            RetryVerdict::Exhausted => self.fail_op(token, cluster, op, err, now),
        }
    }

    /// Give up on the operation and park the cluster in `Error`.
    fn fail_op(
        &self,
        token: &OwnershipToken,
        cluster: &ClusterInstance,
        op: &InFlightOp,
        source: GatewayError,
        now: u64,
    ) -> OpProgress {
        let reason = format!("{} failed: {source}", op.kind.label());
        let releases = op.kind == OpKind::Create;
        let released = self
            .inner
            .inventory
            .update_cluster(token, &cluster.id, None, now, |c| {
                c.status = ClusterStatus::Error;
                c.target_node_count = None;
                c.last_error = Some(reason.clone());
                let released: Vec<WorkloadId> = if releases {
                    std::mem::take(&mut c.workloads).into_keys().collect()
                } else {
                    Vec::new()
                };
                Ok(released)
            });
        let released = match released {
            Ok(released) => released,
            Err(e) => {
                error!(cluster = %cluster.id, error = %e, "could not mark cluster failed");
                Vec::new()
            }
        };
        error!(cluster = %cluster.id, %reason, released = released.len(), "cluster entered error state");
        self.record(AuditEvent::ClusterFailed {
            cluster_id: cluster.id.clone(),
            reason,
            released,
        });
        OpProgress::Failed(GridError::Provisioning {
            cluster_id: cluster.id.clone(),
            source,
        })
    }

    fn finish_scaling(
        &self,
        token: &OwnershipToken,
        cluster: &ClusterInstance,
        op: &mut InFlightOp,
        reported_nodes: u32,
        now: u64,
    ) -> OpProgress {
        let expected = match op.kind {
            OpKind::Resize { to, .. } => to,
            _ => cluster.node_count,
        };
        if reported_nodes != expected {
            warn!(cluster = %cluster.id, expected, reported = reported_nodes, "provider reports a different node count");
        }
        let done = self
            .inner
            .inventory
            .update_cluster(token, &cluster.id, None, now, |c| {
                c.status = ClusterStatus::Active;
                c.node_count = reported_nodes;
                c.target_node_count = None;
                c.last_error = None;
                Ok(())
            });
        match done {
            Ok(()) => {
                op.retry.record_success();
                info!(cluster = %cluster.id, op = op.kind.label(), nodes = reported_nodes, "cluster active");
                OpProgress::Completed
            }
            Err(e) => {
                error!(cluster = %cluster.id, error = %e, "could not complete operation");
                OpProgress::Waiting
            }
        }
    }

    /// Mark the cluster `Deleted` and drop it from the inventory. If the
    /// group is busy the removal is left to the next sweep.
    pub(crate) fn finish_delete(
        &self,
        token: &OwnershipToken,
        cluster: &ClusterInstance,
        now: u64,
    ) -> OpProgress {
        let inventory = &self.inner.inventory;
        if let Err(e) = inventory.update_cluster(token, &cluster.id, None, now, |c| {
            c.status = ClusterStatus::Deleted;
            c.target_node_count = None;
            Ok(())
        }) {
            error!(cluster = %cluster.id, error = %e, "could not mark cluster deleted");
            return OpProgress::Waiting;
        }
        info!(cluster = %cluster.id, "cluster deleted");
        if let Ok(group_token) = inventory.claim_group(&cluster.group_id) {
            self.remove_deleted(token, &group_token, &cluster.id, now);
        }
        OpProgress::Completed
    }

    pub(crate) fn remove_deleted(
        &self,
        token: &OwnershipToken,
        group_token: &OwnershipToken,
        cluster_id: &str,
        now: u64,
    ) {
        match self
            .inner
            .inventory
            .remove_cluster(token, group_token, cluster_id, now)
        {
            Ok(removal) => {
                locked(&self.inner.utilization).reset(cluster_id);
                if removal.group_destroyed {
                    self.forget_group(&removal.cluster.group_id);
                }
            }
            Err(e) => warn!(cluster = %cluster_id, error = %e, "could not remove deleted cluster"),
        }
    }

    /// Drop per-group state once the group is gone from the inventory.
    pub(crate) fn forget_group(&self, group_id: &str) {
        self.inner.forecasts.forget(group_id);
        locked(&self.inner.estimates).remove(group_id);
        info!(group = %group_id, "group destroyed");
        self.record(AuditEvent::GroupDestroyed {
            group_id: group_id.to_string(),
        });
    }
}

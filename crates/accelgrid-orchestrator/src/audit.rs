//! Bounded in-memory audit trail of decisions and autonomous actions.

use std::collections::VecDeque;

use serde::Serialize;

use accelgrid_power::BudgetViolation;
use accelgrid_state::{ClusterId, GroupId, GroupPolicy, ScalingDecision, WorkloadId};

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AuditEvent {
    /// A decision was applied to the inventory.
    Decision { decision: ScalingDecision },
    /// A sustained ceiling breach fired a forced correction.
    BudgetViolation { violation: BudgetViolation },
    /// Workloads removed from a cluster by a forced action.
    Eviction {
        cluster_id: ClusterId,
        workloads: Vec<WorkloadId>,
        reason: String,
    },
    /// A cluster entered `Error`.
    ClusterFailed {
        cluster_id: ClusterId,
        reason: String,
        /// Workloads released because the cluster never came up.
        released: Vec<WorkloadId>,
    },
    /// A group was declared, or an implicit one adopted a policy.
    GroupCreated {
        group_id: GroupId,
        policy: GroupPolicy,
    },
    /// An operator moved a workload between clusters.
    Migration {
        workload_id: WorkloadId,
        /// Group of the receiving cluster.
        group_id: GroupId,
        from: ClusterId,
        to: ClusterId,
    },
    GroupDestroyed { group_id: GroupId },
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AuditRecord {
    pub seq: u64,
    /// Unix seconds.
    pub timestamp: u64,
    #[serde(flatten)]
    pub event: AuditEvent,
}

#[derive(Debug)]
pub struct AuditLog {
    records: VecDeque<AuditRecord>,
    capacity: usize,
    next_seq: u64,
}

impl AuditLog {
    pub fn new(capacity: usize) -> Self {
        Self {
            records: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            next_seq: 0,
        }
    }

    /// Append a record, dropping the oldest when full.
    pub fn record(&mut self, timestamp: u64, event: AuditEvent) {
        if self.records.len() == self.capacity {
            self.records.pop_front();
        }
        self.next_seq += 1;
        self.records.push_back(AuditRecord {
            seq: self.next_seq,
            timestamp,
            event,
        });
    }

    pub fn records(&self) -> Vec<AuditRecord> {
        self.records.iter().cloned().collect()
    }

    /// Records with `seq` greater than `after`.
    pub fn since(&self, after: u64) -> Vec<AuditRecord> {
        self.records.iter().filter(|r| r.seq > after).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drops_oldest_when_full() {
        let mut log = AuditLog::new(2);
        for i in 0..3 {
            log.record(
                i,
                AuditEvent::GroupDestroyed {
                    group_id: format!("g{i}"),
                },
            );
        }
        let records = log.records();
        assert_eq!(records.len(), 2);
        assert_eq!(records[0].seq, 2);
        assert_eq!(log.since(2).len(), 1);
    }

    #[test]
    fn serializes_with_event_tag() {
        let mut log = AuditLog::new(4);
        log.record(
            7,
            AuditEvent::Eviction {
                cluster_id: "c1".to_string(),
                workloads: vec!["w1".to_string()],
                reason: "power".to_string(),
            },
        );
        let json = serde_json::to_value(&log.records()[0]).unwrap();
        assert_eq!(json["event"], "eviction");
        assert_eq!(json["timestamp"], 7);
        assert_eq!(json["workloads"][0], "w1");
    }
}

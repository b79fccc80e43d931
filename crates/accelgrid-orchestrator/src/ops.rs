//! Gateway operations in flight, at most one per cluster.

use serde::Serialize;

use accelgrid_provision::{RetryPolicy, RetryTracker};
use accelgrid_state::ClusterId;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum OpKind {
    Create,
    Resize { from: u32, to: u32 },
    Delete,
}

impl OpKind {
    pub fn label(&self) -> &'static str {
        match self {
            OpKind::Create => "create",
            OpKind::Resize { .. } => "resize",
            OpKind::Delete => "delete",
        }
    }
}

#[derive(Debug, Clone)]
pub struct InFlightOp {
    pub kind: OpKind,
    pub retry: RetryTracker,
    /// Earliest time the next issue attempt may run.
    pub next_attempt_at: u64,
    /// Set once the gateway accepted the request; completion is polled.
    pub issued_at: Option<u64>,
    /// Give up polling after this time.
    pub deadline: u64,
    /// Budget correction or forced delete.
    pub forced: bool,
}

impl InFlightOp {
    pub fn new(kind: OpKind, policy: RetryPolicy, now: u64, forced: bool) -> Self {
        Self {
            kind,
            retry: RetryTracker::new(policy),
            next_attempt_at: now,
            issued_at: None,
            deadline: u64::MAX,
            forced,
        }
    }
}

/// Public view of an outstanding operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct OpSummary {
    pub cluster_id: ClusterId,
    #[serde(flatten)]
    pub kind: OpKind,
    pub attempt: u32,
    pub issued_at: Option<u64>,
    pub forced: bool,
}

/// How one reconcile step on an operation ended.
#[derive(Debug)]
pub(crate) enum OpProgress {
    /// Still outstanding; keep it.
    Waiting,
    Completed,
    Failed(crate::error::GridError),
}

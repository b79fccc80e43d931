//! Error types for the AccelGrid inventory and domain model.

use thiserror::Error;

use crate::types::{CapacityReason, ClusterStatus};

/// Result type alias for inventory operations.
pub type StateResult<T> = Result<T, StateError>;

/// Errors that can occur during inventory operations.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("not found: {0}")]
    NotFound(String),

    /// Another writer holds the entity's ownership token.
    #[error("entity busy: {0}")]
    Busy(String),

    #[error("token for {held} cannot mutate {target}")]
    WrongToken { held: String, target: String },

    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: ClusterStatus,
        to: ClusterStatus,
    },

    /// The entity changed since the snapshot a decision was based on.
    #[error("stale revision for {id}: expected {expected}, found {actual}")]
    StaleRevision { id: String, expected: u64, actual: u64 },

    #[error("insufficient room on cluster {0}")]
    NoRoom(String),

    #[error("already exists: {0}")]
    Duplicate(String),

    #[error("group {0} still has members")]
    NotEmpty(String),

    #[error("invalid cluster template: {0}")]
    InvalidTemplate(String),
}

/// A malformed workload requirement. Never retried.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("invalid requirement: {0}")]
pub struct ValidationError(pub String);

impl ValidationError {
    pub fn new(msg: impl Into<String>) -> Self {
        Self(msg.into())
    }
}

/// No candidate could take the workload within its power budget.
#[derive(Debug, Clone, Error, PartialEq)]
#[error("insufficient capacity ({code}): {detail}")]
pub struct CapacityError {
    pub code: CapacityReason,
    pub detail: String,
}

impl CapacityError {
    pub fn new(code: CapacityReason, detail: impl Into<String>) -> Self {
        Self {
            code,
            detail: detail.into(),
        }
    }
}

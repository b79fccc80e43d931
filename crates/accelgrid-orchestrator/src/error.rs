//! Error taxonomy surfaced by the orchestrator.

use thiserror::Error;

use accelgrid_provision::GatewayError;
use accelgrid_state::{CapacityError, ClusterStatus, StateError, ValidationError};

pub type GridResult<T> = Result<T, GridError>;

#[derive(Debug, Clone, Error)]
pub enum GridError {
    /// Malformed requirement; rejected before matching, never retried.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// No candidate fits the requirement within its power budget.
    #[error(transparent)]
    Capacity(#[from] CapacityError),

    /// A gateway operation failed after its retries.
    #[error("provisioning failed for cluster {cluster_id}: {source}")]
    Provisioning {
        cluster_id: String,
        #[source]
        source: GatewayError,
    },

    /// A forced correction could not bring a scope under its ceiling.
    #[error("power budget violated on {scope}: {load_watts:.0} W against {ceiling_watts:.0} W ceiling")]
    BudgetViolation {
        scope: String,
        load_watts: f64,
        ceiling_watts: f64,
    },

    #[error("not found: {0}")]
    NotFound(String),

    /// Another writer owns the entity, or it has an operation in flight.
    #[error("busy: {0}")]
    Busy(String),

    #[error("invalid transition for {id}: {from} -> {to}")]
    InvalidTransition {
        id: String,
        from: ClusterStatus,
        to: ClusterStatus,
    },

    #[error("cluster {cluster_id} is in cooldown for another {remaining_secs}s")]
    CooldownActive {
        cluster_id: String,
        remaining_secs: u64,
    },

    /// The inventory kept changing under the decision, or the request
    /// contradicts current state.
    #[error("conflict: {0}")]
    Conflict(String),
}

impl From<StateError> for GridError {
    fn from(e: StateError) -> Self {
        match e {
            StateError::NotFound(what) => GridError::NotFound(what),
            StateError::Busy(what) => GridError::Busy(what),
            StateError::InvalidTransition { id, from, to } => {
                GridError::InvalidTransition { id, from, to }
            }
            other => GridError::Conflict(other.to_string()),
        }
    }
}

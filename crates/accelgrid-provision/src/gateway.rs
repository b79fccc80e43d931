//! ProvisioningGateway contract.
//!
//! The gateway executes create/resize/delete against real infrastructure.
//! Calls only start an operation; completion is observed through
//! [`ProvisioningGateway::status`] (or pushed back by the gateway).

use std::future::Future;
use std::pin::Pin;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use accelgrid_state::ClusterType;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum GatewayError {
    /// Transient failure; worth retrying.
    #[error("provider unavailable: {0}")]
    Unavailable(String),

    /// The provider refused the request outright.
    #[error("request rejected: {0}")]
    Rejected(String),

    #[error("instance not found: {0}")]
    NotFound(String),

    #[error("call timed out after {0:?}")]
    Timeout(Duration),

    #[error("call cancelled")]
    Cancelled,
}

impl GatewayError {
    pub fn is_retriable(&self) -> bool {
        matches!(self, GatewayError::Unavailable(_) | GatewayError::Timeout(_))
    }
}

/// Lifecycle phase of an instance as seen by the provider.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "phase", rename_all = "snake_case")]
pub enum ProvisionPhase {
    InProgress,
    Ready { node_count: u32 },
    Failed { reason: String },
    NotFound,
}

pub type GatewayFuture<'a, T> = Pin<Box<dyn Future<Output = Result<T, GatewayError>> + Send + 'a>>;

/// Executes infrastructure changes for the orchestrator.
pub trait ProvisioningGateway: Send + Sync {
    /// Start creating a cluster; returns the provider's instance id.
    fn create<'a>(&'a self, cluster_type: &'a ClusterType, node_count: u32)
        -> GatewayFuture<'a, String>;

    fn resize<'a>(&'a self, instance_id: &'a str, node_count: u32) -> GatewayFuture<'a, ()>;

    fn delete<'a>(&'a self, instance_id: &'a str) -> GatewayFuture<'a, ()>;

    fn status<'a>(&'a self, instance_id: &'a str) -> GatewayFuture<'a, ProvisionPhase>;
}

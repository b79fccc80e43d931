//! accelgrid-provision — the provisioning boundary of AccelGrid.
//!
//! Defines the [`ProvisioningGateway`] contract the orchestrator drives,
//! plus the pieces that keep long-running provisioning calls from ever
//! blocking the decision loop:
//!
//! ```text
//! orchestrator tick
//!   ├── bounded_call(gateway.create/resize/delete, call_timeout, cancel)
//!   │     └── GatewayError → RetryTracker (2s → 60s, capped retries)
//!   └── bounded_call(gateway.status) → ProvisionPhase
//!         └── operation_timeout exceeded → cluster Error
//! ```
//!
//! [`SimulatedGateway`] is a deterministic in-memory implementation for
//! tests and the daemon's simulation mode.

pub mod gateway;
pub mod poller;
pub mod retry;
pub mod sim;

pub use gateway::{GatewayError, GatewayFuture, ProvisionPhase, ProvisioningGateway};
pub use poller::{bounded_call, cancelled, poll_with_timeout, PollOutcome};
pub use retry::{RetryPolicy, RetryTracker, RetryVerdict};
pub use sim::{SimOp, SimulatedGateway};

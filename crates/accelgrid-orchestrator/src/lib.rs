//! accelgrid-orchestrator — the control loop that owns cluster state.
//!
//! [`GroupOrchestrator`] applies matcher decisions to the inventory,
//! drives create/resize/delete operations through the provisioning
//! gateway, enforces power ceilings with forced scale-in, and consolidates
//! under-utilized groups.
//!
//! # Components
//!
//! - **`orchestrator`** — Upward API: submit, evaluate, complete, delete, queries
//! - **`groups`** — Declared groups, replenishment, scale/migrate/consolidate commands, costs
//! - **`tick`** — Periodic loop: forecasts, budget corrections, consolidation
//! - **`reconcile`** — Issuing and polling gateway operations with retry
//! - **`planning`** — Pure planners for forced scale-in and consolidation
//! - **`lifecycle`** — Cooldown and transition gates
//! - **`utilization`** — Low-utilization windows per cluster
//! - **`audit`** — Bounded trail of decisions and autonomous actions

pub mod audit;
pub mod error;
pub mod groups;
pub mod lifecycle;
pub mod ops;
pub mod orchestrator;
pub mod planning;
mod reconcile;
pub mod tick;
pub mod utilization;

pub use audit::{AuditEvent, AuditLog, AuditRecord};
pub use error::{GridError, GridResult};
pub use groups::{GroupSpec, Migration};
pub use ops::{OpKind, OpSummary};
pub use orchestrator::GroupOrchestrator;
pub use planning::{ConsolidationPlan, Correction, CorrectionPlan, WorkloadMove};
pub use tick::TickReport;
pub use utilization::UtilizationTracker;

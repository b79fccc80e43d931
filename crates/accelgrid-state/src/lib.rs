//! accelgrid-state — cluster inventory and domain model for AccelGrid.
//!
//! Holds the cluster template catalog, the in-memory inventory of cluster
//! instances and groups, and the types exchanged between the matcher, the
//! power guard and the orchestrator.
//!
//! # Concurrency
//!
//! The `Inventory` is `Clone` + `Send` + `Sync` (backed by `Arc`) and can be
//! shared across async tasks. Mutations are serialized per entity through
//! `OwnershipToken`s rather than a global writer lock; readers work on
//! `InventorySnapshot`s.

pub mod catalog;
pub mod error;
pub mod inventory;
pub mod types;

pub use catalog::ClusterTypeCatalog;
pub use error::{CapacityError, StateError, StateResult, ValidationError};
pub use inventory::{
    EntityRef, GroupSummary, Inventory, InventorySnapshot, OwnershipToken, Removal,
};
pub use types::*;

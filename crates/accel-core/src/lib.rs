//! accel-core — shared types, configuration and clock for AccelGrid.
//!
//! Everything here is free of orchestration logic: resource vectors and
//! accelerator kinds, the `accelgrid.toml` parser, and the [`Clock`]
//! abstraction the control loop reads time through.

pub mod clock;
pub mod config;
pub mod types;

pub use clock::{Clock, ManualClock, SystemClock, epoch_secs};
pub use config::{GridConfig, parse_duration};
pub use types::*;

//! accelgrid-power — power budget enforcement for AccelGrid.
//!
//! The [`PowerBudgetGuard`] turns an inventory snapshot plus per-group
//! forecasts into a [`PowerView`] that gates every capacity-adding
//! decision, and reports sustained ceiling breaches that the orchestrator
//! corrects with forced scale-in.
//!
//! # Forecasts
//!
//! Predictions come from an external [`ForecastGateway`]. The
//! [`ForecastCache`] keeps the last good prediction per group; when the
//! gateway fails or times out the cached value is used and tagged stale,
//! and decisions made on it carry the stale flag.

pub mod forecast;
pub mod guard;

pub use forecast::{
    ClusterFeatures, ForecastCache, ForecastError, ForecastEstimate, ForecastGateway,
    ForecastFuture, PowerForecast, SimulatedForecaster,
};
pub use guard::{Admission, BudgetScope, BudgetViolation, GroupPower, PowerBudgetGuard, PowerView};

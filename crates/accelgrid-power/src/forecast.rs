//! Power forecasting boundary.
//!
//! The forecasting model itself is external; this module defines the
//! [`ForecastGateway`] contract, a [`ForecastCache`] that keeps the last
//! good prediction per group so a gateway outage degrades to stale data
//! instead of failing, and a deterministic [`SimulatedForecaster`].

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, warn};

use accel_core::AcceleratorKind;
use accelgrid_state::GroupId;

/// A power prediction for one group over the requested horizon.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PowerForecast {
    /// Unix seconds the prediction was made for.
    pub timestamp: u64,
    pub predicted_watts: f64,
    /// 0.0 (no idea) to 1.0 (certain).
    pub confidence: f64,
}

impl PowerForecast {
    /// Pessimistic draw: the prediction inflated by its uncertainty.
    pub fn worst_case(&self) -> f64 {
        self.predicted_watts * (2.0 - self.confidence.clamp(0.0, 1.0))
    }

    fn is_valid(&self) -> bool {
        self.predicted_watts.is_finite()
            && self.predicted_watts >= 0.0
            && self.confidence.is_finite()
    }
}

/// Inputs handed to the forecasting model for one group.
#[derive(Debug, Clone, Serialize)]
pub struct ClusterFeatures {
    pub group_id: GroupId,
    pub kind: AcceleratorKind,
    pub clusters: usize,
    pub nodes: u32,
    pub committed_watts: f64,
    pub utilization: f64,
    pub timestamp: u64,
}

#[derive(Debug, Error)]
pub enum ForecastError {
    #[error("forecast service unavailable: {0}")]
    Unavailable(String),

    #[error("forecast timed out after {0:?}")]
    Timeout(Duration),

    #[error("forecast rejected: {0}")]
    Invalid(String),
}

pub type ForecastFuture<'a> =
    Pin<Box<dyn Future<Output = Result<PowerForecast, ForecastError>> + Send + 'a>>;

/// External power/cost forecasting model.
pub trait ForecastGateway: Send + Sync {
    fn predict_power<'a>(&'a self, features: &'a ClusterFeatures, horizon: Duration)
        -> ForecastFuture<'a>;
}

/// A forecast as used by the guard, tagged with its freshness.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct ForecastEstimate {
    pub forecast: PowerForecast,
    /// The gateway did not answer this round; this is an older value or
    /// the committed draw.
    pub stale: bool,
}

impl ForecastEstimate {
    pub fn worst_case(&self) -> f64 {
        self.forecast.worst_case()
    }
}

/// Last-known-good forecast per group.
#[derive(Debug, Default)]
pub struct ForecastCache {
    last_good: Mutex<HashMap<GroupId, PowerForecast>>,
}

impl ForecastCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Ask the gateway for a fresh forecast, falling back on failure.
    pub async fn refresh(
        &self,
        gateway: &dyn ForecastGateway,
        features: &ClusterFeatures,
        horizon: Duration,
        call_timeout: Duration,
    ) -> ForecastEstimate {
        let result = match tokio::time::timeout(call_timeout, gateway.predict_power(features, horizon))
            .await
        {
            Ok(result) => result,
            Err(_) => Err(ForecastError::Timeout(call_timeout)),
        };

        match result {
            Ok(forecast) if forecast.is_valid() => {
                self.record(&features.group_id, forecast);
                debug!(
                    group = %features.group_id,
                    predicted = forecast.predicted_watts,
                    confidence = forecast.confidence,
                    "forecast refreshed"
                );
                ForecastEstimate {
                    forecast,
                    stale: false,
                }
            }
            Ok(forecast) => {
                warn!(group = %features.group_id, ?forecast, "discarding malformed forecast");
                self.fallback(&features.group_id, features.committed_watts, features.timestamp)
            }
            Err(e) => {
                warn!(group = %features.group_id, error = %e, "forecast unavailable, using last known");
                self.fallback(&features.group_id, features.committed_watts, features.timestamp)
            }
        }
    }

    pub fn record(&self, group_id: &str, forecast: PowerForecast) {
        self.last_good
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(group_id.to_string(), forecast);
    }

    /// Last good value tagged stale; with no history, the committed draw
    /// at full confidence.
    pub fn fallback(&self, group_id: &str, committed_watts: f64, now: u64) -> ForecastEstimate {
        let last = self
            .last_good
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .get(group_id)
            .copied();
        let forecast = last.unwrap_or(PowerForecast {
            timestamp: now,
            predicted_watts: committed_watts,
            confidence: 1.0,
        });
        ForecastEstimate {
            forecast,
            stale: true,
        }
    }

    pub fn forget(&self, group_id: &str) {
        self.last_good
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(group_id);
    }
}

/// Deterministic forecaster: predicts `committed × factor` at a fixed
/// confidence. Per-group overrides and an outage switch drive tests and
/// the daemon's simulation mode.
pub struct SimulatedForecaster {
    factor: f64,
    confidence: f64,
    delay: Duration,
    available: AtomicBool,
    overrides: Mutex<HashMap<GroupId, (f64, f64)>>,
}

impl SimulatedForecaster {
    pub fn new(factor: f64, confidence: f64) -> Self {
        Self {
            factor,
            confidence,
            delay: Duration::ZERO,
            available: AtomicBool::new(true),
            overrides: Mutex::new(HashMap::new()),
        }
    }

    /// Answer every call after `delay` (used to exercise timeouts).
    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Pin a group's prediction regardless of its committed draw.
    pub fn set_prediction(&self, group_id: &str, predicted_watts: f64, confidence: f64) {
        self.overrides
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(group_id.to_string(), (predicted_watts, confidence));
    }

    pub fn clear_prediction(&self, group_id: &str) {
        self.overrides
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(group_id);
    }
}

impl Default for SimulatedForecaster {
    fn default() -> Self {
        Self::new(1.0, 0.9)
    }
}

impl ForecastGateway for SimulatedForecaster {
    fn predict_power<'a>(
        &'a self,
        features: &'a ClusterFeatures,
        _horizon: Duration,
    ) -> ForecastFuture<'a> {
        Box::pin(async move {
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            if !self.available.load(Ordering::SeqCst) {
                return Err(ForecastError::Unavailable("simulated outage".to_string()));
            }
            let pinned = self
                .overrides
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .get(&features.group_id)
                .copied();
            let (predicted_watts, confidence) =
                pinned.unwrap_or((features.committed_watts * self.factor, self.confidence));
            Ok(PowerForecast {
                timestamp: features.timestamp,
                predicted_watts,
                confidence,
            })
        })
    }
}

//! Daemon assembly: configuration, gateways, decision loop, API server.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use anyhow::{Context, bail};
use tokio::sync::watch;
use tracing::{info, warn};

use accel_core::{GridConfig, SystemClock};
use accelgrid_orchestrator::GroupOrchestrator;
use accelgrid_power::SimulatedForecaster;
use accelgrid_provision::SimulatedGateway;
use accelgrid_state::ClusterTypeCatalog;

/// Load and validate the configuration, applying command-line overrides.
pub fn load_config(path: Option<&Path>, tick_interval: Option<u64>) -> anyhow::Result<GridConfig> {
    let mut config = match path {
        Some(path) => GridConfig::from_file(path)?,
        None => {
            info!("no configuration file given, using defaults");
            GridConfig::default()
        }
    };
    if let Some(secs) = tick_interval {
        if secs == 0 {
            bail!("--tick-interval must be at least 1 second");
        }
        config.orchestrator.tick_interval = format!("{secs}s");
    }
    config.validate()?;
    Ok(config)
}

pub async fn run(config: GridConfig, port: u16, simulate: bool, sim_polls: u32) -> anyhow::Result<()> {
    info!("AccelGrid daemon starting");

    if !simulate {
        bail!("no provisioning backend is built in; start with --simulate");
    }

    // ── Initialize subsystems ──────────────────────────────────

    let catalog = ClusterTypeCatalog::from_config(&config.catalog)
        .context("invalid [[catalog]] template")?;
    info!(templates = catalog.len(), "cluster catalog loaded");

    let provisioner = Arc::new(SimulatedGateway::new(sim_polls));
    let forecaster = Arc::new(SimulatedForecaster::default());
    warn!(polls = sim_polls, "simulation mode: provisioning and forecasts are in-memory");

    // ── Shutdown signal ────────────────────────────────────────

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let tick_interval = config.orchestrator.tick_interval();
    let orchestrator = GroupOrchestrator::new(
        config,
        catalog,
        provisioner,
        forecaster,
        Arc::new(SystemClock),
        shutdown_rx.clone(),
    );

    // ── Start background tasks ─────────────────────────────────

    let loop_orchestrator = orchestrator.clone();
    let loop_handle = tokio::spawn(async move {
        loop_orchestrator.run(tick_interval, shutdown_rx).await;
    });

    // ── Start API server ───────────────────────────────────────

    let router = accelgrid_api::build_router(orchestrator);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    info!(%addr, "API server starting");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("bind {addr}"))?;

    axum::serve(listener, router)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                warn!(error = %e, "could not listen for Ctrl-C, shutting down");
            }
            info!("shutdown signal received");
            let _ = shutdown_tx.send(true);
        })
        .await?;

    let _ = loop_handle.await;
    info!("AccelGrid daemon stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn tick_override_applies() {
        let config = load_config(None, Some(5)).unwrap();
        assert_eq!(config.orchestrator.tick_interval(), Duration::from_secs(5));
    }

    #[test]
    fn zero_tick_rejected() {
        assert!(load_config(None, Some(0)).is_err());
    }

    #[test]
    fn sample_config_is_valid() {
        let path = Path::new(env!("CARGO_MANIFEST_DIR")).join("accelgrid.toml");
        let config = load_config(Some(&path), None).unwrap();
        assert!(ClusterTypeCatalog::from_config(&config.catalog).is_ok());
    }
}

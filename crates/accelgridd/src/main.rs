//! accelgridd — the AccelGrid daemon.
//!
//! Single binary that assembles the AccelGrid subsystems:
//! - Cluster type catalog and inventory
//! - Power budget guard and forecast cache
//! - Group orchestrator decision loop
//! - REST API
//!
//! # Usage
//!
//! ```text
//! accelgridd run --config /etc/accelgrid/accelgrid.toml --port 8080 --simulate
//! accelgridd check-config --config /etc/accelgrid/accelgrid.toml
//! ```

mod daemon;

use std::path::PathBuf;

use clap::{Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "accelgridd", about = "AccelGrid cluster-group orchestration daemon")]
struct Cli {
    /// Log output format.
    #[arg(long, value_enum, default_value = "text", global = true)]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Command,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Command {
    /// Run the decision loop and the REST API.
    Run {
        /// Path to accelgrid.toml. Built-in defaults when omitted.
        #[arg(long)]
        config: Option<PathBuf>,

        /// Port to listen on.
        #[arg(long, default_value = "8080")]
        port: u16,

        /// Tick interval in seconds; overrides the configuration.
        #[arg(long)]
        tick_interval: Option<u64>,

        /// Use the in-memory provisioning and forecast gateways.
        #[arg(long)]
        simulate: bool,

        /// Status polls a simulated operation takes to finish.
        #[arg(long, default_value = "1")]
        sim_polls: u32,
    },
    /// Validate a configuration file and print the effective configuration.
    CheckConfig {
        #[arg(long)]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    match cli.command {
        Command::Run {
            config,
            port,
            tick_interval,
            simulate,
            sim_polls,
        } => {
            let config = daemon::load_config(config.as_deref(), tick_interval)?;
            daemon::run(config, port, simulate, sim_polls).await
        }
        Command::CheckConfig { config } => {
            let config = daemon::load_config(config.as_deref(), None)?;
            print!("{}", config.to_toml_string()?);
            Ok(())
        }
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,accelgrid=debug,accelgridd=debug"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Text => builder.init(),
        LogFormat::Json => builder.json().init(),
    }
}

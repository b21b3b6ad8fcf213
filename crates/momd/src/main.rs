//! Memory Overcommitment Manager daemon
//!
//! `momd host` runs on the hypervisor host and balances guest memory;
//! `momd guest` runs inside each guest and answers the host's inquiries.

use anyhow::Result;
use clap::{Parser, Subcommand};
use mom_lib::{
    daemon::{MomGuestDaemon, MomHostDaemon},
    health::HealthRegistry,
    observability::MomMetrics,
    terminable::Terminable,
};
use momd::{api, config};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Memory Overcommitment Manager
#[derive(Parser)]
#[command(name = "momd")]
#[command(author, version, about = "Memory Overcommitment Manager daemon", long_about = None)]
struct Cli {
    /// Configuration file (TOML, JSON, YAML or INI)
    #[arg(long, short, env = "MOM_CONFIG", global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the host daemon
    Host,

    /// Run the guest daemon
    Guest {
        /// Name the guest reports itself as
        #[arg(long, env = "MOM_GUEST_NAME", default_value = "localhost")]
        name: String,
    },
}

/// Terminate on SIGINT
fn spawn_signal_handler(terminable: Terminable) {
    tokio::spawn(async move {
        match tokio::signal::ctrl_c().await {
            Ok(()) => info!("SIGINT received"),
            Err(e) => warn!(error = %e, "Failed to listen for SIGINT"),
        }
        terminable.terminate();
    });
}

async fn run_host(config_path: Option<PathBuf>) -> Result<()> {
    let config = config::load_host_config(config_path.as_deref())?;
    let terminable = Terminable::new();
    let health_registry = HealthRegistry::new();

    let daemon = MomHostDaemon::from_config(config.clone(), health_registry.clone(), terminable.clone())?;

    let app_state = Arc::new(api::AppState::new(health_registry, MomMetrics::new()));
    let api_handle = tokio::spawn(api::serve(config.api.port, app_state, terminable.clone()));

    spawn_signal_handler(terminable.clone());
    let result = daemon.run().await;

    terminable.terminate();
    match api_handle.await {
        Ok(Err(e)) => warn!(error = %format!("{:#}", e), "API server failed"),
        Err(e) => warn!(error = %e, "API server panicked"),
        Ok(Ok(())) => {}
    }
    result
}

async fn run_guest(config_path: Option<PathBuf>, name: String) -> Result<()> {
    let config = config::load_guest_config(config_path.as_deref())?;
    let terminable = Terminable::new();

    let daemon = MomGuestDaemon::new(config, &name, HealthRegistry::new(), terminable.clone())?;
    spawn_signal_handler(terminable);
    daemon.run().await
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing with JSON output and env filter
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(fmt::layer().json())
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Host => run_host(cli.config).await,
        Commands::Guest { name } => run_guest(cli.config, name).await,
    }
}

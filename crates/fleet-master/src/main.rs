//! Fleet Master Daemon
//!
//! Accepts device control-plane connections, keeps the fleet inventory
//! authoritative, and runs the background sweep and notification
//! keepalive loops.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use fleet_core::config::{self, MasterConfig};
use fleet_master::server::DeviceServer;
use fleet_master::MasterState;

#[derive(Parser)]
#[command(name = "fleet-master")]
#[command(about = "Fleet controller daemon for lab test devices")]
#[command(version)]
struct Args {
    /// Path to configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Bind address (overrides config)
    #[arg(short, long)]
    bind: Option<String>,

    /// Log level (error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Initialize logging
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG").unwrap_or_else(|_| args.log_level.clone()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Fleet Master starting...");

    // Load configuration
    let config = if let Some(config_path) = &args.config {
        config::load_config(config_path)
            .with_context(|| format!("Failed to load config from {:?}", config_path))?
    } else {
        let default_path = config::default_config_path();
        if default_path.exists() {
            config::load_config(&default_path).unwrap_or_else(|e| {
                tracing::warn!("Failed to load config from {:?}: {}", default_path, e);
                MasterConfig::default()
            })
        } else {
            tracing::info!("Using default configuration");
            MasterConfig::default()
        }
    };

    let bind_addr = args.bind.unwrap_or_else(|| config.bind_address.clone());

    // Build the service graph; a corrupt paired-device list is the one
    // thing allowed to be fatal here
    let state = Arc::new(MasterState::new(config).context("Failed to initialize state")?);

    match state.master_keys.get_fingerprint() {
        Ok(fingerprint) => tracing::info!("Master key fingerprint: {}", fingerprint),
        Err(e) => tracing::warn!("Master key unavailable at startup: {}", e),
    }

    // Create cancellation token for graceful shutdown
    let cancel = CancellationToken::new();

    // Setup signal handlers
    let cancel_clone = cancel.clone();
    tokio::spawn(async move {
        let ctrl_c = tokio::signal::ctrl_c();

        #[cfg(unix)]
        let terminate = async {
            tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
                .expect("failed to install signal handler")
                .recv()
                .await;
        };

        #[cfg(not(unix))]
        let terminate = std::future::pending::<()>();

        tokio::select! {
            _ = ctrl_c => {
                tracing::info!("Received Ctrl+C, initiating shutdown...");
            }
            _ = terminate => {
                tracing::info!("Received SIGTERM, initiating shutdown...");
            }
        }

        cancel_clone.cancel();
    });

    // Background loops with their own cancellable lifetimes
    tokio::spawn(fleet_master::sweep::run_stale_sweep(
        Arc::clone(&state.registry),
        state.config.sweep_interval,
        cancel.clone(),
    ));
    tokio::spawn(
        Arc::clone(&state.notifications)
            .run_keepalive(state.config.keepalive_interval, cancel.clone()),
    );

    // Run the device server to completion
    let server = DeviceServer::new(Arc::clone(&state), cancel.clone());
    tracing::info!("Starting device server on {}", bind_addr);
    server.run(&bind_addr).await?;

    tracing::info!("Fleet Master shutdown complete");
    Ok(())
}

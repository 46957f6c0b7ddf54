//! GhostWarden - ban-decision reconciler daemon.
//!
//! Ingests decisions from CrowdSec and Wazuh and keeps a Proxmox cluster
//! IPSet and a host-local nftables set converged with them.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Parser;
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

use ghostwarden::cli::Cli;
use ghostwarden::metrics::{MetricsRecorder, MetricsServer};
use ghostwarden::signal::{ShutdownGuard, ShutdownToken};
use ghostwarden::sinks::local::check_root;
use ghostwarden::{Config, Reconciler};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    if cli.print_config {
        print!("{}", Config::example());
        return Ok(());
    }

    let config = Config::load(&cli.config)
        .with_context(|| format!("Failed to load config from {:?}", cli.config))?;

    let log_level = match cli
        .log_level
        .as_deref()
        .unwrap_or(&config.log_level)
    {
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    if cli.validate {
        info!("Configuration is valid");
        return Ok(());
    }

    info!(
        "GhostWarden {} starting (lapi: {}, siem: {}, local plane: {})",
        env!("CARGO_PKG_VERSION"),
        config.lapi.is_some(),
        config.siem.is_some(),
        config.local.is_some(),
    );

    if config.local.is_some() {
        check_root().context("Cannot manage the local nftables plane")?;
    }

    let _guard = ShutdownGuard::new();
    let shutdown = ShutdownToken::new();

    let metrics = Arc::new(MetricsRecorder::new().context("Failed to build metrics registry")?);

    if config.metrics.enabled {
        let server = MetricsServer::new(metrics.clone(), config.metrics.port);
        tokio::spawn(async move {
            if let Err(e) = server.serve().await {
                warn!("Metrics server stopped: {}", e);
            }
        });
    }

    let mut reconciler = Reconciler::from_config(&config, metrics, shutdown)
        .context("Failed to initialize reconciler")?;

    reconciler.run().await.context("Reconciler failed")?;

    info!("Shutdown complete");
    Ok(())
}

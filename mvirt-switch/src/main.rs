//! mvirt-switch: standalone switch fabric daemon.
//!
//! Builds a fabric from a configuration file, applies its bootstrap
//! requests, reports the resulting port table and runs until signalled.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use tokio::signal::unix::{SignalKind, signal};
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use mvirt_switch::{Fabric, FabricConfig};

#[derive(Debug, Clone, Copy, ValueEnum)]
enum LogFormat {
    Full,
    Compact,
}

/// mvirt software switch
#[derive(Parser, Debug)]
#[command(name = "mvirt-switch", version, about)]
struct Args {
    /// JSON configuration file
    #[arg(long)]
    config: Option<PathBuf>,

    /// Override the forwarding batch size
    #[arg(long)]
    batch_size: Option<usize>,

    /// Log line format
    #[arg(long, value_enum, default_value = "full")]
    log_format: LogFormat,
}

#[tokio::main(flavor = "current_thread")]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "mvirt_switch=info".into());
    let registry = tracing_subscriber::registry().with(filter);
    match args.log_format {
        LogFormat::Full => registry.with(tracing_subscriber::fmt::layer()).init(),
        LogFormat::Compact => registry
            .with(tracing_subscriber::fmt::layer().compact())
            .init(),
    }

    let mut config = match &args.config {
        Some(path) => FabricConfig::load(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => FabricConfig::default(),
    };
    if let Some(n) = args.batch_size {
        config.batch_size = n;
    }
    let bootstrap = std::mem::take(&mut config.bootstrap);

    let fabric = Fabric::new(config).context("creating switch fabric")?;
    info!("Starting mvirt-switch");

    for request in bootstrap {
        match fabric.handle(request.clone(), None) {
            Ok(response) => info!(?response, "Bootstrap request applied"),
            Err(e) => error!(?request, error = %e, class = ?e.class(), "Bootstrap request failed"),
        }
    }

    let ports = fabric.list_all();
    info!(
        ports = %serde_json::to_string(&ports).context("encoding port table")?,
        bridges = %serde_json::to_string(&fabric.bridges()).context("encoding bridge table")?,
        "Switch ready"
    );

    let mut sigint = signal(SignalKind::interrupt()).context("installing SIGINT handler")?;
    let mut sigterm = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        _ = sigint.recv() => {
            info!("Received SIGINT, shutting down...");
        }
        _ = sigterm.recv() => {
            info!("Received SIGTERM, shutting down...");
        }
    }

    fabric.shutdown();
    info!("Switch stopped");
    Ok(())
}

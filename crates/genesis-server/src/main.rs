//! # Genesis Server
//!
//! Headless server for the Genesis cell pipeline.
//!
//! Generates the area around spawn through the staged pipeline, ticks the
//! world, autosaves, and flushes every cell on shutdown. Takes an optional
//! path to a TOML config file (default `genesis.toml`).

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(clippy::unwrap_used)]

mod config;
mod generator;
mod server;

use anyhow::Result;
use config::{ServerConfig, CONFIG_FILE};
use std::path::PathBuf;
use tracing::{info, warn};
use tracing_subscriber::{fmt, prelude::*, reload, EnvFilter};

/// Main entry point.
#[tokio::main]
async fn main() -> Result<()> {
    // RUST_LOG takes precedence over the configured filter.
    let env_filter = EnvFilter::try_from_default_env().ok();
    let from_env = env_filter.is_some();
    let initial = env_filter.unwrap_or_else(|| EnvFilter::new("info"));
    let (filter, filter_handle) = reload::Layer::new(initial);
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer())
        .init();

    let config_path = std::env::args_os()
        .nth(1)
        .map_or_else(|| PathBuf::from(CONFIG_FILE), PathBuf::from);
    let config = ServerConfig::load_from(&config_path);
    if !config_path.exists() {
        if let Err(e) = config.save_to(&config_path) {
            warn!("Could not write default config: {e}");
        }
    }
    if !from_env {
        filter_handle.reload(EnvFilter::try_new(&config.log_filter)?)?;
    }

    info!("Genesis server starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    server::run(config).await?;

    info!("Genesis server shutdown complete");
    Ok(())
}

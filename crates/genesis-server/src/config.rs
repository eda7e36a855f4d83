//! Server configuration.
//!
//! Wraps the world configuration with runtime settings for the headless
//! server. Loaded from and saved to a TOML file.

use genesis_world::WorldConfig;
use serde::{Deserialize, Serialize};
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Configuration file name.
pub const CONFIG_FILE: &str = "genesis.toml";

/// Server configuration parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Directory cell files are written to
    pub save_dir: PathBuf,
    /// Radius, in cells, of the area generated around spawn
    pub spawn_radius: u32,
    /// Number of ticks to run before shutting down (0 = until interrupted)
    pub ticks: u64,
    /// Milliseconds between ticks
    pub tick_interval_ms: u64,
    /// Save every N ticks (0 = only on shutdown)
    pub autosave_interval: u64,
    /// Log filter used when `RUST_LOG` is not set
    pub log_filter: String,
    /// World layout and generation settings
    pub world: WorldConfig,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            save_dir: PathBuf::from("world"),
            spawn_radius: 2,
            ticks: 200,
            tick_interval_ms: 50,
            autosave_interval: 100,
            log_filter: "genesis_server=info,genesis_world=info".to_owned(),
            world: WorldConfig::default(),
        }
    }
}

impl ServerConfig {
    /// Load configuration from a specific path.
    /// Returns default config if file doesn't exist or is invalid.
    pub fn load_from<P: AsRef<Path>>(path: P) -> Self {
        let path = path.as_ref();

        if !path.exists() {
            info!("Config file {} not found, using defaults", path.display());
            return Self::default();
        }

        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(e) => {
                warn!("Failed to read config file: {e}");
                return Self::default();
            },
        };

        match toml::from_str::<Self>(&contents) {
            Ok(mut config) => {
                config.validate();
                info!("Loaded config from {}", path.display());
                config
            },
            Err(e) => {
                warn!("Failed to parse config file: {e}");
                Self::default()
            },
        }
    }

    /// Save configuration to a specific path.
    pub fn save_to<P: AsRef<Path>>(&self, path: P) -> io::Result<()> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let contents = toml::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, contents)?;

        info!("Saved config to {}", path.display());
        Ok(())
    }

    /// Validate and clamp configuration values to sensible ranges.
    pub fn validate(&mut self) {
        self.spawn_radius = self.spawn_radius.min(32);
        self.tick_interval_ms = self.tick_interval_ms.clamp(1, 10_000);
        if self.log_filter.trim().is_empty() {
            self.log_filter = Self::default().log_filter;
        }
        self.world.validate();
    }
}

// App Proxy - Daemon Config Module
// Handles daemon configuration (bind address, database path, engine binary)

use std::fs;
use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

/// Daemon configuration
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct DaemonConfig {
    /// Bind address for the control API (loopback only by default)
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// Path to the SQLite database holding configurations and the allow-list
    #[serde(default = "default_database_path")]
    pub database_path: PathBuf,

    /// Packet-relay engine binary (resolved through PATH unless absolute)
    #[serde(default = "default_engine_binary")]
    pub engine_binary: String,

    /// Name of the TUN device to allocate
    #[serde(default = "default_tun_name")]
    pub tun_name: String,

    /// Skip the interactive permission prompt and grant unconditionally.
    /// For headless deployments where the operator pre-approved tunnelling.
    #[serde(default = "default_auto_grant_permission")]
    pub auto_grant_permission: bool,
}

fn default_bind_address() -> String {
    "127.0.0.1:3490".to_string()
}

fn default_database_path() -> PathBuf {
    dirs::data_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("app-proxy")
        .join("configs.db")
}

fn default_engine_binary() -> String {
    "tun2socks".to_string()
}

fn default_tun_name() -> String {
    "appproxy0".to_string()
}

fn default_auto_grant_permission() -> bool {
    false
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            database_path: default_database_path(),
            engine_binary: default_engine_binary(),
            tun_name: default_tun_name(),
            auto_grant_permission: default_auto_grant_permission(),
        }
    }
}

impl DaemonConfig {
    /// Validate the daemon configuration
    pub fn validate(&self) -> Result<()> {
        // The control API is unauthenticated, so it must not leave loopback.
        let is_loopback = self.bind_address.starts_with("127.")
            || self.bind_address.starts_with("localhost:")
            || self.bind_address == "localhost";
        if !is_loopback {
            anyhow::bail!(
                "bind_address {} is not a loopback address; the control API must stay local",
                self.bind_address
            );
        }

        if self.tun_name.trim().is_empty()
            || self.tun_name.chars().any(char::is_whitespace)
        {
            anyhow::bail!("tun_name {:?} is not a valid device name", self.tun_name);
        }

        if self.engine_binary.trim().is_empty() {
            anyhow::bail!("engine_binary must not be empty");
        }

        Ok(())
    }

    /// Load daemon configuration from file
    pub fn load() -> Result<Self> {
        let config_path = Self::config_path()?;

        if !config_path.exists() {
            info!("No daemon configuration found, using defaults");
            info!("Configuration will be saved to: {}", config_path.display());
            let config = Self::default();
            config.save()?;
            return Ok(config);
        }

        let contents = fs::read_to_string(&config_path)
            .context("Failed to read daemon configuration")?;

        let config: Self = toml::from_str(&contents)
            .context("Failed to parse daemon configuration")?;

        config.validate()
            .context("Configuration validation failed")?;

        info!("Loaded daemon configuration from: {}", config_path.display());
        Ok(config)
    }

    /// Save daemon configuration to file
    pub fn save(&self) -> Result<()> {
        let config_path = Self::config_path()?;

        if let Some(parent) = config_path.parent() {
            fs::create_dir_all(parent)
                .context("Failed to create configuration directory")?;
        }

        let contents = toml::to_string_pretty(self)
            .context("Failed to serialize daemon configuration")?;

        fs::write(&config_path, contents)
            .context("Failed to write daemon configuration")?;

        info!("Saved daemon configuration to: {}", config_path.display());
        Ok(())
    }

    /// Get the path to the daemon configuration file
    pub fn config_path() -> Result<PathBuf> {
        let config_dir = dirs::config_dir()
            .ok_or_else(|| anyhow::anyhow!("Could not determine config directory"))?;
        Ok(config_dir.join("app-proxy").join("daemon.toml"))
    }
}

//! Configuration management for LumaDB

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{Error, Result};

/// Main configuration structure for the data-handle layer
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Data handle cache and sweep configuration
    #[serde(default)]
    pub handles: HandleConfig,

    /// Logging configuration
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl Config {
    /// Load configuration from a TOML, YAML or JSON file
    pub async fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|e| Error::Config(format!("Failed to read config file: {e}")))?;

        let config = match path.extension().and_then(|ext| ext.to_str()) {
            Some("toml") => Self::from_toml_str(&content)?,
            Some("yaml" | "yml") => serde_yaml::from_str(&content)?,
            _ => serde_json::from_str(&content)
                .map_err(|e| Error::Config(format!("Failed to parse JSON config: {e}")))?,
        };

        if let Err(e) = config.validate() {
            warn!(path = %path.display(), error = %e, "rejected handle configuration");
            return Err(e);
        }
        info!(
            path = %path.display(),
            sweep_enabled = config.handles.sweep_enabled,
            close_idle_time_ms = config.handles.close_idle_time_ms,
            "loaded configuration"
        );
        Ok(config)
    }

    /// Parse configuration from a TOML string
    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    /// Check all sections for values the handle layer cannot run with
    pub fn validate(&self) -> Result<()> {
        self.handles.validate()
    }
}

/// Data handle sweep configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HandleConfig {
    /// Run the periodic sweep server
    pub sweep_enabled: bool,
    /// Time an unused handle stays open before the sweep closes it
    pub close_idle_time_ms: u64,
    /// Interval between sweep passes
    pub close_scan_interval_ms: u64,
    /// Number of open handles below which idle handles are left open
    pub close_handle_minimum: usize,
}

impl Default for HandleConfig {
    fn default() -> Self {
        Self {
            sweep_enabled: true,
            close_idle_time_ms: 30_000,
            close_scan_interval_ms: 10_000,
            close_handle_minimum: 250,
        }
    }
}

impl HandleConfig {
    #[must_use]
    pub fn idle_threshold(&self) -> Duration {
        Duration::from_millis(self.close_idle_time_ms)
    }

    #[must_use]
    pub fn scan_interval(&self) -> Duration {
        Duration::from_millis(self.close_scan_interval_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.sweep_enabled && self.close_scan_interval_ms == 0 {
            return Err(Error::Config(
                "handles.close_scan_interval_ms must be non-zero when the sweep is enabled"
                    .to_string(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default filter directive, overridden by RUST_LOG
    pub level: String,
    /// Emit JSON lines instead of human readable output
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

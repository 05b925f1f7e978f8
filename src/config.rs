//! Adapter configuration
//!
//! Read from `<config dir>/gcadapter/config.toml`. Every field has a default,
//! so a missing file or a partial one still yields a usable configuration.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info, warn};

const CONFIG_DIR: &str = "gcadapter";
const CONFIG_FILE: &str = "config.toml";

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse configuration: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

#[derive(Deserialize, Serialize, Clone, Debug, PartialEq)]
#[serde(default)]
pub struct AdapterConfig {
    pub vendor_id: u16,
    pub product_id: u16,
    /// Upper bound for waiting on an outstanding output transfer at teardown
    pub drain_timeout_ms: u64,
    /// Slice of a blocking USB read; bounds how fast teardown is noticed
    pub usb_poll_timeout_ms: u64,
    /// Capacity of the virtual pad event channel
    pub event_buffer: usize,
    pub log_level: String,
    pub device_name: String,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self {
            vendor_id: 0x057e,
            product_id: 0x0337,
            drain_timeout_ms: 5000,
            usb_poll_timeout_ms: 100,
            event_buffer: 256,
            log_level: "info".to_string(),
            device_name: "Nintendo GameCube Controller Adapter".to_string(),
        }
    }
}

impl AdapterConfig {
    pub fn default_path() -> PathBuf {
        let mut path = dirs::config_dir().unwrap_or_else(|| {
            warn!("Could not determine config directory, using current directory");
            PathBuf::from(".")
        });
        path.push(CONFIG_DIR);
        path.push(CONFIG_FILE);
        path
    }

    /// Loads the file at `path`, or the defaults when it does not exist.
    pub async fn load_from(path: &Path) -> Result<Self, ConfigError> {
        let exists = tokio::fs::try_exists(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        if !exists {
            warn!(
                "Configuration file {} does not exist, using defaults",
                path.display()
            );
            return Ok(Self::default());
        }

        let content = tokio::fs::read_to_string(path)
            .await
            .map_err(|source| ConfigError::Io {
                path: path.to_path_buf(),
                source,
            })?;
        let config = Self::from_toml(&content)?;
        info!("Loaded configuration from {}", path.display());
        Ok(config)
    }

    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        debug!("Parsed configuration: {:?}", config);
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.drain_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "drain_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.usb_poll_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "usb_poll_timeout_ms must be greater than zero".into(),
            ));
        }
        if self.event_buffer == 0 {
            return Err(ConfigError::Invalid(
                "event_buffer must be greater than zero".into(),
            ));
        }
        if self.log_level.parse::<tracing::Level>().is_err() {
            return Err(ConfigError::Invalid(format!(
                "unknown log level '{}'",
                self.log_level
            )));
        }
        Ok(())
    }

    pub fn drain_timeout(&self) -> Duration {
        Duration::from_millis(self.drain_timeout_ms)
    }

    pub fn usb_poll_timeout(&self) -> Duration {
        Duration::from_millis(self.usb_poll_timeout_ms)
    }

    pub fn log_level(&self) -> tracing::Level {
        self.log_level.parse().unwrap_or(tracing::Level::INFO)
    }
}

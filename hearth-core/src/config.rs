//! Configuration types for Hearth

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Main configuration for the supervisor and its collaborators
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct HearthConfig {
    /// Durable worker catalog
    #[serde(default)]
    pub storage: StorageConfig,

    /// Process lifecycle timing
    #[serde(default)]
    pub supervisor: SupervisorConfig,

    /// Output capture
    #[serde(default)]
    pub logs: LogConfig,

    /// Backup layout
    #[serde(default)]
    pub backups: BackupConfig,

    /// Event bus
    #[serde(default)]
    pub events: EventConfig,
}

/// Persistence store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// JSON file holding the worker catalog
    pub path: PathBuf,
}

impl Default for StorageConfig {
    fn default() -> Self {
        let path = dirs::data_dir()
            .map(|dir| dir.join("hearth").join("servers.json"))
            .unwrap_or_else(|| PathBuf::from("./data/servers.json"));
        Self { path }
    }
}

/// Process lifecycle configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SupervisorConfig {
    /// Grace window between SIGTERM and SIGKILL
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,

    /// How long `stop` keeps waiting after SIGKILL
    #[serde(with = "humantime_serde")]
    pub kill_timeout: Duration,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            shutdown_timeout: Duration::from_secs(10),
            kill_timeout: Duration::from_secs(5),
        }
    }
}

/// Output capture configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogConfig {
    /// In-memory entries kept per worker
    pub buffer_capacity: usize,

    /// Directory name under the install path for daily log files
    pub directory: String,

    /// Longest single entry; longer output without a newline is split
    pub max_line_bytes: usize,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            buffer_capacity: 1000,
            directory: "logs".to_string(),
            max_line_bytes: 16 * 1024,
        }
    }
}

/// Backup configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BackupConfig {
    /// Directory name under the install path holding backups
    pub directory: String,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            directory: "backups".to_string(),
        }
    }
}

/// Event bus configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EventConfig {
    /// Broadcast buffer size; slow subscribers lag past this
    pub buffer_size: usize,
}

impl Default for EventConfig {
    fn default() -> Self {
        Self { buffer_size: 256 }
    }
}

impl HearthConfig {
    /// Load configuration from file and environment variables.
    ///
    /// Loads in this order:
    /// 1. Default configuration
    /// 2. Configuration file (`hearth.toml`)
    /// 3. Environment variable overrides (`HEARTH_LOGS__BUFFER_CAPACITY=500`)
    /// 4. File named by `HEARTH_CONFIG_PATH`, if set
    ///
    /// # Errors
    ///
    /// Returns an error if a configuration source is invalid.
    pub fn load() -> crate::error::Result<Self> {
        use figment::{
            Figment,
            providers::{Env, Format, Serialized, Toml},
        };

        let mut figment = Figment::from(Serialized::defaults(HearthConfig::default()))
            .merge(Toml::file("hearth.toml"))
            .merge(Env::prefixed("HEARTH_").ignore(&["CONFIG_PATH"]).split("__"));

        if let Ok(path) = std::env::var("HEARTH_CONFIG_PATH") {
            figment = figment.merge(Toml::file(path));
        }

        let config: HearthConfig = figment.extract().map_err(|e| {
            crate::error::HearthError::Configuration(format!("Failed to load configuration: {}", e))
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    ///
    /// # Errors
    ///
    /// Returns an error if the file cannot be read or parsed.
    pub fn from_file(path: impl AsRef<std::path::Path>) -> crate::error::Result<Self> {
        use figment::{
            Figment,
            providers::{Format, Serialized, Toml},
        };

        let config: HearthConfig = Figment::from(Serialized::defaults(HearthConfig::default()))
            .merge(Toml::file(path))
            .extract()
            .map_err(|e| {
                crate::error::HearthError::Configuration(format!(
                    "Failed to load configuration file: {}",
                    e
                ))
            })?;

        config.validate()?;
        Ok(config)
    }

    /// Reject settings no component can work with
    pub fn validate(&self) -> crate::error::Result<()> {
        if self.logs.buffer_capacity == 0 {
            return Err(crate::error::HearthError::Configuration(
                "logs.buffer_capacity must be at least 1".to_string(),
            ));
        }
        if self.logs.max_line_bytes == 0 {
            return Err(crate::error::HearthError::Configuration(
                "logs.max_line_bytes must be at least 1".to_string(),
            ));
        }
        if self.events.buffer_size == 0 {
            return Err(crate::error::HearthError::Configuration(
                "events.buffer_size must be at least 1".to_string(),
            ));
        }
        for (key, value) in [
            ("logs.directory", &self.logs.directory),
            ("backups.directory", &self.backups.directory),
        ] {
            if value.is_empty() || value.contains(['/', '\\']) || value == "." || value == ".." {
                return Err(crate::error::HearthError::Configuration(format!(
                    "{key} must be a single directory name, got {value:?}"
                )));
            }
        }
        Ok(())
    }
}

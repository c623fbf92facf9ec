//! Configuration types for devpool

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// System-wide configuration file consulted when `--config` is not given
pub const DEFAULT_CONFIG_PATH: &str = "/etc/devpool/config.toml";

/// Overrides `devices.count`
pub const DEVICE_COUNT_ENV: &str = "DEVPOOL_DEVICE_COUNT";

/// Overrides `storage.state_dir`
pub const STATE_DIR_ENV: &str = "DEVPOOL_STATE_DIR";

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DevpoolConfig {
    /// Where the registry documents live
    pub storage: StorageConfig,
    /// Device pool sizing
    pub devices: DeviceConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
}

impl DevpoolConfig {
    /// Load configuration from a TOML file
    pub fn from_file(path: &Path) -> Result<Self, crate::DevpoolError> {
        let content = std::fs::read_to_string(path).map_err(|e| {
            crate::DevpoolError::Config(format!("Failed to read config file: {}", e))
        })?;
        toml::from_str(&content)
            .map_err(|e| crate::DevpoolError::Config(format!("Failed to parse config: {}", e)))
    }

    /// Resolve the effective configuration.
    ///
    /// An explicit path must exist. Without one, the system-wide file is used
    /// when present and the defaults otherwise. Environment overrides are
    /// applied last.
    pub fn load(path: Option<&Path>) -> Result<Self, crate::DevpoolError> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => {
                let system = Path::new(DEFAULT_CONFIG_PATH);
                if system.exists() {
                    Self::from_file(system)?
                } else {
                    debug!("No config file found, using defaults");
                    Self::default()
                }
            }
        };
        config.apply_overrides(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (normally the process environment)
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), crate::DevpoolError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(count) = lookup(DEVICE_COUNT_ENV) {
            let count = count.trim().parse::<u32>().map_err(|e| {
                crate::DevpoolError::Config(format!(
                    "Invalid {} value '{}': {}",
                    DEVICE_COUNT_ENV, count, e
                ))
            })?;
            self.devices.count = Some(count);
        }
        if let Some(dir) = lookup(STATE_DIR_ENV) {
            self.storage.state_dir = PathBuf::from(dir);
        }
        Ok(())
    }
}

/// Storage configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Directory holding both registry documents and their lock files
    pub state_dir: PathBuf,
    /// File name of the environments document
    pub environments_file: String,
    /// File name of the devices document
    pub devices_file: String,
}

impl StorageConfig {
    pub fn environments_path(&self) -> PathBuf {
        self.state_dir.join(&self.environments_file)
    }

    pub fn devices_path(&self) -> PathBuf {
        self.state_dir.join(&self.devices_file)
    }
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            state_dir: PathBuf::from("/tmp/devpool"),
            environments_file: "environments.json".to_string(),
            devices_file: "devices.json".to_string(),
        }
    }
}

/// Device pool configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DeviceConfig {
    /// Fixed pool size; when set the hardware query is skipped
    pub count: Option<u32>,
    /// Command listing one device per output line
    pub query_command: Vec<String>,
    /// Hardware query timeout in seconds
    pub query_timeout_secs: u64,
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            count: None,
            query_command: vec![
                "nvidia-smi".to_string(),
                "--query-gpu=index".to_string(),
                "--format=csv,noheader".to_string(),
            ],
            query_timeout_secs: 10,
        }
    }
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "warn".to_string(),
        }
    }
}

//! Configuration for the fleet-master daemon

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::ConfigError;

/// Get the default configuration directory
pub fn default_config_dir() -> PathBuf {
    dirs::config_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("fleet-master")
}

/// Get the default configuration file path
pub fn default_config_path() -> PathBuf {
    default_config_dir().join("config.toml")
}

/// Configuration for the Master daemon
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MasterConfig {
    /// Address the device control-plane listener binds to
    pub bind_address: String,

    /// Directory for durable state (paired-device list)
    pub data_dir: PathBuf,

    /// Directory holding SSH material (Master key pair, trusted-key file)
    pub ssh_dir: PathBuf,

    /// Seconds an unpaired offline device may linger before the sweep
    /// removes it; 0 disables automatic cleanup
    #[serde(with = "duration_secs")]
    pub stale_timeout: Duration,

    /// Interval between stale-sweep passes
    #[serde(with = "duration_secs")]
    pub sweep_interval: Duration,

    /// Idle interval after which each notification observer receives a
    /// keepalive
    #[serde(with = "duration_secs")]
    pub keepalive_interval: Duration,

    /// Handshake timeout for outbound shell diagnostics
    #[serde(with = "duration_secs")]
    pub ssh_connect_timeout: Duration,

    /// Overall timeout for remote command execution
    #[serde(with = "duration_secs")]
    pub ssh_exec_timeout: Duration,

    /// Username for outbound shell connections (current user when unset)
    pub ssh_username: Option<String>,

    /// Queue depth per notification observer
    pub observer_queue_capacity: usize,

    /// Queue depth for each device's outbound message channel
    pub outbound_queue_capacity: usize,

    /// Most recent IP transitions retained per device
    pub binding_history_cap: usize,
}

impl Default for MasterConfig {
    fn default() -> Self {
        let home = dirs::home_dir().unwrap_or_else(|| PathBuf::from("."));

        Self {
            bind_address: "0.0.0.0:8765".to_string(),
            data_dir: default_config_dir(),
            ssh_dir: home.join(".ssh"),
            stale_timeout: Duration::from_secs(3600),
            sweep_interval: Duration::from_secs(60),
            keepalive_interval: Duration::from_secs(30),
            ssh_connect_timeout: Duration::from_secs(10),
            ssh_exec_timeout: Duration::from_secs(30),
            ssh_username: None,
            observer_queue_capacity: 64,
            outbound_queue_capacity: 256,
            binding_history_cap: 20,
        }
    }
}

impl MasterConfig {
    /// Path of the durable paired-device list
    pub fn paired_devices_path(&self) -> PathBuf {
        self.data_dir.join("paired_devices.json")
    }

    /// Path of the trusted device-key file
    pub fn key_store_path(&self) -> PathBuf {
        self.ssh_dir.join("authorized_keys")
    }
}

/// Load configuration from a file
pub fn load_config<T: serde::de::DeserializeOwned>(path: &Path) -> Result<T, ConfigError> {
    if !path.exists() {
        return Err(ConfigError::NotFound(path.to_path_buf()));
    }

    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Invalid(format!("Failed to read config: {}", e)))?;

    let config: T = toml::from_str(&content)?;
    Ok(config)
}

/// Save configuration to a file
pub fn save_config<T: serde::Serialize>(path: &Path, config: &T) -> Result<(), ConfigError> {
    let content = toml::to_string_pretty(config)?;

    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .map_err(|e| ConfigError::Invalid(format!("Failed to create config dir: {}", e)))?;
    }

    std::fs::write(path, content)
        .map_err(|e| ConfigError::Invalid(format!("Failed to write config: {}", e)))?;

    Ok(())
}

// Durations are written as plain seconds in the TOML file
mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

//! # Configuration Management Module
//!
//! Configuration for the gateway: which radio to talk to, how hard to retry,
//! where the database lives and how to log.
//!
//! ## Configuration Structure
//!
//! - [`DeviceConfig`] - transport selection, retry policy, timeouts, health checks
//! - [`StorageConfig`] - data directory and database path
//! - [`LoggingConfig`] - log level and optional log file
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshgate::config::Config;
//!
//! #[tokio::main]
//! async fn main() -> anyhow::Result<()> {
//!     let mut config = Config::load("config.toml").await?;
//!     config.apply_env_overrides();
//!     println!("Transport: {}", config.device.transport().describe());
//!     Ok(())
//! }
//! ```
//!
//! ## Configuration File Format
//!
//! ```toml
//! [device]
//! serial_port = "/dev/ttyUSB0"   # empty or "auto" to probe USB serial ports
//! baud_rate = 115200
//! tcp_host = ""                  # non-empty selects TCP instead of serial
//! tcp_port = 5000
//! auto_reconnect = true
//! max_retries = 5
//! base_delay_secs = 5
//! max_delay_secs = 60
//!
//! [storage]
//! data_dir = "./data"
//!
//! [logging]
//! level = "info"
//! ```
//!
//! ## Environment Integration
//!
//! Precedence: CLI args > environment (`MC_*`) > config file > defaults.

use anyhow::{anyhow, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;
use tokio::fs;

use crate::device::link::TransportTarget;
use crate::device::lifecycle::RetryPolicy;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    pub device: DeviceConfig,
    pub storage: StorageConfig,
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceConfig {
    /// Serial device path. Empty or `auto` probes USB serial ports.
    #[serde(default)]
    pub serial_port: String,
    #[serde(default = "default_baud_rate")]
    pub baud_rate: u32,
    /// When non-empty the gateway connects over TCP instead of serial.
    #[serde(default)]
    pub tcp_host: String,
    #[serde(default = "default_tcp_port")]
    pub tcp_port: u16,
    /// Display name used until the device reports its own.
    #[serde(default = "default_device_name")]
    pub device_name: String,
    #[serde(default = "default_true")]
    pub auto_reconnect: bool,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_base_delay_secs")]
    pub base_delay_secs: u64,
    #[serde(default = "default_max_delay_secs")]
    pub max_delay_secs: u64,
    /// Timeout for ordinary commands (seconds).
    #[serde(default)]
    pub command_timeout_secs: Option<u64>,
    /// Timeout for battery / device query style probes (seconds).
    #[serde(default)]
    pub health_timeout_secs: Option<u64>,
    /// Seconds between idle health checks; 0 disables them.
    #[serde(default)]
    pub health_interval_secs: Option<u64>,
    /// Bound on the graceful close during stop (seconds).
    #[serde(default)]
    pub close_timeout_secs: Option<u64>,
    /// Bound on opening the transport and reading the device identity (seconds).
    #[serde(default)]
    pub connect_timeout_secs: Option<u64>,
    #[serde(default = "default_max_channels")]
    pub max_channels: u8,
    /// Manual contact approval. Unset leaves whatever the device (or the last
    /// persisted setting) has.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub manual_add_contacts: Option<bool>,
}

fn default_baud_rate() -> u32 {
    115200
}
fn default_tcp_port() -> u16 {
    5000
}
fn default_device_name() -> String {
    "MeshCore".to_string()
}
fn default_true() -> bool {
    true
}
fn default_max_retries() -> u32 {
    5
}
fn default_base_delay_secs() -> u64 {
    5
}
fn default_max_delay_secs() -> u64 {
    60
}
fn default_max_channels() -> u8 {
    8
}

impl DeviceConfig {
    pub fn transport(&self) -> TransportTarget {
        if !self.tcp_host.trim().is_empty() {
            return TransportTarget::Tcp {
                host: self.tcp_host.trim().to_string(),
                port: self.tcp_port,
            };
        }
        let port = self.serial_port.trim();
        TransportTarget::Serial {
            port: if port.is_empty() || port.eq_ignore_ascii_case("auto") {
                None
            } else {
                Some(port.to_string())
            },
            baud_rate: self.baud_rate,
        }
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_retries: self.max_retries.max(1),
            base_delay: Duration::from_secs(self.base_delay_secs),
            max_delay: Duration::from_secs(self.max_delay_secs.max(self.base_delay_secs)),
        }
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs.unwrap_or(30))
    }

    pub fn health_timeout(&self) -> Duration {
        Duration::from_secs(self.health_timeout_secs.unwrap_or(5))
    }

    /// `None` when periodic health checks are disabled.
    pub fn health_interval(&self) -> Option<Duration> {
        match self.health_interval_secs.unwrap_or(60) {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        }
    }

    pub fn close_timeout(&self) -> Duration {
        Duration::from_secs(self.close_timeout_secs.unwrap_or(5))
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_secs.unwrap_or(15))
    }
}

impl Default for DeviceConfig {
    fn default() -> Self {
        Self {
            serial_port: "/dev/ttyUSB0".to_string(),
            baud_rate: default_baud_rate(),
            tcp_host: String::new(),
            tcp_port: default_tcp_port(),
            device_name: default_device_name(),
            auto_reconnect: true,
            max_retries: default_max_retries(),
            base_delay_secs: default_base_delay_secs(),
            max_delay_secs: default_max_delay_secs(),
            command_timeout_secs: Some(30),
            health_timeout_secs: Some(5),
            health_interval_secs: Some(60),
            close_timeout_secs: Some(5),
            connect_timeout_secs: Some(15),
            max_channels: default_max_channels(),
            manual_add_contacts: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    pub data_dir: String,
    /// Defaults to `<data_dir>/meshgate.db`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub db_path: Option<String>,
}

impl StorageConfig {
    pub fn database_path(&self) -> PathBuf {
        match &self.db_path {
            Some(p) if !p.trim().is_empty() => PathBuf::from(p),
            _ => PathBuf::from(&self.data_dir).join("meshgate.db"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    pub level: String,
    pub file: Option<String>,
}

impl Config {
    /// Load configuration from a file
    pub async fn load(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path)
            .await
            .map_err(|e| anyhow!("Failed to read config file {}: {}", path, e))?;

        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow!("Failed to parse config file {}: {}", path, e))?;

        Ok(config)
    }

    /// Create a default configuration file
    pub async fn create_default(path: &str) -> Result<()> {
        let config = Config::default();
        let content = toml::to_string_pretty(&config)
            .map_err(|e| anyhow!("Failed to serialize default config: {}", e))?;

        fs::write(path, content)
            .await
            .map_err(|e| anyhow!("Failed to write config file {}: {}", path, e))?;

        Ok(())
    }

    /// Apply `MC_*` environment variables on top of the loaded file.
    pub fn apply_env_overrides(&mut self) {
        self.apply_overrides_from(|key| std::env::var(key).ok());
    }

    /// Same as [`Config::apply_env_overrides`] with an injectable lookup.
    pub fn apply_overrides_from<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("MC_SERIAL_PORT") {
            self.device.serial_port = v;
        }
        if let Some(v) = lookup("MC_TCP_HOST") {
            self.device.tcp_host = v;
        }
        if let Some(port) = lookup("MC_TCP_PORT").and_then(|v| v.trim().parse().ok()) {
            self.device.tcp_port = port;
        }
        if let Some(baud) = lookup("MC_BAUD_RATE").and_then(|v| v.trim().parse().ok()) {
            self.device.baud_rate = baud;
        }
        if let Some(v) = lookup("MC_DEVICE_NAME") {
            self.device.device_name = v;
        }
        if let Some(v) = lookup("MC_AUTO_RECONNECT") {
            self.device.auto_reconnect =
                matches!(v.trim().to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on");
        }
        if let Some(v) = lookup("MC_CONFIG_DIR") {
            self.storage.data_dir = v;
        }
        if let Some(v) = lookup("MC_DB_PATH") {
            self.storage.db_path = Some(v);
        }
        if let Some(v) = lookup("MC_LOG_LEVEL") {
            self.logging.level = v.to_ascii_lowercase();
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Config {
            device: DeviceConfig::default(),
            storage: StorageConfig {
                data_dir: "./data".to_string(),
                db_path: None,
            },
            logging: LoggingConfig {
                level: "info".to_string(),
                file: Some("meshgate.log".to_string()),
            },
        }
    }
}

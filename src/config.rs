//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables**: `SIMLINK_DEVICE`, `SIMLINK_BAUD`,
//!    `SIMLINK_APN`
//! 2. **Config file**: path via `--config <path>`, or `simlink.toml` in CWD
//! 3. **Compiled defaults**: see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [serial]
//! device = "/dev/ttyUSB2"
//! baud = 115200
//!
//! [timeouts]            # milliseconds
//! command_ms = 1000
//! call_ms = 3000
//! data_ms = 3000
//! http_ms = 10000
//! body_ms = 5000
//! ussd_ms = 10000
//! prompt_ms = 100
//! sms_read_ms = 10000
//!
//! [data]
//! default_apn = "internet"
//!
//! [service]
//! poll_interval_ms = 10
//!
//! [logging]
//! level = "info"
//! ```

use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub serial: SerialConfig,
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    #[serde(default)]
    pub data: DataConfig,
    #[serde(default)]
    pub service: ServiceConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Serial port settings.
#[derive(Debug, Clone, Deserialize)]
pub struct SerialConfig {
    /// Device path (default `/dev/ttyUSB2`). Override with `SIMLINK_DEVICE`.
    #[serde(default = "default_device")]
    pub device: String,
    /// Baud rate (default 115200). Override with `SIMLINK_BAUD`.
    #[serde(default = "default_baud")]
    pub baud: u32,
}

/// Reply windows per command class, in milliseconds.
///
/// Every command blocks for its full window unless cancelled, so these are
/// also the latency of each call.
#[derive(Debug, Clone, Deserialize)]
pub struct TimeoutConfig {
    /// Simple queries and setup commands (default 1000).
    #[serde(default = "default_command_ms")]
    pub command_ms: u64,
    /// `ATD`, `ATA`, `ATH` (default 3000).
    #[serde(default = "default_call_ms")]
    pub call_ms: u64,
    /// `AT+NETOPEN`, `AT+NETCLOSE`, `AT+IPADDR` (default 3000).
    #[serde(default = "default_data_ms")]
    pub data_ms: u64,
    /// `AT+HTTPACTION`, `AT+HTTPREAD` (default 10000).
    #[serde(default = "default_http_ms")]
    pub http_ms: u64,
    /// SMS body submission and HTTP body upload (default 5000).
    #[serde(default = "default_body_ms")]
    pub body_ms: u64,
    /// `AT+CUSD` network reply (default 10000).
    #[serde(default = "default_ussd_ms")]
    pub ussd_ms: u64,
    /// Wait for the `>` / `DOWNLOAD` input prompt (default 100).
    #[serde(default = "default_prompt_ms")]
    pub prompt_ms: u64,
    /// Give up on an unanswered `AT+CMGR` fetch after this long (default 10000).
    #[serde(default = "default_sms_read_ms")]
    pub sms_read_ms: u64,
}

/// Packet data settings.
#[derive(Debug, Clone, Deserialize)]
pub struct DataConfig {
    /// APN used by `start_data` when none was set explicitly. Override with `SIMLINK_APN`.
    #[serde(default = "default_apn")]
    pub default_apn: String,
}

/// Notification service loop settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServiceConfig {
    /// Sleep between service ticks in milliseconds (default 10).
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG` env var.
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_device() -> String {
    "/dev/ttyUSB2".to_string()
}
fn default_baud() -> u32 {
    115_200
}
fn default_command_ms() -> u64 {
    1000
}
fn default_call_ms() -> u64 {
    3000
}
fn default_data_ms() -> u64 {
    3000
}
fn default_http_ms() -> u64 {
    10_000
}
fn default_body_ms() -> u64 {
    5000
}
fn default_ussd_ms() -> u64 {
    10_000
}
fn default_prompt_ms() -> u64 {
    100
}
fn default_sms_read_ms() -> u64 {
    10_000
}
fn default_apn() -> String {
    "internet".to_string()
}
fn default_poll_interval_ms() -> u64 {
    10
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            device: default_device(),
            baud: default_baud(),
        }
    }
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self {
            command_ms: default_command_ms(),
            call_ms: default_call_ms(),
            data_ms: default_data_ms(),
            http_ms: default_http_ms(),
            body_ms: default_body_ms(),
            ussd_ms: default_ussd_ms(),
            prompt_ms: default_prompt_ms(),
            sms_read_ms: default_sms_read_ms(),
        }
    }
}

impl Default for DataConfig {
    fn default() -> Self {
        Self {
            default_apn: default_apn(),
        }
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl ServiceConfig {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, reads that file. Otherwise looks for `simlink.toml`
    /// in the current directory, falling back to compiled defaults.
    pub fn load(path: Option<&str>) -> Result<Self, String> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new("simlink.toml").exists() => Self::from_file("simlink.toml")?,
            None => Self::default(),
        };
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, String> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| format!("Failed to read config file {path}: {e}"))?;
        toml::from_str(&content).map_err(|e| format!("Failed to parse config file {path}: {e}"))
    }

    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) -> Result<(), String> {
        if let Some(device) = var("SIMLINK_DEVICE") {
            self.serial.device = device;
        }
        if let Some(baud) = var("SIMLINK_BAUD") {
            self.serial.baud = baud
                .parse()
                .map_err(|e| format!("SIMLINK_BAUD {baud:?}: {e}"))?;
        }
        if let Some(apn) = var("SIMLINK_APN") {
            self.data.default_apn = apn;
        }
        Ok(())
    }
}

//! # Host configuration
//!
//! Loaded from a single TOML file. Every field has a default, so an empty
//! file (or a missing section) yields a working offline setup.
//!
//! ```toml
//! [host]
//! base_directory = "/opt/gantry/sd"
//! compatibility = "marlin"
//! listing_buffer = 4096
//! terminate_after_firmware_update = false
//!
//! [firmware]
//! serial = "/dev/ttyACM0"
//! baud = 115200
//!
//! [api]
//! bind = "0.0.0.0:8080"
//!
//! [log]
//! level = "debug"
//! ```

// src/config.rs - Single configuration file
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),
    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Output conventions of the firmware flavour the host pretends to be.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Compatibility {
    #[default]
    RepRapFirmware,
    Marlin,
    #[serde(rename = "nanodlp")]
    NanoDlp,
}

#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct Config {
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub firmware: FirmwareConfig,
    #[serde(default)]
    pub api: ApiConfig,
    #[serde(default)]
    pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct HostConfig {
    /// Physical directory backing the `0:` volume.
    #[serde(default = "default_base_directory")]
    pub base_directory: PathBuf,
    /// Name the operating system assigned to this machine. Falls back to the
    /// `HOSTNAME` environment variable.
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub compatibility: Compatibility,
    /// Upper bound for the size of a JSON file listing.
    #[serde(default = "default_listing_buffer")]
    pub listing_buffer: usize,
    /// Last place to look for firmware images.
    #[serde(default = "default_firmware_directory")]
    pub firmware_directory: PathBuf,
    /// Exit after a firmware update instead of waiting for the resync.
    #[serde(default)]
    pub terminate_after_firmware_update: bool,
    /// Extension processes started with the host.
    #[serde(default)]
    pub plugins: Vec<String>,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            base_directory: default_base_directory(),
            hostname: None,
            compatibility: Compatibility::default(),
            listing_buffer: default_listing_buffer(),
            firmware_directory: default_firmware_directory(),
            terminate_after_firmware_update: false,
            plugins: Vec::new(),
        }
    }
}

impl HostConfig {
    pub fn hostname(&self) -> String {
        self.hostname
            .clone()
            .or_else(|| std::env::var("HOSTNAME").ok())
            .unwrap_or_else(|| "gantry".to_string())
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct FirmwareConfig {
    #[serde(default)]
    pub serial: String,
    #[serde(default = "default_baud")]
    pub baud: u32,
    /// How long a single code may wait for its `ok`.
    #[serde(default = "default_reply_timeout_ms")]
    pub reply_timeout_ms: u64,
}

impl Default for FirmwareConfig {
    fn default() -> Self {
        Self {
            serial: String::new(),
            baud: default_baud(),
            reply_timeout_ms: default_reply_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct ApiConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
}

impl Default for ApiConfig {
    fn default() -> Self {
        Self { bind: default_bind() }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct LogConfig {
    #[serde(default = "default_log_level")]
    pub level: String,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self { level: default_log_level() }
    }
}

fn default_base_directory() -> PathBuf {
    PathBuf::from("/opt/gantry/sd")
}
fn default_listing_buffer() -> usize {
    4096
}
fn default_firmware_directory() -> PathBuf {
    PathBuf::from("/opt/gantry/firmware")
}
fn default_baud() -> u32 {
    115_200
}
fn default_reply_timeout_ms() -> u64 {
    4000
}
fn default_bind() -> String {
    "0.0.0.0:8080".to_string()
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Config {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.host.listing_buffer < 64 {
            return Err(ConfigError::Invalid("host.listing_buffer must be at least 64 bytes".to_string()));
        }
        if self.log.level.parse::<tracing::Level>().is_err() {
            return Err(ConfigError::Invalid(format!("Unknown log level '{}'", self.log.level)));
        }
        Ok(())
    }
}

pub fn load_config(path: &str) -> Result<Config, ConfigError> {
    let config: Config = match std::fs::read_to_string(path) {
        Ok(contents) => match toml::from_str(&contents) {
            Ok(config) => config,
            Err(e) => {
                tracing::error!("Failed to parse config TOML: {}", e);
                return Err(ConfigError::Toml(e));
            }
        },
        Err(e) => {
            tracing::error!("Failed to read config file '{}': {}", path, e);
            return Err(ConfigError::Io(e));
        }
    };
    config.validate()?;
    Ok(config)
}

//! # Configuration Management Module
//!
//! Persistent application settings stored in platform-appropriate locations.
//! Handles loading, saving, and providing defaults for configuration options.
//!
//! ## Settings
//! - `enable_autoconnect`: Connect to the strongest matching device once a scan finds one
//! - `link`: Which sensor link the monitor starts (`ble` or `network`)
//! - `device_name_filters`: Case-insensitive name fragments of the sensor family
//! - `service_uuid` / `characteristic_uuid`: GATT location of the telemetry stream
//! - `allow_simulated_data`: Fall back to simulated samples when the stream stays silent
//! - `sensor_endpoint`: Readings URL of the local-network sensor node
//! - `data_dir`: Where the profile and calorie ledger are kept
//!
//! ## Storage Location
//! - macOS: ~/Library/Application Support/vitalink/config.toml
//! - Linux: ~/.config/vitalink/config.toml
//! - Windows: %APPDATA%\vitalink\config.toml

use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use crate::error::ConfigError;
use crate::poller::DEFAULT_ENDPOINT;
use crate::session::{SessionSettings, DEFAULT_CHARACTERISTIC_UUID, DEFAULT_SERVICE_UUID};

const APP_DIR: &str = "vitalink";

/// Sensor link started by the monitor
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkKind {
    Ble,
    Network,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub enable_autoconnect: bool,
    pub link: LinkKind,
    pub device_name_filters: Vec<String>,
    pub service_uuid: String,
    pub characteristic_uuid: String,
    pub allow_simulated_data: bool,
    pub sensor_endpoint: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            enable_autoconnect: false,
            link: LinkKind::Network,
            device_name_filters: vec!["nicla".to_string(), "arduino".to_string()],
            service_uuid: DEFAULT_SERVICE_UUID.to_string(),
            characteristic_uuid: DEFAULT_CHARACTERISTIC_UUID.to_string(),
            allow_simulated_data: true,
            sensor_endpoint: DEFAULT_ENDPOINT.to_string(),
            data_dir: None,
        }
    }
}

impl Config {
    /// Get the path to the config file
    pub fn config_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    /// Load config from the default location, or create default if it doesn't exist
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(&Self::config_path())
    }

    /// Load config from `path`, writing the defaults there when the file is missing
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        match fs::read_to_string(path) {
            Ok(contents) => {
                let config = toml::from_str(&contents)
                    .map_err(ConfigError::ParseFailed)?;
                Ok(config)
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                let config = Self::default();
                config.save_to(path)?;
                Ok(config)
            }
            Err(e) => Err(ConfigError::ReadFailed(e)),
        }
    }

    /// Save config to `path`
    pub fn save_to(&self, path: &Path) -> Result<(), ConfigError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(ConfigError::WriteFailed)?;
        }

        let toml_string = toml::to_string_pretty(self)
            .map_err(ConfigError::SerializeFailed)?;
        fs::write(path, toml_string)
            .map_err(ConfigError::WriteFailed)?;

        Ok(())
    }

    /// Directory holding the persisted profile and ledger
    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(|| {
            dirs::data_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_DIR)
        })
    }

    /// Settings for the short-range connection session
    pub fn session_settings(&self) -> SessionSettings {
        SessionSettings {
            name_filters: self.device_name_filters.clone(),
            service_uuid: self.service_uuid.clone(),
            characteristic_uuid: self.characteristic_uuid.clone(),
            allow_simulation: self.allow_simulated_data,
            ..SessionSettings::default()
        }
    }
}

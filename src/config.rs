// Copyright 2026 Daniel Pelikan
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//     http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Configuration module.
//!
//! Handles loading and saving application settings.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use uuid::Uuid;

use crate::bluetooth::ble_constants::{policy, DATA_CHARACTERISTIC_UUID, SERVICE_UUID};
use crate::bluetooth::SessionConfig;

/// Directory name under the platform config dir.
const APP_DIR: &str = "simple-ble-central";

/// Application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Central session settings.
    pub central: CentralConfig,

    /// Logging settings.
    pub logging: LoggingConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CentralConfig {
    /// Adapter name (e.g. "hci0"). Uses the default adapter when unset.
    pub adapter: Option<String>,

    /// Power the adapter on at startup if it is off.
    pub power_on: bool,

    /// Service the peripheral must advertise.
    pub service_uuid: Uuid,

    /// Characteristic to read, write and subscribe to.
    pub characteristic_uuid: Uuid,

    pub connect_timeout_ms: u64,

    pub read_timeout_ms: u64,

    /// Service/characteristic discovery timeout. Zero waits forever.
    pub discovery_timeout_ms: u64,

    /// Buffered link events per connection.
    pub connection_buffer: usize,

    /// Buffered notification payloads.
    pub notification_buffer: usize,

    /// Delay between failed reconnect attempts.
    pub reconnect_delay_ms: u64,

    /// Buffered observer events.
    pub event_buffer: usize,
}

impl Default for CentralConfig {
    fn default() -> Self {
        Self {
            adapter: None,
            power_on: true,
            service_uuid: SERVICE_UUID,
            characteristic_uuid: DATA_CHARACTERISTIC_UUID,
            connect_timeout_ms: policy::CONNECT_TIMEOUT_MS,
            read_timeout_ms: policy::READ_TIMEOUT_MS,
            discovery_timeout_ms: policy::DISCOVERY_TIMEOUT_MS,
            connection_buffer: policy::CONNECTION_BUFFER,
            notification_buffer: policy::NOTIFICATION_BUFFER,
            reconnect_delay_ms: policy::RECONNECT_DELAY_MS,
            event_buffer: policy::EVENT_BUFFER,
        }
    }
}

impl CentralConfig {
    /// Session policy derived from these settings.
    pub fn session_config(&self) -> SessionConfig {
        SessionConfig {
            service_uuid: self.service_uuid,
            characteristic_uuid: self.characteristic_uuid,
            connect_timeout: Duration::from_millis(self.connect_timeout_ms),
            read_timeout: Duration::from_millis(self.read_timeout_ms),
            discovery_timeout: (self.discovery_timeout_ms > 0)
                .then(|| Duration::from_millis(self.discovery_timeout_ms)),
            connection_buffer: self.connection_buffer,
            notification_buffer: self.notification_buffer,
            reconnect_delay: Duration::from_millis(self.reconnect_delay_ms),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Default level for this crate when `RUST_LOG` is unset.
    pub level: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

impl Config {
    /// Path of the user configuration file.
    pub fn default_path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(APP_DIR)
            .join("config.toml")
    }

    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::default_path())
    }

    /// Load configuration from `path`, writing defaults there if it is missing.
    pub fn load_from(path: &Path) -> Result<Self> {
        let config = if path.exists() {
            let content = std::fs::read_to_string(path)?;
            toml::from_str(&content)?
        } else {
            let config = Self::default();
            config.save_to(path)?;
            config
        };

        config.validate()?;
        Ok(config)
    }

    /// Save configuration to `path`.
    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    fn validate(&self) -> Result<()> {
        let central = &self.central;
        if central.connection_buffer == 0
            || central.notification_buffer == 0
            || central.event_buffer == 0
        {
            bail!("buffer capacities must be greater than zero");
        }
        if central.connect_timeout_ms == 0 || central.read_timeout_ms == 0 {
            bail!("timeouts must be greater than zero");
        }
        Ok(())
    }
}

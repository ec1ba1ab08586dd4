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

use crate::bluetooth::ble_constants::{timing, LED_UUID, MAIN_BUTTON_UUID, THIRD_BUTTON_UUID};
use crate::bluetooth::{GattProfile, ManagerOptions, DEFAULT_EVENT_CAPACITY};

/// Application configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Bluetooth adapter settings.
    pub bluetooth: BluetoothConfig,

    /// Scan settings.
    pub scan: ScanConfig,

    /// Characteristic UUIDs of the device.
    pub gatt: GattConfig,

    /// Event delivery settings.
    pub events: EventsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BluetoothConfig {
    /// BlueZ adapter name (e.g. "hci0"); the default adapter when unset.
    pub adapter: Option<String>,

    /// Bound on every radio request in milliseconds.
    pub operation_timeout_ms: u64,
}

impl Default for BluetoothConfig {
    fn default() -> Self {
        Self {
            adapter: None,
            operation_timeout_ms: timing::DEFAULT_OPERATION_TIMEOUT_MS,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScanConfig {
    /// Scan window in seconds.
    pub duration_secs: u64,

    /// Only list peripherals that advertise a name.
    pub named_only: bool,

    /// Start scanning right after launch.
    pub auto_start: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        Self {
            duration_secs: timing::DEFAULT_SCAN_SECS,
            named_only: true,
            auto_start: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GattConfig {
    pub led: Uuid,
    pub main_button: Uuid,
    pub third_button: Uuid,
}

impl Default for GattConfig {
    fn default() -> Self {
        Self {
            led: LED_UUID,
            main_button: MAIN_BUTTON_UUID,
            third_button: THIRD_BUTTON_UUID,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EventsConfig {
    /// Events buffered for a slow subscriber before new ones are dropped.
    pub capacity: usize,
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl Config {
    /// Default location of the config file.
    pub fn path() -> PathBuf {
        dirs::config_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("smartdevice")
            .join("config.toml")
    }

    /// Load configuration from file or create default.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::path())
    }

    /// Load from `path`, writing the defaults there if it does not exist.
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

    /// Save configuration to the default location.
    #[allow(dead_code)]
    pub fn save(&self) -> Result<()> {
        self.save_to(&Self::path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(dir) = path.parent() {
            std::fs::create_dir_all(dir)?;
        }
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Reject settings the device manager cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.scan.duration_secs == 0 {
            bail!("scan.duration_secs must be greater than zero");
        }
        if self.bluetooth.operation_timeout_ms == 0 {
            bail!("bluetooth.operation_timeout_ms must be greater than zero");
        }
        if self.events.capacity == 0 {
            bail!("events.capacity must be greater than zero");
        }
        Ok(())
    }

    pub fn scan_duration(&self) -> Duration {
        Duration::from_secs(self.scan.duration_secs)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_millis(self.bluetooth.operation_timeout_ms)
    }

    pub fn profile(&self) -> GattProfile {
        GattProfile {
            led: self.gatt.led,
            main_button: self.gatt.main_button,
            third_button: self.gatt.third_button,
        }
    }

    /// Settings for the Bluetooth manager.
    pub fn manager_options(&self) -> ManagerOptions {
        ManagerOptions {
            scan_duration: self.scan_duration(),
            operation_timeout: self.operation_timeout(),
            named_only: self.scan.named_only,
            event_capacity: self.events.capacity,
            profile: self.profile(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_load_creates_default() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("smartdevice").join("config.toml");

        let config = Config::load_from(&path).unwrap();
        assert_eq!(config, Config::default());
        assert!(path.exists());
        assert_eq!(config.scan.duration_secs, 50);
        assert!(config.scan.named_only);
    }

    #[test]
    fn test_save_and_reload() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");

        let mut config = Config::default();
        config.bluetooth.adapter = Some("hci1".to_string());
        config.scan.duration_secs = 10;
        config.save_to(&path).unwrap();

        let loaded = Config::load_from(&path).unwrap();
        assert_eq!(loaded.bluetooth.adapter.as_deref(), Some("hci1"));
        assert_eq!(loaded.scan_duration(), Duration::from_secs(10));
    }

    #[test]
    fn test_partial_file_uses_defaults() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[scan]\nauto_start = true\n").unwrap();

        let config = Config::load_from(&path).unwrap();
        assert!(config.scan.auto_start);
        assert_eq!(config.scan.duration_secs, 50);
        assert_eq!(config.gatt.led, LED_UUID);
    }

    #[test]
    fn test_zero_duration_rejected() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("config.toml");
        std::fs::write(&path, "[scan]\nduration_secs = 0\n").unwrap();

        assert!(Config::load_from(&path).is_err());
    }

    #[test]
    fn test_manager_options() {
        let mut config = Config::default();
        config.bluetooth.operation_timeout_ms = 250;
        let options = config.manager_options();
        assert_eq!(options.operation_timeout, Duration::from_millis(250));
        assert_eq!(options.profile, GattProfile::default());
        assert!(options.named_only);
    }
}

use std::collections::HashSet;
use std::path::Path;
use std::time::Duration;

use mac_address::MacAddress;
use serde_derive::Deserialize;

use crate::error::ConfigError;
use crate::tracker::{DeviceClass, HysteresisPolicy};

/// MQTT wildcards and the level separator.
const TOPIC_RESERVED: [char; 3] = ['+', '#', '/'];

#[derive(Deserialize, Debug, Clone)]
pub struct AppConfig {
    pub mqtt: MqttConfig,
    pub devices: Option<Vec<BleDevice>>,
    pub scan: Option<ScanConfig>,
}

#[derive(Deserialize, Debug, Clone)]
pub struct MqttConfig {
    pub host: String,
    pub port: Option<u16>,
    pub username: Option<String>,
    pub password: Option<String>,
    pub publisher_id: Option<String>,
    pub topic_path: Option<String>,
    pub discovery_prefix: Option<String>,
    pub keep_alive_seconds: Option<u64>,
}

impl MqttConfig {
    pub fn topic_path(&self) -> &str {
        self.topic_path.as_deref().unwrap_or("bt-mqtt-gateway")
    }

    pub fn discovery_prefix(&self) -> &str {
        self.discovery_prefix.as_deref().unwrap_or("homeassistant")
    }
}

#[derive(Deserialize, Debug, Clone)]
pub enum Manufacturer {
    Apple,
    Google,
    Xiaomi,
}

impl Manufacturer {
    pub fn display_name(&self) -> &'static str {
        match self {
            Manufacturer::Apple => "Apple Inc.",
            Manufacturer::Google => "Google",
            Manufacturer::Xiaomi => "Xiaomi",
        }
    }
}

#[derive(Deserialize, Debug, Clone)]
pub struct BleDevice {
    pub address: MacAddress,
    pub name: String,
    pub class: Option<DeviceClass>,
    pub policy: Option<HysteresisPolicy>,
    pub manufacturer: Option<Manufacturer>,
}

/// Static identity of one configured device: its unique name and its radio
/// address, lowercased.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceConfig {
    pub name: String,
    pub address: String,
    pub class: DeviceClass,
    pub policy: HysteresisPolicy,
    pub manufacturer: Option<String>,
}

impl From<&BleDevice> for DeviceConfig {
    fn from(device: &BleDevice) -> Self {
        let class = device.class.unwrap_or_default();
        DeviceConfig {
            name: device.name.trim().to_string(),
            address: device.address.to_string().to_lowercase(),
            class,
            policy: device.policy.unwrap_or_else(|| class.default_policy()),
            manufacturer: device
                .manufacturer
                .as_ref()
                .map(|m| m.display_name().to_string()),
        }
    }
}

#[derive(Deserialize, Debug, Default, Clone)]
pub struct ScanConfig {
    pub interscan_delay_seconds: Option<u64>,
    pub scan_timeout_seconds: Option<u64>,
    pub passive: Option<bool>,
    pub available_timeout_seconds: Option<u64>,
    pub unavailable_timeout_seconds: Option<u64>,
    pub connect_retries: Option<u32>,
}

impl ScanConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interscan_delay_seconds.unwrap_or(60))
    }

    pub fn probe_options(&self) -> ProbeOptions {
        ProbeOptions {
            timeout: Duration::from_secs(self.scan_timeout_seconds.unwrap_or(10)),
            passive: self.passive.unwrap_or(true),
            retries: self.connect_retries.unwrap_or(2),
        }
    }

    pub fn timeouts(&self) -> Timeouts {
        Timeouts {
            available: Duration::from_secs(self.available_timeout_seconds.unwrap_or(0)),
            unavailable: Duration::from_secs(self.unavailable_timeout_seconds.unwrap_or(60)),
        }
    }
}

/// Hysteresis dwell times: how long a transition must hold before it is
/// published.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Timeouts {
    pub available: Duration,
    pub unavailable: Duration,
}

impl Default for Timeouts {
    fn default() -> Self {
        Timeouts {
            available: Duration::ZERO,
            unavailable: Duration::from_secs(60),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeOptions {
    /// Scan window for presence devices, and the ceiling for each
    /// connect-and-read attempt.
    pub timeout: Duration,
    pub passive: bool,
    /// Extra attempts after the first failed one, per device per cycle.
    pub retries: u32,
}

impl Default for ProbeOptions {
    fn default() -> Self {
        ProbeOptions {
            timeout: Duration::from_secs(10),
            passive: true,
            retries: 2,
        }
    }
}

impl AppConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    pub fn parse(contents: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::de::from_str(contents)?;
        config.validate()?;
        Ok(config)
    }

    pub fn scan(&self) -> ScanConfig {
        self.scan.clone().unwrap_or_default()
    }

    /// Devices in configuration order.
    pub fn device_configs(&self) -> Vec<DeviceConfig> {
        self.devices
            .iter()
            .flatten()
            .map(DeviceConfig::from)
            .collect()
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.mqtt.host.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "mqtt.host",
                reason: "must not be empty".to_string(),
            });
        }

        let scan = self.scan();
        if scan.scan_timeout_seconds == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "scan.scan_timeout_seconds",
                reason: "must be greater than zero".to_string(),
            });
        }
        if scan.interscan_delay_seconds == Some(0) {
            return Err(ConfigError::InvalidValue {
                field: "scan.interscan_delay_seconds",
                reason: "must be greater than zero".to_string(),
            });
        }

        let mut names = HashSet::new();
        let mut addresses = HashSet::new();
        for device in self.device_configs() {
            if device.name.is_empty() {
                return Err(ConfigError::EmptyName(device.address));
            }
            // Names are topic levels in the state topics.
            if let Some(c) = device.name.chars().find(|c| TOPIC_RESERVED.contains(c)) {
                return Err(ConfigError::InvalidValue {
                    field: "devices.name",
                    reason: format!("'{}' must not contain '{}'", device.name, c),
                });
            }
            if !names.insert(device.name.clone()) {
                return Err(ConfigError::DuplicateDevice(device.name));
            }
            if !addresses.insert(device.address.clone()) {
                return Err(ConfigError::DuplicateDevice(device.address));
            }
        }

        Ok(())
    }
}

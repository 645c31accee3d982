use std::time::Duration;

use thiserror::Error;
use uuid::Uuid;

/// Fatal problems found while loading the configuration at startup.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("unable to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("unable to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("device name must not be empty (address {0})")]
    EmptyName(String),

    #[error("duplicate device {0}")]
    DuplicateDevice(String),

    #[error("invalid value for {field}: {reason}")]
    InvalidValue { field: &'static str, reason: String },
}

/// Failures of a single probe call. None of these are fatal; the poll cycle
/// turns them into "no sample" for the affected device.
#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("bluetooth transport error: {0}")]
    Transport(String),

    #[error("probe timed out after {0:?}")]
    Timeout(Duration),

    #[error("device {0} not found")]
    NotFound(String),

    #[error("characteristic {characteristic} of service {service} not found")]
    MissingCharacteristic { service: Uuid, characteristic: Uuid },

    #[error("invalid payload: {0}")]
    InvalidPayload(String),
}

impl From<btleplug::Error> for ProbeError {
    fn from(err: btleplug::Error) -> Self {
        match err {
            btleplug::Error::DeviceNotFound => ProbeError::NotFound("peripheral".to_string()),
            btleplug::Error::TimedOut(after) => ProbeError::Timeout(after),
            other => ProbeError::Transport(other.to_string()),
        }
    }
}

impl ProbeError {
    pub fn is_timeout(&self) -> bool {
        matches!(self, ProbeError::Timeout(_))
    }
}

//! Per-device state tracking.
//!
//! A [`DeviceTracker`] is fed one [`Sample`] per poll cycle and decides which
//! outbound messages are owed to the broker. It never publishes anything
//! itself: [`DeviceTracker::take_due`] hands back a [`Due`] set that the
//! message builder turns into concrete messages.
//!
//! Two hysteresis policies are supported, selected per device:
//!
//! - [`HysteresisPolicy::EdgeDebounced`]: a state message is owed once per
//!   availability edge and is sent the first time the dwell timeout has
//!   elapsed since that edge. Flapping back to the last published state
//!   before the timeout cancels the pending message.
//! - [`HysteresisPolicy::ContinuouslyRefreshed`]: every present sample owes a
//!   fresh state message, so measurements are republished each cycle while
//!   the device is available. Absence is measured from the last time the
//!   device was actually seen.
//!
//! Both device classes default to the continuously-refreshed policy: presence
//! devices republish signal strength every cycle and battery devices publish
//! every successful read.

use std::time::{Duration, Instant};

use serde_derive::Deserialize;

use crate::config::{DeviceConfig, Timeouts};
use crate::error::ProbeError;

#[derive(Deserialize, Debug, Default, Clone, Copy, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum DeviceClass {
    /// Tracked by passive advertisement scanning.
    #[default]
    Presence,
    /// Tracked by connecting and reading the battery level characteristic.
    Battery,
}

impl DeviceClass {
    pub fn default_policy(self) -> HysteresisPolicy {
        HysteresisPolicy::ContinuouslyRefreshed
    }

    pub fn topic_segment(self) -> &'static str {
        match self {
            DeviceClass::Presence => "presence",
            DeviceClass::Battery => "battery",
        }
    }

    /// Connect-based devices keep their last reading when a probe fails
    /// instead of being reported absent.
    pub fn is_connect_based(self) -> bool {
        matches!(self, DeviceClass::Battery)
    }
}

#[derive(Deserialize, Debug, Clone, Copy, PartialEq, Eq)]
pub enum HysteresisPolicy {
    #[serde(rename = "edge")]
    EdgeDebounced,
    #[serde(rename = "continuous")]
    ContinuouslyRefreshed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Measurement {
    /// Received signal strength in dBm.
    Rssi(i16),
    /// Battery level in percent.
    Battery(u8),
}

/// What a probe observed for one device during one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Sample {
    Present(Measurement),
    /// The probe ran fine but the device was not observed.
    Absent,
    TransportFailure,
    Timeout,
}

impl From<Result<Measurement, ProbeError>> for Sample {
    fn from(result: Result<Measurement, ProbeError>) -> Self {
        match result {
            Ok(measurement) => Sample::Present(measurement),
            Err(err) if err.is_timeout() => Sample::Timeout,
            Err(_) => Sample::TransportFailure,
        }
    }
}

/// The externally visible reading of a tracker. `Unavailable` is distinct
/// from any real value, including a zero battery level.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reading {
    Value(Measurement),
    Unavailable,
}

/// Metadata learned from the device itself on its first successful
/// connection.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub model: Option<String>,
    pub manufacturer: Option<String>,
}

/// Messages owed by a tracker in the current cycle.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Due {
    pub config: bool,
    pub state: bool,
}

impl Due {
    pub fn is_empty(&self) -> bool {
        !self.config && !self.state
    }
}

#[derive(Debug, Clone)]
pub struct DeviceTracker {
    device: DeviceConfig,
    timeouts: Timeouts,
    available: bool,
    measurement: Option<Measurement>,
    last_transition: Instant,
    last_seen: Option<Instant>,
    published: Option<bool>,
    pending_state: bool,
    pending_config: bool,
    identity: Option<DeviceIdentity>,
}

impl DeviceTracker {
    pub fn new(device: DeviceConfig, timeouts: Timeouts, now: Instant) -> Self {
        DeviceTracker {
            device,
            timeouts,
            available: false,
            measurement: None,
            last_transition: now,
            last_seen: None,
            published: None,
            pending_state: false,
            pending_config: true,
            identity: None,
        }
    }

    pub fn device(&self) -> &DeviceConfig {
        &self.device
    }

    pub fn name(&self) -> &str {
        &self.device.name
    }

    pub fn address(&self) -> &str {
        &self.device.address
    }

    pub fn class(&self) -> DeviceClass {
        self.device.class
    }

    pub fn policy(&self) -> HysteresisPolicy {
        self.device.policy
    }

    pub fn is_available(&self) -> bool {
        self.available
    }

    /// Last accepted measurement, kept across failed reads.
    pub fn last_measurement(&self) -> Option<Measurement> {
        self.measurement
    }

    pub fn reading(&self) -> Reading {
        match (self.available, self.measurement) {
            (true, Some(measurement)) => Reading::Value(measurement),
            _ => Reading::Unavailable,
        }
    }

    pub fn has_pending_state(&self) -> bool {
        self.pending_state
    }

    pub fn has_pending_config(&self) -> bool {
        self.pending_config
    }

    pub fn identity(&self) -> Option<&DeviceIdentity> {
        self.identity.as_ref()
    }

    /// Identity is fetched once per tracker, on the first successful
    /// connection, whatever that fetch returned.
    pub fn needs_identity(&self) -> bool {
        self.class().is_connect_based() && self.identity.is_none()
    }

    pub fn set_identity(&mut self, identity: DeviceIdentity) {
        self.identity = Some(identity);
    }

    pub fn update(&mut self, sample: Sample, now: Instant) {
        match sample {
            Sample::Present(measurement) => self.on_present(measurement, now),
            _ if self.class().is_connect_based() => self.on_read_failed(now),
            _ => self.on_absent(now),
        }
    }

    fn on_present(&mut self, measurement: Measurement, now: Instant) {
        let rising = !self.available;
        self.available = true;
        self.measurement = Some(measurement);
        self.last_seen = Some(now);
        if rising {
            self.last_transition = now;
        }

        match self.policy() {
            HysteresisPolicy::EdgeDebounced => {
                if rising {
                    self.pending_state = self.published != Some(true);
                }
            }
            HysteresisPolicy::ContinuouslyRefreshed => self.pending_state = true,
        }
    }

    fn on_absent(&mut self, now: Instant) {
        if self.available {
            self.available = false;
            self.last_transition = now;
            self.pending_state = self.published != Some(false);
        }
    }

    // The last measurement survives; nothing stale is republished. No
    // offline message exists for these devices, so the next good read is
    // always owed.
    fn on_read_failed(&mut self, now: Instant) {
        if self.available {
            self.available = false;
            self.last_transition = now;
        }
        self.pending_state = false;
        self.published = None;
    }

    fn timeout(&self) -> Duration {
        if self.available {
            self.timeouts.available
        } else {
            self.timeouts.unavailable
        }
    }

    /// Whether the dwell time for the current availability has passed.
    ///
    /// Becoming available is measured from the rising edge. Becoming
    /// unavailable is measured from the falling edge for edge-debounced
    /// devices and from the last sighting for continuously-refreshed ones.
    pub fn has_time_elapsed(&self, now: Instant) -> bool {
        let anchor = match (self.available, self.policy()) {
            (false, HysteresisPolicy::ContinuouslyRefreshed) => {
                self.last_seen.unwrap_or(self.last_transition)
            }
            _ => self.last_transition,
        };
        now.saturating_duration_since(anchor) >= self.timeout()
    }

    /// Returns the messages owed this cycle and marks them as sent.
    ///
    /// Discovery config is never owed before the device has been seen
    /// available, and once taken it is never owed again by this tracker.
    pub fn take_due(&mut self, now: Instant) -> Due {
        let config = self.available && self.pending_config;
        if config {
            self.pending_config = false;
        }

        let state = self.pending_state && self.has_time_elapsed(now);
        if state {
            self.pending_state = false;
            self.published = Some(self.available);
        }

        Due { config, state }
    }
}

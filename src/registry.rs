use std::time::Instant;

use log::info;

use crate::config::{DeviceConfig, Timeouts};
use crate::tracker::DeviceTracker;

/// The static set of configured devices, in configuration order.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    devices: Vec<DeviceConfig>,
    timeouts: Timeouts,
}

impl DeviceRegistry {
    pub fn new(devices: Vec<DeviceConfig>, timeouts: Timeouts) -> Self {
        DeviceRegistry { devices, timeouts }
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    /// Fresh trackers for every device: unavailable, no measurement and a
    /// discovery message still owed.
    pub fn trackers(&self, now: Instant) -> Vec<DeviceTracker> {
        self.devices
            .iter()
            .map(|device| {
                info!(
                    "Adding {:?} device '{}' ({}) with {:?} policy",
                    device.class, device.name, device.address, device.policy
                );
                DeviceTracker::new(device.clone(), self.timeouts, now)
            })
            .collect()
    }
}

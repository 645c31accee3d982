//! Radio collaborators.
//!
//! [`Probe`] is the seam between the poll cycle and the Bluetooth stack:
//! scan-based devices are observed through [`Probe::scan`], connect-based
//! devices through [`Probe::connect`] and a [`Connection`]. [`BtleScanner`]
//! implements both on top of btleplug.

use std::collections::HashSet;
use std::time::Duration;

use async_trait::async_trait;
use btleplug::api::{Central as _, CentralEvent, Manager as _, Peripheral as _, ScanFilter};
use btleplug::platform::{Adapter, Manager, Peripheral};
use futures::StreamExt as _;
use log::{debug, info};
use uuid::Uuid;

use crate::error::ProbeError;

pub const BATTERY_SERVICE: Uuid = Uuid::from_u128(0x0000180f_0000_1000_8000_00805f9b34fb);
pub const BATTERY_LEVEL: Uuid = Uuid::from_u128(0x00002a19_0000_1000_8000_00805f9b34fb);
pub const DEVICE_INFORMATION_SERVICE: Uuid =
    Uuid::from_u128(0x0000180a_0000_1000_8000_00805f9b34fb);
pub const MODEL_NUMBER: Uuid = Uuid::from_u128(0x00002a24_0000_1000_8000_00805f9b34fb);
pub const MANUFACTURER_NAME: Uuid = Uuid::from_u128(0x00002a29_0000_1000_8000_00805f9b34fb);

/// Time spent scanning for a connect-based device the adapter has not seen yet.
const LOOKUP_SCAN: Duration = Duration::from_secs(3);

/// One device heard during a scan.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Advertisement {
    /// Lowercased radio address.
    pub address: String,
    pub rssi: i16,
}

#[async_trait]
pub trait Probe: Send + Sync {
    /// Scans for `duration` and returns every device heard in that window.
    async fn scan(&self, duration: Duration, passive: bool)
    -> Result<Vec<Advertisement>, ProbeError>;

    async fn connect(&self, address: &str) -> Result<Box<dyn Connection>, ProbeError>;
}

#[async_trait]
pub trait Connection: Send {
    async fn read(&mut self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>, ProbeError>;

    async fn disconnect(&mut self) -> Result<(), ProbeError>;
}

pub fn decode_battery(bytes: &[u8]) -> Result<u8, ProbeError> {
    match bytes.first() {
        Some(level) if *level <= 100 => Ok(*level),
        Some(level) => Err(ProbeError::InvalidPayload(format!(
            "battery level {} out of range",
            level
        ))),
        None => Err(ProbeError::InvalidPayload(
            "empty battery level".to_string(),
        )),
    }
}

pub fn decode_text(bytes: &[u8]) -> Option<String> {
    let text = String::from_utf8_lossy(bytes);
    let text = text.trim_matches(char::from(0)).trim();
    (!text.is_empty()).then(|| text.to_string())
}

pub struct BtleScanner {
    adapter: Adapter,
}

impl BtleScanner {
    pub fn new(adapter: Adapter) -> Self {
        BtleScanner { adapter }
    }

    /// Uses the first Bluetooth adapter on the system.
    pub async fn first_adapter() -> Result<Self, ProbeError> {
        let manager = Manager::new().await?;
        let adapter = manager
            .adapters()
            .await?
            .into_iter()
            .next()
            .ok_or_else(|| ProbeError::NotFound("bluetooth adapter".to_string()))?;
        info!("Using bluetooth adapter {}", adapter.adapter_info().await?);
        Ok(BtleScanner::new(adapter))
    }

    async fn find_peripheral(&self, address: &str) -> Result<Option<Peripheral>, ProbeError> {
        for peripheral in self.adapter.peripherals().await? {
            if peripheral.address().to_string().eq_ignore_ascii_case(address) {
                return Ok(Some(peripheral));
            }
        }
        Ok(None)
    }
}

#[async_trait]
impl Probe for BtleScanner {
    async fn scan(
        &self,
        duration: Duration,
        passive: bool,
    ) -> Result<Vec<Advertisement>, ProbeError> {
        if !passive {
            debug!("Active scanning requested; using the adapter's default scan mode");
        }

        let mut events = self.adapter.events().await?;
        let scan = ScanGuard::start(&self.adapter).await?;

        let mut seen = HashSet::new();
        let window = tokio::time::sleep(duration);
        tokio::pin!(window);
        loop {
            tokio::select! {
                _ = &mut window => break,
                event = events.next() => match event {
                    Some(CentralEvent::DeviceDiscovered(id))
                    | Some(CentralEvent::DeviceUpdated(id))
                    | Some(CentralEvent::ManufacturerDataAdvertisement { id, .. })
                    | Some(CentralEvent::ServiceDataAdvertisement { id, .. }) => {
                        seen.insert(id);
                    }
                    Some(_) => {}
                    None => {
                        debug!("Bluetooth event stream closed during scan");
                        break;
                    }
                },
            }
        }

        // BlueZ keeps an RSSI only while discovery is running and reports
        // unchanged devices without raising an event, so the known
        // peripherals are read before the scan stops.
        let mut advertisements = Vec::with_capacity(seen.len());
        for peripheral in self.adapter.peripherals().await? {
            if !cfg!(target_os = "linux") && !seen.contains(&peripheral.id()) {
                continue;
            }
            seen.remove(&peripheral.id());
            if let Some(advertisement) = advertisement(&peripheral).await? {
                advertisements.push(advertisement);
            }
        }
        for id in seen {
            let peripheral = self.adapter.peripheral(&id).await?;
            if let Some(advertisement) = advertisement(&peripheral).await? {
                advertisements.push(advertisement);
            }
        }
        scan.stop().await?;
        Ok(advertisements)
    }

    async fn connect(&self, address: &str) -> Result<Box<dyn Connection>, ProbeError> {
        let peripheral = match self.find_peripheral(address).await? {
            Some(peripheral) => peripheral,
            None => {
                debug!("Device {} not known yet, scanning for it", address);
                let scan = ScanGuard::start(&self.adapter).await?;
                tokio::time::sleep(LOOKUP_SCAN).await;
                scan.stop().await?;
                self.find_peripheral(address)
                    .await?
                    .ok_or_else(|| ProbeError::NotFound(address.to_string()))?
            }
        };

        if !peripheral.is_connected().await? {
            peripheral.connect().await?;
        }
        peripheral.discover_services().await?;
        Ok(Box::new(BtleConnection { peripheral }))
    }
}

async fn advertisement(peripheral: &Peripheral) -> Result<Option<Advertisement>, ProbeError> {
    let rssi = peripheral.properties().await?.and_then(|p| p.rssi);
    Ok(rssi.map(|rssi| {
        let address = peripheral.address().to_string().to_lowercase();
        debug!("Discovered device {} rssi: {}", address, rssi);
        Advertisement { address, rssi }
    }))
}

/// A running scan. Stops the scan when dropped, so a caller that gives up
/// on a scan never leaves the adapter scanning.
struct ScanGuard {
    adapter: Option<Adapter>,
}

impl ScanGuard {
    async fn start(adapter: &Adapter) -> Result<Self, ProbeError> {
        adapter.start_scan(ScanFilter::default()).await?;
        Ok(ScanGuard {
            adapter: Some(adapter.clone()),
        })
    }

    async fn stop(mut self) -> Result<(), ProbeError> {
        match self.adapter.take() {
            Some(adapter) => Ok(adapter.stop_scan().await?),
            None => Ok(()),
        }
    }
}

impl Drop for ScanGuard {
    fn drop(&mut self) {
        let Some(adapter) = self.adapter.take() else {
            return;
        };
        if let Ok(handle) = tokio::runtime::Handle::try_current() {
            debug!("Scan abandoned, stopping it");
            handle.spawn(async move {
                if let Err(err) = adapter.stop_scan().await {
                    debug!("Error stopping abandoned scan: {:?}", err);
                }
            });
        }
    }
}

struct BtleConnection {
    peripheral: Peripheral,
}

#[async_trait]
impl Connection for BtleConnection {
    async fn read(&mut self, service: Uuid, characteristic: Uuid) -> Result<Vec<u8>, ProbeError> {
        let target = self
            .peripheral
            .characteristics()
            .into_iter()
            .find(|c| c.service_uuid == service && c.uuid == characteristic)
            .ok_or(ProbeError::MissingCharacteristic {
                service,
                characteristic,
            })?;
        Ok(self.peripheral.read(&target).await?)
    }

    async fn disconnect(&mut self) -> Result<(), ProbeError> {
        Ok(self.peripheral.disconnect().await?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_decode_battery() {
        assert_eq!(decode_battery(&[73]).unwrap(), 73);
        assert_eq!(decode_battery(&[0, 1]).unwrap(), 0);
        assert!(matches!(
            decode_battery(&[]),
            Err(ProbeError::InvalidPayload(_))
        ));
        assert!(matches!(
            decode_battery(&[0xff]),
            Err(ProbeError::InvalidPayload(_))
        ));
    }

    #[test]
    fn test_decode_text() {
        assert_eq!(decode_text(b"Mi Band 4\0"), Some("Mi Band 4".to_string()));
        assert_eq!(decode_text(b"\0\0"), None);
        assert_eq!(decode_text(b""), None);
    }

    #[test]
    fn test_assigned_numbers() {
        assert_eq!(
            BATTERY_LEVEL.to_string(),
            "00002a19-0000-1000-8000-00805f9b34fb"
        );
        assert_eq!(
            DEVICE_INFORMATION_SERVICE.to_string(),
            "0000180a-0000-1000-8000-00805f9b34fb"
        );
    }
}

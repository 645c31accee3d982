use std::collections::HashMap;
use std::future::Future;
use std::time::{Duration, Instant};

use log::{debug, info, warn};

use crate::config::ProbeOptions;
use crate::error::ProbeError;
use crate::messages::{Message, MessageBuilder};
use crate::scanner::{
    Advertisement, BATTERY_LEVEL, BATTERY_SERVICE, Connection, DEVICE_INFORMATION_SERVICE,
    MANUFACTURER_NAME, MODEL_NUMBER, Probe, decode_battery, decode_text,
};
use crate::tracker::{DeviceClass, DeviceIdentity, DeviceTracker, Measurement, Sample};

/// Slack on top of the scan window before a scan counts as hung.
const SCAN_GRACE: Duration = Duration::from_secs(5);

/// One round over every tracked device.
///
/// Owns the trackers exclusively; `run` takes `&mut self`, so two cycles can
/// never overlap.
pub struct PollCycle<P> {
    probe: P,
    trackers: Vec<DeviceTracker>,
    builder: MessageBuilder,
    options: ProbeOptions,
}

impl<P: Probe> PollCycle<P> {
    pub fn new(
        probe: P,
        trackers: Vec<DeviceTracker>,
        builder: MessageBuilder,
        options: ProbeOptions,
    ) -> Self {
        PollCycle {
            probe,
            trackers,
            builder,
            options,
        }
    }

    pub fn trackers(&self) -> &[DeviceTracker] {
        &self.trackers
    }

    /// Probes every device once and returns the messages owed, in
    /// configuration order. A failing device is logged and skipped; it never
    /// stops the others.
    pub async fn run(&mut self, now: Instant) -> Vec<Message> {
        info!("Updating {} devices", self.trackers.len());

        let scan = if self
            .trackers
            .iter()
            .any(|t| t.class() == DeviceClass::Presence)
        {
            Some(self.scan().await)
        } else {
            None
        };

        let mut messages = Vec::new();
        for tracker in self.trackers.iter_mut() {
            let sample = match tracker.class() {
                DeviceClass::Presence => match &scan {
                    Some(Ok(seen)) => seen
                        .get(tracker.address())
                        .map(|rssi| Sample::Present(Measurement::Rssi(*rssi)))
                        .unwrap_or(Sample::Absent),
                    Some(Err(err)) => {
                        warn!(
                            "Error getting state of device '{}' ({}): {}",
                            tracker.name(),
                            tracker.address(),
                            err
                        );
                        if err.is_timeout() {
                            Sample::Timeout
                        } else {
                            Sample::TransportFailure
                        }
                    }
                    None => Sample::Absent,
                },
                DeviceClass::Battery => read_battery(&self.probe, self.options, tracker).await,
            };

            tracker.update(sample, now);
            let due = tracker.take_due(now);
            debug!(
                "Device '{}' reads {:?}, state message pending: {}",
                tracker.name(),
                tracker.reading(),
                tracker.has_pending_state()
            );
            if due.is_empty() {
                continue;
            }
            messages.extend(self.builder.build(tracker, due));
        }
        messages
    }

    async fn scan(&self) -> Result<HashMap<String, i16>, ProbeError> {
        let ProbeOptions {
            timeout,
            passive,
            retries,
        } = self.options;
        let advertisements = with_retries("scan", retries, timeout + SCAN_GRACE, || {
            self.probe.scan(timeout, passive)
        })
        .await?;
        Ok(advertisements
            .into_iter()
            .map(|Advertisement { address, rssi }| (address.to_lowercase(), rssi))
            .collect())
    }
}

async fn read_battery<P: Probe>(
    probe: &P,
    options: ProbeOptions,
    tracker: &mut DeviceTracker,
) -> Sample {
    let address = tracker.address().to_string();
    let fetch_identity = tracker.needs_identity();
    debug!("Updating device '{}' ({})", tracker.name(), address);

    let result = with_retries(&address, options.retries, options.timeout, || {
        connect_and_read(probe, &address, fetch_identity)
    })
    .await;

    match result {
        Ok((level, identity)) => {
            if let Some(identity) = identity {
                debug!("Device '{}' identifies as {:?}", tracker.name(), identity);
                tracker.set_identity(identity);
            }
            Sample::Present(Measurement::Battery(level))
        }
        Err(err) => {
            warn!(
                "Error getting state of device '{}' ({}): {}",
                tracker.name(),
                address,
                err
            );
            Sample::from(Err(err))
        }
    }
}

async fn connect_and_read<P: Probe>(
    probe: &P,
    address: &str,
    fetch_identity: bool,
) -> Result<(u8, Option<DeviceIdentity>), ProbeError> {
    let mut guard = ConnectionGuard::new(probe.connect(address).await?, address);
    let result = read_connected(guard.connection()?, fetch_identity).await;
    guard.close().await;
    result
}

/// Holds an open connection and disconnects it however the attempt ends.
///
/// A timeout drops the attempt mid-read; the disconnect then moves onto a
/// spawned task.
struct ConnectionGuard {
    connection: Option<Box<dyn Connection>>,
    address: String,
}

impl ConnectionGuard {
    fn new(connection: Box<dyn Connection>, address: &str) -> Self {
        ConnectionGuard {
            connection: Some(connection),
            address: address.to_string(),
        }
    }

    fn connection(&mut self) -> Result<&mut (dyn Connection + 'static), ProbeError> {
        let address = &self.address;
        self.connection
            .as_deref_mut()
            .ok_or_else(|| ProbeError::Transport(format!("{} already disconnected", address)))
    }

    async fn close(mut self) {
        if let Some(connection) = self.connection.take() {
            disconnect(connection, &self.address).await;
        }
    }
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        let Some(connection) = self.connection.take() else {
            return;
        };
        let address = std::mem::take(&mut self.address);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                debug!("Attempt for {} abandoned, disconnecting", address);
                handle.spawn(async move { disconnect(connection, &address).await });
            }
            Err(_) => warn!("No runtime left to disconnect from {}", address),
        }
    }
}

async fn disconnect(mut connection: Box<dyn Connection>, address: &str) {
    if let Err(err) = connection.disconnect().await {
        debug!("Error disconnecting from {}: {}", address, err);
    }
}

async fn read_connected(
    connection: &mut dyn Connection,
    fetch_identity: bool,
) -> Result<(u8, Option<DeviceIdentity>), ProbeError> {
    let level = decode_battery(&connection.read(BATTERY_SERVICE, BATTERY_LEVEL).await?)?;
    if !fetch_identity {
        return Ok((level, None));
    }

    // Identity is optional metadata; a device without the service is fine.
    let model = connection
        .read(DEVICE_INFORMATION_SERVICE, MODEL_NUMBER)
        .await
        .ok()
        .and_then(|bytes| decode_text(&bytes));
    let manufacturer = connection
        .read(DEVICE_INFORMATION_SERVICE, MANUFACTURER_NAME)
        .await
        .ok()
        .and_then(|bytes| decode_text(&bytes));
    Ok((
        level,
        Some(DeviceIdentity {
            model,
            manufacturer,
        }),
    ))
}

/// Runs `op` up to `retries + 1` times, each attempt bounded by `timeout`.
/// A timed out attempt is dropped, so whatever it holds must release itself
/// on drop.
async fn with_retries<T, F, Fut>(
    what: &str,
    retries: u32,
    timeout: Duration,
    mut op: F,
) -> Result<T, ProbeError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, ProbeError>>,
{
    let mut last_error = ProbeError::Timeout(timeout);
    for attempt in 1..=retries.saturating_add(1) {
        match tokio::time::timeout(timeout, op()).await {
            Ok(Ok(value)) => return Ok(value),
            Ok(Err(err)) => {
                debug!("Attempt {} for {} failed: {}", attempt, what, err);
                last_error = err;
            }
            Err(_) => {
                debug!("Attempt {} for {} timed out", attempt, what);
                last_error = ProbeError::Timeout(timeout);
            }
        }
    }
    Err(last_error)
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;
    use std::sync::{Arc, Mutex};
    use std::sync::atomic::{AtomicUsize, Ordering};

    use async_trait::async_trait;
    use uuid::Uuid;

    use super::*;
    use crate::config::{DeviceConfig, Timeouts};
    use crate::messages::{MessageClass, ONLINE};
    use crate::tracker::HysteresisPolicy;

    const DESK: &str = "aa:bb:cc:dd:ee:ff";
    const BAND: &str = "11:22:33:44:55:66";

    #[derive(Default)]
    struct MockProbe {
        scans: Mutex<VecDeque<Result<Vec<Advertisement>, ProbeError>>>,
        reads: Mutex<VecDeque<Result<u8, ProbeError>>>,
        hang: bool,
        hang_read: bool,
        scan_calls: AtomicUsize,
        connect_calls: AtomicUsize,
        disconnect_calls: Arc<AtomicUsize>,
    }

    impl MockProbe {
        fn push_scan(&self, seen: &[(&str, i16)]) {
            let advertisements = seen
                .iter()
                .map(|(address, rssi)| Advertisement {
                    address: address.to_string(),
                    rssi: *rssi,
                })
                .collect();
            self.scans.lock().unwrap().push_back(Ok(advertisements));
        }

        fn push_read(&self, result: Result<u8, ProbeError>) {
            self.reads.lock().unwrap().push_back(result);
        }
    }

    #[async_trait]
    impl Probe for MockProbe {
        async fn scan(
            &self,
            _duration: Duration,
            _passive: bool,
        ) -> Result<Vec<Advertisement>, ProbeError> {
            self.scan_calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                futures::future::pending::<()>().await;
            }
            self.scans.lock().unwrap().pop_front().unwrap_or(Ok(Vec::new()))
        }

        async fn connect(&self, address: &str) -> Result<Box<dyn Connection>, ProbeError> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            if self.hang {
                futures::future::pending::<()>().await;
            }
            let next = self
                .reads
                .lock()
                .unwrap()
                .pop_front()
                .unwrap_or_else(|| Err(ProbeError::NotFound(address.to_string())));
            Ok(Box::new(MockConnection {
                level: next?,
                hang_read: self.hang_read,
                disconnect_calls: self.disconnect_calls.clone(),
            }))
        }
    }

    struct MockConnection {
        level: u8,
        hang_read: bool,
        disconnect_calls: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl Connection for MockConnection {
        async fn read(
            &mut self,
            service: Uuid,
            characteristic: Uuid,
        ) -> Result<Vec<u8>, ProbeError> {
            if self.hang_read {
                futures::future::pending::<()>().await;
            }
            match (service, characteristic) {
                (BATTERY_SERVICE, BATTERY_LEVEL) => Ok(vec![self.level]),
                (DEVICE_INFORMATION_SERVICE, MODEL_NUMBER) => Ok(b"Band 4\0".to_vec()),
                _ => Err(ProbeError::MissingCharacteristic {
                    service,
                    characteristic,
                }),
            }
        }

        async fn disconnect(&mut self) -> Result<(), ProbeError> {
            self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
    }

    fn device(
        name: &str,
        address: &str,
        class: DeviceClass,
        policy: HysteresisPolicy,
    ) -> DeviceConfig {
        DeviceConfig {
            name: name.to_string(),
            address: address.to_string(),
            class,
            policy,
            manufacturer: None,
        }
    }

    fn cycle(probe: MockProbe, devices: Vec<DeviceConfig>, start: Instant) -> PollCycle<MockProbe> {
        let trackers = devices
            .into_iter()
            .map(|d| DeviceTracker::new(d, Timeouts::default(), start))
            .collect();
        PollCycle::new(
            probe,
            trackers,
            MessageBuilder::new("gateway"),
            ProbeOptions {
                timeout: Duration::from_secs(10),
                passive: true,
                retries: 2,
            },
        )
    }

    fn topics(messages: &[Message]) -> Vec<String> {
        messages.iter().map(|m| m.topic("homeassistant")).collect()
    }

    fn secs(s: u64) -> Duration {
        Duration::from_secs(s)
    }

    async fn desk_sensor_scenario(policy: HysteresisPolicy) -> Vec<Message> {
        let start = Instant::now();
        let probe = MockProbe::default();
        for _ in 0..3 {
            probe.push_scan(&[]);
        }
        probe.push_scan(&[(DESK, -62)]);
        probe.push_scan(&[(DESK, -62)]);
        let mut cycle = cycle(
            probe,
            vec![device("desk-sensor", DESK, DeviceClass::Presence, policy)],
            start,
        );

        for i in 0..3 {
            assert!(cycle.run(start + secs(60 * i)).await.is_empty());
        }

        let t0 = start + secs(180);
        let messages = cycle.run(t0).await;
        assert_eq!(
            topics(&messages),
            vec![
                "homeassistant/binary_sensor/desk_sensor_online/config",
                "homeassistant/sensor/desk_sensor_rssi/config",
                "gateway/presence/desk-sensor/online",
                "gateway/presence/desk-sensor/rssi",
            ]
        );
        assert_eq!(messages[2].payload(), ONLINE);
        assert_eq!(messages[3].payload(), "-62");

        cycle.run(t0 + secs(30)).await
    }

    #[tokio::test]
    async fn test_desk_sensor_edge_debounced() {
        let messages = desk_sensor_scenario(HysteresisPolicy::EdgeDebounced).await;
        assert!(messages.is_empty());
    }

    #[tokio::test]
    async fn test_desk_sensor_continuously_refreshed() {
        let messages = desk_sensor_scenario(HysteresisPolicy::ContinuouslyRefreshed).await;
        assert_eq!(
            topics(&messages),
            vec![
                "gateway/presence/desk-sensor/online",
                "gateway/presence/desk-sensor/rssi",
            ]
        );
        assert!(messages.iter().all(|m| m.class() == MessageClass::State));
    }

    #[tokio::test]
    async fn test_battery_reads_after_failed_cycles() {
        let start = Instant::now();
        let probe = MockProbe::default();
        // Two whole cycles of failures: first attempt plus two retries each.
        for _ in 0..6 {
            probe.push_read(Err(ProbeError::Transport("connection refused".to_string())));
        }
        probe.push_read(Ok(73));
        let mut cycle = cycle(
            probe,
            vec![device(
                "band",
                BAND,
                DeviceClass::Battery,
                HysteresisPolicy::ContinuouslyRefreshed,
            )],
            start,
        );

        assert!(cycle.run(start).await.is_empty());
        assert!(cycle.trackers()[0].has_pending_config());
        assert!(cycle.run(start + secs(60)).await.is_empty());
        assert!(cycle.trackers()[0].has_pending_config());
        assert_eq!(cycle.probe.connect_calls.load(Ordering::SeqCst), 6);

        let messages = cycle.run(start + secs(120)).await;
        assert_eq!(
            topics(&messages),
            vec![
                "homeassistant/sensor/band_battery/config",
                "gateway/battery/band/battery",
            ]
        );
        assert_eq!(messages[1].payload(), "73");
        assert!(!cycle.trackers()[0].has_pending_config());

        let identity = cycle.trackers()[0].identity().unwrap();
        assert_eq!(identity.model.as_deref(), Some("Band 4"));
        assert_eq!(identity.manufacturer, None);
        let config: serde_json::Value = serde_json::from_str(messages[0].payload()).unwrap();
        assert_eq!(config["dev"]["mdl"], "Band 4");
    }

    #[tokio::test]
    async fn test_retry_recovers_within_cycle() {
        let start = Instant::now();
        let probe = MockProbe::default();
        probe.push_read(Err(ProbeError::Transport("busy".to_string())));
        probe.push_read(Ok(50));
        let mut cycle = cycle(
            probe,
            vec![device(
                "band",
                BAND,
                DeviceClass::Battery,
                HysteresisPolicy::EdgeDebounced,
            )],
            start,
        );

        let messages = cycle.run(start).await;
        assert_eq!(messages.len(), 2);
        assert_eq!(messages[1].payload(), "50");
        assert_eq!(cycle.probe.connect_calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_failed_device_does_not_stop_others() {
        let start = Instant::now();
        let probe = MockProbe::default();
        probe.push_scan(&[("AA:BB:CC:DD:EE:FF", -55)]);
        let mut cycle = cycle(
            probe,
            vec![
                device(
                    "band",
                    BAND,
                    DeviceClass::Battery,
                    HysteresisPolicy::ContinuouslyRefreshed,
                ),
                device(
                    "desk-sensor",
                    DESK,
                    DeviceClass::Presence,
                    HysteresisPolicy::EdgeDebounced,
                ),
            ],
            start,
        );

        let messages = cycle.run(start).await;
        assert_eq!(messages.len(), 4);
        assert!(
            messages
                .iter()
                .all(|m| m.topic("homeassistant").contains("desk_sensor")
                    || m.topic("homeassistant").contains("desk-sensor"))
        );
        assert!(!cycle.trackers()[0].is_available());
        assert!(cycle.trackers()[1].is_available());
    }

    #[tokio::test]
    async fn test_messages_follow_configuration_order() {
        let start = Instant::now();
        let probe = MockProbe::default();
        probe.push_scan(&[(DESK, -40), ("aa:bb:cc:dd:ee:01", -70)]);
        probe.push_read(Ok(90));
        let mut cycle = cycle(
            probe,
            vec![
                device(
                    "second",
                    "aa:bb:cc:dd:ee:01",
                    DeviceClass::Presence,
                    HysteresisPolicy::EdgeDebounced,
                ),
                device(
                    "band",
                    BAND,
                    DeviceClass::Battery,
                    HysteresisPolicy::EdgeDebounced,
                ),
                device(
                    "desk-sensor",
                    DESK,
                    DeviceClass::Presence,
                    HysteresisPolicy::EdgeDebounced,
                ),
            ],
            start,
        );

        let messages = cycle.run(start).await;
        let states: Vec<String> = messages
            .iter()
            .filter(|m| m.class() == MessageClass::State)
            .map(|m| m.topic("homeassistant"))
            .collect();
        assert_eq!(
            states,
            vec![
                "gateway/presence/second/online",
                "gateway/presence/second/rssi",
                "gateway/battery/band/battery",
                "gateway/presence/desk-sensor/online",
                "gateway/presence/desk-sensor/rssi",
            ]
        );
        assert_eq!(cycle.probe.scan_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_scan_failure_marks_presence_devices_absent() {
        let start = Instant::now();
        let probe = MockProbe::default();
        probe.push_scan(&[(DESK, -62)]);
        for _ in 0..3 {
            probe
                .scans
                .lock()
                .unwrap()
                .push_back(Err(ProbeError::Transport("adapter gone".to_string())));
        }
        let mut cycle = cycle(
            probe,
            vec![device(
                "desk-sensor",
                DESK,
                DeviceClass::Presence,
                HysteresisPolicy::EdgeDebounced,
            )],
            start,
        );

        assert_eq!(cycle.run(start).await.len(), 4);
        assert!(cycle.run(start + secs(10)).await.is_empty());
        assert!(!cycle.trackers()[0].is_available());
        assert_eq!(cycle.probe.scan_calls.load(Ordering::SeqCst), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unresponsive_probe_is_bounded() {
        let start = Instant::now();
        let probe = MockProbe {
            hang: true,
            ..MockProbe::default()
        };
        let mut cycle = cycle(
            probe,
            vec![
                device(
                    "desk-sensor",
                    DESK,
                    DeviceClass::Presence,
                    HysteresisPolicy::EdgeDebounced,
                ),
                device(
                    "band",
                    BAND,
                    DeviceClass::Battery,
                    HysteresisPolicy::EdgeDebounced,
                ),
            ],
            start,
        );

        let messages = cycle.run(start).await;
        assert!(messages.is_empty());
        assert_eq!(cycle.probe.scan_calls.load(Ordering::SeqCst), 3);
        assert_eq!(cycle.probe.connect_calls.load(Ordering::SeqCst), 3);
        assert!(cycle.trackers()[1].has_pending_config());
    }

    #[tokio::test(start_paused = true)]
    async fn test_timed_out_read_still_disconnects() {
        let start = Instant::now();
        let probe = MockProbe {
            hang_read: true,
            ..MockProbe::default()
        };
        for _ in 0..3 {
            probe.push_read(Ok(80));
        }
        let mut cycle = cycle(
            probe,
            vec![device(
                "band",
                BAND,
                DeviceClass::Battery,
                HysteresisPolicy::EdgeDebounced,
            )],
            start,
        );

        assert!(cycle.run(start).await.is_empty());
        // Let the abandoned attempts finish disconnecting.
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert_eq!(cycle.probe.connect_calls.load(Ordering::SeqCst), 3);
        assert_eq!(cycle.probe.disconnect_calls.load(Ordering::SeqCst), 3);
        assert!(!cycle.trackers()[0].is_available());
    }

    #[tokio::test]
    async fn test_successful_read_disconnects_once() {
        let start = Instant::now();
        let probe = MockProbe::default();
        probe.push_read(Ok(64));
        let mut cycle = cycle(
            probe,
            vec![device(
                "band",
                BAND,
                DeviceClass::Battery,
                HysteresisPolicy::EdgeDebounced,
            )],
            start,
        );

        assert_eq!(cycle.run(start).await.len(), 2);
        assert_eq!(cycle.probe.disconnect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_empty_cycle_is_not_an_error() {
        let mut cycle = cycle(MockProbe::default(), Vec::new(), Instant::now());
        assert!(cycle.run(Instant::now()).await.is_empty());
        assert_eq!(cycle.probe.scan_calls.load(Ordering::SeqCst), 0);
    }
}

use std::future::Future;
use std::time::{Duration, Instant};

use log::{error, info, warn};
use tokio::time::MissedTickBehavior;

use crate::poll::PollCycle;
use crate::scanner::Probe;

/// How long to let the MQTT event loop flush the disconnect on shutdown.
const SHUTDOWN_GRACE: Duration = Duration::from_secs(5);

/// Drives the poll cycle on a fixed interval and hands every cycle's
/// messages to the broker.
pub struct Manager<P> {
    cycle: PollCycle<P>,
    mqtt_client: crate::mqtt::MqttClient,
    mqtt_event_loop: Option<rumqttc::EventLoop>,
    interval: Duration,
}

impl<P: Probe> Manager<P> {
    pub fn new(
        cycle: PollCycle<P>,
        mqtt_client: crate::mqtt::MqttClient,
        mqtt_event_loop: rumqttc::EventLoop,
        interval: Duration,
    ) -> Self {
        Manager {
            cycle,
            mqtt_client,
            mqtt_event_loop: Some(mqtt_event_loop),
            interval,
        }
    }

    pub async fn run_loop(mut self) -> anyhow::Result<()> {
        let mqtt_handle = self.mqtt_event_loop.take().map(|mut event_loop| {
            let client = self.mqtt_client.clone();
            tokio::task::spawn(async move {
                client.event_loop(&mut event_loop).await;
            })
        });

        let shutdown = async {
            if let Err(err) = tokio::signal::ctrl_c().await {
                error!("Error waiting for shutdown signal: {:?}", err);
                futures::future::pending::<()>().await;
            }
        };
        self.run_until(shutdown).await;

        self.mqtt_client.disconnect().await?;
        if let Some(mqtt_handle) = mqtt_handle {
            match tokio::time::timeout(SHUTDOWN_GRACE, mqtt_handle).await {
                Ok(Err(err)) => error!("Error handling MQTT events: {:?}", err),
                Err(_) => warn!("MQTT event loop did not finish within {:?}", SHUTDOWN_GRACE),
                Ok(Ok(())) => {}
            }
        }
        info!("Exiting manager event loop");

        Ok(())
    }

    /// Runs a cycle on every tick until `shutdown` resolves and returns how
    /// many cycles ran.
    ///
    /// `shutdown` is polled across the whole loop, so a signal that arrives
    /// mid-cycle stops the loop as soon as that cycle is published.
    async fn run_until(&mut self, shutdown: impl Future<Output = ()>) -> usize {
        tokio::pin!(shutdown);

        // A cycle runs inside the tick branch, so ticks that fire while it is
        // still busy are skipped rather than queued.
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);

        let mut cycles = 0;
        loop {
            tokio::select! {
                biased;
                _ = &mut shutdown => break,
                _ = ticker.tick() => {
                    cycles += 1;
                    let messages = self.cycle.run(Instant::now()).await;
                    if messages.is_empty() {
                        continue;
                    }
                    info!("Publishing {} messages", messages.len());
                    self.mqtt_client.publish_all(&messages).await;
                }
            }
        }

        let available = self
            .cycle
            .trackers()
            .iter()
            .filter(|t| t.is_available())
            .count();
        info!(
            "Shutting down after {} cycles with {} of {} devices available",
            cycles,
            available,
            self.cycle.trackers().len()
        );
        cycles
    }
}

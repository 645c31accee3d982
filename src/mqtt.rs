use std::time::Duration;

use log::{debug, error, info, warn};
use rumqttc::{LastWill, MqttOptions, QoS};

use crate::config;
use crate::messages::{Message, OFFLINE, ONLINE};

/// Delay before polling the event loop again after a connection error.
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

#[derive(Debug, Clone)]
pub struct MqttClient {
    client: rumqttc::AsyncClient,
    discovery_prefix: String,
    availability_topic: String,
}

impl MqttClient {
    pub fn new(config: &config::MqttConfig) -> (Self, rumqttc::EventLoop) {
        let publisher_id = config
            .publisher_id
            .as_ref()
            .unwrap_or(&"bt-gateway-rs".to_string())
            .to_string();
        let availability_topic = format!("{}/LWT", config.topic_path());

        let mut mqttoptions = MqttOptions::new(
            publisher_id,
            config.host.clone(),
            config.port.unwrap_or(1883),
        );

        mqttoptions.set_keep_alive(Duration::from_secs(config.keep_alive_seconds.unwrap_or(5)));
        mqttoptions.set_last_will(LastWill::new(
            availability_topic.clone(),
            OFFLINE,
            QoS::AtLeastOnce,
            true,
        ));

        if let (Some(username), Some(password)) =
            (config.username.as_ref(), config.password.as_ref())
        {
            mqttoptions.set_credentials(username.clone(), password.clone());
        }

        let (client, eventloop) = rumqttc::AsyncClient::new(mqttoptions, 10);

        (
            MqttClient {
                client,
                discovery_prefix: config.discovery_prefix().to_string(),
                availability_topic,
            },
            eventloop,
        )
    }

    pub async fn event_loop(&self, eventloop: &mut rumqttc::EventLoop) {
        loop {
            match eventloop.poll().await {
                Ok(notification) => match notification {
                    rumqttc::Event::Incoming(rumqttc::Packet::ConnAck(_)) => {
                        info!("Connected to MQTT broker");
                        // Never wait on the request queue from inside the event loop.
                        if let Err(err) = self.client.try_publish(
                            self.availability_topic.clone(),
                            QoS::AtLeastOnce,
                            true,
                            ONLINE,
                        ) {
                            error!("Error announcing availability: {:?}", err);
                        }
                    }
                    rumqttc::Event::Incoming(rumqttc::Packet::PubAck(ack)) => {
                        debug!("Publish acknowledged: {}", ack.pkid);
                    }
                    rumqttc::Event::Outgoing(rumqttc::Outgoing::Disconnect) => {
                        debug!("Disconnect sent, stopping MQTT event loop");
                        break;
                    }
                    _ => {}
                },
                Err(e) => {
                    error!("Error polling MQTT event loop: {:?}", e);
                    tokio::time::sleep(RECONNECT_DELAY).await;
                }
            }
        }
    }

    pub async fn publish(&self, message: &Message) -> Result<(), rumqttc::ClientError> {
        let topic = message.topic(&self.discovery_prefix);
        debug!(
            "Publishing {:?} message to {}: {}",
            message.class(),
            topic,
            message.payload()
        );
        self.client
            .publish(
                topic,
                QoS::AtLeastOnce,
                message.retain(),
                message.payload().to_string(),
            )
            .await
    }

    /// Publishes every message in order. A failed publish is logged and the
    /// rest still go out.
    pub async fn publish_all(&self, messages: &[Message]) {
        for message in messages {
            if let Err(err) = self.publish(message).await {
                warn!(
                    "Error publishing to {}: {:?}",
                    message.topic(&self.discovery_prefix),
                    err
                );
            }
        }
    }

    pub async fn disconnect(&self) -> Result<(), rumqttc::ClientError> {
        debug!("Disconnecting MQTT client");
        self.client
            .publish(
                self.availability_topic.clone(),
                QoS::AtLeastOnce,
                true,
                OFFLINE,
            )
            .await?;
        self.client.disconnect().await
    }
}

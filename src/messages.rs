use serde_derive::Serialize;

use crate::tracker::{DeviceClass, DeviceTracker, Due, Measurement};

pub const ONLINE: &str = "online";
pub const OFFLINE: &str = "offline";

/// Home Assistant entity domain a discovery message configures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Component {
    BinarySensor,
    Sensor,
}

impl Component {
    pub fn as_str(&self) -> &'static str {
        match self {
            Component::BinarySensor => "binary_sensor",
            Component::Sensor => "sensor",
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MessageClass {
    Discovery,
    State,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Message {
    /// One-shot entity description for the automation hub.
    Config {
        component: Component,
        object_id: String,
        payload: String,
        retain: bool,
    },
    State {
        topic: String,
        payload: String,
        retain: bool,
    },
}

impl Message {
    pub fn class(&self) -> MessageClass {
        match self {
            Message::Config { .. } => MessageClass::Discovery,
            Message::State { .. } => MessageClass::State,
        }
    }

    pub fn topic(&self, discovery_prefix: &str) -> String {
        match self {
            Message::Config {
                component,
                object_id,
                ..
            } => format!("{}/{}/{}/config", discovery_prefix, component.as_str(), object_id),
            Message::State { topic, .. } => topic.clone(),
        }
    }

    pub fn payload(&self) -> &str {
        match self {
            Message::Config { payload, .. } | Message::State { payload, .. } => payload,
        }
    }

    pub fn retain(&self) -> bool {
        match self {
            Message::Config { retain, .. } | Message::State { retain, .. } => *retain,
        }
    }
}

#[derive(Debug, Serialize)]
struct DeviceBlock<'a> {
    ids: Vec<&'a str>,
    cns: Vec<(&'static str, &'a str)>,
    name: &'a str,
    #[serde(rename = "mdl", skip_serializing_if = "Option::is_none")]
    model: Option<&'a str>,
    #[serde(rename = "mf", skip_serializing_if = "Option::is_none")]
    manufacturer: Option<&'a str>,
}

#[derive(Debug, Serialize)]
struct DiscoveryPayload<'a> {
    #[serde(rename = "dev")]
    device: DeviceBlock<'a>,
    name: &'static str,
    #[serde(rename = "~")]
    base_topic: String,
    #[serde(rename = "uniq_id")]
    unique_id: String,
    qos: u8,
    #[serde(rename = "stat_t")]
    state_topic: String,
    #[serde(rename = "unit_of_meas", skip_serializing_if = "Option::is_none")]
    unit: Option<&'static str>,
    #[serde(rename = "pl_on", skip_serializing_if = "Option::is_none")]
    payload_on: Option<&'static str>,
    #[serde(rename = "pl_off", skip_serializing_if = "Option::is_none")]
    payload_off: Option<&'static str>,
    #[serde(rename = "avty_t")]
    availability_topic: String,
    #[serde(rename = "dev_cla")]
    device_class: &'static str,
    #[serde(rename = "stat_cla", skip_serializing_if = "Option::is_none")]
    state_class: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    entity_category: Option<&'static str>,
    source_type: &'static str,
}

/// One entity announced for a device: which field it reads and how the hub
/// should present it.
struct Entity {
    component: Component,
    field: &'static str,
    device_class: &'static str,
    unit: Option<&'static str>,
    state_class: Option<&'static str>,
    entity_category: Option<&'static str>,
}

const ONLINE_ENTITY: Entity = Entity {
    component: Component::BinarySensor,
    field: "online",
    device_class: "connectivity",
    unit: None,
    state_class: None,
    entity_category: None,
};

const RSSI_ENTITY: Entity = Entity {
    component: Component::Sensor,
    field: "rssi",
    device_class: "signal_strength",
    unit: Some("dBm"),
    state_class: Some("measurement"),
    entity_category: Some("diagnostic"),
};

const BATTERY_ENTITY: Entity = Entity {
    component: Component::Sensor,
    field: "battery",
    device_class: "battery",
    unit: Some("%"),
    state_class: Some("measurement"),
    entity_category: None,
};

/// Maps tracker state to outbound messages. Holds only immutable topic
/// settings, so building never touches the tracker.
#[derive(Clone, Debug)]
pub struct MessageBuilder {
    topic_path: String,
}

impl MessageBuilder {
    pub fn new(topic_path: impl Into<String>) -> Self {
        MessageBuilder {
            topic_path: topic_path.into(),
        }
    }

    pub fn availability_topic(&self) -> String {
        format!("{}/LWT", self.topic_path)
    }

    pub fn base_topic(&self, tracker: &DeviceTracker) -> String {
        format!(
            "{}/{}/{}",
            self.topic_path,
            tracker.class().topic_segment(),
            tracker.name()
        )
    }

    /// Discovery messages come first, binary entities before measurement
    /// entities, followed by the state messages.
    pub fn build(&self, tracker: &DeviceTracker, due: Due) -> Vec<Message> {
        let mut messages = Vec::new();
        if due.config {
            for entity in entities(tracker.class()) {
                messages.push(self.config_message(tracker, entity));
            }
        }
        if due.state {
            messages.extend(self.state_messages(tracker));
        }
        messages
    }

    fn config_message(&self, tracker: &DeviceTracker, entity: &Entity) -> Message {
        let object_id = format!("{}_{}", sanitize_name(tracker.name()), entity.field);
        let identity = tracker.identity();
        let manufacturer = identity
            .and_then(|i| i.manufacturer.as_deref())
            .or(tracker.device().manufacturer.as_deref());

        let (payload_on, payload_off) = match entity.component {
            Component::BinarySensor => (Some(ONLINE), Some(OFFLINE)),
            Component::Sensor => (None, None),
        };

        let payload = DiscoveryPayload {
            device: DeviceBlock {
                ids: vec![tracker.name()],
                cns: vec![("mac", tracker.address())],
                name: tracker.name(),
                model: identity.and_then(|i| i.model.as_deref()),
                manufacturer,
            },
            name: entity.field,
            base_topic: self.base_topic(tracker),
            unique_id: object_id.clone(),
            qos: 1,
            state_topic: format!("~/{}", entity.field),
            unit: entity.unit,
            payload_on,
            payload_off,
            availability_topic: self.availability_topic(),
            device_class: entity.device_class,
            state_class: entity.state_class,
            entity_category: entity.entity_category,
            source_type: "bluetooth_le",
        };

        Message::Config {
            component: entity.component,
            object_id,
            // A struct of strings and integers always serializes.
            payload: serde_json::to_string(&payload).unwrap_or_default(),
            retain: true,
        }
    }

    fn state_messages(&self, tracker: &DeviceTracker) -> Vec<Message> {
        let base = self.base_topic(tracker);
        let state = |field: &str, payload: String| Message::State {
            topic: format!("{}/{}", base, field),
            payload,
            retain: false,
        };

        match tracker.class() {
            DeviceClass::Presence => {
                let presence = if tracker.is_available() { ONLINE } else { OFFLINE };
                let mut messages = vec![state("online", presence.to_string())];
                if tracker.is_available() {
                    if let Some(Measurement::Rssi(rssi)) = tracker.last_measurement() {
                        messages.push(state("rssi", rssi.to_string()));
                    }
                }
                messages
            }
            DeviceClass::Battery => match tracker.last_measurement() {
                Some(Measurement::Battery(level)) if tracker.is_available() => {
                    vec![state("battery", level.to_string())]
                }
                _ => Vec::new(),
            },
        }
    }
}

fn entities(class: DeviceClass) -> &'static [Entity] {
    match class {
        DeviceClass::Presence => &[ONLINE_ENTITY, RSSI_ENTITY],
        DeviceClass::Battery => &[BATTERY_ENTITY],
    }
}

pub fn sanitize_name(name: &str) -> String {
    // Remove any non-alphanumeric characters and replace spaces with underscores
    name.to_lowercase()
        .chars()
        .map(|c| if c.is_alphanumeric() { c } else { '_' })
        .collect::<String>()
}

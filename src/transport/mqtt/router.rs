//! Pure routing decisions for MQTT events

use crate::protocol::canonicalize_subject;
use rumqttc::v5::mqttbytes::v5::{Packet, Publish};
use rumqttc::v5::Event;
use tracing::debug;

/// Pure event routing for the supervisor loop
pub struct EventRouter;

impl EventRouter {
    /// Route MQTT event to the supervisor branch that handles it (pure function)
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    publish: publish.clone(),
                },
                Packet::PubAck(_) => EventRoute::PublishAcknowledged,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    detail: format!("{:?}", suback.return_codes),
                },
                Packet::Disconnect(_) => EventRoute::Disconnected,
                other => EventRoute::Infrastructure(format!("{other:?}")),
            },
            Event::Outgoing(_) => EventRoute::Outgoing,
        }
    }

    /// Retained messages are replays of old state, never new jobs (pure function)
    pub fn should_deliver(topic: &str, retain: bool) -> bool {
        if retain {
            debug!(topic, "Ignoring retained message");
            return false;
        }
        true
    }

    /// Registry key for an inbound topic; matches how subjects are stored on subscribe
    pub fn route_key(topic: &str) -> String {
        canonicalize_subject(topic)
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    ConnectionAcknowledged,
    MessageReceived { topic: String, publish: Publish },
    PublishAcknowledged,
    SubscriptionConfirmed { detail: String },
    Disconnected,
    Outgoing,
    Infrastructure(String),
}

//! Pure routing decisions for MQTT events
//!
//! The client's pump task asks this module what an event means and acts on
//! the answer. Nothing here performs I/O.

use crate::protocol::topic_matches;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::{Packet, SubscribeReasonCode};
use rumqttc::v5::Event;
use rumqttc::Outgoing;
use tracing::debug;

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: String::from_utf8_lossy(&publish.topic).to_string(),
                    payload: publish.payload.clone(),
                    retain: publish.retain,
                },
                Packet::Disconnect(disconnect) => {
                    EventRoute::Disconnected(format!("{:?}", disconnect.reason_code))
                }
                Packet::SubAck(suback) => {
                    match Self::subscription_rejection(&suback.return_codes) {
                        Some(reasons) => EventRoute::SubscriptionRejected { reasons },
                        None => EventRoute::SubscriptionConfirmed {
                            packet_id: suback.pkid,
                        },
                    }
                }
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Whether a received publish belongs to the subscription
    ///
    /// Retained messages are delivered like any other.
    pub fn should_forward(topic: &str, topic_filter: &str) -> bool {
        if topic_matches(topic_filter, topic) {
            return true;
        }
        debug!(
            topic = %topic,
            filter = %topic_filter,
            "Ignoring message outside subscription"
        );
        false
    }

    /// Describe failed reason codes in a SubAck, `None` when all succeeded
    pub fn subscription_rejection(return_codes: &[SubscribeReasonCode]) -> Option<String> {
        let failures: Vec<String> = return_codes
            .iter()
            .filter(|code| !matches!(code, SubscribeReasonCode::Success(_)))
            .map(|code| format!("{code:?}"))
            .collect();

        if failures.is_empty() {
            None
        } else {
            Some(failures.join(", "))
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone)]
pub enum EventRoute {
    /// Connection acknowledged - ready to subscribe
    ConnectionAcknowledged,
    /// Message received on subscribed topic
    MessageReceived {
        topic: String,
        payload: Bytes,
        retain: bool,
    },
    /// Broker sent DISCONNECT
    Disconnected(String),
    /// Every requested filter was granted
    SubscriptionConfirmed { packet_id: u16 },
    /// The broker refused the subscription
    SubscriptionRejected { reasons: String },
    /// Our DISCONNECT reached the socket
    DisconnectSent,
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

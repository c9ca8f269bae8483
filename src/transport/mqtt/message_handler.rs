//! Pure routing of rumqttc events
//!
//! The supervisor loop polls the event loop and asks [`MessageHandler`] what
//! each event means; nothing in here performs I/O.

use crate::transport::TransportSignal;
use bytes::Bytes;
use rumqttc::v5::mqttbytes::v5::Packet;
use rumqttc::v5::{ConnectionError, Event};
use tracing::debug;

/// Pure message routing decisions based on MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Route MQTT event to appropriate handler (pure routing decision)
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
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            // Outgoing's Debug output is the bare variant name
            Event::Outgoing(outgoing) if format!("{outgoing:?}") == "Disconnect" => {
                EventRoute::DisconnectSent
            }
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Signal a route produces for the session, if any
    pub fn signal_for(route: &EventRoute) -> Option<TransportSignal> {
        match route {
            EventRoute::ConnectionAcknowledged => Some(TransportSignal::Connect),
            EventRoute::MessageReceived { topic, payload, .. } => {
                Some(TransportSignal::Message {
                    topic: topic.clone(),
                    payload: payload.clone(),
                })
            }
            EventRoute::Disconnected(reason) => Some(TransportSignal::Error(format!(
                "Broker disconnected: {reason}"
            ))),
            EventRoute::SubscriptionConfirmed { packet_id } => {
                debug!(target: "mqtt_transport", packet_id, "Subscription confirmed");
                None
            }
            EventRoute::InfrastructureEvent(event) => {
                debug!(target: "mqtt_transport", "MQTT event: {}", event);
                None
            }
            EventRoute::DisconnectSent | EventRoute::OutgoingEvent => None,
        }
    }

    /// Error text for a failed poll, as carried by the Error signal
    pub fn describe_connection_error(error: &ConnectionError) -> String {
        format!("Connection error: {error}")
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Connection acknowledged - ready to publish/subscribe
    ConnectionAcknowledged,
    /// Message received on subscribed topic
    MessageReceived {
        topic: String,
        payload: Bytes,
        retain: bool,
    },
    /// Broker sent a Disconnect with this reason
    Disconnected(String),
    SubscriptionConfirmed { packet_id: u16 },
    /// Infrastructure event (PingResp, etc.)
    InfrastructureEvent(String),
    /// Our own Disconnect packet went out
    DisconnectSent,
    /// Outgoing event (handled automatically)
    OutgoingEvent,
}

impl EventRoute {
    /// Whether the connection is gone after this event
    pub fn ends_connection(&self) -> bool {
        matches!(self, EventRoute::Disconnected(_) | EventRoute::DisconnectSent)
    }
}

//! Pure routing of rumqttc events
//!
//! The event loop task feeds every polled event through
//! [`MessageHandler::route_mqtt_event`] and turns the resulting route into at
//! most one [`TransportEvent`], keeping track of the connected edge so that
//! `Disconnected` is emitted once per connected period.

use crate::transport::TransportEvent;
use bytes::Bytes;
use rumqttc::{Event, Outgoing, Packet, SubscribeReasonCode};

/// Pure routing decisions for MQTT events
pub struct MessageHandler;

impl MessageHandler {
    /// Classify a polled event
    pub fn route_mqtt_event(event: &Event) -> EventRoute {
        match event {
            Event::Incoming(incoming) => match incoming {
                Packet::ConnAck(_) => EventRoute::ConnectionAcknowledged,
                Packet::Publish(publish) => EventRoute::MessageReceived {
                    topic: publish.topic.clone(),
                    payload: publish.payload.clone(),
                },
                Packet::Disconnect => EventRoute::Disconnected,
                Packet::SubAck(suback) => EventRoute::SubscriptionConfirmed {
                    packet_id: suback.pkid,
                    failures: suback
                        .return_codes
                        .iter()
                        .filter(|code| matches!(code, SubscribeReasonCode::Failure))
                        .count(),
                },
                other => EventRoute::InfrastructureEvent(format!("{other:?}")),
            },
            Event::Outgoing(Outgoing::Disconnect) => EventRoute::DisconnectSent,
            Event::Outgoing(_) => EventRoute::OutgoingEvent,
        }
    }

    /// Transport event for a route, given whether the connection was up.
    /// Returns the event (if any) and the new connected flag.
    pub fn transport_event(route: EventRoute, was_connected: bool) -> (Option<TransportEvent>, bool) {
        match route {
            EventRoute::ConnectionAcknowledged => (Some(TransportEvent::Connected), true),
            EventRoute::MessageReceived { topic, payload } => {
                (Some(TransportEvent::Message { topic, payload }), was_connected)
            }
            EventRoute::Disconnected => Self::connection_lost(was_connected),
            EventRoute::SubscriptionConfirmed { .. }
            | EventRoute::InfrastructureEvent(_)
            | EventRoute::DisconnectSent
            | EventRoute::OutgoingEvent => (None, was_connected),
        }
    }

    /// Disconnected on the connected → disconnected edge only
    pub fn connection_lost(was_connected: bool) -> (Option<TransportEvent>, bool) {
        if was_connected {
            (Some(TransportEvent::Disconnected), false)
        } else {
            (None, false)
        }
    }
}

/// Routing decisions for MQTT events
#[derive(Debug, Clone, PartialEq)]
pub enum EventRoute {
    /// Connection acknowledged by the broker
    ConnectionAcknowledged,
    /// Message received on a subscribed topic
    MessageReceived { topic: String, payload: Bytes },
    /// Broker closed the connection
    Disconnected,
    /// Subscription acknowledged; `failures` counts rejected filters
    SubscriptionConfirmed { packet_id: u16, failures: usize },
    /// Our own DISCONNECT went out; the event loop can stop
    DisconnectSent,
    /// Pings and acknowledgements
    InfrastructureEvent(String),
    /// Other outgoing traffic
    OutgoingEvent,
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, ConnectReturnCode, Publish, QoS, SubAck};

    #[test]
    fn test_route_connack() {
        let event = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        }));
        assert_eq!(
            MessageHandler::route_mqtt_event(&event),
            EventRoute::ConnectionAcknowledged
        );
    }

    #[test]
    fn test_route_publish() {
        let event = Event::Incoming(Packet::Publish(Publish::new(
            "v1/devices/me/rpc/request/7",
            QoS::AtLeastOnce,
            r#"{"method":"ping"}"#,
        )));

        match MessageHandler::route_mqtt_event(&event) {
            EventRoute::MessageReceived { topic, payload } => {
                assert_eq!(topic, "v1/devices/me/rpc/request/7");
                assert_eq!(payload.as_ref(), br#"{"method":"ping"}"#);
            }
            other => panic!("Expected MessageReceived, got {other:?}"),
        }
    }

    #[test]
    fn test_route_disconnects() {
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Incoming(Packet::Disconnect)),
            EventRoute::Disconnected
        );
        assert_eq!(
            MessageHandler::route_mqtt_event(&Event::Outgoing(Outgoing::Disconnect)),
            EventRoute::DisconnectSent
        );
    }

    #[test]
    fn test_route_suback_counts_failures() {
        let event = Event::Incoming(Packet::SubAck(SubAck::new(
            3,
            vec![
                SubscribeReasonCode::Success(QoS::AtLeastOnce),
                SubscribeReasonCode::Failure,
            ],
        )));
        assert_eq!(
            MessageHandler::route_mqtt_event(&event),
            EventRoute::SubscriptionConfirmed {
                packet_id: 3,
                failures: 1
            }
        );
    }

    #[test]
    fn test_route_ping_is_infrastructure() {
        let event = Event::Incoming(Packet::PingResp);
        assert!(matches!(
            MessageHandler::route_mqtt_event(&event),
            EventRoute::InfrastructureEvent(_)
        ));
    }

    #[test]
    fn test_disconnected_emitted_once_per_connection() {
        let (event, connected) =
            MessageHandler::transport_event(EventRoute::ConnectionAcknowledged, false);
        assert_eq!(event, Some(TransportEvent::Connected));
        assert!(connected);

        let (event, connected) = MessageHandler::transport_event(EventRoute::Disconnected, connected);
        assert_eq!(event, Some(TransportEvent::Disconnected));
        assert!(!connected);

        // A following poll error does not repeat the event
        let (event, connected) = MessageHandler::connection_lost(connected);
        assert_eq!(event, None);
        assert!(!connected);
    }

    #[test]
    fn test_messages_pass_through() {
        let route = EventRoute::MessageReceived {
            topic: "/provision/response".to_string(),
            payload: Bytes::from_static(b"{}"),
        };
        let (event, connected) = MessageHandler::transport_event(route, true);
        assert_eq!(
            event,
            Some(TransportEvent::Message {
                topic: "/provision/response".to_string(),
                payload: Bytes::from_static(b"{}"),
            })
        );
        assert!(connected);
    }
}

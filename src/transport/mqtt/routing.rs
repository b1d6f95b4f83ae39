//! Pure event routing from `rumqttc` types to session events
//!
//! The event loop hands back library packets and errors; this module decides
//! what each one means to the session without touching the network.

use crate::transport::{ConnAckCode, DisconnectReason, InboundMessage, ProtocolEvent, QoS};
use rumqttc::{ConnectReturnCode, ConnectionError, Event, Packet, SubscribeReasonCode};
use tracing::debug;

/// Pure routing decisions for `rumqttc` events
pub struct EventRouter;

impl EventRouter {
    /// Route an event loop event (outgoing traffic yields nothing)
    pub fn route_event(event: Event) -> Option<ProtocolEvent> {
        match event {
            Event::Incoming(packet) => Some(Self::route_packet(packet)),
            Event::Outgoing(outgoing) => {
                debug!(packet = ?outgoing, "Outgoing MQTT packet");
                None
            }
        }
    }

    fn route_packet(packet: Packet) -> ProtocolEvent {
        match packet {
            Packet::ConnAck(connack) => ProtocolEvent::ConnAck(Self::connack_code(connack.code)),
            Packet::Publish(publish) => ProtocolEvent::Message(InboundMessage {
                topic: publish.topic,
                payload: publish.payload,
                retain: publish.retain,
            }),
            Packet::Disconnect => ProtocolEvent::Disconnected(DisconnectReason::ByBroker),
            Packet::SubAck(suback) => {
                let granted = suback
                    .return_codes
                    .iter()
                    .map(|code| match code {
                        SubscribeReasonCode::Success(qos) => format!("granted QoS {}", *qos as u8),
                        SubscribeReasonCode::Failure => "rejected".to_string(),
                    })
                    .collect::<Vec<_>>()
                    .join(", ");
                ProtocolEvent::Other(format!("SubAck {}: {granted}", suback.pkid))
            }
            other => ProtocolEvent::Other(format!("{other:?}")),
        }
    }

    /// Route an event loop error. A refused handshake is an acknowledgement
    /// with a failure code; anything else means the connection is gone.
    pub fn route_error(error: ConnectionError) -> Result<ProtocolEvent, ConnectionError> {
        match error {
            ConnectionError::ConnectionRefused(code) => {
                Ok(ProtocolEvent::ConnAck(Self::connack_code(code)))
            }
            other => Err(other),
        }
    }

    pub fn connack_code(code: ConnectReturnCode) -> ConnAckCode {
        match code {
            ConnectReturnCode::Success => ConnAckCode::Accepted,
            ConnectReturnCode::RefusedProtocolVersion => ConnAckCode::UnacceptableProtocolVersion,
            ConnectReturnCode::BadClientId => ConnAckCode::IdentifierRejected,
            ConnectReturnCode::ServiceUnavailable => ConnAckCode::ServerUnavailable,
            ConnectReturnCode::BadUserNamePassword => ConnAckCode::BadUserNameOrPassword,
            ConnectReturnCode::NotAuthorized => ConnAckCode::NotAuthorized,
        }
    }

    pub fn to_rumqttc_qos(qos: QoS) -> rumqttc::QoS {
        match qos {
            QoS::AtMostOnce => rumqttc::QoS::AtMostOnce,
            QoS::AtLeastOnce => rumqttc::QoS::AtLeastOnce,
            QoS::ExactlyOnce => rumqttc::QoS::ExactlyOnce,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rumqttc::{ConnAck, Outgoing, Publish, SubAck};

    #[test]
    fn test_route_connack() {
        let event = Event::Incoming(Packet::ConnAck(ConnAck {
            session_present: false,
            code: ConnectReturnCode::Success,
        }));
        assert_eq!(
            EventRouter::route_event(event),
            Some(ProtocolEvent::ConnAck(ConnAckCode::Accepted))
        );
    }

    #[test]
    fn test_route_publish() {
        let mut publish = Publish::new(
            "lights/state",
            rumqttc::QoS::AtMostOnce,
            "{\"state\": \"ON\"}",
        );
        publish.retain = true;

        let routed = EventRouter::route_event(Event::Incoming(Packet::Publish(publish)));
        match routed {
            Some(ProtocolEvent::Message(message)) => {
                assert_eq!(message.topic, "lights/state");
                assert_eq!(message.payload_str(), "{\"state\": \"ON\"}");
                assert!(message.retain);
            }
            other => panic!("expected message, got {other:?}"),
        }
    }

    #[test]
    fn test_route_disconnect_and_infrastructure() {
        assert_eq!(
            EventRouter::route_event(Event::Incoming(Packet::Disconnect)),
            Some(ProtocolEvent::Disconnected(DisconnectReason::ByBroker))
        );
        assert!(matches!(
            EventRouter::route_event(Event::Incoming(Packet::PingResp)),
            Some(ProtocolEvent::Other(_))
        ));
        assert_eq!(EventRouter::route_event(Event::Outgoing(Outgoing::PingReq)), None);
    }

    #[test]
    fn test_route_suback() {
        let suback = SubAck::new(
            7,
            vec![
                SubscribeReasonCode::Success(rumqttc::QoS::AtLeastOnce),
                SubscribeReasonCode::Failure,
            ],
        );
        assert_eq!(
            EventRouter::route_event(Event::Incoming(Packet::SubAck(suback))),
            Some(ProtocolEvent::Other(
                "SubAck 7: granted QoS 1, rejected".to_string()
            ))
        );
    }

    #[test]
    fn test_route_refused_connection_error() {
        let routed = EventRouter::route_error(ConnectionError::ConnectionRefused(
            ConnectReturnCode::NotAuthorized,
        ));
        assert!(matches!(
            routed,
            Ok(ProtocolEvent::ConnAck(ConnAckCode::NotAuthorized))
        ));

        let routed = EventRouter::route_error(ConnectionError::NetworkTimeout);
        assert!(routed.is_err());
    }

    #[test]
    fn test_connack_code_mapping_is_numeric() {
        let codes = [
            (ConnectReturnCode::Success, 0),
            (ConnectReturnCode::RefusedProtocolVersion, 1),
            (ConnectReturnCode::BadClientId, 2),
            (ConnectReturnCode::ServiceUnavailable, 3),
            (ConnectReturnCode::BadUserNamePassword, 4),
            (ConnectReturnCode::NotAuthorized, 5),
        ];
        for (code, expected) in codes {
            assert_eq!(EventRouter::connack_code(code).code(), expected);
        }
    }
}

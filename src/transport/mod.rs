//! Transport layer for the panel session
//!
//! This module provides the protocol-client abstraction the session drives,
//! the event types it surfaces, and the `rumqttc` implementation in [`mqtt`].

use crate::config::MqttConfig;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::borrow::Cow;
use std::fmt;
use thiserror::Error;

pub mod mqtt;

/// MQTT delivery guarantee
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum QoS {
    /// At most once (0)
    #[default]
    AtMostOnce = 0,
    /// At least once (1)
    AtLeastOnce = 1,
    /// Exactly once (2)
    ExactlyOnce = 2,
}

/// Rejected QoS level
#[derive(Debug, Error, PartialEq, Eq)]
#[error("QoS must be 0, 1 or 2, got {0}")]
pub struct InvalidQoS(pub u8);

impl TryFrom<u8> for QoS {
    type Error = InvalidQoS;

    fn try_from(level: u8) -> Result<Self, Self::Error> {
        match level {
            0 => Ok(QoS::AtMostOnce),
            1 => Ok(QoS::AtLeastOnce),
            2 => Ok(QoS::ExactlyOnce),
            other => Err(InvalidQoS(other)),
        }
    }
}

impl From<QoS> for u8 {
    fn from(qos: QoS) -> Self {
        qos as u8
    }
}

impl fmt::Display for QoS {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", *self as u8)
    }
}

/// Message delivered by the broker on a subscribed topic
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InboundMessage {
    pub topic: String,
    pub payload: Bytes,
    pub retain: bool,
}

impl InboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Bytes>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            retain: false,
        }
    }

    /// Payload as text, with invalid UTF-8 replaced
    pub fn payload_str(&self) -> Cow<'_, str> {
        String::from_utf8_lossy(&self.payload)
    }
}

/// CONNACK return codes (MQTT 3.1.1, section 3.2.2.3)
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnAckCode {
    Accepted,
    UnacceptableProtocolVersion,
    IdentifierRejected,
    ServerUnavailable,
    BadUserNameOrPassword,
    NotAuthorized,
}

impl ConnAckCode {
    /// Numeric return code as sent on the wire
    pub fn code(self) -> u8 {
        match self {
            ConnAckCode::Accepted => 0,
            ConnAckCode::UnacceptableProtocolVersion => 1,
            ConnAckCode::IdentifierRejected => 2,
            ConnAckCode::ServerUnavailable => 3,
            ConnAckCode::BadUserNameOrPassword => 4,
            ConnAckCode::NotAuthorized => 5,
        }
    }

    pub fn from_code(code: u8) -> Option<Self> {
        match code {
            0 => Some(ConnAckCode::Accepted),
            1 => Some(ConnAckCode::UnacceptableProtocolVersion),
            2 => Some(ConnAckCode::IdentifierRejected),
            3 => Some(ConnAckCode::ServerUnavailable),
            4 => Some(ConnAckCode::BadUserNameOrPassword),
            5 => Some(ConnAckCode::NotAuthorized),
            _ => None,
        }
    }

    pub fn is_success(self) -> bool {
        self == ConnAckCode::Accepted
    }
}

impl fmt::Display for ConnAckCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ConnAckCode::Accepted => "accepted",
            ConnAckCode::UnacceptableProtocolVersion => "unacceptable protocol version",
            ConnAckCode::IdentifierRejected => "identifier rejected",
            ConnAckCode::ServerUnavailable => "server unavailable",
            ConnAckCode::BadUserNameOrPassword => "bad user name or password",
            ConnAckCode::NotAuthorized => "not authorized",
        };
        write!(f, "{name} ({})", self.code())
    }
}

/// Why a connection ended
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// Broker sent DISCONNECT or closed the session
    ByBroker,
    /// Socket or protocol failure while servicing the network
    Network(String),
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::ByBroker => write!(f, "broker closed the connection"),
            DisconnectReason::Network(error) => write!(f, "network error: {error}"),
        }
    }
}

/// Event surfaced by one network-service step
#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolEvent {
    /// Broker answered CONNECT
    ConnAck(ConnAckCode),
    /// Message received on a subscribed topic
    Message(InboundMessage),
    /// Connection ended
    Disconnected(DisconnectReason),
    /// Infrastructure traffic (PingResp, SubAck, ...)
    Other(String),
}

/// Protocol client the session drives
///
/// Abstracts the MQTT library so the lifecycle, dispatch and publish logic can
/// be exercised without a broker. `subscribe` and `publish` only enqueue; the
/// network is serviced by repeated calls to `poll_event`.
#[async_trait::async_trait]
pub trait ProtocolClient: Send + Sync + 'static {
    type Error: std::error::Error + Send + Sync + 'static;

    /// Open a connection. `Err` means the broker could not be reached; the
    /// acknowledgement, accepted or refused, is delivered by `poll_event`
    async fn connect(&self, config: &MqttConfig) -> Result<(), Self::Error>;

    /// Request a protocol-level disconnect
    async fn disconnect(&self) -> Result<(), Self::Error>;

    /// Enqueue a SUBSCRIBE for one topic filter
    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), Self::Error>;

    /// Enqueue a PUBLISH; `Ok` means accepted into the local outbound queue
    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), Self::Error>;

    /// Run one network-service step, returning the event it produced, if any.
    /// An `Err` means the connection is lost.
    async fn poll_event(&self) -> Result<Option<ProtocolEvent>, Self::Error>;
}

/// Receiver of protocol events, fed by the session's background tick
pub trait EventSink: Send + Sync {
    fn on_connected(&self, _code: ConnAckCode) {}

    fn on_message(&self, _message: InboundMessage) {}

    fn on_disconnected(&self, _reason: DisconnectReason) {}
}

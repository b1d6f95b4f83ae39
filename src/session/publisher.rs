//! Outbound publishing gated on the connected condition
//!
//! A publish waits (bounded) for the session to be connected, encodes the
//! payload and hands it to the protocol client's non-blocking enqueue. Nothing
//! is raised: every path resolves to a [`PublishOutcome`].

use crate::transport::mqtt::{ConnectionState, HealthMonitor};
use crate::transport::{ProtocolClient, QoS};
use bytes::Bytes;
use serde::Serialize;
use serde_json::ser::Formatter;
use serde_json::Value;
use std::fmt;
use std::io;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, error, info, Instrument};

/// Result of a publish request. Reflects the local enqueue only, never broker delivery.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PublishOutcome {
    /// Accepted by the protocol client's outbound queue
    Queued,
    /// Not connected within the publish timeout; dropped
    NotConnected,
    /// Payload could not be encoded; dropped
    EncodeFailed,
    /// Enqueue rejected (queue full, client gone); dropped
    EnqueueFailed,
}

impl PublishOutcome {
    pub fn is_queued(self) -> bool {
        self == PublishOutcome::Queued
    }
}

impl fmt::Display for PublishOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            PublishOutcome::Queued => "queued",
            PublishOutcome::NotConnected => "not connected",
            PublishOutcome::EncodeFailed => "encode failed",
            PublishOutcome::EnqueueFailed => "enqueue failed",
        };
        f.write_str(text)
    }
}

/// Message payload before encoding
#[derive(Debug, Clone, PartialEq)]
pub enum Payload {
    /// Sent unchanged
    Raw(Vec<u8>),
    /// Sent as JSON text; a bare string is sent as its raw text
    Structured(Value),
}

impl Payload {
    /// Structured payload from any serializable value
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<Self, serde_json::Error> {
        serde_json::to_value(value).map(Payload::Structured)
    }

    /// Bytes as they go on the wire
    pub fn encode(self) -> Result<Vec<u8>, serde_json::Error> {
        match self {
            Payload::Raw(bytes) => Ok(bytes),
            Payload::Structured(Value::String(text)) => Ok(text.into_bytes()),
            Payload::Structured(value) => to_wire_json(&value),
        }
    }
}

impl From<Vec<u8>> for Payload {
    fn from(bytes: Vec<u8>) -> Self {
        Payload::Raw(bytes)
    }
}

impl From<&[u8]> for Payload {
    fn from(bytes: &[u8]) -> Self {
        Payload::Raw(bytes.to_vec())
    }
}

impl From<Bytes> for Payload {
    fn from(bytes: Bytes) -> Self {
        Payload::Raw(bytes.to_vec())
    }
}

impl From<String> for Payload {
    fn from(text: String) -> Self {
        Payload::Raw(text.into_bytes())
    }
}

impl From<&str> for Payload {
    fn from(text: &str) -> Self {
        Payload::Raw(text.as_bytes().to_vec())
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Payload::Structured(value)
    }
}

/// JSON formatter writing `", "` between items and `": "` after keys
#[derive(Debug, Default, Clone, Copy)]
pub struct WireFormatter;

impl Formatter for WireFormatter {
    fn begin_array_value<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_key<W>(&mut self, writer: &mut W, first: bool) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        if first {
            Ok(())
        } else {
            writer.write_all(b", ")
        }
    }

    fn begin_object_value<W>(&mut self, writer: &mut W) -> io::Result<()>
    where
        W: ?Sized + io::Write,
    {
        writer.write_all(b": ")
    }
}

/// Serialize with the wire separators, e.g. `{"v": 1}`
pub fn to_wire_json<T: Serialize + ?Sized>(value: &T) -> Result<Vec<u8>, serde_json::Error> {
    let mut out = Vec::with_capacity(128);
    let mut serializer = serde_json::Serializer::with_formatter(&mut out, WireFormatter);
    value.serialize(&mut serializer)?;
    Ok(out)
}

/// Prepared outbound message
#[derive(Debug, Clone, PartialEq)]
pub struct OutboundMessage {
    pub topic: String,
    pub payload: Payload,
    /// None uses the session's default QoS
    pub qos: Option<QoS>,
    pub retain: bool,
}

impl OutboundMessage {
    pub fn new(topic: impl Into<String>, payload: impl Into<Payload>) -> Self {
        Self {
            topic: topic.into(),
            payload: payload.into(),
            qos: None,
            retain: false,
        }
    }

    pub fn with_qos(mut self, qos: QoS) -> Self {
        self.qos = Some(qos);
        self
    }

    pub fn retained(mut self) -> Self {
        self.retain = true;
        self
    }
}

/// Publishes through a shared protocol client once the session is connected
pub struct Publisher<C: ProtocolClient> {
    client: Arc<C>,
    state_rx: watch::Receiver<ConnectionState>,
    default_qos: QoS,
    timeout: Duration,
}

impl<C: ProtocolClient> Clone for Publisher<C> {
    fn clone(&self) -> Self {
        Self {
            client: Arc::clone(&self.client),
            state_rx: self.state_rx.clone(),
            default_qos: self.default_qos,
            timeout: self.timeout,
        }
    }
}

impl<C: ProtocolClient> Publisher<C> {
    pub fn new(
        client: Arc<C>,
        state_rx: watch::Receiver<ConnectionState>,
        default_qos: QoS,
        timeout: Duration,
    ) -> Self {
        Self {
            client,
            state_rx,
            default_qos,
            timeout,
        }
    }

    pub fn default_qos(&self) -> QoS {
        self.default_qos
    }

    pub fn timeout(&self) -> Duration {
        self.timeout
    }

    /// Wait up to the publish timeout for the connected condition
    pub async fn wait_for_connection(&self) -> bool {
        let mut state_rx = self.state_rx.clone();
        tokio::time::timeout(self.timeout, async {
            loop {
                let connected = HealthMonitor::can_publish(&state_rx.borrow_and_update());
                if connected {
                    return true;
                }
                if state_rx.changed().await.is_err() {
                    return false;
                }
            }
        })
        .await
        .unwrap_or(false)
    }

    /// Publish `payload` to `topic`; `qos` None uses the default
    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Payload>,
        qos: Option<QoS>,
        retain: bool,
    ) -> PublishOutcome {
        self.send(OutboundMessage {
            topic: topic.into(),
            payload: payload.into(),
            qos,
            retain,
        })
        .await
    }

    /// Publish any serializable value as structured JSON
    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        topic: impl Into<String>,
        value: &T,
        qos: Option<QoS>,
        retain: bool,
    ) -> PublishOutcome {
        let topic = topic.into();
        match Payload::json(value) {
            Ok(payload) => self.publish(topic, payload, qos, retain).await,
            Err(e) => {
                error!(topic = %topic, error = %e, "Failed to encode payload");
                PublishOutcome::EncodeFailed
            }
        }
    }

    /// Publish a prepared message
    pub async fn send(&self, message: OutboundMessage) -> PublishOutcome {
        let span = crate::mqtt_span!(operation = "publish", topic = %message.topic);
        self.send_inner(message).instrument(span).await
    }

    async fn send_inner(&self, message: OutboundMessage) -> PublishOutcome {
        let OutboundMessage {
            topic,
            payload,
            qos,
            retain,
        } = message;

        if !self.wait_for_connection().await {
            error!(
                topic = %topic,
                timeout_ms = self.timeout.as_millis() as u64,
                "Not connected within publish timeout; message dropped"
            );
            return PublishOutcome::NotConnected;
        }

        let bytes = match payload.encode() {
            Ok(bytes) => bytes,
            Err(e) => {
                error!(topic = %topic, error = %e, "Failed to encode payload");
                return PublishOutcome::EncodeFailed;
            }
        };

        let qos = qos.unwrap_or(self.default_qos);
        let size = bytes.len();
        debug!(topic = %topic, qos = %qos, retain, size, "Enqueuing publish");

        match self.client.publish(&topic, bytes, qos, retain) {
            Ok(()) => {
                info!(topic = %topic, qos = %qos, retain, size, "Message queued");
                PublishOutcome::Queued
            }
            Err(e) => {
                error!(topic = %topic, error = %e, "Failed to enqueue publish");
                PublishOutcome::EnqueueFailed
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockProtocolClient;
    use serde_json::json;
    use std::collections::HashMap;

    fn publisher(
        state: ConnectionState,
        timeout: Duration,
    ) -> (
        Arc<MockProtocolClient>,
        watch::Sender<ConnectionState>,
        Publisher<MockProtocolClient>,
    ) {
        let client = Arc::new(MockProtocolClient::new());
        let (state_tx, state_rx) = watch::channel(state);
        let publisher = Publisher::new(Arc::clone(&client), state_rx, QoS::AtMostOnce, timeout);
        (client, state_tx, publisher)
    }

    #[test]
    fn test_wire_separators() {
        let encoded = to_wire_json(&json!({"v": 1})).unwrap();
        assert_eq!(encoded, b"{\"v\": 1}");

        let encoded = to_wire_json(&json!({"a": [1, 2, {"b": null}], "c": "x"})).unwrap();
        assert_eq!(
            String::from_utf8(encoded).unwrap(),
            r#"{"a": [1, 2, {"b": null}], "c": "x"}"#
        );

        assert_eq!(to_wire_json(&json!([])).unwrap(), b"[]");
        assert_eq!(to_wire_json(&json!({})).unwrap(), b"{}");
    }

    #[test]
    fn test_wire_json_keeps_insertion_order() {
        let encoded = to_wire_json(&json!({"b": 1, "a": 2})).unwrap();
        assert_eq!(String::from_utf8(encoded).unwrap(), r#"{"b": 1, "a": 2}"#);

        let value: Value = serde_json::from_str(r#"{"state": "ON", "brightness": 80}"#).unwrap();
        assert_eq!(
            Payload::from(value).encode().unwrap(),
            br#"{"state": "ON", "brightness": 80}"#.to_vec()
        );
    }

    #[test]
    fn test_payload_encoding() {
        assert_eq!(Payload::from("plain text").encode().unwrap(), b"plain text");
        assert_eq!(Payload::from(vec![0u8, 255]).encode().unwrap(), vec![0u8, 255]);
        assert_eq!(Payload::from(json!("ON")).encode().unwrap(), b"ON");
        assert_eq!(Payload::from(json!(42)).encode().unwrap(), b"42");
        assert_eq!(Payload::from(json!(true)).encode().unwrap(), b"true");
        assert_eq!(Payload::from(json!(null)).encode().unwrap(), b"null");
        assert_eq!(
            Payload::from(json!({"state": "OFF"})).encode().unwrap(),
            b"{\"state\": \"OFF\"}"
        );
    }

    #[test]
    fn test_outbound_message_builder() {
        let message = OutboundMessage::new("x/y", "1")
            .with_qos(QoS::ExactlyOnce)
            .retained();
        assert_eq!(message.qos, Some(QoS::ExactlyOnce));
        assert!(message.retain);
    }

    #[tokio::test]
    async fn test_publish_when_connected() {
        let (client, _state_tx, publisher) =
            publisher(ConnectionState::Connected, Duration::from_millis(100));

        let outcome = publisher.publish("x/y", json!({"v": 1}), None, true).await;

        assert_eq!(outcome, PublishOutcome::Queued);
        let published = client.get_published_messages();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "x/y");
        assert_eq!(published[0].payload_str(), "{\"v\": 1}");
        assert_eq!(published[0].qos, QoS::AtMostOnce);
        assert!(published[0].retain);
    }

    #[tokio::test]
    async fn test_qos_override() {
        let (client, _state_tx, publisher) =
            publisher(ConnectionState::Connected, Duration::from_millis(100));

        publisher
            .publish("x/y", "a", Some(QoS::AtLeastOnce), false)
            .await;

        assert_eq!(client.get_published_messages()[0].qos, QoS::AtLeastOnce);
    }

    #[tokio::test]
    async fn test_publish_times_out_when_never_connected() {
        let (client, _state_tx, publisher) =
            publisher(ConnectionState::Connecting, Duration::from_millis(50));

        let started = tokio::time::Instant::now();
        let outcome = publisher.publish("x/y", "a", None, false).await;

        assert_eq!(outcome, PublishOutcome::NotConnected);
        assert!(started.elapsed() >= Duration::from_millis(50));
        assert!(client.get_published_messages().is_empty());
    }

    #[tokio::test]
    async fn test_publish_waits_for_connection() {
        let (client, state_tx, publisher) =
            publisher(ConnectionState::Connecting, Duration::from_secs(2));

        let pending = tokio::spawn({
            let publisher = publisher.clone();
            async move { publisher.publish("x/y", "late", None, false).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        state_tx.send_replace(ConnectionState::Connected);

        assert_eq!(pending.await.unwrap(), PublishOutcome::Queued);
        assert_eq!(client.get_published_messages().len(), 1);
    }

    #[tokio::test]
    async fn test_enqueue_failure_is_reported() {
        let (client, _state_tx, publisher) =
            publisher(ConnectionState::Connected, Duration::from_millis(100));
        client.set_fail_publish(true);

        let outcome = publisher.publish("x/y", "a", None, false).await;
        assert_eq!(outcome, PublishOutcome::EnqueueFailed);
    }

    #[tokio::test]
    async fn test_unencodable_value_is_reported() {
        let (client, _state_tx, publisher) =
            publisher(ConnectionState::Connected, Duration::from_millis(100));

        let mut bad_keys = HashMap::new();
        bad_keys.insert((1, 2), "tuple keys are not valid JSON object keys");

        let outcome = publisher.publish_json("x/y", &bad_keys, None, false).await;
        assert_eq!(outcome, PublishOutcome::EncodeFailed);
        assert!(client.get_published_messages().is_empty());
    }

    mod wire_properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            #[test]
            fn wire_json_parses_back_to_the_same_value(
                entries in prop::collection::btree_map("[a-z]{1,6}", any::<i64>(), 0..6),
                label in "[ -~]{0,16}",
            ) {
                let value = json!({"entries": entries, "label": label});
                let wire = to_wire_json(&value).unwrap();
                let parsed: Value = serde_json::from_slice(&wire).unwrap();
                prop_assert_eq!(parsed, value);
            }
        }
    }
}

//! Impure I/O operations for the MQTT transport
//!
//! [`RumqttClient`] adapts `rumqttc`'s `AsyncClient`/`EventLoop` pair to the
//! [`ProtocolClient`] seam. Every `connect` builds a fresh pair, so a session
//! that was stopped (or lost its connection) never reuses a spent event loop.
//!
//! `connect` drives the first `poll` itself, which covers the TCP connect, the
//! CONNECT packet and the CONNACK. An unreachable broker fails `connect`; the
//! acknowledgement (accepted or refused) is held back and handed out by the
//! next `poll_event`.

use super::connection::{configure_mqtt_options, ConnectionState, MqttError};
use super::routing::EventRouter;
use crate::config::MqttConfig;
use crate::transport::{ProtocolClient, ProtocolEvent, QoS};
use async_trait::async_trait;
use rumqttc::{AsyncClient, ConnectionError, Event, EventLoop, Outgoing};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

/// Bound on the outbound request queue shared by publish and subscribe
const DEFAULT_REQUEST_CAPACITY: usize = 10;

/// How long `disconnect` drives the event loop to flush DISCONNECT
const DISCONNECT_FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// `rumqttc`-backed protocol client (MQTT 3.1.1)
pub struct RumqttClient {
    client: StdMutex<Option<AsyncClient>>,
    event_loop: Mutex<Option<EventLoop>>,
    /// CONNACK from the handshake, returned by the next `poll_event`
    pending: StdMutex<Option<ProtocolEvent>>,
    request_capacity: usize,
}

impl Default for RumqttClient {
    fn default() -> Self {
        Self::new()
    }
}

impl RumqttClient {
    pub fn new() -> Self {
        Self::with_request_capacity(DEFAULT_REQUEST_CAPACITY)
    }

    pub fn with_request_capacity(request_capacity: usize) -> Self {
        Self {
            client: StdMutex::new(None),
            event_loop: Mutex::new(None),
            pending: StdMutex::new(None),
            request_capacity: request_capacity.max(1),
        }
    }

    /// Resolve the broker address so a bad host fails at `connect` time
    async fn resolve_broker(config: &MqttConfig) -> Result<(), MqttError> {
        let address = config.broker_address();
        let mut resolved =
            tokio::net::lookup_host((config.broker_host.as_str(), config.broker_port))
                .await
                .map_err(|e| MqttError::InvalidBrokerAddress(format!("{address}: {e}")))?;

        match resolved.next() {
            Some(socket_addr) => {
                debug!(broker = %address, resolved = %socket_addr, "Resolved MQTT broker");
                Ok(())
            }
            None => Err(MqttError::InvalidBrokerAddress(format!(
                "{address}: no addresses found"
            ))),
        }
    }

    fn set_pending(&self, event: Option<ProtocolEvent>) -> Result<(), MqttError> {
        *self
            .pending
            .lock()
            .map_err(|_| MqttError::Network("pending event lock poisoned".to_string()))? = event;
        Ok(())
    }

    fn take_pending(&self) -> Result<Option<ProtocolEvent>, MqttError> {
        Ok(self
            .pending
            .lock()
            .map_err(|_| MqttError::Network("pending event lock poisoned".to_string()))?
            .take())
    }

    /// Run the handshake on a fresh event loop. A refused CONNACK is an
    /// acknowledgement, not a failure; I/O errors and timeouts are failures.
    async fn handshake(event_loop: &mut EventLoop) -> Result<ProtocolEvent, MqttError> {
        match event_loop.poll().await {
            Ok(event) => match EventRouter::route_event(event) {
                Some(acknowledgement @ ProtocolEvent::ConnAck(_)) => Ok(acknowledgement),
                other => Err(MqttError::Network(format!(
                    "expected CONNACK during handshake, got {other:?}"
                ))),
            },
            Err(error) => EventRouter::route_error(error).map_err(Self::handshake_error),
        }
    }

    fn handshake_error(error: ConnectionError) -> MqttError {
        match error {
            ConnectionError::Io(e) => MqttError::ConnectionFailed(Box::new(e)),
            ConnectionError::NetworkTimeout => {
                MqttError::Network("timed out connecting to broker".to_string())
            }
            other => MqttError::Network(other.to_string()),
        }
    }

    fn current_client(&self) -> Result<AsyncClient, MqttError> {
        let guard = self
            .client
            .lock()
            .map_err(|_| MqttError::Network("client lock poisoned".to_string()))?;
        guard.clone().ok_or(MqttError::NotConnected {
            state: ConnectionState::Stopped,
        })
    }

    /// Poll until DISCONNECT has been written, the connection ends, or the timeout passes
    async fn flush_disconnect(event_loop: &mut EventLoop) {
        let flushed = tokio::time::timeout(DISCONNECT_FLUSH_TIMEOUT, async {
            loop {
                match event_loop.poll().await {
                    Ok(Event::Outgoing(Outgoing::Disconnect)) => break,
                    Ok(_) => continue,
                    Err(e) => {
                        debug!(error = %e, "Event loop ended while flushing DISCONNECT");
                        break;
                    }
                }
            }
        })
        .await;

        if flushed.is_err() {
            warn!("Timed out flushing MQTT DISCONNECT");
        }
    }
}

#[async_trait]
impl ProtocolClient for RumqttClient {
    type Error = MqttError;

    async fn connect(&self, config: &MqttConfig) -> Result<(), MqttError> {
        config
            .validate()
            .map_err(|e| MqttError::InvalidConfig(e.to_string()))?;
        Self::resolve_broker(config).await?;

        // A previous pair is spent once a new handshake starts
        self.set_pending(None)?;
        self.event_loop.lock().await.take();
        self.client
            .lock()
            .map_err(|_| MqttError::Network("client lock poisoned".to_string()))?
            .take();

        let mqtt_options = configure_mqtt_options(config);
        let (client, mut event_loop) = AsyncClient::new(mqtt_options, self.request_capacity);

        let acknowledgement = Self::handshake(&mut event_loop).await?;
        let accepted = matches!(acknowledgement, ProtocolEvent::ConnAck(code) if code.is_success());
        self.set_pending(Some(acknowledgement))?;

        if !accepted {
            debug!(broker = %config.broker_address(), "Handshake refused by broker");
            return Ok(());
        }

        *self.event_loop.lock().await = Some(event_loop);
        *self
            .client
            .lock()
            .map_err(|_| MqttError::Network("client lock poisoned".to_string()))? = Some(client);

        info!(
            broker = %config.broker_address(),
            client_id = %config.client_id,
            "MQTT handshake completed"
        );
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), MqttError> {
        let client = self
            .client
            .lock()
            .map_err(|_| MqttError::Network("client lock poisoned".to_string()))?
            .take();

        let Some(client) = client else {
            debug!("MQTT disconnect requested without a connection");
            return Ok(());
        };

        let sent = client
            .try_disconnect()
            .map_err(|e| MqttError::ConnectionFailed(Box::new(e)));

        if let Some(mut event_loop) = self.event_loop.lock().await.take() {
            if sent.is_ok() {
                Self::flush_disconnect(&mut event_loop).await;
            }
        }

        sent
    }

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), MqttError> {
        self.current_client()?
            .try_subscribe(topic, EventRouter::to_rumqttc_qos(qos))
            .map_err(|e| MqttError::SubscriptionFailed(Box::new(e)))
    }

    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), MqttError> {
        self.current_client()?
            .try_publish(topic, EventRouter::to_rumqttc_qos(qos), retain, payload)
            .map_err(|e| MqttError::PublishFailed(Box::new(e)))
    }

    async fn poll_event(&self) -> Result<Option<ProtocolEvent>, MqttError> {
        if let Some(event) = self.take_pending()? {
            return Ok(Some(event));
        }

        let mut guard = self.event_loop.lock().await;
        let event_loop = guard.as_mut().ok_or(MqttError::NotConnected {
            state: ConnectionState::Stopped,
        })?;

        match event_loop.poll().await {
            Ok(event) => Ok(EventRouter::route_event(event)),
            Err(error) => match EventRouter::route_error(error) {
                Ok(event) => Ok(Some(event)),
                Err(error) => Err(MqttError::Network(error.to_string())),
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::transport::ConnAckCode;
    use tokio::io::{AsyncReadExt, AsyncWriteExt};
    use tokio::net::TcpListener;

    #[tokio::test]
    async fn test_publish_before_connect_fails() {
        let client = RumqttClient::new();

        let result = client.publish("a/b", b"x".to_vec(), QoS::AtMostOnce, false);
        assert!(matches!(result, Err(MqttError::NotConnected { .. })));

        let result = client.subscribe("a/b", QoS::AtMostOnce);
        assert!(matches!(result, Err(MqttError::NotConnected { .. })));
    }

    #[tokio::test]
    async fn test_poll_before_connect_fails() {
        let client = RumqttClient::new();
        assert!(matches!(
            client.poll_event().await,
            Err(MqttError::NotConnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_disconnect_without_connection() {
        let client = RumqttClient::new();
        assert!(client.disconnect().await.is_ok());
    }

    #[tokio::test]
    async fn test_connect_rejects_invalid_config() {
        let client = RumqttClient::new();
        let config = MqttConfig::new("localhost", "");

        assert!(matches!(
            client.connect(&config).await,
            Err(MqttError::InvalidConfig(_))
        ));
    }

    #[tokio::test]
    async fn test_connect_rejects_unresolvable_host() {
        let client = RumqttClient::new();
        let config = MqttConfig::new("no-such-broker.invalid", "panel-test");

        assert!(matches!(
            client.connect(&config).await,
            Err(MqttError::InvalidBrokerAddress(_))
        ));
    }

    /// Accept one connection, read the CONNECT and answer with a CONNACK
    /// carrying `return_code`
    async fn fake_broker(return_code: u8) -> u16 {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        tokio::spawn(async move {
            let (mut socket, _) = listener.accept().await.unwrap();
            let mut connect = [0u8; 256];
            let _ = socket.read(&mut connect).await.unwrap();
            socket
                .write_all(&[0x20, 0x02, 0x00, return_code])
                .await
                .unwrap();
            // Hold the socket open until the client goes away
            let _ = socket.read(&mut connect).await;
        });
        port
    }

    #[tokio::test]
    async fn test_connect_to_closed_port_fails() {
        let client = RumqttClient::new();
        let config = MqttConfig::new("127.0.0.1", "panel-test").with_port(1);

        let result = tokio::time::timeout(Duration::from_secs(10), client.connect(&config))
            .await
            .expect("connect should fail promptly against a closed port");

        assert!(matches!(result, Err(MqttError::ConnectionFailed(_))));
        assert!(matches!(
            client.publish("a/b", b"x".to_vec(), QoS::AtMostOnce, false),
            Err(MqttError::NotConnected { .. })
        ));
        assert!(matches!(
            client.poll_event().await,
            Err(MqttError::NotConnected { .. })
        ));
    }

    #[tokio::test]
    async fn test_accepted_handshake_is_reported_by_first_poll() {
        let port = fake_broker(0x00).await;
        let client = RumqttClient::new();
        let config = MqttConfig::new("127.0.0.1", "panel-test").with_port(port);

        client.connect(&config).await.unwrap();

        assert_eq!(
            client.poll_event().await.unwrap(),
            Some(ProtocolEvent::ConnAck(ConnAckCode::Accepted))
        );
        assert!(client
            .publish("a/b", b"queued".to_vec(), QoS::AtMostOnce, false)
            .is_ok());
    }

    #[tokio::test]
    async fn test_refused_handshake_is_an_acknowledgement() {
        let port = fake_broker(0x05).await;
        let client = RumqttClient::new();
        let config = MqttConfig::new("127.0.0.1", "panel-test").with_port(port);

        client.connect(&config).await.unwrap();

        assert_eq!(
            client.poll_event().await.unwrap(),
            Some(ProtocolEvent::ConnAck(ConnAckCode::NotAuthorized))
        );
        assert!(matches!(
            client.subscribe("a/b", QoS::AtMostOnce),
            Err(MqttError::NotConnected { .. })
        ));
        assert!(client.disconnect().await.is_ok());
    }
}

//! MQTT session: lifecycle, dispatch and publishing over one protocol client
//!
//! [`MqttSession`] is what an application shell holds. It composes the
//! [`ConnectionManager`], the [`MessageDispatcher`] and a [`Publisher`] that
//! share the same client and the same connection-state channel.
//!
//! ```rust,no_run
//! use lightpanel::config::MqttConfig;
//! use lightpanel::session::{HandlerError, MqttSession};
//! use lightpanel::transport::{InboundMessage, mqtt::RumqttClient};
//! use serde_json::json;
//! use std::sync::Arc;
//!
//! # tokio_test::block_on(async {
//! let config = MqttConfig::new("broker.hivemq.com", "panel-7f3a")
//!     .with_subscribe_topics(["demo/light/state"]);
//!
//! let session = MqttSession::new(config, RumqttClient::new()).with_handler(Arc::new(
//!     |message: &InboundMessage| -> Result<(), HandlerError> {
//!         println!("{} -> {}", message.topic, message.payload_str());
//!         Ok(())
//!     },
//! ));
//!
//! session.start().await;
//! session.publish("demo/light/set", json!({"state": "ON"}), None, false).await;
//! session.stop().await;
//! # });
//! ```

pub mod dispatcher;
pub mod lifecycle;
pub mod publisher;

pub use dispatcher::{HandlerError, MessageDispatcher, MessageHandler, UnconfiguredHandler};
pub use lifecycle::{ConnectionManager, SessionEvents, TickControl};
pub use publisher::{to_wire_json, OutboundMessage, Payload, PublishOutcome, Publisher};

use crate::config::{AppConfig, MqttConfig};
use crate::transport::mqtt::{ConnectionState, ReconnectPolicy};
use crate::transport::{ProtocolClient, QoS};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

/// Timing and reconnect settings for a session
#[derive(Debug, Clone, PartialEq)]
pub struct SessionOptions {
    /// How long a publish waits for the connected condition
    pub publish_timeout: Duration,
    /// Idle delay between network-service steps
    pub tick_interval: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for SessionOptions {
    fn default() -> Self {
        Self {
            publish_timeout: Duration::from_secs(5),
            tick_interval: Duration::from_millis(100),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

impl SessionOptions {
    pub fn from_app_config(config: &AppConfig) -> Self {
        Self {
            publish_timeout: config.session.publish_timeout(),
            tick_interval: config.session.tick_interval(),
            reconnect: config.reconnect.clone(),
        }
    }

    pub fn with_publish_timeout(mut self, timeout: Duration) -> Self {
        self.publish_timeout = timeout;
        self
    }

    pub fn with_tick_interval(mut self, interval: Duration) -> Self {
        self.tick_interval = interval;
        self
    }

    pub fn with_reconnect(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect = policy;
        self
    }
}

/// One MQTT session driving one protocol client
pub struct MqttSession<C: ProtocolClient> {
    config: Arc<MqttConfig>,
    client: Arc<C>,
    options: SessionOptions,
    dispatcher: Arc<MessageDispatcher>,
    manager: ConnectionManager<C>,
    publisher: Publisher<C>,
}

impl<C: ProtocolClient> MqttSession<C> {
    pub fn new(config: MqttConfig, client: C) -> Self {
        Self::with_options(config, client, SessionOptions::default())
    }

    pub fn with_options(config: MqttConfig, client: C, options: SessionOptions) -> Self {
        let config = Arc::new(config);
        let client = Arc::new(client);
        let dispatcher = Arc::new(MessageDispatcher::new());

        let manager = ConnectionManager::new(
            Arc::clone(&config),
            Arc::clone(&client),
            Arc::clone(&dispatcher),
            options.reconnect.clone(),
            options.tick_interval,
        );
        let publisher = Publisher::new(
            Arc::clone(&client),
            manager.subscribe_state(),
            config.default_qos,
            options.publish_timeout,
        );

        Self {
            config,
            client,
            options,
            dispatcher,
            manager,
            publisher,
        }
    }

    /// Register the message handler at construction
    pub fn with_handler(self, handler: Arc<dyn MessageHandler>) -> Self {
        self.dispatcher.set_handler(handler);
        self
    }

    pub fn set_handler(&self, handler: Arc<dyn MessageHandler>) {
        self.dispatcher.set_handler(handler);
    }

    pub async fn start(&self) {
        self.manager.start().await;
    }

    pub async fn stop(&self) {
        self.manager.stop().await;
    }

    pub async fn publish(
        &self,
        topic: impl Into<String>,
        payload: impl Into<Payload>,
        qos: Option<QoS>,
        retain: bool,
    ) -> PublishOutcome {
        self.publisher.publish(topic, payload, qos, retain).await
    }

    pub async fn publish_json<T: Serialize + ?Sized>(
        &self,
        topic: impl Into<String>,
        value: &T,
        qos: Option<QoS>,
        retain: bool,
    ) -> PublishOutcome {
        self.publisher.publish_json(topic, value, qos, retain).await
    }

    pub async fn send(&self, message: OutboundMessage) -> PublishOutcome {
        self.publisher.send(message).await
    }

    pub fn state(&self) -> ConnectionState {
        self.manager.state()
    }

    pub fn subscribe_state(&self) -> watch::Receiver<ConnectionState> {
        self.manager.subscribe_state()
    }

    pub fn is_connected(&self) -> bool {
        self.manager.is_connected()
    }

    pub fn is_running(&self) -> bool {
        self.manager.is_running()
    }

    pub async fn is_ticking(&self) -> bool {
        self.manager.is_ticking().await
    }

    pub fn is_permanently_disconnected(&self) -> bool {
        self.manager.is_permanently_disconnected()
    }

    /// Cloneable publish handle for other tasks
    pub fn publisher(&self) -> Publisher<C> {
        self.publisher.clone()
    }

    pub fn dispatcher(&self) -> &Arc<MessageDispatcher> {
        &self.dispatcher
    }

    pub fn config(&self) -> &MqttConfig {
        &self.config
    }

    pub fn options(&self) -> &SessionOptions {
        &self.options
    }

    pub fn client(&self) -> &Arc<C> {
        &self.client
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{wait_for_state, MockProtocolClient};
    use crate::transport::InboundMessage;
    use serde_json::json;
    use std::sync::Mutex;

    fn fast_options() -> SessionOptions {
        SessionOptions::default()
            .with_tick_interval(Duration::from_millis(5))
            .with_publish_timeout(Duration::from_millis(500))
    }

    #[tokio::test]
    async fn test_scenario_connect_and_subscribe() {
        let config = MqttConfig::new("test-broker", "session-test").with_subscribe_topics(["a/b"]);
        let session = MqttSession::with_options(config, MockProtocolClient::new(), fast_options());
        let mut state_rx = session.subscribe_state();

        session.start().await;

        assert!(
            wait_for_state(&mut state_rx, ConnectionState::is_connected, Duration::from_secs(2))
                .await
        );
        assert_eq!(
            session.client().get_subscriptions(),
            vec![("a/b".to_string(), QoS::AtMostOnce)]
        );
        session.stop().await;
    }

    #[tokio::test]
    async fn test_scenario_publish_structured_retained() {
        let config = MqttConfig::new("test-broker", "session-test");
        let session = MqttSession::with_options(config, MockProtocolClient::new(), fast_options());
        session.start().await;

        let outcome = session.publish("x/y", json!({"v": 1}), None, true).await;

        assert_eq!(outcome, PublishOutcome::Queued);
        let published = session.client().get_published_messages();
        assert_eq!(published.len(), 1);
        assert_eq!(published[0].topic, "x/y");
        assert_eq!(published[0].payload_str(), "{\"v\": 1}");
        assert!(published[0].retain);
        session.stop().await;
    }

    #[tokio::test]
    async fn test_handler_receives_inbound_messages() {
        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&received);

        let config = MqttConfig::new("test-broker", "session-test").with_subscribe_topics(["a/b"]);
        let session = MqttSession::with_options(config, MockProtocolClient::new(), fast_options())
            .with_handler(Arc::new(
                move |message: &InboundMessage| -> Result<(), HandlerError> {
                    sink.lock().unwrap().push(message.payload_str().into_owned());
                    Ok(())
                },
            ));
        session.start().await;
        session.client().push_message("a/b", "hello");

        assert!(
            crate::testing::wait_until(
                || session.dispatcher().dispatched_count() == 1,
                Duration::from_secs(2)
            )
            .await
        );
        assert_eq!(*received.lock().unwrap(), vec!["hello"]);
        session.stop().await;
    }
}

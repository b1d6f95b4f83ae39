//! MQTT 3.1.1 transport backed by `rumqttc`
//!
//! The module separates pure functions from I/O:
//!
//! - [`connection`] - connection state, reconnect policy and option mapping
//! - [`health_monitor`] - reconnection decisions and state transitions
//! - [`routing`] - translation of `rumqttc` events into [`ProtocolEvent`]s
//! - [`client`] - the [`RumqttClient`] adapter that performs the I/O
//!
//! [`ProtocolEvent`]: crate::transport::ProtocolEvent
//!
//! # Usage
//!
//! ```rust,no_run
//! use lightpanel::config::MqttConfig;
//! use lightpanel::session::MqttSession;
//! use lightpanel::transport::mqtt::RumqttClient;
//!
//! # tokio_test::block_on(async {
//! let config = MqttConfig::new("broker.hivemq.com", "panel-7f3a")
//!     .with_subscribe_topics(["lightpanel/demo/light/state"]);
//!
//! let session = MqttSession::new(config, RumqttClient::new());
//! session.start().await;
//! session.stop().await;
//! # });
//! ```

pub mod client;
pub mod connection;
pub mod health_monitor;
pub mod routing;

pub use client::RumqttClient;
pub use connection::{configure_mqtt_options, ConnectionState, MqttError, ReconnectPolicy};
pub use health_monitor::{ConnectionEvent, HealthMonitor, ReconnectionDecision};
pub use routing::EventRouter;

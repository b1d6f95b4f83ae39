//! Test helpers and utilities for integration tests

use lightpanel::config::MqttConfig;
use lightpanel::session::{HandlerError, MessageHandler, MqttSession, SessionOptions};
use lightpanel::testing::MockProtocolClient;
use lightpanel::transport::mqtt::ReconnectPolicy;
use lightpanel::transport::InboundMessage;
use std::sync::{Arc, Mutex};
use std::time::Duration;

/// Upper bound for any condition a test waits on
#[allow(dead_code)]
pub const WAIT: Duration = Duration::from_secs(2);

/// Create a session record for the given subscriptions
#[allow(dead_code)]
pub fn test_mqtt_config(topics: &[&str]) -> MqttConfig {
    MqttConfig::new("test-broker", "lightpanel-it").with_subscribe_topics(topics.iter().copied())
}

/// Reconnect quickly and deterministically
#[allow(dead_code)]
pub fn fast_reconnect() -> ReconnectPolicy {
    ReconnectPolicy {
        initial_delay_ms: 10,
        max_delay_ms: 40,
        jitter: 0.0,
        ..ReconnectPolicy::default()
    }
}

/// Short tick and publish timeout so tests finish fast
#[allow(dead_code)]
pub fn fast_options() -> SessionOptions {
    SessionOptions::default()
        .with_tick_interval(Duration::from_millis(5))
        .with_publish_timeout(Duration::from_millis(300))
        .with_reconnect(fast_reconnect())
}

#[allow(dead_code)]
pub fn mock_session(
    client: MockProtocolClient,
    topics: &[&str],
    options: SessionOptions,
) -> MqttSession<MockProtocolClient> {
    MqttSession::with_options(test_mqtt_config(topics), client, options)
}

/// Handler that records every message it sees
#[allow(dead_code)]
pub fn recording_handler() -> (Arc<Mutex<Vec<InboundMessage>>>, Arc<dyn MessageHandler>) {
    let received = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&received);
    let handler = move |message: &InboundMessage| -> Result<(), HandlerError> {
        sink.lock().unwrap().push(message.clone());
        Ok(())
    };
    (received, Arc::new(handler))
}

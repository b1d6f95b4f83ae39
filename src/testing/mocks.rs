//! Mock implementations for testing
//!
//! [`MockProtocolClient`] is a scriptable in-memory [`ProtocolClient`]: it
//! records every subscribe and publish, answers `connect` with a queued
//! acknowledgement, and replays events pushed by the test.

use crate::config::MqttConfig;
use crate::transport::mqtt::{ConnectionState, MqttError};
use crate::transport::{
    ConnAckCode, DisconnectReason, InboundMessage, ProtocolClient, ProtocolEvent, QoS,
};
use async_trait::async_trait;
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::watch;

/// Message handed to the mock's enqueue primitive
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublishedMessage {
    pub topic: String,
    pub payload: Vec<u8>,
    pub qos: QoS,
    pub retain: bool,
}

impl PublishedMessage {
    pub fn payload_str(&self) -> String {
        String::from_utf8_lossy(&self.payload).into_owned()
    }
}

/// Mock protocol client for testing
#[derive(Debug)]
pub struct MockProtocolClient {
    pub subscriptions: Arc<Mutex<Vec<(String, QoS)>>>,
    /// Every topic handed to `subscribe`, including the ones that failed
    pub subscribe_attempts: Arc<Mutex<Vec<String>>>,
    pub published_messages: Arc<Mutex<Vec<PublishedMessage>>>,
    pub connected_with: Arc<Mutex<Vec<MqttConfig>>>,
    events: Mutex<VecDeque<Result<ProtocolEvent, String>>>,
    connack: Mutex<Option<ConnAckCode>>,
    fail_connect: AtomicBool,
    failing_connects: AtomicUsize,
    fail_publish: AtomicBool,
    fail_subscribe: AtomicBool,
    failing_topics: Mutex<Vec<String>>,
    fail_disconnect: AtomicBool,
    connect_calls: AtomicUsize,
    disconnect_calls: AtomicUsize,
    poll_calls: AtomicUsize,
}

impl Default for MockProtocolClient {
    fn default() -> Self {
        Self::new()
    }
}

impl MockProtocolClient {
    /// Mock whose `connect` is acknowledged with `Accepted`
    pub fn new() -> Self {
        Self {
            subscriptions: Arc::new(Mutex::new(Vec::new())),
            subscribe_attempts: Arc::new(Mutex::new(Vec::new())),
            published_messages: Arc::new(Mutex::new(Vec::new())),
            connected_with: Arc::new(Mutex::new(Vec::new())),
            events: Mutex::new(VecDeque::new()),
            connack: Mutex::new(Some(ConnAckCode::Accepted)),
            fail_connect: AtomicBool::new(false),
            failing_connects: AtomicUsize::new(0),
            fail_publish: AtomicBool::new(false),
            fail_subscribe: AtomicBool::new(false),
            failing_topics: Mutex::new(Vec::new()),
            fail_disconnect: AtomicBool::new(false),
            connect_calls: AtomicUsize::new(0),
            disconnect_calls: AtomicUsize::new(0),
            poll_calls: AtomicUsize::new(0),
        }
    }

    /// Mock whose `connect` succeeds but the broker never answers
    pub fn silent() -> Self {
        let mock = Self::new();
        mock.set_connack(None);
        mock
    }

    /// Mock whose `connect` is answered with the given code
    pub fn with_connack(code: ConnAckCode) -> Self {
        let mock = Self::new();
        mock.set_connack(Some(code));
        mock
    }

    /// Mock whose `connect` cannot be initiated
    pub fn with_connect_failure() -> Self {
        let mock = Self::new();
        mock.set_fail_connect(true);
        mock
    }

    pub fn set_connack(&self, code: Option<ConnAckCode>) {
        *lock(&self.connack) = code;
    }

    pub fn set_fail_connect(&self, fail: bool) {
        self.fail_connect.store(fail, Ordering::SeqCst);
    }

    /// Fail the next `count` connect calls, then succeed again
    pub fn fail_next_connects(&self, count: usize) {
        self.failing_connects.store(count, Ordering::SeqCst);
    }

    pub fn set_fail_publish(&self, fail: bool) {
        self.fail_publish.store(fail, Ordering::SeqCst);
    }

    pub fn set_fail_subscribe(&self, fail: bool) {
        self.fail_subscribe.store(fail, Ordering::SeqCst);
    }

    /// Reject every subscribe request for `topic`
    pub fn fail_subscribe_to(&self, topic: &str) {
        lock(&self.failing_topics).push(topic.to_string());
    }

    pub fn set_fail_disconnect(&self, fail: bool) {
        self.fail_disconnect.store(fail, Ordering::SeqCst);
    }

    /// Queue an event for a later `poll_event`
    pub fn push_event(&self, event: ProtocolEvent) {
        lock(&self.events).push_back(Ok(event));
    }

    pub fn push_message(&self, topic: &str, payload: &str) {
        self.push_event(ProtocolEvent::Message(InboundMessage::new(
            topic.to_string(),
            payload.as_bytes().to_vec(),
        )));
    }

    pub fn push_broker_disconnect(&self) {
        self.push_event(ProtocolEvent::Disconnected(DisconnectReason::ByBroker));
    }

    /// Queue a failed network step
    pub fn push_network_error(&self, error: &str) {
        lock(&self.events).push_back(Err(error.to_string()));
    }

    pub fn pending_events(&self) -> usize {
        lock(&self.events).len()
    }

    pub fn get_subscriptions(&self) -> Vec<(String, QoS)> {
        lock(&self.subscriptions).clone()
    }

    pub fn get_published_messages(&self) -> Vec<PublishedMessage> {
        lock(&self.published_messages).clone()
    }

    pub fn get_subscribe_attempts(&self) -> Vec<String> {
        lock(&self.subscribe_attempts).clone()
    }

    pub fn connect_calls(&self) -> usize {
        self.connect_calls.load(Ordering::SeqCst)
    }

    pub fn disconnect_calls(&self) -> usize {
        self.disconnect_calls.load(Ordering::SeqCst)
    }

    pub fn poll_calls(&self) -> usize {
        self.poll_calls.load(Ordering::SeqCst)
    }

    fn connect_should_fail(&self) -> bool {
        if self.fail_connect.load(Ordering::SeqCst) {
            return true;
        }
        self.failing_connects
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl ProtocolClient for MockProtocolClient {
    type Error = MqttError;

    async fn connect(&self, config: &MqttConfig) -> Result<(), Self::Error> {
        self.connect_calls.fetch_add(1, Ordering::SeqCst);
        if self.connect_should_fail() {
            return Err(MqttError::ConnectionFailed(
                "Mock connection failure".to_string().into(),
            ));
        }

        lock(&self.connected_with).push(config.clone());
        if let Some(code) = *lock(&self.connack) {
            self.push_event(ProtocolEvent::ConnAck(code));
        }
        Ok(())
    }

    async fn disconnect(&self) -> Result<(), Self::Error> {
        self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        if self.fail_disconnect.load(Ordering::SeqCst) {
            return Err(MqttError::Network("Mock disconnect failure".to_string()));
        }
        Ok(())
    }

    fn subscribe(&self, topic: &str, qos: QoS) -> Result<(), Self::Error> {
        lock(&self.subscribe_attempts).push(topic.to_string());
        let rejected = lock(&self.failing_topics)
            .iter()
            .any(|failing| failing == topic);
        if rejected || self.fail_subscribe.load(Ordering::SeqCst) {
            return Err(MqttError::SubscriptionFailed(
                "Mock subscribe failure".to_string().into(),
            ));
        }
        lock(&self.subscriptions).push((topic.to_string(), qos));
        Ok(())
    }

    fn publish(
        &self,
        topic: &str,
        payload: Vec<u8>,
        qos: QoS,
        retain: bool,
    ) -> Result<(), Self::Error> {
        if self.fail_publish.load(Ordering::SeqCst) {
            return Err(MqttError::PublishFailed(
                "Mock publish failure".to_string().into(),
            ));
        }
        lock(&self.published_messages).push(PublishedMessage {
            topic: topic.to_string(),
            payload,
            qos,
            retain,
        });
        Ok(())
    }

    async fn poll_event(&self) -> Result<Option<ProtocolEvent>, Self::Error> {
        self.poll_calls.fetch_add(1, Ordering::SeqCst);
        match lock(&self.events).pop_front() {
            Some(Ok(event)) => Ok(Some(event)),
            Some(Err(error)) => Err(MqttError::Network(error)),
            None => Ok(None),
        }
    }
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

/// Wait until the observed state satisfies `predicate`; false on timeout
pub async fn wait_for_state<F>(
    state_rx: &mut watch::Receiver<ConnectionState>,
    predicate: F,
    timeout: Duration,
) -> bool
where
    F: Fn(&ConnectionState) -> bool,
{
    tokio::time::timeout(timeout, async {
        loop {
            let matched = predicate(&*state_rx.borrow_and_update());
            if matched {
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

/// Poll `condition` every few milliseconds; false on timeout
pub async fn wait_until<F>(condition: F, timeout: Duration) -> bool
where
    F: Fn() -> bool,
{
    tokio::time::timeout(timeout, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .is_ok()
}

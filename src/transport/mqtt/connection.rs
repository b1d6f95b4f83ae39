//! Pure connection state management for the MQTT session
//!
//! This module contains the observable connection state, the reconnect policy
//! with its backoff arithmetic, the transport error type and the mapping from
//! [`MqttConfig`] to `rumqttc` options.

use crate::config::MqttConfig;
use rand::Rng;
use rumqttc::MqttOptions;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;
use thiserror::Error;

/// Connection state of a session
#[derive(Debug, Clone, PartialEq, Default)]
pub enum ConnectionState {
    /// Not started, or stopped by the caller
    #[default]
    Stopped,
    /// Connect issued, waiting for the broker's acknowledgement
    Connecting,
    /// Acknowledged by the broker; publishing is allowed
    Connected,
    /// Attempting to reconnect (attempt count)
    Reconnecting(u32),
    /// Disconnected with reason
    Disconnected(String),
    /// Reconnect budget exhausted
    PermanentlyDisconnected(String),
}

impl ConnectionState {
    pub fn is_connected(&self) -> bool {
        matches!(self, ConnectionState::Connected)
    }

    /// States the session cannot leave without `stop()` followed by `start()`
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            ConnectionState::Disconnected(_) | ConnectionState::PermanentlyDisconnected(_)
        )
    }
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConnectionState::Stopped => write!(f, "stopped"),
            ConnectionState::Connecting => write!(f, "connecting"),
            ConnectionState::Connected => write!(f, "connected"),
            ConnectionState::Reconnecting(attempt) => write!(f, "reconnecting (attempt {attempt})"),
            ConnectionState::Disconnected(reason) => write!(f, "disconnected: {reason}"),
            ConnectionState::PermanentlyDisconnected(reason) => {
                write!(f, "permanently disconnected: {reason}")
            }
        }
    }
}

/// Automatic reconnection after an unexpected disconnect
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReconnectPolicy {
    pub enabled: bool,
    /// Delay before the first attempt
    pub initial_delay_ms: u64,
    /// Upper bound for the un-jittered delay
    pub max_delay_ms: u64,
    /// Growth factor between attempts
    pub multiplier: f64,
    /// Random spread applied to each delay, as a fraction (0.2 = +/-20%)
    pub jitter: f64,
    /// Maximum number of reconnection attempts (None = unlimited)
    pub max_attempts: Option<u32>,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            enabled: true,
            initial_delay_ms: 250,
            max_delay_ms: 30_000,
            multiplier: 2.0,
            jitter: 0.2,
            max_attempts: None,
        }
    }
}

impl ReconnectPolicy {
    pub fn disabled() -> Self {
        Self {
            enabled: false,
            ..Self::default()
        }
    }

    /// Un-jittered delay for a 1-based attempt number
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.initial_delay_ms as f64 * self.multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Jittered delay drawn from the given generator
    pub fn backoff_delay_with<R: Rng + ?Sized>(&self, attempt: u32, rng: &mut R) -> Duration {
        let base = self.base_delay(attempt).as_millis() as f64;
        let spread = self.jitter.clamp(0.0, 1.0);
        let factor = if spread > 0.0 {
            1.0 + rng.gen_range(-spread..=spread)
        } else {
            1.0
        };
        Duration::from_millis((base * factor).max(0.0) as u64)
    }

    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.backoff_delay_with(attempt, &mut rand::thread_rng())
    }
}

/// MQTT transport errors
#[derive(Debug, Error)]
pub enum MqttError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Publishing failed: {0}")]
    PublishFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Subscription failed: {0}")]
    SubscriptionFailed(#[source] Box<dyn std::error::Error + Send + Sync>),
    #[error("Invalid broker address: {0}")]
    InvalidBrokerAddress(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Not connected - current state: {state}")]
    NotConnected { state: ConnectionState },
    #[error("Network error: {0}")]
    Network(String),
}

/// Pure function to build `rumqttc` options from a validated configuration
pub fn configure_mqtt_options(config: &MqttConfig) -> MqttOptions {
    let mut mqtt_options = MqttOptions::new(
        config.client_id.clone(),
        config.broker_host.clone(),
        config.broker_port,
    );

    mqtt_options.set_keep_alive(config.keepalive());
    mqtt_options.set_clean_session(true);

    if let Some(credentials) = &config.credentials {
        mqtt_options.set_credentials(credentials.username.clone(), credentials.password.clone());
    }

    mqtt_options
}

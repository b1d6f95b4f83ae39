//! Pure reconnection and state-transition logic for the MQTT session
//!
//! Nothing in here performs I/O. The session's background tick feeds
//! [`ConnectionEvent`]s through [`HealthMonitor::determine_next_state`] and asks
//! [`HealthMonitor::should_attempt_reconnection`] what to do after a loss.

use super::connection::{ConnectionState, ReconnectPolicy};
use crate::transport::ConnAckCode;
use std::time::Duration;
use tracing::{debug, error, info, warn};

/// Pure health monitoring and reconnection decision logic
pub struct HealthMonitor;

impl HealthMonitor {
    /// Determine if reconnection should be attempted (pure apart from jitter)
    pub fn should_attempt_reconnection(
        current_attempts: u32,
        policy: &ReconnectPolicy,
        shutdown_requested: bool,
    ) -> ReconnectionDecision {
        if shutdown_requested {
            return ReconnectionDecision::AbortShutdownRequested;
        }

        if !policy.enabled {
            return ReconnectionDecision::AbortDisabled;
        }

        if let Some(max_attempts) = policy.max_attempts {
            if current_attempts >= max_attempts {
                return ReconnectionDecision::AbortMaxAttemptsExceeded;
            }
        }

        let attempt = current_attempts.saturating_add(1);
        ReconnectionDecision::Proceed {
            attempt,
            delay: policy.backoff_delay(attempt),
        }
    }

    /// Determine next state after a connection event. A stopped session only
    /// leaves `Stopped` through a connect request; late network events are ignored.
    pub fn determine_next_state(
        current_state: &ConnectionState,
        event: ConnectionEvent,
    ) -> ConnectionState {
        if *current_state == ConnectionState::Stopped
            && !matches!(
                event,
                ConnectionEvent::ConnectRequested
                    | ConnectionEvent::StopRequested
                    | ConnectionEvent::StartFailed
            )
        {
            debug!(event = ?event, "Ignoring connection event while stopped");
            return ConnectionState::Stopped;
        }

        match event {
            ConnectionEvent::ConnectRequested => ConnectionState::Connecting,
            ConnectionEvent::ConnectFailed(error) => ConnectionState::Disconnected(error),
            ConnectionEvent::ConnAckAccepted => ConnectionState::Connected,
            ConnectionEvent::ConnAckRefused(code) => {
                ConnectionState::Disconnected(format!("connection refused: {code}"))
            }
            ConnectionEvent::DisconnectedByBroker => {
                ConnectionState::Disconnected("broker closed the connection".to_string())
            }
            ConnectionEvent::NetworkError(error) => ConnectionState::Disconnected(error),
            ConnectionEvent::ReconnectionStarted(attempt) => ConnectionState::Reconnecting(attempt),
            ConnectionEvent::PermanentFailure(reason) => {
                ConnectionState::PermanentlyDisconnected(reason)
            }
            ConnectionEvent::StopRequested | ConnectionEvent::StartFailed => {
                ConnectionState::Stopped
            }
        }
    }

    /// Check if connection state allows publishing
    pub fn can_publish(state: &ConnectionState) -> bool {
        state.is_connected()
    }

    /// Log connection state transition
    pub fn log_state_transition(from: &ConnectionState, to: &ConnectionState) {
        if from == to {
            return;
        }

        match (from, to) {
            (ConnectionState::Reconnecting(_), ConnectionState::Connected) => {
                info!("Reconnection successful");
            }
            (_, ConnectionState::Connected) => {
                info!("MQTT connection established");
            }
            (ConnectionState::Connected, ConnectionState::Disconnected(reason)) => {
                warn!(reason = %reason, "MQTT connection lost");
            }
            (ConnectionState::Disconnected(_), ConnectionState::Reconnecting(attempt)) => {
                info!(attempt, "Starting reconnection attempt");
            }
            (_, ConnectionState::PermanentlyDisconnected(reason)) => {
                error!(reason = %reason, "MQTT connection permanently failed");
            }
            _ => {
                debug!(from = %from, to = %to, "MQTT connection state changed");
            }
        }
    }

    /// Validate reconnect policy
    pub fn validate_reconnect_policy(policy: &ReconnectPolicy) -> Result<(), String> {
        if let Some(max_attempts) = policy.max_attempts {
            if max_attempts == 0 {
                return Err(
                    "reconnect.max_attempts must be greater than 0, or omitted for unlimited"
                        .to_string(),
                );
            }
        }

        if policy.initial_delay_ms == 0 {
            return Err("reconnect.initial_delay_ms must be greater than 0".to_string());
        }

        if policy.max_delay_ms < policy.initial_delay_ms {
            return Err("reconnect.max_delay_ms must not be below initial_delay_ms".to_string());
        }

        if !policy.multiplier.is_finite() || policy.multiplier < 1.0 {
            return Err("reconnect.multiplier must be at least 1.0".to_string());
        }

        if !(0.0..=1.0).contains(&policy.jitter) {
            return Err("reconnect.jitter must be between 0.0 and 1.0".to_string());
        }

        Ok(())
    }
}

/// Decision result for reconnection attempts
#[derive(Debug, PartialEq)]
pub enum ReconnectionDecision {
    /// Wait `delay`, then make attempt number `attempt`
    Proceed { attempt: u32, delay: Duration },
    /// Abort reconnection - shutdown requested
    AbortShutdownRequested,
    /// Abort reconnection - policy disabled
    AbortDisabled,
    /// Abort reconnection - max attempts exceeded
    AbortMaxAttemptsExceeded,
}

/// Connection events that trigger state transitions
#[derive(Debug, Clone, PartialEq)]
pub enum ConnectionEvent {
    ConnectRequested,
    /// Client could not initiate a connection
    ConnectFailed(String),
    ConnAckAccepted,
    ConnAckRefused(ConnAckCode),
    DisconnectedByBroker,
    /// Network or protocol error
    NetworkError(String),
    ReconnectionStarted(u32),
    /// No more retries
    PermanentFailure(String),
    StopRequested,
    /// `start()` could not initiate a connection
    StartFailed,
}

//! Crate-level error types for the light panel
//!
//! Session operations never return these: lifecycle, dispatch and publish
//! failures are logged and reported as values. `PanelError` covers what the
//! shell and the panel handler can fail on.

use crate::config::ConfigError;
use crate::transport::mqtt::MqttError;
use thiserror::Error;

/// Main error type for light panel operations
#[derive(Debug, Error)]
pub enum PanelError {
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    #[error("Transport error: {0}")]
    Transport(#[from] MqttError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid payload on {topic}: {source}")]
    InvalidPayload {
        topic: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("Invalid command: {message}")]
    InvalidCommand { message: String },
}

impl PanelError {
    pub fn invalid_payload(topic: impl Into<String>, source: serde_json::Error) -> Self {
        Self::InvalidPayload {
            topic: topic.into(),
            source,
        }
    }

    pub fn invalid_command<S: Into<String>>(message: S) -> Self {
        Self::InvalidCommand {
            message: message.into(),
        }
    }
}

/// Result type for light panel operations
pub type PanelResult<T> = Result<T, PanelError>;

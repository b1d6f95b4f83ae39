//! Lightpanel - MQTT session wrapper and toggle-light panel
//!
//! # Overview
//!
//! This crate provides a small, reusable MQTT session plus the demo that drives it:
//! - Connection lifecycle with a background network tick and automatic reconnection
//! - Topic subscription on every (re)connect and message dispatch to an injected handler
//! - Publishing that waits for the connected condition, with structured JSON payloads
//! - A headless toggle-light panel bound to `{base}/light/state` and `{base}/light/set`
//!
//! # Quick Start
//!
//! ```rust
//! use lightpanel::light::{LightPanel, LightState};
//! use lightpanel::transport::InboundMessage;
//! use lightpanel::session::MessageHandler;
//!
//! let panel = LightPanel::new("demo/light/state", "demo/light/set");
//! panel
//!     .handle(&InboundMessage::new("demo/light/state", r#"{"state": "on"}"#))
//!     .unwrap();
//! assert_eq!(panel.view().state, LightState::On);
//!
//! // Ask the light to switch off
//! let command = panel.toggle_command();
//! assert_eq!(command.topic, "demo/light/set");
//! assert_eq!(command.payload.encode().unwrap(), br#"{"state": "OFF"}"#.to_vec());
//! ```

pub mod config;
pub mod error;
pub mod light;
pub mod observability;
pub mod session;
pub mod testing;
pub mod transport;

pub use config::{AppConfig, MqttConfig};
pub use error::{PanelError, PanelResult};
pub use light::{LightPanel, LightState, PanelCommand, PanelView};
pub use session::{MqttSession, OutboundMessage, Payload, PublishOutcome, SessionOptions};
pub use transport::mqtt::{ConnectionState, RumqttClient};
pub use transport::{EventSink, InboundMessage, ProtocolClient, QoS};

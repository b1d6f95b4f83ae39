//! Toggle-light control panel
//!
//! Headless model of the panel: it consumes `{"state": "ON"|"OFF"}` reports
//! from the light topics, exposes the rendered view through a watch channel,
//! and builds the command messages the shell publishes.

use crate::config::LightSection;
use crate::error::{PanelError, PanelResult};
use crate::session::{HandlerError, MessageHandler, OutboundMessage};
use crate::transport::InboundMessage;
use chrono::{DateTime, Local};
use serde::Deserialize;
use serde_json::json;
use std::fmt;
use std::str::FromStr;
use tokio::sync::watch;
use tracing::{debug, info};

/// Last state reported for the light
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LightState {
    /// No report received yet
    #[default]
    Unknown,
    On,
    Off,
}

impl LightState {
    /// `"ON"` in any case is on; any other text is off
    pub fn from_state_value(value: &str) -> Self {
        if value.trim().eq_ignore_ascii_case("on") {
            LightState::On
        } else {
            LightState::Off
        }
    }

    /// State a toggle asks for: on becomes off, anything else becomes on
    pub fn toggled(self) -> Self {
        match self {
            LightState::On => LightState::Off,
            LightState::Off | LightState::Unknown => LightState::On,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            LightState::Unknown => "UNKNOWN",
            LightState::On => "ON",
            LightState::Off => "OFF",
        }
    }

    pub fn is_on(self) -> bool {
        self == LightState::On
    }
}

impl fmt::Display for LightState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What the panel shows
#[derive(Debug, Clone, PartialEq, Default)]
pub struct PanelView {
    pub state: LightState,
    pub last_updated: Option<DateTime<Local>>,
    /// Toggling stays disabled until the first report arrives
    pub toggle_enabled: bool,
}

impl PanelView {
    pub fn status_line(&self) -> String {
        match self.last_updated {
            None => "Waiting for status...".to_string(),
            Some(at) => format!(
                "Light is {} (last update: {})",
                self.state,
                at.format("%H:%M:%S")
            ),
        }
    }
}

#[derive(Debug, Deserialize)]
struct StateReport {
    state: Option<String>,
}

/// Panel bound to one light's state and command topics
pub struct LightPanel {
    view_tx: watch::Sender<PanelView>,
    state_topic: String,
    command_topic: String,
}

impl LightPanel {
    pub fn new(state_topic: impl Into<String>, command_topic: impl Into<String>) -> Self {
        let (view_tx, _) = watch::channel(PanelView::default());
        Self {
            view_tx,
            state_topic: state_topic.into(),
            command_topic: command_topic.into(),
        }
    }

    pub fn from_section(section: &LightSection) -> Self {
        Self::new(section.state_topic(), section.command_topic())
    }

    pub fn state_topic(&self) -> &str {
        &self.state_topic
    }

    pub fn command_topic(&self) -> &str {
        &self.command_topic
    }

    pub fn view(&self) -> PanelView {
        self.view_tx.borrow().clone()
    }

    pub fn subscribe(&self) -> watch::Receiver<PanelView> {
        self.view_tx.subscribe()
    }

    fn is_light_topic(&self, topic: &str) -> bool {
        topic == self.state_topic || topic == self.command_topic
    }

    /// Apply a report received on `topic`. Returns whether the view changed;
    /// reports without a `state` field and other topics are ignored.
    pub fn apply_payload(&self, topic: &str, payload: &[u8]) -> PanelResult<bool> {
        if !self.is_light_topic(topic) {
            debug!(topic = %topic, "Ignoring message outside the light topics");
            return Ok(false);
        }

        let report: StateReport = serde_json::from_slice(payload)
            .map_err(|e| PanelError::invalid_payload(topic, e))?;

        match report.state {
            Some(value) => {
                self.apply_state(LightState::from_state_value(&value));
                Ok(true)
            }
            None => {
                debug!(topic = %topic, "Report without state field ignored");
                Ok(false)
            }
        }
    }

    /// Record a state report at the current local time
    pub fn apply_state(&self, state: LightState) {
        self.view_tx.send_replace(PanelView {
            state,
            last_updated: Some(Local::now()),
            toggle_enabled: true,
        });
        info!(state = %state, "Light state updated");
    }

    /// Command message asking the light to flip
    pub fn toggle_command(&self) -> OutboundMessage {
        let next = self.view().state.toggled();
        self.set_command(next.is_on())
    }

    pub fn set_command(&self, on: bool) -> OutboundMessage {
        let state = if on { LightState::On } else { LightState::Off };
        OutboundMessage::new(self.command_topic.clone(), json!({ "state": state.as_str() }))
    }

    /// Retained OFF report published at startup
    pub fn initial_state_message(&self) -> OutboundMessage {
        OutboundMessage::new(
            self.state_topic.clone(),
            json!({ "state": LightState::Off.as_str() }),
        )
        .retained()
    }
}

impl MessageHandler for LightPanel {
    fn handle(&self, message: &InboundMessage) -> Result<(), HandlerError> {
        self.apply_payload(&message.topic, &message.payload)?;
        Ok(())
    }
}

/// Terminal command understood by the shell
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PanelCommand {
    Toggle,
    On,
    Off,
    Status,
    Help,
    Quit,
}

impl FromStr for PanelCommand {
    type Err = PanelError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        match input.trim().to_lowercase().as_str() {
            "toggle" | "t" => Ok(PanelCommand::Toggle),
            "on" => Ok(PanelCommand::On),
            "off" => Ok(PanelCommand::Off),
            "status" | "s" => Ok(PanelCommand::Status),
            "help" | "h" | "?" => Ok(PanelCommand::Help),
            "quit" | "q" | "exit" => Ok(PanelCommand::Quit),
            other => Err(PanelError::invalid_command(other)),
        }
    }
}

impl PanelCommand {
    pub fn parse(input: &str) -> PanelResult<Self> {
        input.parse()
    }

    pub const HELP: &'static str = "commands: toggle | on | off | status | help | quit";
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::Payload;

    fn panel() -> LightPanel {
        LightPanel::new("demo/light/state", "demo/light/set")
    }

    #[test]
    fn test_state_parsing() {
        assert_eq!(LightState::from_state_value("ON"), LightState::On);
        assert_eq!(LightState::from_state_value("on"), LightState::On);
        assert_eq!(LightState::from_state_value("OFF"), LightState::Off);
        assert_eq!(LightState::from_state_value("dimmed"), LightState::Off);
    }

    #[test]
    fn test_toggle_rules() {
        assert_eq!(LightState::On.toggled(), LightState::Off);
        assert_eq!(LightState::Off.toggled(), LightState::On);
        assert_eq!(LightState::Unknown.toggled(), LightState::On);
    }

    #[test]
    fn test_initial_view() {
        let view = panel().view();
        assert_eq!(view.state, LightState::Unknown);
        assert!(!view.toggle_enabled);
        assert_eq!(view.status_line(), "Waiting for status...");
    }

    #[test]
    fn test_apply_payload_updates_view() {
        let panel = panel();
        let mut view_rx = panel.subscribe();

        assert!(panel
            .apply_payload("demo/light/state", br#"{"state": "on"}"#)
            .unwrap());

        assert!(view_rx.has_changed().unwrap());
        let view = view_rx.borrow_and_update().clone();
        assert_eq!(view.state, LightState::On);
        assert!(view.toggle_enabled);
        assert!(view.last_updated.is_some());
        assert!(view.status_line().starts_with("Light is ON"));
    }

    #[test]
    fn test_apply_payload_ignores_irrelevant_messages() {
        let panel = panel();

        assert!(!panel
            .apply_payload("demo/light/state", br#"{"brightness": 3}"#)
            .unwrap());
        assert!(!panel
            .apply_payload("other/topic", br#"{"state": "ON"}"#)
            .unwrap());
        assert_eq!(panel.view().state, LightState::Unknown);
    }

    #[test]
    fn test_apply_payload_rejects_bad_json() {
        let panel = panel();

        let result = panel.apply_payload("demo/light/set", b"not json");
        assert!(matches!(result, Err(PanelError::InvalidPayload { .. })));

        let result = panel.apply_payload("demo/light/set", br#"{"state": 1}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_command_topic_echo_updates_view() {
        let panel = panel();
        panel
            .handle(&InboundMessage::new("demo/light/set", r#"{"state": "OFF"}"#))
            .unwrap();
        assert_eq!(panel.view().state, LightState::Off);
    }

    #[test]
    fn test_toggle_command() {
        let panel = panel();

        let command = panel.toggle_command();
        assert_eq!(command.topic, "demo/light/set");
        assert_eq!(command.payload, Payload::Structured(json!({"state": "ON"})));
        assert!(!command.retain);

        panel.apply_state(LightState::On);
        let command = panel.toggle_command();
        assert_eq!(
            command.payload.encode().unwrap(),
            br#"{"state": "OFF"}"#.to_vec()
        );
    }

    #[test]
    fn test_initial_state_message() {
        let message = panel().initial_state_message();
        assert_eq!(message.topic, "demo/light/state");
        assert!(message.retain);
        assert_eq!(message.qos, None);
        assert_eq!(message.payload.encode().unwrap(), br#"{"state": "OFF"}"#.to_vec());
    }

    #[test]
    fn test_command_parsing() {
        assert_eq!(PanelCommand::parse("toggle").unwrap(), PanelCommand::Toggle);
        assert_eq!(PanelCommand::parse(" ON ").unwrap(), PanelCommand::On);
        assert_eq!(PanelCommand::parse("q").unwrap(), PanelCommand::Quit);
        assert!(matches!(
            PanelCommand::parse("blink"),
            Err(PanelError::InvalidCommand { .. })
        ));
    }
}

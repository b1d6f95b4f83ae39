//! Configuration for the light panel
//!
//! [`MqttConfig`] is the immutable record a session runs on. [`AppConfig`] is
//! the TOML file the shell loads it from; credentials are read from the
//! environment variables the file names rather than stored in it.

use crate::transport::mqtt::{HealthMonitor, ReconnectPolicy};
use crate::transport::QoS;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Broker login
#[derive(Clone, PartialEq, Eq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for Credentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"***")
            .finish()
    }
}

/// Connection parameters for one MQTT session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MqttConfig {
    pub broker_host: String,
    pub broker_port: u16,
    pub credentials: Option<Credentials>,
    /// Must be unique per running process
    pub client_id: String,
    pub keepalive_secs: u16,
    /// QoS for subscriptions and for publishes without an override
    pub default_qos: QoS,
    /// Topic filters subscribed, in order, on every successful connect
    pub subscribe_topics: Vec<String>,
}

impl MqttConfig {
    pub fn new(broker_host: impl Into<String>, client_id: impl Into<String>) -> Self {
        Self {
            broker_host: broker_host.into(),
            broker_port: default_broker_port(),
            credentials: None,
            client_id: client_id.into(),
            keepalive_secs: default_keepalive(),
            default_qos: QoS::AtMostOnce,
            subscribe_topics: Vec::new(),
        }
    }

    pub fn with_port(mut self, port: u16) -> Self {
        self.broker_port = port;
        self
    }

    pub fn with_credentials(
        mut self,
        username: impl Into<String>,
        password: impl Into<String>,
    ) -> Self {
        self.credentials = Some(Credentials {
            username: username.into(),
            password: password.into(),
        });
        self
    }

    pub fn with_keepalive(mut self, secs: u16) -> Self {
        self.keepalive_secs = secs;
        self
    }

    pub fn with_default_qos(mut self, qos: QoS) -> Self {
        self.default_qos = qos;
        self
    }

    pub fn with_subscribe_topics<I, S>(mut self, topics: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.subscribe_topics = topics.into_iter().map(Into::into).collect();
        self
    }

    pub fn keepalive(&self) -> Duration {
        Duration::from_secs(u64::from(self.keepalive_secs))
    }

    /// `host:port` for logging
    pub fn broker_address(&self) -> String {
        format!("{}:{}", self.broker_host, self.broker_port)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.broker_host.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "broker_host must not be empty".to_string(),
            ));
        }
        if self.client_id.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "client_id must not be empty".to_string(),
            ));
        }
        if self.client_id.starts_with(char::is_whitespace) {
            return Err(ConfigError::InvalidConfig(
                "client_id must not start with whitespace".to_string(),
            ));
        }
        if self.keepalive_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "keepalive_secs must be greater than 0".to_string(),
            ));
        }
        for topic in &self.subscribe_topics {
            if topic.is_empty() || !rumqttc::valid_filter(topic) {
                return Err(ConfigError::InvalidConfig(format!(
                    "invalid topic filter: '{topic}'"
                )));
            }
        }
        Ok(())
    }
}

/// Complete application configuration file
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct AppConfig {
    pub mqtt: MqttSection,
    #[serde(default)]
    pub session: SessionSection,
    #[serde(default)]
    pub reconnect: ReconnectPolicy,
    pub light: LightSection,
}

/// `[mqtt]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MqttSection {
    pub broker_host: String,
    #[serde(default = "default_broker_port")]
    pub broker_port: u16,
    /// Required; there is no derived default
    pub client_id: String,
    #[serde(default = "default_keepalive")]
    pub keepalive_secs: u16,
    #[serde(default)]
    pub qos: QoS,
    /// Extra topic filters beyond the light topics
    #[serde(default)]
    pub subscribe_topics: Vec<String>,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
}

/// `[session]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionSection {
    /// How long a publish waits for the connection (default: 5000)
    #[serde(default = "default_publish_timeout_ms")]
    pub publish_timeout_ms: u64,
    /// Idle delay between network-service steps (default: 100)
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
}

impl Default for SessionSection {
    fn default() -> Self {
        Self {
            publish_timeout_ms: default_publish_timeout_ms(),
            tick_interval_ms: default_tick_interval_ms(),
        }
    }
}

impl SessionSection {
    pub fn publish_timeout(&self) -> Duration {
        Duration::from_millis(self.publish_timeout_ms)
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }
}

/// `[light]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LightSection {
    /// Prefix for the light topics, e.g. `lightpanel/demo`
    pub base_topic: String,
}

impl LightSection {
    /// Topic the light reports its state on: `{base}/light/state`
    pub fn state_topic(&self) -> String {
        format!("{}/light/state", self.base_topic.trim_end_matches('/'))
    }

    /// Topic toggle commands are sent to: `{base}/light/set`
    pub fn command_topic(&self) -> String {
        format!("{}/light/set", self.base_topic.trim_end_matches('/'))
    }
}

fn default_broker_port() -> u16 {
    1883
}

fn default_keepalive() -> u16 {
    60
}

fn default_publish_timeout_ms() -> u64 {
    5000
}

fn default_tick_interval_ms() -> u64 {
    100
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to serialize TOML: {0}")]
    TomlSerialize(#[from] toml::ser::Error),
    #[error("Environment variable not found: {0}")]
    EnvVarNotFound(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl AppConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: AppConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let base = self.light.base_topic.trim_end_matches('/');
        if base.is_empty() || !rumqttc::valid_topic(base) {
            return Err(ConfigError::InvalidConfig(format!(
                "light.base_topic must be a concrete topic without wildcards: '{}'",
                self.light.base_topic
            )));
        }
        if self.session.tick_interval_ms == 0 {
            return Err(ConfigError::InvalidConfig(
                "session.tick_interval_ms must be greater than 0".to_string(),
            ));
        }
        HealthMonitor::validate_reconnect_policy(&self.reconnect)
            .map_err(ConfigError::InvalidConfig)?;

        // Credentials are resolved at connect time; check the shape only
        self.mqtt.to_config_without_credentials().validate()
    }

    /// Build the session record: light topics first, then the extra filters.
    /// Reads credentials from the environment.
    pub fn mqtt_config(&self) -> Result<MqttConfig, ConfigError> {
        let mut config = self.mqtt.to_mqtt_config()?;
        let mut topics = vec![self.light.state_topic(), self.light.command_topic()];
        for topic in config.subscribe_topics.drain(..) {
            if !topics.contains(&topic) {
                topics.push(topic);
            }
        }
        config.subscribe_topics = topics;
        config.validate()?;
        Ok(config)
    }
}

impl MqttSection {
    /// Resolve environment variables into an immutable session record
    pub fn to_mqtt_config(&self) -> Result<MqttConfig, ConfigError> {
        let mut config = self.to_config_without_credentials();

        if let Some(username_env) = &self.username_env {
            let username = get_env_var_required(username_env)?;
            let password = match &self.password_env {
                Some(password_env) => get_env_var_required(password_env)?,
                None => String::new(),
            };
            config.credentials = Some(Credentials { username, password });
        }

        config.validate()?;
        Ok(config)
    }

    fn to_config_without_credentials(&self) -> MqttConfig {
        MqttConfig::new(&self.broker_host, &self.client_id)
            .with_port(self.broker_port)
            .with_keepalive(self.keepalive_secs)
            .with_default_qos(self.qos)
            .with_subscribe_topics(self.subscribe_topics.iter().cloned())
    }
}

fn get_env_var_required(env_var_name: &str) -> Result<String, ConfigError> {
    std::env::var(env_var_name).map_err(|_| ConfigError::EnvVarNotFound(env_var_name.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINIMAL: &str = r#"
[mqtt]
broker_host = "broker.hivemq.com"
client_id = "lightpanel-test"

[light]
base_topic = "lightpanel/demo"
"#;

    #[test]
    fn test_minimal_config_defaults() {
        let config = AppConfig::from_toml_str(MINIMAL).unwrap();

        assert_eq!(config.mqtt.broker_port, 1883);
        assert_eq!(config.mqtt.keepalive_secs, 60);
        assert_eq!(config.mqtt.qos, QoS::AtMostOnce);
        assert!(config.mqtt.subscribe_topics.is_empty());
        assert_eq!(config.session.publish_timeout(), Duration::from_secs(5));
        assert_eq!(config.session.tick_interval(), Duration::from_millis(100));
        assert_eq!(config.reconnect, ReconnectPolicy::default());
    }

    #[test]
    fn test_light_topics() {
        let light = LightSection {
            base_topic: "home/kitchen/".to_string(),
        };
        assert_eq!(light.state_topic(), "home/kitchen/light/state");
        assert_eq!(light.command_topic(), "home/kitchen/light/set");
    }

    #[test]
    fn test_mqtt_config_puts_light_topics_first() {
        let mut config = AppConfig::from_toml_str(MINIMAL).unwrap();
        config.mqtt.subscribe_topics = vec![
            "sensors/#".to_string(),
            "lightpanel/demo/light/state".to_string(),
        ];

        let mqtt = config.mqtt_config().unwrap();
        assert_eq!(
            mqtt.subscribe_topics,
            vec![
                "lightpanel/demo/light/state",
                "lightpanel/demo/light/set",
                "sensors/#"
            ]
        );
        assert!(mqtt.credentials.is_none());
    }

    #[test]
    fn test_missing_client_id_is_rejected() {
        let toml = r#"
[mqtt]
broker_host = "localhost"

[light]
base_topic = "demo"
"#;
        assert!(matches!(
            AppConfig::from_toml_str(toml),
            Err(ConfigError::TomlParse(_))
        ));
    }

    #[test]
    fn test_invalid_qos_is_rejected() {
        let toml = MINIMAL.replace(
            "client_id = \"lightpanel-test\"",
            "client_id = \"lightpanel-test\"\nqos = 3",
        );
        assert!(AppConfig::from_toml_str(&toml).is_err());
    }

    #[test]
    fn test_wildcard_base_topic_is_rejected() {
        let toml = MINIMAL.replace("lightpanel/demo", "lightpanel/+");
        assert!(matches!(
            AppConfig::from_toml_str(&toml),
            Err(ConfigError::InvalidConfig(_))
        ));
    }

    #[test]
    fn test_mqtt_config_validation() {
        let valid = MqttConfig::new("localhost", "client-1").with_subscribe_topics(["a/b", "c/#"]);
        assert!(valid.validate().is_ok());

        assert!(MqttConfig::new("", "client-1").validate().is_err());
        assert!(MqttConfig::new("localhost", " ").validate().is_err());
        assert!(MqttConfig::new("localhost", "client-1")
            .with_keepalive(0)
            .validate()
            .is_err());
        assert!(MqttConfig::new("localhost", "client-1")
            .with_subscribe_topics(["a/#/b"])
            .validate()
            .is_err());
        assert!(MqttConfig::new("localhost", "client-1")
            .with_subscribe_topics([""])
            .validate()
            .is_err());
    }

    #[test]
    fn test_credentials_debug_hides_password() {
        let config = MqttConfig::new("localhost", "client-1").with_credentials("alice", "hunter2");
        let debug = format!("{config:?}");
        assert!(debug.contains("alice"));
        assert!(!debug.contains("hunter2"));
    }

    #[test]
    fn test_credentials_from_environment() {
        std::env::set_var("LIGHTPANEL_TEST_USER_A", "panel");
        std::env::set_var("LIGHTPANEL_TEST_PASS_A", "s3cret");

        let mut config = AppConfig::from_toml_str(MINIMAL).unwrap();
        config.mqtt.username_env = Some("LIGHTPANEL_TEST_USER_A".to_string());
        config.mqtt.password_env = Some("LIGHTPANEL_TEST_PASS_A".to_string());

        let mqtt = config.mqtt_config().unwrap();
        assert_eq!(
            mqtt.credentials,
            Some(Credentials {
                username: "panel".to_string(),
                password: "s3cret".to_string(),
            })
        );
    }

    #[test]
    fn test_missing_credential_variable() {
        let mut config = AppConfig::from_toml_str(MINIMAL).unwrap();
        config.mqtt.username_env = Some("LIGHTPANEL_TEST_UNSET_USER".to_string());

        assert!(matches!(
            config.mqtt_config(),
            Err(ConfigError::EnvVarNotFound(name)) if name == "LIGHTPANEL_TEST_UNSET_USER"
        ));
    }
}

//! TOML configuration for the session manager and CLI
//!
//! The file describes where the broker lives, how to authenticate, which
//! reconnect bounds to hand to the transport and which topics to subscribe
//! to. Secrets are never stored in the file itself; the credentials section
//! only names the environment variables that hold them.

use crate::credentials::{Credential, CredentialError, StaticCredentials};
use crate::session::SessionOptions;
use crate::transport::{Protocol, ReconnectBounds};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Environment variables consulted, in order, when no region is configured
pub const REGION_ENV_VARS: [&str; 2] = ["AWS_REGION", "AWS_DEFAULT_REGION"];

/// Root configuration document
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SessionConfig {
    pub broker: BrokerSection,
    #[serde(default)]
    pub credentials: CredentialsSection,
    #[serde(default)]
    pub session: SessionSection,
}

/// Broker endpoint and connection tuning
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// Broker host; looked up through the control plane when absent
    pub endpoint: Option<String>,
    /// Region; falls back to `AWS_REGION` / `AWS_DEFAULT_REGION`
    pub region: Option<String>,
    /// Port (default depends on protocol)
    pub port: Option<u16>,
    /// Protocol tag: wss, mqtts or mqtt
    #[serde(default = "default_protocol")]
    pub protocol: String,
    /// Client identifier; a unique one is generated per connection when absent
    pub client_id: Option<String>,
    #[serde(default)]
    pub debug: bool,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
    #[serde(default)]
    pub reconnect: ReconnectSection,
}

fn default_protocol() -> String {
    "wss".to_string()
}

fn default_keep_alive() -> u64 {
    30
}

/// Reconnect timing passed through to the transport
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ReconnectSection {
    #[serde(default = "default_base_delay")]
    pub base_delay_ms: u64,
    #[serde(default = "default_min_delay")]
    pub min_delay_ms: u64,
    #[serde(default = "default_max_delay")]
    pub max_delay_ms: u64,
    /// Unlimited when absent
    pub max_attempts: Option<u32>,
}

fn default_base_delay() -> u64 {
    1000
}

fn default_min_delay() -> u64 {
    1000
}

fn default_max_delay() -> u64 {
    128_000
}

impl Default for ReconnectSection {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay(),
            min_delay_ms: default_min_delay(),
            max_delay_ms: default_max_delay(),
            max_attempts: None,
        }
    }
}

impl ReconnectSection {
    pub fn bounds(&self) -> ReconnectBounds {
        ReconnectBounds {
            base_delay: Duration::from_millis(self.base_delay_ms),
            min_delay: Duration::from_millis(self.min_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_attempts: self.max_attempts,
        }
    }
}

/// Where credentials come from
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Default)]
#[serde(rename_all = "lowercase")]
pub enum CredentialSource {
    /// Keys read from environment variables
    #[default]
    Static,
    /// Exchanged from an identity pool
    Pool,
    /// Pushed in by the embedding application
    External,
}

/// Credential section: names of environment variables, never the secrets
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct CredentialsSection {
    #[serde(default)]
    pub source: CredentialSource,
    #[serde(default = "default_access_key_env")]
    pub access_key_env: String,
    #[serde(default = "default_secret_key_env")]
    pub secret_key_env: String,
    #[serde(default = "default_session_token_env")]
    pub session_token_env: Option<String>,
    /// Identity pool id, required for the pool source
    pub identity_pool_id: Option<String>,
    /// Policy to attach to the principal before connecting
    pub policy_name: Option<String>,
}

fn default_access_key_env() -> String {
    "AWS_ACCESS_KEY_ID".to_string()
}

fn default_secret_key_env() -> String {
    "AWS_SECRET_ACCESS_KEY".to_string()
}

fn default_session_token_env() -> Option<String> {
    Some("AWS_SESSION_TOKEN".to_string())
}

impl Default for CredentialsSection {
    fn default() -> Self {
        Self {
            source: CredentialSource::default(),
            access_key_env: default_access_key_env(),
            secret_key_env: default_secret_key_env(),
            session_token_env: default_session_token_env(),
            identity_pool_id: None,
            policy_name: None,
        }
    }
}

/// Session behaviour
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Default)]
pub struct SessionSection {
    /// Topics subscribed on start-up, in order
    #[serde(default)]
    pub topics: Vec<String>,
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Unknown protocol: {0}")]
    UnknownProtocol(String),
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Credential error: {0}")]
    Credential(#[from] CredentialError),
}

impl SessionConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: SessionConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check cross-field consistency
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.protocol()?;

        let reconnect = &self.broker.reconnect;
        if reconnect.min_delay_ms > reconnect.max_delay_ms {
            return Err(ConfigError::InvalidConfig(format!(
                "reconnect min_delay_ms ({}) exceeds max_delay_ms ({})",
                reconnect.min_delay_ms, reconnect.max_delay_ms
            )));
        }
        if reconnect.max_attempts == Some(0) {
            return Err(ConfigError::InvalidConfig(
                "reconnect max_attempts must be greater than 0 or omitted for unlimited"
                    .to_string(),
            ));
        }

        if self.broker.keep_alive_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "keep_alive_secs must be greater than 0".to_string(),
            ));
        }

        if let Some(endpoint) = &self.broker.endpoint {
            if endpoint.trim().is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "broker endpoint must not be empty".to_string(),
                ));
            }
        }

        if self.credentials.source == CredentialSource::Pool
            && self
                .credentials
                .identity_pool_id
                .as_deref()
                .map_or(true, |id| id.trim().is_empty())
        {
            return Err(ConfigError::InvalidConfig(
                "pool credential source requires identity_pool_id".to_string(),
            ));
        }

        if self.session.topics.iter().any(|t| t.is_empty()) {
            return Err(ConfigError::InvalidConfig(
                "session topics must not be empty strings".to_string(),
            ));
        }

        Ok(())
    }

    pub fn protocol(&self) -> Result<Protocol, ConfigError> {
        Protocol::parse(&self.broker.protocol)
            .ok_or_else(|| ConfigError::UnknownProtocol(self.broker.protocol.clone()))
    }

    /// Configured region, else the first non-empty region environment variable
    pub fn resolved_region(&self) -> Option<String> {
        self.broker
            .region
            .clone()
            .filter(|r| !r.trim().is_empty())
            .or_else(|| {
                REGION_ENV_VARS
                    .iter()
                    .filter_map(|name| std::env::var(name).ok())
                    .find(|value| !value.trim().is_empty())
            })
    }

    /// Options for a [`crate::SessionManager`] built from this file
    pub fn session_options(&self) -> Result<SessionOptions, ConfigError> {
        let protocol = self.protocol()?;
        Ok(SessionOptions {
            protocol,
            port: self.broker.port.unwrap_or_else(|| protocol.default_port()),
            client_id: self.broker.client_id.clone(),
            debug: self.broker.debug,
            keep_alive: Duration::from_secs(self.broker.keep_alive_secs),
            reconnect: self.broker.reconnect.bounds(),
            default_region: self.resolved_region(),
        })
    }

    /// Credential for the static source, read from the environment
    pub fn static_credential(&self) -> Result<Credential, ConfigError> {
        let provider = StaticCredentials::from_env(&self.credentials)?;
        Ok(provider.into_credential())
    }

    /// Minimal configuration for unit tests
    #[cfg(test)]
    pub fn test_config() -> Self {
        let toml_content = r#"
[broker]
endpoint = "localhost"
region = "eu-west-1"
protocol = "mqtt"

[session]
topics = ["sensor/data"]
"#;
        toml::from_str(toml_content).expect("Test config should parse")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_full_config() {
        let toml_content = r#"
[broker]
endpoint = "abc-ats.iot.eu-west-1.amazonaws.com"
region = "eu-west-1"
port = 443
protocol = "wss"
client_id = "dashboard-1"
debug = true
keep_alive_secs = 45

[broker.reconnect]
base_delay_ms = 500
min_delay_ms = 250
max_delay_ms = 30000
max_attempts = 12

[credentials]
source = "pool"
identity_pool_id = "eu-west-1:1234"
policy_name = "iot-dashboard"

[session]
topics = ["sensor/data", "sensor/data/gz"]
"#;

        let config = SessionConfig::from_toml_str(toml_content).unwrap();
        assert_eq!(config.broker.client_id.as_deref(), Some("dashboard-1"));
        assert_eq!(config.credentials.source, CredentialSource::Pool);
        assert_eq!(config.credentials.policy_name.as_deref(), Some("iot-dashboard"));
        assert_eq!(config.session.topics.len(), 2);

        let options = config.session_options().unwrap();
        assert_eq!(options.protocol, Protocol::Wss);
        assert_eq!(options.port, 443);
        assert!(options.debug);
        assert_eq!(options.keep_alive, Duration::from_secs(45));
        assert_eq!(options.reconnect.base_delay, Duration::from_millis(500));
        assert_eq!(options.reconnect.max_attempts, Some(12));
        assert_eq!(options.default_region.as_deref(), Some("eu-west-1"));
    }

    #[test]
    fn test_minimal_config_defaults() {
        let config = SessionConfig::from_toml_str("[broker]\n").unwrap();
        assert_eq!(config.broker.protocol, "wss");
        assert_eq!(config.broker.keep_alive_secs, 30);
        assert_eq!(config.broker.reconnect, ReconnectSection::default());
        assert_eq!(config.credentials.source, CredentialSource::Static);
        assert_eq!(config.credentials.access_key_env, "AWS_ACCESS_KEY_ID");
        assert!(config.session.topics.is_empty());

        let options = config.session_options().unwrap();
        assert_eq!(options.port, 443);
    }

    #[test]
    fn test_port_follows_protocol() {
        let config = SessionConfig::test_config();
        assert_eq!(config.session_options().unwrap().port, 1883);
    }

    #[test]
    fn test_unknown_protocol_rejected() {
        let result = SessionConfig::from_toml_str("[broker]\nprotocol = \"http\"\n");
        assert!(matches!(result, Err(ConfigError::UnknownProtocol(_))));
    }

    #[test]
    fn test_inverted_delay_bounds_rejected() {
        let toml_content = r#"
[broker]
[broker.reconnect]
min_delay_ms = 5000
max_delay_ms = 1000
"#;
        let result = SessionConfig::from_toml_str(toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_pool_source_requires_pool_id() {
        let toml_content = r#"
[broker]
[credentials]
source = "pool"
"#;
        let result = SessionConfig::from_toml_str(toml_content);
        assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
    }

    #[test]
    fn test_empty_topic_rejected() {
        let toml_content = r#"
[broker]
[session]
topics = ["ok", ""]
"#;
        assert!(SessionConfig::from_toml_str(toml_content).is_err());
    }

    #[test]
    fn test_zero_max_attempts_rejected() {
        let toml_content = r#"
[broker]
[broker.reconnect]
max_attempts = 0
"#;
        assert!(SessionConfig::from_toml_str(toml_content).is_err());
    }

    #[test]
    fn test_configured_region_wins() {
        let config = SessionConfig::test_config();
        assert_eq!(config.resolved_region().as_deref(), Some("eu-west-1"));
    }
}

//! Gateway configuration
//!
//! Loaded from a TOML file. Broker credentials are never stored in the file;
//! the configuration names the environment variables that hold them.

use crate::protocol::QoS;
use crate::registry::PredefinedTopics;
use crate::session::RetryConfig;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Main gateway configuration structure
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewayConfig {
    pub gateway: GatewaySection,
    pub broker: BrokerSection,
    #[serde(default)]
    pub predefined_topics: Vec<PredefinedTopicConfig>,
    #[serde(default)]
    pub clients: Vec<ClientConfig>,
}

/// Gateway section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GatewaySection {
    /// Gateway identifier, also used to derive the broker client id
    pub gateway_id: String,
    /// UDP address the gateway listens on for MQTT-SN clients
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
    /// Seconds to wait for an acknowledgment before retransmitting
    #[serde(default = "default_retry_period")]
    pub retry_period_secs: u64,
    /// Transmissions of a message before the publish is abandoned
    #[serde(default = "default_retry_count")]
    pub retry_count: u32,
}

/// Broker section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct BrokerSection {
    /// MQTT broker URL with protocol and port
    pub broker_url: String,
    /// Environment variable containing username
    pub username_env: Option<String>,
    /// Environment variable containing password
    pub password_env: Option<String>,
    #[serde(default = "default_keep_alive")]
    pub keep_alive_secs: u64,
}

/// Topic id known to clients out-of-band
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct PredefinedTopicConfig {
    pub topic: String,
    pub topic_id: u16,
}

/// A statically configured MQTT-SN client
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ClientConfig {
    pub client_id: String,
    /// UDP address of the client
    pub address: String,
    /// Broker topic filters forwarded to this client
    #[serde(default)]
    pub topics: Vec<String>,
    /// Highest QoS level the client accepts
    #[serde(default = "default_max_qos")]
    pub max_qos: u8,
}

fn default_bind_address() -> String {
    "0.0.0.0:1883".to_string()
}

fn default_retry_period() -> u64 {
    10
}

fn default_retry_count() -> u32 {
    3
}

fn default_keep_alive() -> u64 {
    60
}

fn default_max_qos() -> u8 {
    1
}

/// Configuration loading errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileRead(#[from] std::io::Error),
    #[error("Failed to parse TOML: {0}")]
    TomlParse(#[from] toml::de::Error),
    #[error("Failed to render TOML: {0}")]
    TomlRender(#[from] toml::ser::Error),
    #[error("Invalid address '{address}': {reason}")]
    InvalidAddress { address: String, reason: String },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl GatewayConfig {
    /// Load and validate configuration from a TOML file
    pub fn load_from_file(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse and validate configuration from TOML text
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: GatewayConfig = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Render the configuration back to TOML
    pub fn to_toml_string(&self) -> Result<String, ConfigError> {
        Ok(toml::to_string_pretty(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.gateway.gateway_id.trim().is_empty() {
            return Err(ConfigError::InvalidConfig(
                "gateway_id must not be empty".to_string(),
            ));
        }
        parse_socket_addr(&self.gateway.bind_address)?;

        if self.gateway.retry_count == 0 {
            return Err(ConfigError::InvalidConfig(
                "retry_count must be at least 1".to_string(),
            ));
        }
        if self.gateway.retry_period_secs == 0 {
            return Err(ConfigError::InvalidConfig(
                "retry_period_secs must be at least 1".to_string(),
            ));
        }

        if self.broker.keep_alive_secs != 0 && self.broker.keep_alive_secs < 5 {
            return Err(ConfigError::InvalidConfig(
                "keep_alive_secs must be 0 or at least 5".to_string(),
            ));
        }

        let mut topic_names = HashSet::new();
        let mut topic_ids = HashSet::new();
        for predefined in &self.predefined_topics {
            if predefined.topic_id == 0 {
                return Err(ConfigError::InvalidConfig(format!(
                    "Pre-defined topic '{}' uses reserved topic id 0",
                    predefined.topic
                )));
            }
            if !topic_names.insert(predefined.topic.as_str()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "Pre-defined topic '{}' is listed twice",
                    predefined.topic
                )));
            }
            if !topic_ids.insert(predefined.topic_id) {
                return Err(ConfigError::InvalidConfig(format!(
                    "Pre-defined topic id {} is used twice",
                    predefined.topic_id
                )));
            }
        }

        let mut client_ids = HashSet::new();
        let mut addresses = HashSet::new();
        for client in &self.clients {
            if client.client_id.is_empty() {
                return Err(ConfigError::InvalidConfig(
                    "client_id must not be empty".to_string(),
                ));
            }
            if !client_ids.insert(client.client_id.as_str()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "Client '{}' is listed twice",
                    client.client_id
                )));
            }
            if !addresses.insert(parse_socket_addr(&client.address)?) {
                return Err(ConfigError::InvalidConfig(format!(
                    "Address {} is used by more than one client",
                    client.address
                )));
            }
            if QoS::from_level(client.max_qos).is_none() {
                return Err(ConfigError::InvalidConfig(format!(
                    "Client '{}' has max_qos {}, expected 0, 1 or 2",
                    client.client_id, client.max_qos
                )));
            }
            if client.topics.iter().any(|filter| filter.is_empty()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "Client '{}' has an empty topic filter",
                    client.client_id
                )));
            }
        }

        Ok(())
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            retry_period: Duration::from_secs(self.gateway.retry_period_secs),
            retry_count: self.gateway.retry_count,
        }
    }

    pub fn bind_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_socket_addr(&self.gateway.bind_address)
    }

    pub fn predefined(&self) -> PredefinedTopics {
        self.predefined_topics
            .iter()
            .map(|predefined| (predefined.topic.clone(), predefined.topic_id))
            .collect()
    }

    /// Get broker username from environment variable
    pub fn broker_username(&self) -> Option<String> {
        env_var_optional(self.broker.username_env.as_ref())
    }

    /// Get broker password from environment variable
    pub fn broker_password(&self) -> Option<String> {
        env_var_optional(self.broker.password_env.as_ref())
    }
}

impl ClientConfig {
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        parse_socket_addr(&self.address)
    }

    /// Validated max QoS; falls back to at-least-once for unchecked values
    pub fn max_qos(&self) -> QoS {
        QoS::from_level(self.max_qos).unwrap_or(QoS::AtLeastOnce)
    }
}

fn env_var_optional(env_var_name: Option<&String>) -> Option<String> {
    env_var_name.and_then(|name| std::env::var(name).ok())
}

fn parse_socket_addr(address: &str) -> Result<SocketAddr, ConfigError> {
    address
        .parse()
        .map_err(|e: std::net::AddrParseError| ConfigError::InvalidAddress {
            address: address.to_string(),
            reason: e.to_string(),
        })
}

//! Configuration loading and validation tests
//!
//! Tests focus on BEHAVIOR of configuration loading, validation, and error handling.
//! We test observable outcomes, not implementation details of TOML parsing.

use mqttsn_gateway::config::{ConfigError, GatewayConfig};
use mqttsn_gateway::protocol::QoS;
use mqttsn_gateway::registry::RegistrationCache;
use mqttsn_gateway::registry::TopicRegistry;
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tempfile::NamedTempFile;

fn write_config(content: &str) -> NamedTempFile {
    let mut temp_file = NamedTempFile::new().unwrap();
    writeln!(temp_file, "{content}").unwrap();
    temp_file
}

const MINIMAL: &str = r#"
[gateway]
gateway_id = "gw-1"

[broker]
broker_url = "mqtt://localhost:1883"
"#;

#[test]
fn test_config_loads_successfully_from_valid_toml() {
    let temp_file = write_config(
        r#"
[gateway]
gateway_id = "gw-1"
bind_address = "127.0.0.1:10000"
retry_period_secs = 5
retry_count = 4

[broker]
broker_url = "mqtt://broker.local:1883"
username_env = "GW_BROKER_USER"
keep_alive_secs = 30

[[predefined_topics]]
topic = "sensors/temp"
topic_id = 1

[[clients]]
client_id = "node-1"
address = "127.0.0.1:20001"
topics = ["sensors/+/cmd", "broadcast/#"]
max_qos = 2
"#,
    );

    let config = GatewayConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.gateway.gateway_id, "gw-1");
    assert_eq!(config.bind_addr().unwrap().port(), 10000);
    assert_eq!(config.retry_config().retry_period, Duration::from_secs(5));
    assert_eq!(config.retry_config().retry_count, 4);
    assert_eq!(config.broker.broker_url, "mqtt://broker.local:1883");
    assert_eq!(config.broker.keep_alive_secs, 30);
    assert_eq!(config.clients.len(), 1);
    assert_eq!(config.clients[0].topics, vec!["sensors/+/cmd", "broadcast/#"]);
    assert_eq!(config.clients[0].max_qos(), QoS::ExactlyOnce);
}

#[test]
fn test_config_applies_defaults_when_not_specified() {
    let temp_file = write_config(MINIMAL);

    let config = GatewayConfig::load_from_file(temp_file.path()).unwrap();

    assert_eq!(config.gateway.bind_address, "0.0.0.0:1883");
    assert_eq!(config.retry_config().retry_period, Duration::from_secs(10));
    assert_eq!(config.retry_config().retry_count, 3);
    assert_eq!(config.broker.keep_alive_secs, 60);
    assert!(config.predefined_topics.is_empty());
    assert!(config.clients.is_empty());
}

#[test]
fn test_client_max_qos_defaults_to_one() {
    let temp_file = write_config(&format!(
        r#"{MINIMAL}
[[clients]]
client_id = "node-1"
address = "127.0.0.1:20001"
topics = ["a"]
"#
    ));

    let config = GatewayConfig::load_from_file(temp_file.path()).unwrap();
    assert_eq!(config.clients[0].max_qos(), QoS::AtLeastOnce);
}

#[test]
fn test_predefined_topics_feed_the_registry() {
    let config = GatewayConfig::from_toml_str(&format!(
        r#"{MINIMAL}
[[predefined_topics]]
topic = "sensors/temp"
topic_id = 7
"#
    ))
    .unwrap();

    let mut registry = TopicRegistry::new(Arc::new(config.predefined()));
    let mapping = registry.resolve("sensors/temp");
    assert_eq!(mapping.topic_id, 7);
    assert!(mapping.predefined);
}

#[test]
fn test_config_returns_error_when_broker_section_missing() {
    let temp_file = write_config(
        r#"
[gateway]
gateway_id = "gw-1"
"#,
    );

    match GatewayConfig::load_from_file(temp_file.path()) {
        Err(ConfigError::TomlParse(_)) => {}
        other => panic!("Expected TomlParse error, got {other:?}"),
    }
}

#[test]
fn test_config_returns_error_for_invalid_toml_syntax() {
    let temp_file = write_config("[gateway\ngateway_id = ");

    match GatewayConfig::load_from_file(temp_file.path()) {
        Err(ConfigError::TomlParse(_)) => {}
        other => panic!("Expected TomlParse error, got {other:?}"),
    }
}

#[test]
fn test_config_returns_error_when_file_not_found() {
    let result = GatewayConfig::load_from_file(std::path::Path::new("/nonexistent/gateway.toml"));

    match result {
        Err(ConfigError::FileRead(_)) => {}
        other => panic!("Expected FileRead error, got {other:?}"),
    }
}

#[test]
fn test_config_rejects_empty_gateway_id() {
    let result = GatewayConfig::from_toml_str(
        r#"
[gateway]
gateway_id = "  "

[broker]
broker_url = "mqtt://localhost:1883"
"#,
    );

    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_config_rejects_zero_retry_count() {
    let result = GatewayConfig::from_toml_str(
        r#"
[gateway]
gateway_id = "gw-1"
retry_count = 0

[broker]
broker_url = "mqtt://localhost:1883"
"#,
    );

    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_config_rejects_short_keep_alive() {
    let result = GatewayConfig::from_toml_str(
        r#"
[gateway]
gateway_id = "gw-1"

[broker]
broker_url = "mqtt://localhost:1883"
keep_alive_secs = 2
"#,
    );

    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_config_rejects_reserved_predefined_topic_id() {
    let result = GatewayConfig::from_toml_str(&format!(
        r#"{MINIMAL}
[[predefined_topics]]
topic = "a"
topic_id = 0
"#
    ));

    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_config_rejects_duplicate_predefined_topic_id() {
    let result = GatewayConfig::from_toml_str(&format!(
        r#"{MINIMAL}
[[predefined_topics]]
topic = "a"
topic_id = 3

[[predefined_topics]]
topic = "b"
topic_id = 3
"#
    ));

    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_config_rejects_invalid_client_address() {
    let result = GatewayConfig::from_toml_str(&format!(
        r#"{MINIMAL}
[[clients]]
client_id = "node-1"
address = "not-an-address"
"#
    ));

    match result {
        Err(ConfigError::InvalidAddress { address, .. }) => assert_eq!(address, "not-an-address"),
        other => panic!("Expected InvalidAddress error, got {other:?}"),
    }
}

#[test]
fn test_config_rejects_clients_sharing_an_address() {
    let result = GatewayConfig::from_toml_str(&format!(
        r#"{MINIMAL}
[[clients]]
client_id = "node-1"
address = "127.0.0.1:20001"

[[clients]]
client_id = "node-2"
address = "127.0.0.1:20001"
"#
    ));

    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_config_rejects_invalid_max_qos() {
    let result = GatewayConfig::from_toml_str(&format!(
        r#"{MINIMAL}
[[clients]]
client_id = "node-1"
address = "127.0.0.1:20001"
max_qos = 3
"#
    ));

    assert!(matches!(result, Err(ConfigError::InvalidConfig(_))));
}

#[test]
fn test_broker_credentials_come_from_environment() {
    let config = GatewayConfig::from_toml_str(
        r#"
[gateway]
gateway_id = "gw-1"

[broker]
broker_url = "mqtt://localhost:1883"
username_env = "MQTTSN_TEST_BROKER_USER"
password_env = "MQTTSN_TEST_BROKER_PASS_UNSET"
"#,
    )
    .unwrap();

    std::env::set_var("MQTTSN_TEST_BROKER_USER", "gateway");
    assert_eq!(config.broker_username(), Some("gateway".to_string()));
    assert_eq!(config.broker_password(), None);
    std::env::remove_var("MQTTSN_TEST_BROKER_USER");
}

#[test]
fn test_config_renders_back_to_toml() {
    let config = GatewayConfig::from_toml_str(MINIMAL).unwrap();

    let rendered = config.to_toml_string().unwrap();
    let reparsed = GatewayConfig::from_toml_str(&rendered).unwrap();

    assert_eq!(reparsed.gateway.gateway_id, "gw-1");
    assert_eq!(reparsed.broker.broker_url, "mqtt://localhost:1883");
}

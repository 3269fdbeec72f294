//! Config module tests

use std::io::Write;
use std::time::Duration;

use super::*;

const MINIMAL: &str = r#"
[[bridge]]
hardware_type = "H"
serial_number = "42"
connection_id = "conn1"
host = "cloud.example.com"
"#;

#[test]
fn test_substitute_env_vars_simple() {
    std::env::set_var("TEST_VAR_SIMPLE", "hello");
    let result = substitute_env_vars("value = \"${TEST_VAR_SIMPLE}\"").unwrap();
    assert_eq!(result, "value = \"hello\"");
    std::env::remove_var("TEST_VAR_SIMPLE");
}

#[test]
fn test_substitute_env_vars_with_default() {
    // Unset var should use default
    std::env::remove_var("TEST_VAR_UNSET");
    let result = substitute_env_vars("value = \"${TEST_VAR_UNSET:-default_value}\"").unwrap();
    assert_eq!(result, "value = \"default_value\"");

    // Set var should use env value
    std::env::set_var("TEST_VAR_SET", "env_value");
    let result = substitute_env_vars("value = \"${TEST_VAR_SET:-default_value}\"").unwrap();
    assert_eq!(result, "value = \"env_value\"");
    std::env::remove_var("TEST_VAR_SET");
}

#[test]
fn test_substitute_env_vars_missing_no_default() {
    std::env::remove_var("TEST_VAR_MISSING");
    let result = substitute_env_vars("value = \"${TEST_VAR_MISSING}\"").unwrap();
    assert_eq!(result, "value = \"\"");
}

#[test]
fn test_parse_minimal_config() {
    let config = Config::parse(MINIMAL).unwrap();

    assert_eq!(config.log.level, "info");
    assert_eq!(config.local.host, "localhost");
    assert_eq!(config.local.port, 1883);
    assert_eq!(config.bridge.len(), 1);

    let bridge = &config.bridge[0];
    assert_eq!(bridge.name(), "conn1");
    assert_eq!(bridge.username, "remoteclient");
    assert_eq!(bridge.port(), 1883);
    assert_eq!(bridge.state_topic, "state");
    assert_eq!(bridge.control_scope, ControlScope::Connection);
    assert_eq!(bridge.calibration.interval, Duration::from_millis(500));
    assert_eq!(bridge.calibration.max_attempts, 10);
    assert!(bridge.calibration.offset_correction);
    assert!(bridge.publish_whitelist.is_empty());
}

#[test]
fn test_parse_full_config() {
    let content = r#"
[log]
level = "debug"

[local]
host = "127.0.0.1"
port = 1884
username = "bridge"
password = "local-secret"
qos = 1
reconnect_interval = "2s"

[[bridge]]
name = "cloud"
hardware_type = "gateway"
serial_number = "SN001"
connection_id = "primary"
host = "cloud.example.com"
port = 8884
protocol = "mqtts"
client_id = "gw-SN001"
password = "secret"
keepalive = 30
qos = 1
reconnect_interval = "500ms"
max_reconnect_interval = "2m"
control_scope = "device"
state_topic = "presence-check"
publish_whitelist = ["gateway/SN001/telemetry/#", "gateway/SN001/events/+"]
subscribe_whitelist = ["gateway/SN001/commands/:command"]

[bridge.tls]
ca_cert = "/etc/edgebridge/ca.pem"
server_name = "broker.example.com"

[bridge.calibration]
interval = "250ms"
max_attempts = 20
offset_correction = false
"#;

    let config = Config::parse(content).unwrap();
    assert_eq!(config.log.level, "debug");
    assert_eq!(config.local.port, 1884);
    assert_eq!(config.local.reconnect_interval, Duration::from_secs(2));
    assert_eq!(config.local.qos(), crate::protocol::QoS::AtLeastOnce);

    let bridge = &config.bridge[0];
    assert_eq!(bridge.name(), "cloud");
    assert_eq!(bridge.protocol, BridgeProtocol::Mqtts);
    assert_eq!(bridge.port(), 8884);
    assert_eq!(bridge.client_id(), "gw-SN001");
    assert_eq!(bridge.max_reconnect_interval, Duration::from_secs(120));
    assert_eq!(bridge.control_scope, ControlScope::Device);
    assert_eq!(bridge.state_topic, "presence-check");
    assert_eq!(bridge.publish_whitelist.len(), 2);

    let tls = bridge.tls.as_ref().unwrap();
    assert_eq!(tls.ca_cert, "/etc/edgebridge/ca.pem");
    assert_eq!(tls.server_name.as_deref(), Some("broker.example.com"));

    assert_eq!(bridge.calibration.interval, Duration::from_millis(250));
    assert_eq!(bridge.calibration.max_attempts, 20);
    assert!(!bridge.calibration.offset_correction);
}

#[test]
fn test_unknown_key_rejected() {
    let content = format!("{}unexpected = true\n", MINIMAL);
    assert!(matches!(
        Config::parse(&content),
        Err(ConfigError::Parse(_))
    ));

    let content = format!("[local]\nhots = \"x\"\n{}", MINIMAL);
    assert!(matches!(
        Config::parse(&content),
        Err(ConfigError::Parse(_))
    ));
}

#[test]
fn test_missing_serial_number_rejected() {
    let content = r#"
[[bridge]]
hardware_type = "H"
connection_id = "conn1"
host = "cloud.example.com"
"#;
    assert!(matches!(
        Config::parse(content),
        Err(ConfigError::Parse(_))
    ));
}

#[test]
fn test_invalid_pattern_rejected() {
    let content = format!("{}publish_whitelist = [\"a/#/b\"]\n", MINIMAL);
    match Config::parse(&content) {
        Err(ConfigError::Validation(msg)) => {
            assert!(msg.contains("conn1"));
            assert!(msg.contains("a/#/b"));
        }
        other => panic!("expected validation error, got {:?}", other),
    }
}

#[test]
fn test_no_bridges_rejected() {
    assert!(matches!(
        Config::parse("[log]\nlevel = \"info\"\n"),
        Err(ConfigError::Validation(_))
    ));
}

#[test]
fn test_duplicate_connection_id_rejected() {
    let content = format!("{}{}", MINIMAL, MINIMAL);
    match Config::parse(&content) {
        Err(ConfigError::Validation(msg)) => assert!(msg.contains("Duplicate")),
        other => panic!("expected validation error, got {:?}", other),
    }
}

#[test]
fn test_invalid_local_qos_rejected() {
    let content = format!("[local]\nqos = 2\n{}", MINIMAL);
    assert!(matches!(
        Config::parse(&content),
        Err(ConfigError::Validation(_))
    ));
}

#[test]
fn test_enabled_bridges() {
    let content = format!(
        "{}\n[[bridge]]\nenabled = false\nhardware_type = \"H\"\nserial_number = \"43\"\nconnection_id = \"conn2\"\nhost = \"h\"\n",
        MINIMAL
    );
    let config = Config::parse(&content).unwrap();
    let enabled: Vec<_> = config.enabled_bridges().map(|b| b.name()).collect();
    assert_eq!(enabled, vec!["conn1"]);
}

#[test]
fn test_load_config_with_env_substitution() {
    std::env::set_var("TEST_CLOUD_HOST", "cloud.internal");
    std::env::remove_var("TEST_CLOUD_PORT");

    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
[[bridge]]
hardware_type = "H"
serial_number = "42"
connection_id = "conn1"
host = "${{TEST_CLOUD_HOST}}"
port = ${{TEST_CLOUD_PORT:-9883}}
reconnect_interval = "3s"
"#
    )
    .unwrap();

    let config = Config::load(file.path()).unwrap();
    assert_eq!(config.local.host, "localhost");
    assert_eq!(config.bridge[0].host, "cloud.internal");
    assert_eq!(config.bridge[0].port(), 9883);
    assert_eq!(config.bridge[0].reconnect_interval, Duration::from_secs(3));

    std::env::remove_var("TEST_CLOUD_HOST");
}

#[test]
fn test_load_missing_file() {
    assert!(matches!(
        Config::load("/nonexistent/edgebridge.toml"),
        Err(ConfigError::Io(_))
    ));
}

#[test]
fn test_load_rejects_invalid_bridge() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    write!(file, "{}publish_whitelist = [\"a/b+\"]\n", MINIMAL).unwrap();

    assert!(matches!(
        Config::load(file.path()),
        Err(ConfigError::Validation(_))
    ));
}

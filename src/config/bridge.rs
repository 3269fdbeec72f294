//! Bridge Configuration
//!
//! Configuration structures for the local broker endpoint and the per-device
//! bridge connections.

use std::time::Duration;

use serde::Deserialize;

use crate::calibration::DEFAULT_THRESHOLD_MS;
use crate::protocol::QoS;
use crate::topic::{validate_literal_segment, TopicPattern};

/// Bridge connection protocol
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BridgeProtocol {
    /// Plain MQTT over TCP
    #[default]
    Mqtt,
    /// MQTT over TLS
    Mqtts,
}

impl std::fmt::Display for BridgeProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeProtocol::Mqtt => write!(f, "mqtt"),
            BridgeProtocol::Mqtts => write!(f, "mqtts"),
        }
    }
}

impl BridgeProtocol {
    /// Get default port for this protocol
    pub fn default_port(&self) -> u16 {
        match self {
            BridgeProtocol::Mqtt => 1883,
            BridgeProtocol::Mqtts => 8883,
        }
    }

    /// Check if this protocol uses TLS
    pub fn uses_tls(&self) -> bool {
        matches!(self, BridgeProtocol::Mqtts)
    }
}

/// Where remote-link control topics live
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ControlScope {
    /// `{hw}/{serial}/{connection_id}/{disconnect|connect}`
    #[default]
    Connection,
    /// `{hw}/{serial}/{disconnect|connect}`
    Device,
}

/// Startup clock calibration settings
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct CalibrationConfig {
    /// Delay between clock polls
    #[serde(default = "default_calibration_interval", with = "humantime_serde")]
    pub interval: Duration,

    /// Polls before giving up
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,

    /// The clock is trusted once it reads later than this (epoch ms)
    #[serde(default = "default_threshold_ms")]
    pub threshold_ms: i64,

    /// Subtract the time spent polling from the accepted start time
    #[serde(default = "default_true")]
    pub offset_correction: bool,
}

fn default_calibration_interval() -> Duration {
    Duration::from_millis(500)
}

fn default_max_attempts() -> u32 {
    10
}

fn default_threshold_ms() -> i64 {
    DEFAULT_THRESHOLD_MS
}

impl Default for CalibrationConfig {
    fn default() -> Self {
        Self {
            interval: default_calibration_interval(),
            max_attempts: default_max_attempts(),
            threshold_ms: default_threshold_ms(),
            offset_correction: true,
        }
    }
}

/// TLS configuration for the remote connection
#[derive(Debug, Clone, Deserialize, Default)]
#[serde(deny_unknown_fields)]
pub struct BridgeTlsConfig {
    /// Path to CA certificate file (PEM format)
    pub ca_cert: String,

    /// Path to client certificate file (PEM format)
    pub client_cert: Option<String>,

    /// Path to client private key file (PEM format)
    pub client_key: Option<String>,

    /// Server name for SNI and verification (defaults to host)
    pub server_name: Option<String>,
}

/// Local broker endpoint shared by every bridge
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LocalConfig {
    pub host: String,

    pub port: u16,

    /// Client IDs are `{client_id_prefix}-{connection_id}`
    pub client_id_prefix: String,

    pub username: Option<String>,

    pub password: Option<String>,

    /// Keep-alive interval in seconds
    pub keepalive: u16,

    pub clean_session: bool,

    /// QoS for forwarded messages and subscriptions (0 or 1)
    pub qos: u8,

    #[serde(with = "humantime_serde")]
    pub reconnect_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub max_reconnect_interval: Duration,

    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
}

impl Default for LocalConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 1883,
            client_id_prefix: "edgebridge-local".to_string(),
            username: None,
            password: None,
            keepalive: default_keepalive(),
            clean_session: true,
            qos: 0,
            reconnect_interval: default_reconnect_interval(),
            max_reconnect_interval: default_max_reconnect_interval(),
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl LocalConfig {
    pub fn qos(&self) -> QoS {
        QoS::from_u8(self.qos).unwrap_or_default()
    }

    pub fn validate(&self) -> Result<(), String> {
        if self.host.is_empty() {
            return Err("local.host cannot be empty".to_string());
        }
        if self.port == 0 {
            return Err("local.port cannot be 0".to_string());
        }
        if self.client_id_prefix.is_empty() {
            return Err("local.client_id_prefix cannot be empty".to_string());
        }
        if self.qos > 1 {
            return Err("local.qos must be 0 or 1".to_string());
        }
        validate_intervals(self.reconnect_interval, self.max_reconnect_interval)
            .map_err(|e| format!("local: {}", e))
    }
}

/// Configuration for a single bridge connection
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct BridgeConfig {
    /// Name used in logs (defaults to the connection id)
    #[serde(default)]
    pub name: Option<String>,

    /// Whether this bridge is enabled
    #[serde(default = "default_true")]
    pub enabled: bool,

    /// Device hardware type
    pub hardware_type: String,

    /// Device serial number
    pub serial_number: String,

    /// Identifier of this remote connection
    pub connection_id: String,

    /// Remote broker host
    pub host: String,

    /// Remote broker port (defaults to the protocol's port)
    #[serde(default)]
    pub port: Option<u16>,

    /// Connection protocol
    #[serde(default)]
    pub protocol: BridgeProtocol,

    /// Client ID (defaults to `edgebridge-{hw}-{serial}-{connection_id}`)
    #[serde(default)]
    pub client_id: Option<String>,

    /// Username for authentication
    #[serde(default = "default_username")]
    pub username: String,

    /// Password for authentication
    #[serde(default)]
    pub password: Option<String>,

    /// Keep-alive interval in seconds
    #[serde(default = "default_keepalive")]
    pub keepalive: u16,

    /// Use a clean session
    #[serde(default = "default_true")]
    pub clean_session: bool,

    /// QoS for forwarded messages and subscriptions (0 or 1)
    #[serde(default)]
    pub qos: u8,

    /// Initial reconnect delay
    #[serde(default = "default_reconnect_interval", with = "humantime_serde")]
    pub reconnect_interval: Duration,

    /// Maximum reconnect delay (for exponential backoff)
    #[serde(default = "default_max_reconnect_interval", with = "humantime_serde")]
    pub max_reconnect_interval: Duration,

    /// Connection timeout
    #[serde(default = "default_connect_timeout", with = "humantime_serde")]
    pub connect_timeout: Duration,

    /// TLS configuration (required for mqtts)
    #[serde(default)]
    pub tls: Option<BridgeTlsConfig>,

    /// Control topic layout
    #[serde(default)]
    pub control_scope: ControlScope,

    /// Segment used in state request/response topics
    #[serde(default = "default_state_topic")]
    pub state_topic: String,

    /// Topics forwarded local -> remote
    #[serde(default)]
    pub publish_whitelist: Vec<String>,

    /// Topics forwarded remote -> local
    #[serde(default)]
    pub subscribe_whitelist: Vec<String>,

    /// Startup clock calibration
    #[serde(default)]
    pub calibration: CalibrationConfig,
}

fn default_true() -> bool {
    true
}

fn default_username() -> String {
    "remoteclient".to_string()
}

fn default_keepalive() -> u16 {
    60
}

fn default_reconnect_interval() -> Duration {
    Duration::from_secs(1)
}

fn default_max_reconnect_interval() -> Duration {
    Duration::from_secs(60)
}

fn default_connect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_state_topic() -> String {
    "state".to_string()
}

impl Default for BridgeConfig {
    fn default() -> Self {
        Self {
            name: None,
            enabled: true,
            hardware_type: String::new(),
            serial_number: String::new(),
            connection_id: String::new(),
            host: String::new(),
            port: None,
            protocol: BridgeProtocol::default(),
            client_id: None,
            username: default_username(),
            password: None,
            keepalive: default_keepalive(),
            clean_session: true,
            qos: 0,
            reconnect_interval: default_reconnect_interval(),
            max_reconnect_interval: default_max_reconnect_interval(),
            connect_timeout: default_connect_timeout(),
            tls: None,
            control_scope: ControlScope::default(),
            state_topic: default_state_topic(),
            publish_whitelist: Vec::new(),
            subscribe_whitelist: Vec::new(),
            calibration: CalibrationConfig::default(),
        }
    }
}

impl BridgeConfig {
    /// Name used in logs
    pub fn name(&self) -> &str {
        self.name.as_deref().unwrap_or(&self.connection_id)
    }

    /// Effective remote port
    pub fn port(&self) -> u16 {
        self.port.unwrap_or_else(|| self.protocol.default_port())
    }

    /// Effective client ID
    pub fn client_id(&self) -> String {
        self.client_id.clone().unwrap_or_else(|| {
            format!(
                "edgebridge-{}-{}-{}",
                self.hardware_type, self.serial_number, self.connection_id
            )
        })
    }

    pub fn qos(&self) -> QoS {
        QoS::from_u8(self.qos).unwrap_or_default()
    }

    /// Validate everything that would otherwise fail at use
    pub fn validate(&self) -> Result<(), String> {
        for (field, value) in [
            ("hardware_type", &self.hardware_type),
            ("serial_number", &self.serial_number),
            ("connection_id", &self.connection_id),
            ("state_topic", &self.state_topic),
        ] {
            validate_literal_segment(value).map_err(|e| format!("{}: {}", field, e))?;
        }

        if self.host.is_empty() {
            return Err("host cannot be empty".to_string());
        }
        if self.port == Some(0) {
            return Err("port cannot be 0".to_string());
        }
        if matches!(self.client_id.as_deref(), Some("")) {
            return Err("client_id cannot be empty".to_string());
        }
        if self.qos > 1 {
            return Err("qos must be 0 or 1".to_string());
        }
        if self.protocol.uses_tls() && self.tls.is_none() {
            return Err("protocol 'mqtts' requires a [bridge.tls] section".to_string());
        }
        if let Some(tls) = &self.tls {
            if tls.ca_cert.is_empty() {
                return Err("tls.ca_cert cannot be empty".to_string());
            }
            if tls.client_cert.is_some() != tls.client_key.is_some() {
                return Err("tls.client_cert and tls.client_key must be set together".to_string());
            }
        }

        for pattern in self
            .publish_whitelist
            .iter()
            .chain(&self.subscribe_whitelist)
        {
            TopicPattern::compile(pattern).map_err(|e| e.to_string())?;
        }

        validate_intervals(self.reconnect_interval, self.max_reconnect_interval)?;

        if self.calibration.max_attempts == 0 {
            return Err("calibration.max_attempts must be at least 1".to_string());
        }
        if self.calibration.interval.is_zero() {
            return Err("calibration.interval must be non-zero".to_string());
        }

        Ok(())
    }
}

fn validate_intervals(reconnect: Duration, max_reconnect: Duration) -> Result<(), String> {
    if reconnect.is_zero() {
        return Err("reconnect_interval must be non-zero".to_string());
    }
    if max_reconnect < reconnect {
        return Err("max_reconnect_interval must not be less than reconnect_interval".to_string());
    }
    Ok(())
}

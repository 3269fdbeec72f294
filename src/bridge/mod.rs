//! Bridge Module
//!
//! Connects a device's local MQTT bus to a remote broker. Each bridge owns two
//! links and forwards messages between them according to per-direction
//! whitelists, while also serving a small set of device topics:
//! - `{hw}/{serial}/{conn}/disconnect` and `.../connect` suspend and resume the remote link
//! - `{hw}/{serial}/{state}/request[/{id}]` is answered with uptime and timestamp
//! - `{hw}/{serial}/register-device` is published whenever the remote link connects
//!   and on `coordinator/device-info/request`
//!
//! # Example Configuration
//!
//! ```toml
//! [[bridge]]
//! hardware_type = "gateway"
//! serial_number = "SN001"
//! connection_id = "primary"
//! host = "cloud.example.com"
//! protocol = "mqtts"
//! publish_whitelist = ["gateway/SN001/telemetry/#"]
//! subscribe_whitelist = ["gateway/SN001/commands/:command"]
//!
//! [bridge.tls]
//! ca_cert = "/etc/edgebridge/ca.pem"
//! ```

mod connection;
mod manager;


pub use connection::{
    BridgeConnection, BridgeState, DeviceIdentity, DeviceRegistration, StateResponse,
};
pub use manager::BridgeManager;

// Re-export config types from the config module for convenience
pub use crate::config::{BridgeConfig, BridgeProtocol, ControlScope, LocalConfig};

use crate::link::LinkError;
use crate::topic::PatternError;

/// Filter subscribed on both links for coordinator traffic
pub const COORDINATOR_FILTER: &str = "coordinator/#";

/// Topic that triggers a fresh device registration
pub const DEVICE_INFO_REQUEST_TOPIC: &str = "coordinator/device-info/request";

/// Bridge construction errors
#[derive(Debug)]
pub enum BridgeError {
    /// A whitelist or device topic failed to compile
    Pattern(PatternError),
    /// Link options could not be built
    Link(LinkError),
}

impl std::fmt::Display for BridgeError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            BridgeError::Pattern(e) => write!(f, "Pattern error: {}", e),
            BridgeError::Link(e) => write!(f, "Link error: {}", e),
        }
    }
}

impl std::error::Error for BridgeError {}

impl From<PatternError> for BridgeError {
    fn from(e: PatternError) -> Self {
        BridgeError::Pattern(e)
    }
}

impl From<LinkError> for BridgeError {
    fn from(e: LinkError) -> Self {
        BridgeError::Link(e)
    }
}

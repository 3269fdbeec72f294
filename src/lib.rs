//! edgebridge - MQTT edge bridge
//!
//! Mirrors selected topics between a device's local MQTT bus and a remote
//! broker, and serves a small control and state protocol on the same buses.

pub mod bridge;
pub mod calibration;
pub mod codec;
pub mod config;
pub mod link;
pub mod protocol;
pub mod topic;

pub use bridge::{BridgeConnection, BridgeError, BridgeManager, BridgeState};
pub use calibration::{ClockCalibrator, StartedAt};
pub use config::Config;
pub use link::{Link, LinkError, LinkEvent, MqttLink};
pub use protocol::QoS;
pub use topic::TopicPattern;

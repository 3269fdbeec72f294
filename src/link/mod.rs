//! Message Bus Links
//!
//! A link is one connection to a message bus. The bridge consumes links only
//! through the [`Link`] trait and reacts to the [`LinkEvent`]s each link
//! delivers on its event channel. Two implementations are provided:
//! - `MqttLink`: MQTT v3.1.1 client over TCP or TLS
//! - `MockLink`: in-memory double that records calls

mod mock;
mod mqtt;
mod tls;

use std::fmt;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

pub use mock::{LinkCall, MockLink};
pub use mqtt::{LinkOptions, MqttLink};
pub use tls::TlsSettings;

/// Capacity of each link's event channel
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Capacity of each link's command channel
pub const COMMAND_QUEUE_CAPACITY: usize = 1024;

/// Receiving end of a link's event stream
pub type LinkEvents = mpsc::Receiver<LinkEvent>;

/// Error type for link operations
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkError {
    /// Connection failed, was lost, or the link is not connected
    ConnectionLost(String),
    /// The broker refused the connection
    Rejected(String),
    /// Operation timed out
    Timeout,
    /// Command queue is full
    QueueFull,
    /// Invalid configuration
    InvalidConfig(String),
    /// TLS setup or handshake failed
    Tls(String),
    /// Peer violated the protocol
    Protocol(String),
}

impl fmt::Display for LinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LinkError::ConnectionLost(msg) => write!(f, "Connection lost: {}", msg),
            LinkError::Rejected(msg) => write!(f, "Rejected: {}", msg),
            LinkError::Timeout => write!(f, "Operation timed out"),
            LinkError::QueueFull => write!(f, "Command queue full"),
            LinkError::InvalidConfig(msg) => write!(f, "Invalid config: {}", msg),
            LinkError::Tls(msg) => write!(f, "TLS error: {}", msg),
            LinkError::Protocol(msg) => write!(f, "Protocol error: {}", msg),
        }
    }
}

impl std::error::Error for LinkError {}

/// Connection state of a link
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LinkState {
    /// Not connected and not trying to connect
    #[default]
    Disconnected,
    /// Connection attempt in progress
    Connecting,
    /// Connected and operational
    Connected,
    /// Connection lost, backing off before the next attempt
    Reconnecting,
    /// Link task has stopped for good
    Closed,
}

/// Event delivered by a link, in arrival order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    Connected,
    Message { topic: String, payload: Bytes },
    Closed,
    Offline,
    Error(LinkError),
    Reconnecting,
}

/// One connection to a message bus
///
/// Operations hand work to the link and return without waiting on the
/// network. Failures are returned to the caller, never raised as faults.
#[async_trait]
pub trait Link: Send + Sync {
    /// Get the name of this link, used in logs
    fn name(&self) -> &str;

    /// Get the current connection state
    fn state(&self) -> LinkState;

    /// Start connecting
    async fn connect(&self) -> Result<(), LinkError>;

    /// Subscribe to a topic filter. The filter is remembered and
    /// re-subscribed after every reconnect.
    async fn subscribe(&self, filter: &str) -> Result<(), LinkError>;

    /// Publish a message
    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), LinkError>;

    /// Close the connection. With `force` the socket is dropped without a
    /// DISCONNECT packet. Either way no `Message` is delivered and no
    /// automatic reconnect happens until `reconnect` is called.
    async fn disconnect(&self, force: bool) -> Result<(), LinkError>;

    /// Re-establish the connection. A no-op while connected or connecting.
    async fn reconnect(&self) -> Result<(), LinkError>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_link_error_display() {
        assert_eq!(
            LinkError::ConnectionLost("reset".to_string()).to_string(),
            "Connection lost: reset"
        );
        assert_eq!(LinkError::QueueFull.to_string(), "Command queue full");
        assert!(LinkError::Tls("bad cert".to_string())
            .to_string()
            .contains("TLS error"));
    }

    #[test]
    fn test_default_state() {
        assert_eq!(LinkState::default(), LinkState::Disconnected);
    }
}

//! Bridge Manager
//!
//! Spawns one task per bridge and provides a unified interface for
//! status queries and shutdown.

use std::sync::Arc;

use parking_lot::RwLock;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{error, info};

use super::connection::{BridgeConnection, BridgeState};
use super::BridgeError;
use crate::config::{BridgeConfig, Config, LocalConfig};
use crate::link::LinkEvents;

struct ManagedBridge {
    name: String,
    state: Arc<RwLock<BridgeState>>,
    task: JoinHandle<()>,
}

/// Manages all bridges of a process
pub struct BridgeManager {
    /// Running bridges
    bridges: RwLock<Vec<ManagedBridge>>,
    /// Broadcast to every bridge task on shutdown
    shutdown: watch::Sender<bool>,
}

impl BridgeManager {
    /// Create an empty bridge manager
    pub fn new() -> Self {
        let (shutdown, _) = watch::channel(false);
        Self {
            bridges: RwLock::new(Vec::new()),
            shutdown,
        }
    }

    /// Create a bridge manager and start every enabled bridge
    pub fn from_config(config: &Config) -> Result<Self, BridgeError> {
        let manager = Self::new();

        for bridge in config.enabled_bridges() {
            manager.add_bridge(&config.local, bridge)?;
        }

        Ok(manager)
    }

    /// Build a bridge over MQTT links and start it
    pub fn add_bridge(&self, local: &LocalConfig, config: &BridgeConfig) -> Result<(), BridgeError> {
        let (bridge, local_events, remote_events) = BridgeConnection::from_config(local, config)?;
        self.spawn_bridge(bridge, local_events, remote_events);
        Ok(())
    }

    /// Start an already built bridge
    pub fn spawn_bridge(
        &self,
        bridge: BridgeConnection,
        local_events: LinkEvents,
        remote_events: LinkEvents,
    ) {
        let name = bridge.name().to_string();
        let state = bridge.shared_state();
        let task = tokio::spawn(bridge.run(local_events, remote_events, self.shutdown.subscribe()));

        info!("Bridge manager: Added bridge '{}'", name);

        self.bridges.write().push(ManagedBridge { name, state, task });
    }

    /// Get the number of bridges
    pub fn bridge_count(&self) -> usize {
        self.bridges.read().len()
    }

    /// Get the number of bridges currently forwarding
    pub fn bridging_count(&self) -> usize {
        self.bridges
            .read()
            .iter()
            .filter(|b| *b.state.read() == BridgeState::Bridging)
            .count()
    }

    /// Get status of all bridges
    pub fn status(&self) -> Vec<(String, BridgeState)> {
        self.bridges
            .read()
            .iter()
            .map(|b| (b.name.clone(), *b.state.read()))
            .collect()
    }

    /// Stop all bridges and wait for their tasks to finish
    pub async fn shutdown(&self) {
        self.shutdown.send_replace(true);

        // Take the handles first to avoid holding the lock across await
        let bridges: Vec<_> = self.bridges.write().drain(..).collect();
        for bridge in bridges {
            if let Err(e) = bridge.task.await {
                error!("Bridge '{}': Task failed: {}", bridge.name, e);
            }
        }
        info!("Bridge manager: All bridges stopped");
    }
}

impl Default for BridgeManager {
    fn default() -> Self {
        Self::new()
    }
}

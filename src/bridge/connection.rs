//! Bridge Connection
//!
//! Owns the local and remote links of one device and reacts to their events:
//! whitelist forwarding in both directions, remote-link control commands from
//! the local bus, state queries and device registration on the remote bus.

use std::sync::Arc;

use bytes::Bytes;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{BridgeError, COORDINATOR_FILTER, DEVICE_INFO_REQUEST_TOPIC};
use crate::calibration::{ClockCalibrator, SharedClock, StartedAt, SystemClock};
use crate::config::{BridgeConfig, CalibrationConfig, ControlScope, LocalConfig};
use crate::link::{Link, LinkEvent, LinkEvents, LinkOptions, MqttLink};
use crate::topic::{compile_all, matches_any, Params, TopicPattern};

/// Lifecycle state of a bridge
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BridgeState {
    /// Waiting for both links to connect
    #[default]
    Init,
    /// Both links connected, forwarding
    Bridging,
    /// Remote link closed by a disconnect command
    RemoteSuspended,
    /// Remote link reopening after a connect command
    RemoteReconnecting,
    /// Shut down
    Closed,
}

/// Payload published on `{hw}/{serial}/register-device`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceRegistration {
    pub timestamp: i64,
}

/// Payload published on `{hw}/{serial}/{state}/response[/{id}]`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StateResponse {
    /// Milliseconds since process start, `null` while the clock is untrusted
    pub uptime: Option<i64>,
    pub timestamp: i64,
}

/// Identity of the device a bridge serves
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceIdentity {
    pub hardware_type: String,
    pub serial_number: String,
    pub connection_id: String,
}

impl DeviceIdentity {
    fn device_prefix(&self) -> String {
        format!("{}/{}", self.hardware_type, self.serial_number)
    }
}

/// Topics derived from the identity, compiled once
struct DeviceTopics {
    device_filter: String,
    register: String,
    state_response: String,
    disconnect: TopicPattern,
    connect: TopicPattern,
    state_request: TopicPattern,
    state_request_with_id: TopicPattern,
}

impl DeviceTopics {
    fn new(
        identity: &DeviceIdentity,
        scope: ControlScope,
        state_topic: &str,
    ) -> Result<Self, BridgeError> {
        let device = identity.device_prefix();
        let control = match scope {
            ControlScope::Connection => format!("{}/{}", device, identity.connection_id),
            ControlScope::Device => device.clone(),
        };

        Ok(Self {
            device_filter: format!("{}/#", device),
            register: format!("{}/register-device", device),
            state_response: format!("{}/{}/response", device, state_topic),
            disconnect: TopicPattern::compile(&format!("{}/disconnect", control))?,
            connect: TopicPattern::compile(&format!("{}/connect", control))?,
            state_request: TopicPattern::compile(&format!("{}/{}/request", device, state_topic))?,
            state_request_with_id: TopicPattern::compile(&format!(
                "{}/{}/request/:id",
                device, state_topic
            ))?,
        })
    }

    fn match_state_request(&self, topic: &str) -> Option<Params> {
        self.state_request
            .matches(topic)
            .or_else(|| self.state_request_with_id.matches(topic))
    }
}

/// Bridge between a device's local bus and the remote bus
pub struct BridgeConnection {
    name: String,
    identity: DeviceIdentity,
    topics: DeviceTopics,
    publish_whitelist: Vec<TopicPattern>,
    subscribe_whitelist: Vec<TopicPattern>,
    local: Box<dyn Link>,
    remote: Box<dyn Link>,
    clock: SharedClock,
    started_at: StartedAt,
    calibration: CalibrationConfig,
    state: Arc<RwLock<BridgeState>>,
    local_connected: bool,
    remote_connected: bool,
}

impl BridgeConnection {
    /// Build a bridge over the given links. All patterns are compiled here.
    pub fn new(
        config: &BridgeConfig,
        local: Box<dyn Link>,
        remote: Box<dyn Link>,
        clock: SharedClock,
    ) -> Result<Self, BridgeError> {
        let identity = DeviceIdentity {
            hardware_type: config.hardware_type.clone(),
            serial_number: config.serial_number.clone(),
            connection_id: config.connection_id.clone(),
        };
        let topics = DeviceTopics::new(&identity, config.control_scope, &config.state_topic)?;

        Ok(Self {
            name: config.name().to_string(),
            identity,
            topics,
            publish_whitelist: compile_all(&config.publish_whitelist)?,
            subscribe_whitelist: compile_all(&config.subscribe_whitelist)?,
            local,
            remote,
            clock,
            started_at: StartedAt::new(),
            calibration: config.calibration.clone(),
            state: Arc::new(RwLock::new(BridgeState::Init)),
            local_connected: false,
            remote_connected: false,
        })
    }

    /// Build a bridge over two MQTT links, returning their event streams
    pub fn from_config(
        local: &LocalConfig,
        config: &BridgeConfig,
    ) -> Result<(Self, LinkEvents, LinkEvents), BridgeError> {
        let remote_options = LinkOptions::remote(config)?;
        let (local_link, local_events) = MqttLink::spawn(LinkOptions::local(local, config));
        let (remote_link, remote_events) = MqttLink::spawn(remote_options);

        let bridge = Self::new(
            config,
            Box::new(local_link),
            Box::new(remote_link),
            Arc::new(SystemClock),
        )?;
        Ok((bridge, local_events, remote_events))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn identity(&self) -> &DeviceIdentity {
        &self.identity
    }

    pub fn state(&self) -> BridgeState {
        *self.state.read()
    }

    /// Handle for observing the state after the bridge is moved into a task
    pub fn shared_state(&self) -> Arc<RwLock<BridgeState>> {
        self.state.clone()
    }

    /// Shared start timestamp, written once by the calibrator
    pub fn started_at(&self) -> &StartedAt {
        &self.started_at
    }

    fn set_state(&self, next: BridgeState) {
        let mut state = self.state.write();
        if *state != next {
            debug!("Bridge '{}': {:?} -> {:?}", self.name, *state, next);
            *state = next;
        }
    }

    /// Re-derive the state after a link connected or dropped
    fn refresh_state(&self) {
        let both = self.local_connected && self.remote_connected;
        let next = match self.state() {
            BridgeState::Closed => BridgeState::Closed,
            BridgeState::RemoteSuspended => BridgeState::RemoteSuspended,
            _ if both => BridgeState::Bridging,
            BridgeState::RemoteReconnecting => BridgeState::RemoteReconnecting,
            _ => BridgeState::Init,
        };
        self.set_state(next);
    }

    async fn subscribe_device_scope(&self, link: &dyn Link) {
        for filter in [self.topics.device_filter.as_str(), COORDINATOR_FILTER] {
            if let Err(e) = link.subscribe(filter).await {
                warn!(
                    "Bridge '{}': Subscribe to {} on {} failed: {}",
                    self.name,
                    filter,
                    link.name(),
                    e
                );
            }
        }
    }

    /// Publish a fresh registration to the remote bus
    async fn register_device(&self) {
        let registration = DeviceRegistration {
            timestamp: self.clock.now_ms(),
        };
        self.publish_json(&self.topics.register, &registration).await;
    }

    /// Answer a state query
    async fn publish_state(&self, id: Option<&str>) {
        let now = self.clock.now_ms();
        let response = StateResponse {
            uptime: self.started_at.uptime(now),
            timestamp: now,
        };
        let topic = match id {
            Some(id) => format!("{}/{}", self.topics.state_response, id),
            None => self.topics.state_response.clone(),
        };
        self.publish_json(&topic, &response).await;
    }

    async fn publish_json<T: Serialize>(&self, topic: &str, value: &T) {
        let payload = match serde_json::to_vec(value) {
            Ok(payload) => Bytes::from(payload),
            Err(e) => {
                warn!("Bridge '{}': Failed to encode {}: {}", self.name, topic, e);
                return;
            }
        };
        if let Err(e) = self.remote.publish(topic, payload).await {
            warn!("Bridge '{}': Publish to {} failed: {}", self.name, topic, e);
        }
    }

    /// Disconnect command from the local bus
    async fn suspend_remote(&self) {
        info!("Bridge '{}': Remote disconnect requested", self.name);
        match self.remote.disconnect(true).await {
            Ok(()) => self.set_state(BridgeState::RemoteSuspended),
            Err(e) => warn!("Bridge '{}': Remote disconnect failed: {}", self.name, e),
        }
    }

    /// Connect command from the local bus
    async fn resume_remote(&self) {
        info!("Bridge '{}': Remote reconnect requested", self.name);
        match self.remote.reconnect().await {
            Ok(()) => {
                if self.state() == BridgeState::RemoteSuspended {
                    self.set_state(BridgeState::RemoteReconnecting);
                }
            }
            Err(e) => warn!("Bridge '{}': Remote reconnect failed: {}", self.name, e),
        }
    }

    /// Handle one event from the local link
    pub async fn handle_local(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected => {
                info!("Bridge '{}': Local connected", self.name);
                self.local_connected = true;
                self.subscribe_device_scope(self.local.as_ref()).await;
                self.refresh_state();
            }
            LinkEvent::Message { topic, payload } => {
                if matches_any(&self.publish_whitelist, &topic) {
                    debug!("Bridge '{}': Forwarding {} -> remote", self.name, topic);
                    if let Err(e) = self.remote.publish(&topic, payload).await {
                        debug!("Bridge '{}': Forward of {} failed: {}", self.name, topic, e);
                    }
                }
                if self.topics.disconnect.is_match(&topic) {
                    self.suspend_remote().await;
                }
                if self.topics.connect.is_match(&topic) {
                    self.resume_remote().await;
                }
            }
            LinkEvent::Closed | LinkEvent::Offline => {
                if self.local_connected {
                    info!("Bridge '{}': Local disconnected", self.name);
                }
                self.local_connected = false;
                self.refresh_state();
            }
            LinkEvent::Error(e) => {
                warn!("Bridge '{}': Local error: {}", self.name, e);
            }
            LinkEvent::Reconnecting => {
                debug!("Bridge '{}': Local reconnecting", self.name);
            }
        }
    }

    /// Handle one event from the remote link
    pub async fn handle_remote(&mut self, event: LinkEvent) {
        match event {
            LinkEvent::Connected => {
                info!("Bridge '{}': Remote connected", self.name);
                self.remote_connected = true;
                self.subscribe_device_scope(self.remote.as_ref()).await;
                self.register_device().await;
                self.refresh_state();
            }
            LinkEvent::Message { topic, payload } => {
                if matches_any(&self.subscribe_whitelist, &topic) {
                    debug!("Bridge '{}': Forwarding {} -> local", self.name, topic);
                    if let Err(e) = self.local.publish(&topic, payload).await {
                        debug!("Bridge '{}': Forward of {} failed: {}", self.name, topic, e);
                    }
                }
                if let Some(params) = self.topics.match_state_request(&topic) {
                    self.publish_state(params.get("id").map(String::as_str))
                        .await;
                }
                if topic == DEVICE_INFO_REQUEST_TOPIC {
                    self.register_device().await;
                }
            }
            LinkEvent::Closed | LinkEvent::Offline => {
                if self.remote_connected {
                    info!("Bridge '{}': Remote disconnected", self.name);
                }
                self.remote_connected = false;
                self.refresh_state();
            }
            LinkEvent::Error(e) => {
                warn!("Bridge '{}': Remote error: {}", self.name, e);
            }
            LinkEvent::Reconnecting => {
                debug!("Bridge '{}': Remote reconnecting", self.name);
            }
        }
    }

    /// Connect both links, start calibration, and dispatch events until
    /// `shutdown` fires or both event streams end.
    pub async fn run(
        mut self,
        mut local_events: LinkEvents,
        mut remote_events: LinkEvents,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!("Bridge '{}': Starting", self.name);

        for link in [self.local.as_ref(), self.remote.as_ref()] {
            if let Err(e) = link.connect().await {
                warn!("Bridge '{}': Connect of {} failed: {}", self.name, link.name(), e);
            }
        }

        let calibrator = ClockCalibrator::new(
            self.name.clone(),
            self.calibration.clone(),
            self.clock.clone(),
            self.started_at.clone(),
        )
        .spawn();

        let mut local_open = true;
        let mut remote_open = true;

        while (local_open || remote_open) && !*shutdown.borrow() {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                event = local_events.recv(), if local_open => match event {
                    Some(event) => self.handle_local(event).await,
                    None => local_open = false,
                },
                event = remote_events.recv(), if remote_open => match event {
                    Some(event) => self.handle_remote(event).await,
                    None => remote_open = false,
                },
            }
        }

        calibrator.abort();
        self.close().await;
    }

    /// Disconnect both links and enter `Closed`
    pub async fn close(&mut self) {
        self.set_state(BridgeState::Closed);
        for link in [self.local.as_ref(), self.remote.as_ref()] {
            if let Err(e) = link.disconnect(false).await {
                debug!("Bridge '{}': Disconnect of {} failed: {}", self.name, link.name(), e);
            }
        }
        self.local_connected = false;
        self.remote_connected = false;
        info!("Bridge '{}': Closed", self.name);
    }
}

//! MQTT Link
//!
//! MQTT v3.1.1 client behind the [`Link`] trait. All operations are sent as
//! commands to a connection task which owns the socket, so callers never wait
//! on the network. The task keeps the session alive with PINGREQ, reconnects
//! with exponential backoff after unexpected loss, and re-subscribes every
//! known filter after each connect.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::{Buf, Bytes, BytesMut};
use parking_lot::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadHalf, WriteHalf};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::{interval_at, timeout, Instant};
use tracing::{debug, info, warn};

use super::{
    Link, LinkError, LinkEvent, LinkEvents, LinkState, TlsSettings, COMMAND_QUEUE_CAPACITY,
    EVENT_QUEUE_CAPACITY,
};
use crate::codec::{Decoder, Encoder, DEFAULT_MAX_PACKET_SIZE};
use crate::config::{BridgeConfig, LocalConfig};
use crate::protocol::{
    Connect, ConnectReturnCode, Packet, PubAck, Publish, QoS, Subscribe, SUBACK_FAILURE,
};
use crate::topic::{validate_topic_filter, validate_topic_name};

/// Connection parameters for an [`MqttLink`]
#[derive(Debug, Clone)]
pub struct LinkOptions {
    /// Name used in logs
    pub name: String,
    pub host: String,
    pub port: u16,
    pub client_id: String,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Keep alive in seconds, 0 disables pings
    pub keepalive: u16,
    pub clean_session: bool,
    /// QoS used for publishes and subscriptions
    pub qos: QoS,
    pub reconnect_interval: Duration,
    pub max_reconnect_interval: Duration,
    pub connect_timeout: Duration,
    pub tls: Option<TlsSettings>,
}

impl LinkOptions {
    pub fn new(
        name: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        client_id: impl Into<String>,
    ) -> Self {
        Self {
            name: name.into(),
            host: host.into(),
            port,
            client_id: client_id.into(),
            username: None,
            password: None,
            keepalive: 60,
            clean_session: true,
            qos: QoS::AtMostOnce,
            reconnect_interval: Duration::from_secs(1),
            max_reconnect_interval: Duration::from_secs(60),
            connect_timeout: Duration::from_secs(30),
            tls: None,
        }
    }

    /// Options for the remote (cloud) side of a bridge
    pub fn remote(config: &BridgeConfig) -> Result<Self, LinkError> {
        let tls = match (config.protocol.uses_tls(), &config.tls) {
            (true, Some(tls)) => Some(TlsSettings::from_config(tls, &config.host)?),
            (true, None) => {
                return Err(LinkError::InvalidConfig(
                    "mqtts requires a [bridge.tls] section".to_string(),
                ))
            }
            (false, _) => None,
        };

        Ok(Self {
            name: format!("{}/remote", config.name()),
            host: config.host.clone(),
            port: config.port(),
            client_id: config.client_id(),
            username: Some(config.username.clone()),
            password: config.password.clone(),
            keepalive: config.keepalive,
            clean_session: config.clean_session,
            qos: config.qos(),
            reconnect_interval: config.reconnect_interval,
            max_reconnect_interval: config.max_reconnect_interval,
            connect_timeout: config.connect_timeout,
            tls,
        })
    }

    /// Options for the local side of a bridge
    pub fn local(config: &LocalConfig, bridge: &BridgeConfig) -> Self {
        Self {
            name: format!("{}/local", bridge.name()),
            host: config.host.clone(),
            port: config.port,
            client_id: format!("{}-{}", config.client_id_prefix, bridge.connection_id),
            username: config.username.clone(),
            password: config.password.clone(),
            keepalive: config.keepalive,
            clean_session: config.clean_session,
            qos: config.qos(),
            reconnect_interval: config.reconnect_interval,
            max_reconnect_interval: config.max_reconnect_interval,
            connect_timeout: config.connect_timeout,
            tls: None,
        }
    }
}

/// Command sent to the connection task
#[derive(Debug)]
enum LinkCommand {
    Connect,
    Subscribe(String),
    Publish { topic: String, payload: Bytes },
    Disconnect { force: bool },
    Reconnect,
}

/// MQTT v3.1.1 link
pub struct MqttLink {
    name: String,
    state: Arc<RwLock<LinkState>>,
    commands: mpsc::Sender<LinkCommand>,
}

impl MqttLink {
    /// Spawn the connection task. The link stays idle until `connect` is called.
    pub fn spawn(options: LinkOptions) -> (Self, LinkEvents) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_QUEUE_CAPACITY);
        let (event_tx, event_rx) = mpsc::channel(EVENT_QUEUE_CAPACITY);
        let state = Arc::new(RwLock::new(LinkState::Disconnected));

        let link = Self {
            name: options.name.clone(),
            state: state.clone(),
            commands: command_tx,
        };

        let task = ConnectionTask {
            options,
            state,
            commands: command_rx,
            events: event_tx,
            filters: Vec::new(),
            encoder: Encoder::new(),
            decoder: Decoder::new().with_max_packet_size(DEFAULT_MAX_PACKET_SIZE),
            next_packet_id: 1,
        };
        tokio::spawn(task.run());

        (link, event_rx)
    }

    fn send(&self, command: LinkCommand) -> Result<(), LinkError> {
        self.commands.try_send(command).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => LinkError::QueueFull,
            mpsc::error::TrySendError::Closed(_) => {
                LinkError::ConnectionLost("link task stopped".to_string())
            }
        })
    }
}

#[async_trait]
impl Link for MqttLink {
    fn name(&self) -> &str {
        &self.name
    }

    fn state(&self) -> LinkState {
        *self.state.read()
    }

    async fn connect(&self) -> Result<(), LinkError> {
        self.send(LinkCommand::Connect)
    }

    async fn subscribe(&self, filter: &str) -> Result<(), LinkError> {
        validate_topic_filter(filter)
            .map_err(|e| LinkError::InvalidConfig(format!("filter '{}': {}", filter, e)))?;
        self.send(LinkCommand::Subscribe(filter.to_string()))
    }

    async fn publish(&self, topic: &str, payload: Bytes) -> Result<(), LinkError> {
        if self.state() != LinkState::Connected {
            return Err(LinkError::ConnectionLost("not connected".to_string()));
        }
        validate_topic_name(topic)
            .map_err(|e| LinkError::Protocol(format!("topic '{}': {}", topic, e)))?;
        self.send(LinkCommand::Publish {
            topic: topic.to_string(),
            payload,
        })
    }

    async fn disconnect(&self, force: bool) -> Result<(), LinkError> {
        self.send(LinkCommand::Disconnect { force })
    }

    async fn reconnect(&self) -> Result<(), LinkError> {
        self.send(LinkCommand::Reconnect)
    }
}

/// How a connected session ended
enum SessionEnd {
    /// Closed on request
    Stopped,
    /// Every link handle was dropped
    Shutdown,
    /// Unexpected loss or failed attempt
    Lost(LinkError),
}

/// How a backoff wait ended
enum Backoff {
    Retry,
    Stopped,
    Shutdown,
}

trait Transport: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Transport for T {}

type BoxedStream = Box<dyn Transport>;

struct ConnectionTask {
    options: LinkOptions,
    state: Arc<RwLock<LinkState>>,
    commands: mpsc::Receiver<LinkCommand>,
    events: mpsc::Sender<LinkEvent>,
    /// Every filter ever subscribed, in order
    filters: Vec<String>,
    encoder: Encoder,
    decoder: Decoder,
    next_packet_id: u16,
}

impl ConnectionTask {
    async fn run(mut self) {
        while self.wait_for_start().await {
            if !self.run_active().await {
                break;
            }
        }

        *self.state.write() = LinkState::Closed;
        debug!("Link '{}': Task stopped", self.options.name);
    }

    fn set_state(&self, state: LinkState) {
        *self.state.write() = state;
    }

    async fn emit(&self, event: LinkEvent) {
        // Nobody listening is not an error for the link
        let _ = self.events.send(event).await;
    }

    fn next_packet_id(&mut self) -> u16 {
        let id = self.next_packet_id;
        self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
        id
    }

    fn remember_filter(&mut self, filter: String) -> Option<String> {
        if self.filters.contains(&filter) {
            None
        } else {
            self.filters.push(filter.clone());
            Some(filter)
        }
    }

    /// Idle until asked to connect. Returns false when every handle is gone.
    async fn wait_for_start(&mut self) -> bool {
        self.set_state(LinkState::Disconnected);

        while let Some(command) = self.commands.recv().await {
            match command {
                LinkCommand::Connect | LinkCommand::Reconnect => return true,
                LinkCommand::Subscribe(filter) => {
                    self.remember_filter(filter);
                }
                LinkCommand::Publish { topic, .. } => {
                    debug!(
                        "Link '{}': Not connected, dropping publish to {}",
                        self.options.name, topic
                    );
                }
                LinkCommand::Disconnect { .. } => {}
            }
        }
        false
    }

    /// Connect and keep reconnecting until stopped. Returns false on shutdown.
    async fn run_active(&mut self) -> bool {
        let mut retry_interval = self.options.reconnect_interval;

        loop {
            self.set_state(LinkState::Connecting);
            debug!(
                "Link '{}': Connecting to {}:{}",
                self.options.name, self.options.host, self.options.port
            );

            let mut connected = false;
            let end = match self.connect_and_run(&mut connected).await {
                Ok(end) => end,
                Err(e) => SessionEnd::Lost(e),
            };

            if connected {
                retry_interval = self.options.reconnect_interval;
            }

            match end {
                SessionEnd::Stopped => {
                    info!("Link '{}': Disconnected", self.options.name);
                    self.set_state(LinkState::Disconnected);
                    self.emit(LinkEvent::Closed).await;
                    return true;
                }
                SessionEnd::Shutdown => {
                    self.emit(LinkEvent::Closed).await;
                    return false;
                }
                SessionEnd::Lost(e) => {
                    warn!("Link '{}': Connection failed: {}", self.options.name, e);
                    self.set_state(LinkState::Reconnecting);
                    self.emit(LinkEvent::Error(e)).await;
                    self.emit(LinkEvent::Closed).await;
                    self.emit(LinkEvent::Offline).await;

                    debug!(
                        "Link '{}': Reconnecting in {:?}",
                        self.options.name, retry_interval
                    );
                    match self.backoff(retry_interval).await {
                        Backoff::Retry => {}
                        Backoff::Stopped => return true,
                        Backoff::Shutdown => return false,
                    }

                    // Exponential backoff
                    retry_interval =
                        std::cmp::min(retry_interval * 2, self.options.max_reconnect_interval);
                    self.emit(LinkEvent::Reconnecting).await;
                }
            }
        }
    }

    /// Wait out the backoff delay while still serving commands
    async fn backoff(&mut self, delay: Duration) -> Backoff {
        let sleep = tokio::time::sleep(delay);
        tokio::pin!(sleep);

        loop {
            tokio::select! {
                _ = &mut sleep => return Backoff::Retry,
                command = self.commands.recv() => match command {
                    None => return Backoff::Shutdown,
                    Some(LinkCommand::Disconnect { .. }) => {
                        info!("Link '{}': Reconnect cancelled", self.options.name);
                        self.set_state(LinkState::Disconnected);
                        return Backoff::Stopped;
                    }
                    Some(LinkCommand::Connect) | Some(LinkCommand::Reconnect) => {
                        return Backoff::Retry;
                    }
                    Some(LinkCommand::Subscribe(filter)) => {
                        self.remember_filter(filter);
                    }
                    Some(LinkCommand::Publish { topic, .. }) => {
                        debug!(
                            "Link '{}': Offline, dropping publish to {}",
                            self.options.name, topic
                        );
                    }
                },
            }
        }
    }

    async fn open_stream(&self) -> Result<BoxedStream, LinkError> {
        let address = format!("{}:{}", self.options.host, self.options.port);
        let tcp = timeout(self.options.connect_timeout, TcpStream::connect(&address))
            .await
            .map_err(|_| LinkError::Timeout)?
            .map_err(|e| LinkError::ConnectionLost(e.to_string()))?;
        let _ = tcp.set_nodelay(true);

        match &self.options.tls {
            Some(tls) => {
                let stream = timeout(
                    self.options.connect_timeout,
                    tls.connector.connect(tls.server_name.clone(), tcp),
                )
                .await
                .map_err(|_| LinkError::Timeout)?
                .map_err(|e| LinkError::Tls(e.to_string()))?;
                Ok(Box::new(stream))
            }
            None => Ok(Box::new(tcp)),
        }
    }

    async fn write_packet(
        &self,
        writer: &mut WriteHalf<BoxedStream>,
        packet: &Packet,
    ) -> Result<(), LinkError> {
        let mut buf = BytesMut::new();
        self.encoder
            .encode(packet, &mut buf)
            .map_err(|e| LinkError::Protocol(format!("Encode error: {}", e)))?;
        writer
            .write_all(&buf)
            .await
            .map_err(|e| LinkError::ConnectionLost(e.to_string()))
    }

    /// Read until one full packet is buffered
    async fn read_packet(
        &self,
        reader: &mut ReadHalf<BoxedStream>,
        buf: &mut BytesMut,
    ) -> Result<Packet, LinkError> {
        loop {
            if let Some(packet) = self.take_packet(buf)? {
                return Ok(packet);
            }
            let n = reader
                .read_buf(buf)
                .await
                .map_err(|e| LinkError::ConnectionLost(e.to_string()))?;
            if n == 0 {
                return Err(LinkError::ConnectionLost("Connection closed".to_string()));
            }
        }
    }

    fn take_packet(&self, buf: &mut BytesMut) -> Result<Option<Packet>, LinkError> {
        match self.decoder.decode(&buf[..]) {
            Ok(Some((packet, consumed))) => {
                buf.advance(consumed);
                Ok(Some(packet))
            }
            Ok(None) => Ok(None),
            Err(e) => Err(LinkError::Protocol(format!("Decode error: {}", e))),
        }
    }

    /// Connect to the broker and run the session loop
    async fn connect_and_run(&mut self, connected: &mut bool) -> Result<SessionEnd, LinkError> {
        let stream = self.open_stream().await?;
        debug!("Link '{}': Transport connected", self.options.name);

        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut read_buf = BytesMut::with_capacity(4096);

        let connect = Packet::Connect(Box::new(Connect {
            client_id: self.options.client_id.clone(),
            clean_session: self.options.clean_session,
            keep_alive: self.options.keepalive,
            username: self.options.username.clone(),
            password: self.options.password.clone().map(Bytes::from),
        }));
        self.write_packet(&mut writer, &connect).await?;

        let packet = timeout(
            self.options.connect_timeout,
            self.read_packet(&mut reader, &mut read_buf),
        )
        .await
        .map_err(|_| LinkError::Timeout)??;

        match packet {
            Packet::ConnAck(connack) if connack.return_code == ConnectReturnCode::Accepted => {
                info!(
                    "Link '{}': Connected (session_present={})",
                    self.options.name, connack.session_present
                );
            }
            Packet::ConnAck(connack) => {
                return Err(LinkError::Rejected(
                    connack.return_code.as_str().to_string(),
                ));
            }
            other => {
                return Err(LinkError::Protocol(format!(
                    "Expected CONNACK, got {:?}",
                    other.packet_type()
                )));
            }
        }

        *connected = true;
        self.set_state(LinkState::Connected);

        if !self.filters.is_empty() {
            let subscribe = Packet::Subscribe(Subscribe {
                packet_id: self.next_packet_id(),
                filters: self
                    .filters
                    .iter()
                    .map(|f| (f.clone(), self.options.qos))
                    .collect(),
            });
            self.write_packet(&mut writer, &subscribe).await?;
            debug!(
                "Link '{}': Re-subscribed {} filters",
                self.options.name,
                self.filters.len()
            );
        }

        self.emit(LinkEvent::Connected).await;

        // A keepalive of 0 disables pings
        let keepalive = Duration::from_secs(u64::from(self.options.keepalive.max(1)));
        let pings_enabled = self.options.keepalive > 0;
        let mut keepalive_timer = interval_at(Instant::now() + keepalive, keepalive);
        let mut awaiting_pingresp = false;

        // Packets that arrived in the same read as CONNACK
        while let Some(packet) = self.take_packet(&mut read_buf)? {
            self.handle_inbound(&mut writer, packet, &mut awaiting_pingresp).await?;
        }

        loop {
            tokio::select! {
                // Queued commands win over inbound traffic
                biased;

                command = self.commands.recv() => {
                    let Some(command) = command else {
                        let _ = self.write_packet(&mut writer, &Packet::Disconnect).await;
                        return Ok(SessionEnd::Shutdown);
                    };

                    match command {
                        LinkCommand::Publish { topic, payload } => {
                            let qos = self.options.qos;
                            let packet_id = match qos {
                                QoS::AtMostOnce => None,
                                _ => Some(self.next_packet_id()),
                            };
                            let publish = Packet::Publish(Publish {
                                dup: false,
                                qos,
                                retain: false,
                                topic,
                                packet_id,
                                payload,
                            });
                            self.write_packet(&mut writer, &publish).await?;
                        }
                        LinkCommand::Subscribe(filter) => {
                            if let Some(filter) = self.remember_filter(filter) {
                                let subscribe = Packet::Subscribe(Subscribe {
                                    packet_id: self.next_packet_id(),
                                    filters: vec![(filter, self.options.qos)],
                                });
                                self.write_packet(&mut writer, &subscribe).await?;
                            }
                        }
                        LinkCommand::Disconnect { force } => {
                            if !force {
                                self.write_packet(&mut writer, &Packet::Disconnect).await?;
                                let _ = writer.shutdown().await;
                            }
                            return Ok(SessionEnd::Stopped);
                        }
                        LinkCommand::Connect | LinkCommand::Reconnect => {
                            debug!("Link '{}': Already connected", self.options.name);
                        }
                    }
                }

                result = reader.read_buf(&mut read_buf) => {
                    let n = result.map_err(|e| LinkError::ConnectionLost(e.to_string()))?;
                    if n == 0 {
                        return Err(LinkError::ConnectionLost("Connection closed".to_string()));
                    }

                    while let Some(packet) = self.take_packet(&mut read_buf)? {
                        self.handle_inbound(&mut writer, packet, &mut awaiting_pingresp).await?;
                    }
                }

                _ = keepalive_timer.tick(), if pings_enabled => {
                    if awaiting_pingresp {
                        return Err(LinkError::Timeout);
                    }
                    self.write_packet(&mut writer, &Packet::PingReq).await?;
                    awaiting_pingresp = true;
                }
            }
        }
    }

    /// Handle one packet from the broker during a session
    async fn handle_inbound(
        &self,
        writer: &mut WriteHalf<BoxedStream>,
        packet: Packet,
        awaiting_pingresp: &mut bool,
    ) -> Result<(), LinkError> {
        match packet {
            Packet::Publish(publish) => {
                if let (QoS::AtLeastOnce, Some(packet_id)) = (publish.qos, publish.packet_id) {
                    self.write_packet(writer, &Packet::PubAck(PubAck { packet_id }))
                        .await?;
                }
                self.emit(LinkEvent::Message {
                    topic: publish.topic,
                    payload: publish.payload,
                })
                .await;
            }
            Packet::PingResp => {
                *awaiting_pingresp = false;
            }
            Packet::SubAck(suback) => {
                if suback.return_codes.contains(&SUBACK_FAILURE) {
                    warn!("Link '{}': Subscription refused by broker", self.options.name);
                } else {
                    debug!("Link '{}': SUBACK received", self.options.name);
                }
            }
            Packet::PubAck(_) => {
                debug!("Link '{}': PUBACK received", self.options.name);
            }
            other => {
                return Err(LinkError::Protocol(format!(
                    "Unexpected {:?} from broker",
                    other.packet_type()
                )));
            }
        }
        Ok(())
    }
}

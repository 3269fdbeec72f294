//! Bridge Integration Tests
//!
//! Drives a running bridge task through its event channels with in-memory
//! links on both sides.

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{sleep, timeout};

use edgebridge::bridge::{BridgeConfig, BridgeConnection, BridgeManager, BridgeState};
use edgebridge::calibration::ManualClock;
use edgebridge::link::{LinkCall, LinkEvent, MockLink};

/// 2024-01-01T00:00:00Z
const NOW: i64 = 1_704_067_200_000;

struct Running {
    local: MockLink,
    remote: MockLink,
    local_tx: mpsc::Sender<LinkEvent>,
    remote_tx: mpsc::Sender<LinkEvent>,
    shutdown: watch::Sender<bool>,
    state: Arc<parking_lot::RwLock<BridgeState>>,
    task: JoinHandle<()>,
}

fn config() -> BridgeConfig {
    BridgeConfig {
        hardware_type: "H".to_string(),
        serial_number: "42".to_string(),
        connection_id: "conn1".to_string(),
        host: "cloud.example.com".to_string(),
        publish_whitelist: vec!["H/42/telemetry/#".to_string()],
        subscribe_whitelist: vec!["H/42/commands/+".to_string()],
        ..Default::default()
    }
}

fn start(config: BridgeConfig, clock: ManualClock) -> Running {
    let local = MockLink::new("H/local");
    let remote = MockLink::new("H/remote");
    let bridge = BridgeConnection::new(
        &config,
        Box::new(local.clone()),
        Box::new(remote.clone()),
        Arc::new(clock),
    )
    .unwrap();
    let state = bridge.shared_state();

    let (local_tx, local_rx) = mpsc::channel(16);
    let (remote_tx, remote_rx) = mpsc::channel(16);
    let (shutdown, shutdown_rx) = watch::channel(false);
    let task = tokio::spawn(bridge.run(local_rx, remote_rx, shutdown_rx));

    Running {
        local,
        remote,
        local_tx,
        remote_tx,
        shutdown,
        state,
        task,
    }
}

async fn wait_until(what: &str, condition: impl Fn() -> bool) {
    let result = timeout(Duration::from_secs(2), async {
        while !condition() {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(result.is_ok(), "timed out waiting for {}", what);
}

fn message(topic: &str, payload: &'static [u8]) -> LinkEvent {
    LinkEvent::Message {
        topic: topic.to_string(),
        payload: Bytes::from_static(payload),
    }
}

#[tokio::test]
async fn test_bridge_connects_links_and_forwards() {
    let bridge = start(config(), ManualClock::new(NOW));

    wait_until("connect calls", || {
        bridge.local.count(&LinkCall::Connect) == 1 && bridge.remote.count(&LinkCall::Connect) == 1
    })
    .await;

    bridge.local_tx.send(LinkEvent::Connected).await.unwrap();
    bridge.remote_tx.send(LinkEvent::Connected).await.unwrap();
    wait_until("bridging", || *bridge.state.read() == BridgeState::Bridging).await;

    bridge
        .local_tx
        .send(message("H/42/telemetry/temp", b"21.5"))
        .await
        .unwrap();
    bridge
        .remote_tx
        .send(message("H/42/commands/reboot", b"now"))
        .await
        .unwrap();

    wait_until("remote forward", || {
        bridge
            .remote
            .published()
            .iter()
            .any(|(topic, _)| topic == "H/42/telemetry/temp")
    })
    .await;
    wait_until("local forward", || {
        bridge.local.published() == vec![("H/42/commands/reboot".to_string(), Bytes::from_static(b"now"))]
    })
    .await;

    bridge.shutdown.send_replace(true);
    bridge.task.await.unwrap();

    assert_eq!(*bridge.state.read(), BridgeState::Closed);
    assert_eq!(bridge.local.count(&LinkCall::Disconnect { force: false }), 1);
    assert_eq!(bridge.remote.count(&LinkCall::Disconnect { force: false }), 1);
}

#[tokio::test]
async fn test_events_are_handled_in_order() {
    let bridge = start(config(), ManualClock::new(NOW));

    for i in 0..10u8 {
        let topic = format!("H/42/telemetry/{}", i);
        bridge
            .local_tx
            .send(LinkEvent::Message {
                topic,
                payload: Bytes::from(vec![i]),
            })
            .await
            .unwrap();
    }

    wait_until("ten forwards", || bridge.remote.published().len() == 10).await;
    let topics: Vec<_> = bridge
        .remote
        .published()
        .into_iter()
        .map(|(topic, _)| topic)
        .collect();
    let expected: Vec<_> = (0..10).map(|i| format!("H/42/telemetry/{}", i)).collect();
    assert_eq!(topics, expected);

    bridge.shutdown.send_replace(true);
    bridge.task.await.unwrap();
}

#[tokio::test]
async fn test_state_query_after_calibration() {
    let bridge = start(config(), ManualClock::new(NOW));

    // Calibration accepts on its first poll, 500ms after start
    sleep(Duration::from_millis(700)).await;

    bridge
        .remote_tx
        .send(message("H/42/state/request/abc", b""))
        .await
        .unwrap();

    wait_until("state response", || !bridge.remote.published().is_empty()).await;
    let (topic, payload) = bridge.remote.published().remove(0);
    assert_eq!(topic, "H/42/state/response/abc");

    let response: serde_json::Value = serde_json::from_slice(&payload).unwrap();
    assert_eq!(response["timestamp"], NOW);
    assert_eq!(response["uptime"], 500);

    bridge.shutdown.send_replace(true);
    bridge.task.await.unwrap();
}

#[tokio::test]
async fn test_disconnect_command_while_running() {
    let bridge = start(config(), ManualClock::new(NOW));

    bridge
        .local_tx
        .send(message("H/42/conn1/disconnect", b""))
        .await
        .unwrap();
    wait_until("suspended", || {
        *bridge.state.read() == BridgeState::RemoteSuspended
    })
    .await;
    assert_eq!(bridge.remote.count(&LinkCall::Disconnect { force: true }), 1);

    bridge
        .local_tx
        .send(message("H/42/conn1/connect", b""))
        .await
        .unwrap();
    wait_until("reconnecting", || {
        *bridge.state.read() == BridgeState::RemoteReconnecting
    })
    .await;
    assert_eq!(bridge.remote.count(&LinkCall::Reconnect), 1);

    bridge.shutdown.send_replace(true);
    bridge.task.await.unwrap();
}

#[tokio::test]
async fn test_bridge_stops_when_event_streams_end() {
    let bridge = start(config(), ManualClock::new(NOW));
    let Running {
        local_tx,
        remote_tx,
        state,
        task,
        ..
    } = bridge;

    drop(local_tx);
    drop(remote_tx);

    timeout(Duration::from_secs(2), task).await.unwrap().unwrap();
    assert_eq!(*state.read(), BridgeState::Closed);
}

#[tokio::test]
async fn test_manager_runs_independent_bridges() {
    let manager = BridgeManager::new();
    let mut senders = Vec::new();
    let mut remotes = Vec::new();

    for (serial, connection_id) in [("42", "conn1"), ("43", "conn2")] {
        let local = MockLink::new(format!("{}/local", connection_id));
        let remote = MockLink::new(format!("{}/remote", connection_id));
        let config = BridgeConfig {
            serial_number: serial.to_string(),
            connection_id: connection_id.to_string(),
            ..config()
        };
        let bridge = BridgeConnection::new(
            &config,
            Box::new(local),
            Box::new(remote.clone()),
            Arc::new(ManualClock::new(NOW)),
        )
        .unwrap();

        let (local_tx, local_rx) = mpsc::channel(16);
        let (remote_tx, remote_rx) = mpsc::channel(16);
        manager.spawn_bridge(bridge, local_rx, remote_rx);
        senders.push((local_tx, remote_tx));
        remotes.push(remote);
    }

    assert_eq!(manager.bridge_count(), 2);

    let (local_tx, remote_tx) = &senders[0];
    local_tx.send(LinkEvent::Connected).await.unwrap();
    remote_tx.send(LinkEvent::Connected).await.unwrap();

    let status = || manager.status();
    wait_until("first bridge bridging", || manager.bridging_count() == 1).await;
    assert_eq!(
        status(),
        vec![
            ("conn1".to_string(), BridgeState::Bridging),
            ("conn2".to_string(), BridgeState::Init),
        ]
    );

    // Only the first bridge registered
    assert_eq!(remotes[0].published().len(), 1);
    assert!(remotes[1].published().is_empty());

    manager.shutdown().await;
    assert_eq!(manager.bridge_count(), 0);
    for remote in &remotes {
        assert_eq!(remote.count(&LinkCall::Disconnect { force: false }), 1);
    }
}

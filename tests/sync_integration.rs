//! End-to-end tests for the sync layer against an in-process channel backend.
//!
//! These cover the full path from wire frame to published snapshot:
//! - handshake ordering and the `session_id` query parameter
//! - status summaries and telemetry landing in the fleet snapshot
//! - heartbeats staying out of state and the event log
//! - probe cadence, outbound sends, and session-driven open/close

mod common;

use common::{config_for, MockChannel, WAIT};
use fleetsync::channel::{ChannelSettings, ChannelState};
use fleetsync::dashboard::FleetSync;
use fleetsync::fleet::{FleetSnapshot, FleetStore, RobotId, RobotStatus};
use fleetsync::protocol::FleetEvent;
use fleetsync::session::{Session, SessionContext};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::timeout;

async fn wait_for_snapshot(sync: &FleetSync, pred: impl FnMut(&Arc<FleetSnapshot>) -> bool) {
    let mut rx = sync.subscribe();
    timeout(WAIT, rx.wait_for(pred))
        .await
        .expect("snapshot condition should be reached in time")
        .expect("store alive");
}

async fn wait_for_channel(sync: &FleetSync, want: ChannelState) {
    let mut rx = sync.watch_channel_state();
    timeout(WAIT, rx.wait_for(|s| *s == want))
        .await
        .expect("channel state should change in time")
        .expect("connection alive");
}

/// Connect and consume the handshake so later frames are what the test sent.
async fn open(sync: &FleetSync, mock: &mut MockChannel, token: &str) {
    sync.connect(&Session::authenticated(token)).await;
    mock.next_uri().await;
    let handshake = mock.next_frame().await;
    assert_eq!(handshake["id"], token);
    wait_for_channel(sync, ChannelState::Open).await;
}

#[tokio::test]
async fn handshake_is_first_frame_and_token_is_in_query() {
    let mut mock = MockChannel::spawn().await;
    let mut sync = FleetSync::new(&config_for(&mock)).unwrap();

    sync.connect(&Session::authenticated("tok-1")).await;

    let uri = mock.next_uri().await;
    assert_eq!(uri, "/ws?session_id=tok-1");
    let first = mock.next_frame().await;
    assert_eq!(first, json!({"role": "operator", "id": "tok-1"}));

    wait_for_channel(&sync, ChannelState::Open).await;
    sync.shutdown().await;
}

#[tokio::test]
async fn summary_then_telemetry_reach_the_snapshot() {
    let mut mock = MockChannel::spawn().await;
    let mut sync = FleetSync::new(&config_for(&mock)).unwrap();
    open(&sync, &mut mock, "tok").await;

    mock.push(
        json!({
            "type": "robot_status_summary",
            "statuses": {"AVAILABLE": 2, "CHARGING": 1, "IN_OPERATION": 0, "BROKEN_CONNECT": 3},
            "connected_robots": 3
        })
        .to_string(),
    );
    wait_for_snapshot(&sync, |s| s.total_connected == 3).await;
    {
        let snap = sync.snapshot();
        assert_eq!(snap.count(RobotStatus::Available), 2);
        assert_eq!(snap.count(RobotStatus::Unreachable), 3);
        assert!(snap.robots.is_empty());
    }

    mock.push(
        json!({
            "robot_id": 7,
            "deviceName": "Transbot",
            "status": "IN_OPERATION",
            "battery": 81.5,
            "lat": 52.1,
            "lng": 47.9
        })
        .to_string(),
    );
    let id = RobotId::from(7u64);
    wait_for_snapshot(&sync, |s| s.robot(&id).is_some()).await;

    let snap = sync.snapshot();
    let robot = snap.robot(&id).unwrap();
    assert_eq!(robot.display_name, "Transbot");
    assert_eq!(robot.status, RobotStatus::InOperation);
    assert_eq!(robot.metric("battery"), Some(81.5));
    assert!(robot.coordinates.is_some());
    // Telemetry recounts from the robots themselves.
    assert_eq!(snap.count(RobotStatus::InOperation), 1);
    assert_eq!(snap.total_connected, 1);

    let log = sync.event_log();
    assert_eq!(log.len(), 2);
    assert!(matches!(log[0].event, FleetEvent::StatusSummary(_)));
    assert!(matches!(log[1].event, FleetEvent::Telemetry(_)));
    assert!(log[0].seq < log[1].seq);

    sync.shutdown().await;
}

#[tokio::test]
async fn heartbeats_and_garbage_leave_no_trace() {
    let mut mock = MockChannel::spawn().await;
    let mut sync = FleetSync::new(&config_for(&mock)).unwrap();
    open(&sync, &mut mock, "tok").await;

    mock.push(r#"{"type":"pong"}"#);
    mock.push("not json at all");
    mock.push("[1, 2, 3]");
    mock.push(r#"{"type":"robot_status_summary","statuses":{"AVAILABLE":"many"}}"#);
    // A marker frame; once it lands everything before it has been handled.
    mock.push(r#"{"robot_id":"marker","status":"CHARGING"}"#);

    let marker = RobotId::from("marker");
    wait_for_snapshot(&sync, |s| s.robot(&marker).is_some()).await;

    let snap = sync.snapshot();
    assert_eq!(snap.robots.len(), 1);
    assert_eq!(sync.event_log().len(), 1);
    assert_eq!(sync.channel_state(), ChannelState::Open);
    sync.shutdown().await;
}

#[tokio::test]
async fn telemetry_without_id_updates_current_robot() {
    let mut mock = MockChannel::spawn().await;
    let mut sync = FleetSync::new(&config_for(&mock)).unwrap();
    open(&sync, &mut mock, "tok").await;

    mock.push(r#"{"robot_id":3,"status":"AVAILABLE"}"#);
    mock.push(r#"{"cpu_usage":42}"#);

    let id = RobotId::from(3u64);
    wait_for_snapshot(&sync, |s| {
        s.robot(&id).and_then(|r| r.metric("cpu_usage")) == Some(42.0)
    })
    .await;
    assert_eq!(sync.snapshot().robots.len(), 1);
    sync.shutdown().await;
}

#[tokio::test]
async fn field_robot_reports_are_live_and_bad_ids_are_dropped() {
    let mut mock = MockChannel::spawn().await;
    let mut sync = FleetSync::new(&config_for(&mock)).unwrap();
    open(&sync, &mut mock, "tok").await;

    mock.push(
        json!({
            "deviceName": "transbot-01",
            "status": "Подключен",
            "camera_ok": "OK",
            "lidar_ok": "OK",
            "cpu_usage": 10,
            "coordinates": {"lat": 55.75, "lng": 37.61},
            "robot_id": 3
        })
        .to_string(),
    );
    mock.push(r#"{"robot_id":1.5,"cpu_usage":99}"#);
    mock.push(r#"{"robot_id":"marker","status":"CHARGING"}"#);

    let marker = RobotId::from("marker");
    wait_for_snapshot(&sync, |s| s.robot(&marker).is_some()).await;

    let snap = sync.snapshot();
    let robot = snap.robot(&RobotId::from(3u64)).unwrap();
    assert_eq!(robot.status, RobotStatus::Available);
    assert_eq!(robot.metric("cpu_usage"), Some(10.0));
    assert_eq!(snap.count(RobotStatus::Available), 1);
    assert_eq!(snap.count(RobotStatus::Unreachable), 0);
    assert_eq!(snap.robots.len(), 2);
    assert_eq!(sync.event_log().len(), 2);
    sync.shutdown().await;
}

#[tokio::test]
async fn probes_follow_configured_cadence() {
    let mut mock = MockChannel::spawn().await;
    let mut config = config_for(&mock);
    config.channel.probe_interval_ms = 100;
    let mut sync = FleetSync::new(&config).unwrap();
    open(&sync, &mut mock, "tok").await;

    let started = tokio::time::Instant::now();
    let mut last = 0u64;
    for _ in 0..3 {
        let frame = mock.next_frame().await;
        assert_eq!(frame["type"], "ping");
        let ts = frame["timestamp"].as_u64().expect("timestamp in millis");
        assert!(ts >= last);
        last = ts;
    }
    // First tick is skipped, so three probes take at least three intervals.
    assert!(started.elapsed() >= Duration::from_millis(250));
    sync.shutdown().await;
}

#[tokio::test]
async fn operator_messages_reach_the_backend() {
    let mut mock = MockChannel::spawn().await;
    let mut sync = FleetSync::new(&config_for(&mock)).unwrap();
    open(&sync, &mut mock, "tok").await;

    sync.send("plain text");
    sync.send(json!({"command": "return_home", "robot_id": 4}));

    assert_eq!(mock.next_text().await, "plain text");
    assert_eq!(
        mock.next_frame().await,
        json!({"command": "return_home", "robot_id": 4})
    );
    sync.shutdown().await;
}

#[tokio::test]
async fn send_while_closed_is_dropped() {
    let mut mock = MockChannel::spawn().await;
    let mut sync = FleetSync::new(&config_for(&mock)).unwrap();

    sync.send("lost");
    open(&sync, &mut mock, "tok").await;
    sync.send("kept");

    assert_eq!(mock.next_text().await, "kept");
    sync.shutdown().await;
}

#[tokio::test]
async fn session_login_and_logout_drive_the_channel() {
    let mut mock = MockChannel::spawn().await;
    let mut sync = FleetSync::new(&config_for(&mock)).unwrap();
    let sessions = SessionContext::new();
    sync.follow(&sessions);

    sessions.login("tok-a");
    assert_eq!(mock.next_uri().await, "/ws?session_id=tok-a");
    wait_for_channel(&sync, ChannelState::Open).await;

    sessions.logout();
    wait_for_channel(&sync, ChannelState::Closed).await;
    mock.wait_closed().await;

    // A new login opens a fresh channel with the new token.
    sessions.login("tok-b");
    assert_eq!(mock.next_uri().await, "/ws?session_id=tok-b");
    wait_for_channel(&sync, ChannelState::Open).await;

    sync.shutdown().await;
    assert_eq!(sync.channel_state(), ChannelState::Closed);
}

#[tokio::test]
async fn dropping_the_session_context_closes_the_channel() {
    let mut mock = MockChannel::spawn().await;
    let mut sync = FleetSync::new(&config_for(&mock)).unwrap();
    let sessions = SessionContext::new();
    sync.follow(&sessions);
    sessions.login("tok");
    wait_for_channel(&sync, ChannelState::Open).await;

    drop(sessions);
    wait_for_channel(&sync, ChannelState::Closed).await;
    mock.wait_closed().await;
    sync.shutdown().await;
}

#[tokio::test]
async fn silent_robots_are_demoted() {
    let mut mock = MockChannel::spawn().await;
    let config = config_for(&mock);
    let settings = ChannelSettings::new(
        config.channel_url().unwrap(),
        &config.channel,
        &config.reconnect,
    );
    let mut sync = FleetSync::with_settings(
        settings,
        FleetStore::new(),
        Duration::from_millis(50),
        Duration::from_millis(200),
    );
    open(&sync, &mut mock, "tok").await;

    mock.push(r#"{"robot_id":1,"status":"AVAILABLE"}"#);
    let id = RobotId::from(1u64);
    wait_for_snapshot(&sync, |s| {
        s.robot(&id).map(|r| r.status) == Some(RobotStatus::Available)
    })
    .await;

    wait_for_snapshot(&sync, |s| {
        s.robot(&id).map(|r| r.status) == Some(RobotStatus::Unreachable)
    })
    .await;
    assert_eq!(sync.snapshot().count(RobotStatus::Unreachable), 1);
    sync.shutdown().await;
}

#[tokio::test]
async fn backend_closing_leaves_channel_closed() {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        if let Ok((stream, _)) = listener.accept().await {
            if let Ok(mut ws) = tokio_tungstenite::accept_async(stream).await {
                let _ = ws.close(None).await;
            }
        }
    });

    let mut config = fleetsync::config::FleetConfig::default();
    config.channel.url = Some(format!("ws://{}/ws", addr));
    let mut sync = FleetSync::new(&config).unwrap();
    sync.connect(&Session::authenticated("tok")).await;

    let mut rx = sync.watch_channel_state();
    timeout(WAIT, rx.wait_for(|s| *s == ChannelState::Closed))
        .await
        .unwrap()
        .unwrap();
    sync.shutdown().await;
}

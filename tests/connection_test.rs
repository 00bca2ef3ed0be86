//! Integration tests for the connection manager: backoff, stop and fan-out.
//!
//! All tests run on a paused tokio clock, so backoff delays are observed
//! exactly without real waiting.

use live_telemetry::connection::mock::MockTransport;
use live_telemetry::connection::{
    ConnectionManager, ConnectionState, ReconnectConfig, StreamEvent,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::{sleep, timeout};

const URL: &str = "ws://mock.local/ws";

fn gaps_ms(times: &[tokio::time::Instant]) -> Vec<u128> {
    times
        .windows(2)
        .map(|pair| (pair[1] - pair[0]).as_millis())
        .collect()
}

async fn wait_for_state(rx: &mut watch::Receiver<ConnectionState>, target: ConnectionState) {
    timeout(Duration::from_secs(60), rx.wait_for(|s| *s == target))
        .await
        .expect("timed out waiting for connection state")
        .expect("state channel closed");
}

#[tokio::test(start_paused = true)]
async fn test_backoff_sequence_on_repeated_connect_failures() {
    let mock = Arc::new(MockTransport::refusing());
    let mut manager = ConnectionManager::new(mock.clone(), ReconnectConfig::default());

    assert!(manager.open(URL));
    sleep(Duration::from_millis(40_500)).await;
    manager.shutdown().await;

    // attempts at 0, 1, 3, 7, 15, 30 seconds
    assert_eq!(mock.connect_attempts(), 6);
    assert_eq!(
        gaps_ms(&mock.attempt_times()),
        vec![1_000, 2_000, 4_000, 8_000, 15_000]
    );
}

#[tokio::test(start_paused = true)]
async fn test_backoff_caps_at_ceiling() {
    let mock = Arc::new(MockTransport::refusing());
    let mut manager = ConnectionManager::new(mock.clone(), ReconnectConfig::default());

    manager.open(URL);
    sleep(Duration::from_secs(120)).await;
    manager.stop();

    let gaps = gaps_ms(&mock.attempt_times());
    assert!(gaps.len() > 6);
    assert!(gaps.iter().all(|gap| *gap <= 15_000));
    assert!(gaps[4..].iter().all(|gap| *gap == 15_000));
}

#[tokio::test(start_paused = true)]
async fn test_peer_closes_follow_backoff_and_reset_on_open() {
    let mock = Arc::new(MockTransport::refusing());
    let mut manager = ConnectionManager::new(mock.clone(), ReconnectConfig::default());
    let mut state = manager.watch_state();

    manager.open(URL);
    // failures at 0 s and 1 s, next attempt due at 3 s
    sleep(Duration::from_secs(2)).await;
    mock.set_refuse(false);
    wait_for_state(&mut state, ConnectionState::Connected).await;
    assert_eq!(mock.connect_attempts(), 3);

    // A close after a successful open waits the floor delay again
    mock.peer().unwrap().close();
    wait_for_state(&mut state, ConnectionState::Disconnected).await;
    wait_for_state(&mut state, ConnectionState::Connected).await;

    let gaps = gaps_ms(&mock.attempt_times());
    assert_eq!(gaps, vec![1_000, 2_000, 1_000]);
    assert_eq!(mock.accepted(), 2);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_receive_error_is_treated_like_close() {
    let mock = Arc::new(MockTransport::new());
    let mut manager = ConnectionManager::new(mock.clone(), ReconnectConfig::default());
    let mut state = manager.watch_state();

    manager.open(URL);
    wait_for_state(&mut state, ConnectionState::Connected).await;
    mock.peer().unwrap().fail("connection reset by peer");

    wait_for_state(&mut state, ConnectionState::Disconnected).await;
    wait_for_state(&mut state, ConnectionState::Connected).await;
    assert_eq!(mock.accepted(), 2);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_no_reconnect_after_stop_while_waiting() {
    let mock = Arc::new(MockTransport::new());
    let mut manager = ConnectionManager::new(mock.clone(), ReconnectConfig::default());
    let mut state = manager.watch_state();

    manager.open(URL);
    wait_for_state(&mut state, ConnectionState::Connected).await;
    mock.peer().unwrap().close();
    wait_for_state(&mut state, ConnectionState::Disconnected).await;

    // Reconnect timer is pending; stop cancels it
    manager.stop();
    sleep(Duration::from_secs(600)).await;

    assert_eq!(mock.connect_attempts(), 1);
    assert_eq!(manager.state(), ConnectionState::Disconnected);
    assert!(!manager.is_busy());
}

#[tokio::test(start_paused = true)]
async fn test_stop_closes_live_socket() {
    let mock = Arc::new(MockTransport::new());
    let mut manager = ConnectionManager::new(mock.clone(), ReconnectConfig::default());
    let mut state = manager.watch_state();

    manager.open(URL);
    wait_for_state(&mut state, ConnectionState::Connected).await;
    manager.shutdown().await;
    manager.stop();

    let peer = mock.peer().unwrap();
    assert!(peer.closed_by_client());
    assert!(!peer.send_text(r#"{"device_id":"late"}"#));

    sleep(Duration::from_secs(600)).await;
    assert_eq!(mock.connect_attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn test_reopen_while_previous_socket_is_still_closing() {
    let mock = Arc::new(MockTransport::new());
    mock.set_close_delay(Duration::from_millis(200));
    let mut manager = ConnectionManager::new(mock.clone(), ReconnectConfig::default());
    let mut state = manager.watch_state();

    manager.open(URL);
    wait_for_state(&mut state, ConnectionState::Connected).await;
    let first = mock.peer().unwrap();

    manager.stop();
    assert!(manager.open(URL));
    sleep(Duration::from_secs(1)).await;

    // The old supervisor finished closing after the new session connected
    assert!(first.closed_by_client());
    assert_eq!(mock.connect_attempts(), 2);
    assert_eq!(manager.state(), ConnectionState::Connected);

    // Frames of the new session still flow
    let mut subscription = manager.subscribe();
    mock.peer().unwrap().send_text(r#"{"device_id":"d1"}"#);
    assert!(subscription.recv().await.is_some());

    manager.shutdown().await;
    assert_eq!(manager.state(), ConnectionState::Disconnected);
}

#[tokio::test(start_paused = true)]
async fn test_events_fan_out_and_discards_are_dropped() {
    let mock = Arc::new(MockTransport::new());
    let mut manager = ConnectionManager::new(mock.clone(), ReconnectConfig::default());
    let mut first = manager.subscribe();
    let mut second = manager.subscribe();
    let mut state = manager.watch_state();

    manager.open(URL);
    wait_for_state(&mut state, ConnectionState::Connected).await;
    let peer = mock.peer().unwrap();

    peer.send_text(r#"{"type":"telemetry","payload":{"device_id":"d1","heading_deg":12.5}}"#);
    peer.send_text("{{not json");
    peer.send_text(r#"{"type":"telemetry","payload":{"heading_deg":1}}"#);
    peer.send_text(r#"{"type":"status","uptime_s":12}"#);
    peer.send_text(r#"{"type":"training_live","device_id":"d1","sample_count":3}"#);

    for subscription in [&mut first, &mut second] {
        match subscription.recv().await {
            Some(StreamEvent::Telemetry(record)) => {
                assert_eq!(record.device_id, "d1");
                assert_eq!(record.heading_degrees, 12.5);
            }
            other => panic!("expected telemetry, got {other:?}"),
        }
        match subscription.recv().await {
            Some(StreamEvent::TrainingStats(stats)) => assert_eq!(stats.sample_count, 3),
            other => panic!("expected training stats, got {other:?}"),
        }
    }

    // Unsubscribing does not touch the connection
    assert!(manager.unsubscribe(second.id()));
    assert!(!manager.unsubscribe(second.id()));
    assert_eq!(manager.subscriber_count(), 1);
    peer.send_text(r#"{"device_id":"d2"}"#);

    assert!(matches!(first.recv().await, Some(StreamEvent::Telemetry(r)) if r.device_id == "d2"));
    assert!(second.recv().await.is_none());
    assert_eq!(manager.state(), ConnectionState::Connected);
    assert_eq!(mock.accepted(), 1);

    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_dropped_subscription_is_pruned() {
    let mock = Arc::new(MockTransport::new());
    let mut manager = ConnectionManager::new(mock.clone(), ReconnectConfig::default());
    let mut kept = manager.subscribe();
    let dropped = manager.subscribe();
    drop(dropped);
    let mut state = manager.watch_state();

    manager.open(URL);
    wait_for_state(&mut state, ConnectionState::Connected).await;
    mock.peer().unwrap().send_text(r#"{"device_id":"d1"}"#);

    assert!(kept.recv().await.is_some());
    assert_eq!(manager.subscriber_count(), 1);
    manager.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn test_independent_managers_do_not_share_state() {
    let first_mock = Arc::new(MockTransport::new());
    let second_mock = Arc::new(MockTransport::refusing());
    let mut first = ConnectionManager::new(first_mock.clone(), ReconnectConfig::default());
    let mut second = ConnectionManager::new(second_mock.clone(), ReconnectConfig::default());
    let mut first_state = first.watch_state();

    first.open(URL);
    second.open(URL);
    wait_for_state(&mut first_state, ConnectionState::Connected).await;
    sleep(Duration::from_millis(500)).await;

    assert_eq!(first.state(), ConnectionState::Connected);
    assert_ne!(second.state(), ConnectionState::Connected);

    second.shutdown().await;
    assert_eq!(first.state(), ConnectionState::Connected);
    first.shutdown().await;
}

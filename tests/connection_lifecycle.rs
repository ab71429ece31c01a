mod common;

use common::{connected, harness, test_config, wait_for, MockRadio};
use meshgate::device::{DeviceRequest, LifecycleState};
use meshgate::storage::Store;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::time::Instant;

#[tokio::test(start_paused = true)]
async fn unreachable_device_gives_up_after_max_retries() {
    let h = harness(MockRadio::unreachable(), test_config());
    let began = Instant::now();
    h.manager.start();

    assert!(wait_for(|| h.manager.status().unreachable).await);
    let elapsed = began.elapsed();
    let status = h.manager.status();

    assert_eq!(h.radio.attempts(), 3);
    assert!(!status.connected);
    assert!(!h.manager.is_connected());
    assert_eq!(status.state, LifecycleState::Idle);
    assert!(status.last_error.unwrap().contains("unreachable after 3 attempts"));
    // Waits of 5s then 10s between the three attempts, none after the last.
    assert!(elapsed >= Duration::from_secs(15), "{:?}", elapsed);
    assert!(elapsed < Duration::from_secs(16), "{:?}", elapsed);

    // Nothing else is attempted once the driver has given up.
    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(h.radio.attempts(), 3);
}

#[tokio::test(start_paused = true)]
async fn transient_failures_are_retried_until_connected() {
    let radio = MockRadio::new();
    radio.fail_next_connects(2);
    let h = harness(radio, test_config());
    h.manager.start();

    assert!(wait_for(|| h.manager.is_connected()).await);
    assert_eq!(h.radio.attempts(), 3);
    let status = h.manager.status();
    assert_eq!(status.state, LifecycleState::Connected);
    assert!(!status.unreachable);
    assert_eq!(status.device_name.as_deref(), Some("Base Camp"));
    assert_eq!(status.public_key.as_deref(), Some(common::DEVICE_KEY));
}

#[tokio::test(start_paused = true)]
async fn restart_after_unreachable_clears_the_flag() {
    let radio = MockRadio::unreachable();
    let h = harness(radio, test_config());
    h.manager.start();
    assert!(wait_for(|| h.manager.status().unreachable).await);

    h.radio.fail_next_connects(0);
    h.manager.start();
    assert!(!h.manager.status().unreachable);
    assert!(wait_for(|| h.manager.is_connected()).await);
    assert_eq!(h.radio.attempts(), 4);
}

#[tokio::test]
async fn handshake_records_identity_and_mirrors_contacts() {
    let h = connected().await;
    let device = h.store.get_device_info().unwrap().unwrap();
    assert_eq!(device.name, "Base Camp");
    assert_eq!(device.public_key, common::DEVICE_KEY);
    assert!(h.radio.sent_count(|r| *r == DeviceRequest::GetContacts) >= 1);
    h.manager.stop().await;
}

#[tokio::test]
async fn start_is_idempotent_while_running() {
    let h = connected().await;
    h.manager.start();
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(h.radio.attempts(), 1);
    assert_eq!(h.radio.live_links.load(Ordering::SeqCst), 1);
    h.manager.stop().await;
}

#[tokio::test]
async fn stop_is_safe_in_any_state() {
    let h = harness(MockRadio::new(), test_config());
    h.manager.stop().await;
    assert_eq!(h.manager.status().state, LifecycleState::Idle);

    h.manager.start();
    assert!(wait_for(|| h.manager.is_connected()).await);
    assert!(h.manager.bus().subscriber_count() > 0);

    h.manager.stop().await;
    let status = h.manager.status();
    assert_eq!(status.state, LifecycleState::Idle);
    assert!(!status.connected);
    assert!(!h.manager.is_connected());
    assert_eq!(h.manager.bus().subscriber_count(), 0);
    assert_eq!(h.radio.live_links.load(Ordering::SeqCst), 0);

    h.manager.stop().await;
}

#[tokio::test]
async fn at_most_one_live_link_across_reconnects() {
    let h = connected().await;

    for round in 2..=4u32 {
        assert!(h.radio.drop_link("cable pulled"));
        assert!(wait_for(|| h.radio.attempts() == round && h.manager.is_connected()).await);
    }

    assert_eq!(h.radio.max_live_links.load(Ordering::SeqCst), 1);
    assert_eq!(h.radio.live_links.load(Ordering::SeqCst), 1);
    h.manager.stop().await;
    assert_eq!(h.radio.live_links.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn lost_link_without_auto_reconnect_settles_idle() {
    let mut config = test_config();
    config.auto_reconnect = false;
    let h = harness(MockRadio::new(), config);
    h.manager.start();
    assert!(wait_for(|| h.manager.is_connected()).await);

    h.radio.drop_link("radio rebooted");
    assert!(wait_for(|| h.manager.status().state == LifecycleState::Idle).await);
    tokio::time::sleep(Duration::from_millis(100)).await;

    let status = h.manager.status();
    assert!(!status.connected);
    assert!(status.last_error.unwrap().contains("radio rebooted"));
    assert_eq!(h.radio.attempts(), 1);
}

#[tokio::test(start_paused = true)]
async fn silent_device_fails_health_check_and_reconnects() {
    let mut config = test_config();
    config.health_interval_secs = Some(10);
    config.health_timeout_secs = Some(5);
    let h = harness(MockRadio::new(), config);
    h.radio.set_responder(|request| match request {
        DeviceRequest::GetBattery => None,
        other => common::default_response(other),
    });
    h.manager.start();
    assert!(wait_for(|| h.manager.is_connected()).await);

    assert!(wait_for(|| h.radio.attempts() >= 2).await);
    assert!(h.radio.sent_count(|r| *r == DeviceRequest::GetBattery) >= 1);
    assert_eq!(h.radio.max_live_links.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn status_transitions_are_published_live() {
    let h = harness(MockRadio::new(), test_config());
    let mut updates = h.live.subscribe();
    h.manager.start();
    assert!(wait_for(|| h.manager.is_connected()).await);

    let mut states = Vec::new();
    while let Ok(update) = updates.try_recv() {
        if update.topic == "status" {
            if let Some(state) = update.payload["state"].as_str() {
                states.push(state.to_string());
            }
        }
    }
    assert!(states.contains(&"connecting".to_string()), "{:?}", states);
    assert!(states.contains(&"connected".to_string()), "{:?}", states);
    h.manager.stop().await;
}

#[tokio::test]
async fn status_watchers_see_the_connection_come_up() {
    let h = harness(MockRadio::new(), test_config());
    let mut status = h.manager.watch_status();
    h.manager.start();

    let connected = tokio::time::timeout(Duration::from_secs(5), status.wait_for(|s| s.connected))
        .await
        .unwrap()
        .unwrap()
        .clone();
    assert_eq!(connected.state, LifecycleState::Connected);
    assert_eq!(connected.attempt, 1);
    h.manager.stop().await;
    assert!(!status.borrow_and_update().connected);
}

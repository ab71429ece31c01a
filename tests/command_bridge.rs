mod common;

use common::{connected, harness, test_config, wait_for, MockRadio};
use meshgate::device::events::DeliveryAck;
use meshgate::device::lifecycle::LATE_ANSWER_GRACE;
use meshgate::device::{DeviceEvent, DeviceRequest, DeviceResponse};
use meshgate::error::GatewayError;
use meshgate::storage::{ContactSource, ContactUpsert, Direction, Store};
use std::time::Duration;
use tokio::time::Instant;

const ALICE: &str = "a1b2c3d4e5f60718293a4b5c6d7e8f90a1b2c3d4e5f60718293a4b5c6d7e8f90";

fn never_answer_battery(radio: &MockRadio) {
    radio.set_responder(|request| match request {
        DeviceRequest::GetBattery => None,
        other => common::default_response(other),
    });
}

#[tokio::test]
async fn commands_fail_fast_when_not_connected() {
    let h = harness(MockRadio::new(), test_config());

    let err = h.manager.bridge().call(DeviceRequest::GetBattery).await.unwrap_err();
    assert!(matches!(err, GatewayError::NotConnected));

    let outcome = h.manager.send_channel_message(0, "hello").await;
    assert!(!outcome.ok);
    assert_eq!(outcome.error.as_deref(), Some("device not connected"));
    assert!(h.radio.sent().is_empty());
}

#[tokio::test]
async fn channel_message_is_sent_and_stored() {
    let h = connected().await;

    let outcome = h.manager.send_channel_message(0, "hello mesh").await;
    assert!(outcome.ok, "{:?}", outcome);
    let id = outcome.data["id"].as_i64().unwrap();
    assert!(id > 0);

    let sent = h.radio.sent_count(|r| {
        matches!(r, DeviceRequest::SendChannelMessage { channel: 0, text, .. } if text == "hello mesh")
    });
    assert_eq!(sent, 1);

    let stored = h.store.get_channel_messages(Some(0), 10, 0).unwrap();
    assert_eq!(stored.len(), 1);
    assert_eq!(stored[0].id, id);
    assert!(stored[0].is_own);
    assert_eq!(stored[0].sender, "Base Camp");
    h.manager.stop().await;
}

#[tokio::test]
async fn invalid_input_is_rejected_before_the_radio() {
    let h = connected().await;
    let before = h.radio.sent().len();

    assert!(!h.manager.send_channel_message(0, "   ").await.ok);
    assert!(!h.manager.send_channel_message(200, "hi").await.ok);
    assert!(!h.manager.send_dm("nobody-we-know", "hi").await.ok);
    assert!(!h.manager.remove_channel(0).await.ok);

    assert_eq!(h.radio.sent().len(), before);
    h.manager.stop().await;
}

#[tokio::test]
async fn device_error_is_reported_to_the_caller() {
    let h = connected().await;
    h.radio.set_responder(|request| match request {
        DeviceRequest::SendAdvert { .. } => Some(Err("table full".to_string())),
        other => common::default_response(other),
    });

    let err = h
        .manager
        .bridge()
        .call(DeviceRequest::SendAdvert { flood: true })
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::DeviceRejected(ref m) if m == "table full"));
    assert!(h.manager.is_connected());
    h.manager.stop().await;
}

#[tokio::test]
async fn timeout_yields_exactly_one_outcome() {
    let h = connected().await;
    never_answer_battery(&h.radio);

    let err = h
        .manager
        .bridge()
        .execute(DeviceRequest::GetBattery, Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Timeout { command: "get_battery", .. }));

    // The link survives and the next command goes through.
    let outcome = h.manager.send_advert(false).await;
    assert!(outcome.ok, "{:?}", outcome);
    assert!(h.manager.is_connected());
    h.manager.stop().await;
}

#[tokio::test(start_paused = true)]
async fn same_kind_command_waits_for_a_late_answer_window() {
    let h = connected().await;
    never_answer_battery(&h.radio);

    let err = h
        .manager
        .bridge()
        .execute(DeviceRequest::GetBattery, Duration::from_millis(200))
        .await
        .unwrap_err();
    assert!(matches!(err, GatewayError::Timeout { .. }));
    let expired_at = Instant::now();

    // A command with different response codes is not held.
    let outcome = h.manager.send_advert(false).await;
    assert!(outcome.ok, "{:?}", outcome);
    assert!(expired_at.elapsed() < LATE_ANSWER_GRACE);

    h.radio.set_responder(common::default_response);
    let outcome = h.manager.get_battery().await;
    assert!(outcome.ok, "{:?}", outcome);
    assert!(expired_at.elapsed() >= LATE_ANSWER_GRACE - Duration::from_millis(50));
    assert_eq!(
        h.radio.sent_count(|r| *r == DeviceRequest::GetBattery),
        2
    );
    h.manager.stop().await;
}

#[tokio::test]
async fn outstanding_commands_fail_when_the_link_drops() {
    let h = connected().await;
    never_answer_battery(&h.radio);

    let first = {
        let manager = h.manager.clone();
        tokio::spawn(async move {
            manager
                .bridge()
                .execute(DeviceRequest::GetBattery, Duration::from_secs(30))
                .await
        })
    };
    let second = {
        let manager = h.manager.clone();
        tokio::spawn(async move {
            manager
                .bridge()
                .execute(DeviceRequest::GetBattery, Duration::from_secs(30))
                .await
        })
    };

    assert!(wait_for(|| h.radio.sent_count(|r| *r == DeviceRequest::GetBattery) == 1).await);
    tokio::time::sleep(Duration::from_millis(50)).await;
    assert!(h.radio.drop_link("cable pulled"));

    let first = first.await.unwrap().unwrap_err();
    let second = second.await.unwrap().unwrap_err();
    assert!(matches!(first, GatewayError::DisconnectedMidFlight), "{:?}", first);
    assert!(matches!(second, GatewayError::DisconnectedMidFlight), "{:?}", second);

    // Only the first ever reached the radio.
    assert_eq!(h.radio.sent_count(|r| *r == DeviceRequest::GetBattery), 1);
    assert!(wait_for(|| h.manager.is_connected()).await);
    h.manager.stop().await;
}

#[tokio::test]
async fn commands_run_one_at_a_time_in_order() {
    let h = connected().await;
    let before = h.radio.sent().len();

    let mut tasks = Vec::new();
    for i in 0..5u8 {
        let manager = h.manager.clone();
        tasks.push(tokio::spawn(async move {
            manager.bridge().call(DeviceRequest::GetChannel(i)).await
        }));
    }
    for (i, task) in tasks.into_iter().enumerate() {
        match task.await.unwrap().unwrap() {
            DeviceResponse::Channel(c) => assert_eq!(c.index as usize, i),
            other => panic!("unexpected {:?}", other),
        }
    }
    assert_eq!(h.radio.sent().len() - before, 5);
    h.manager.stop().await;
}

#[tokio::test]
async fn direct_message_links_delivery_ack() {
    let h = connected().await;
    let mut alice = ContactUpsert::new(ALICE, ContactSource::Advert);
    alice.name = "Alice".to_string();
    h.store.upsert_contact(&alice).unwrap();

    let outcome = h.manager.send_dm("alice", "meet at the ridge").await;
    assert!(outcome.ok, "{:?}", outcome);
    assert_eq!(outcome.data["expected_ack"], "a1b2c3d4");

    let sent = h.radio.sent_count(|r| {
        matches!(r, DeviceRequest::SendDirectMessage { recipient_prefix, .. }
            if hex::encode(recipient_prefix) == ALICE[..12])
    });
    assert_eq!(sent, 1);

    let dms = h.store.get_dm_messages(ALICE, 10, 0).unwrap();
    assert_eq!(dms.len(), 1);
    assert_eq!(dms[0].direction, Direction::Out);

    let pending = h.manager.delivery_status(&["a1b2c3d4".to_string()]);
    assert_eq!(pending.data["a1b2c3d4"]["delivered"], false);

    h.radio.emit(DeviceEvent::DeliveryAck(DeliveryAck {
        code: "a1b2c3d4".to_string(),
        round_trip_ms: Some(1800),
    }));
    assert!(wait_for(|| h.store.get_ack_for_code("a1b2c3d4").unwrap().is_some()).await);

    let delivered = h.manager.delivery_status(&["A1B2C3D4".to_string()]);
    assert_eq!(delivered.data["a1b2c3d4"]["delivered"], true);
    assert_eq!(delivered.data["a1b2c3d4"]["dm_id"], dms[0].id);
    h.manager.stop().await;
}

#[tokio::test]
async fn channel_slots_are_managed_on_the_device() {
    let h = connected().await;

    let outcome = h.manager.add_channel("#hiking", None).await;
    assert!(outcome.ok, "{:?}", outcome);
    assert_eq!(outcome.data["index"], 1);
    let channels = h.store.get_channels().unwrap();
    assert!(channels.iter().any(|c| c.idx == 1 && c.name == "#hiking"));

    let removed = h.manager.remove_channel(1).await;
    assert!(removed.ok, "{:?}", removed);
    assert!(h.store.get_channels().unwrap().iter().all(|c| c.idx != 1));
    h.manager.stop().await;
}

#[tokio::test]
async fn protected_contacts_cannot_be_deleted() {
    let h = connected().await;
    h.store
        .upsert_contact(&ContactUpsert::new(ALICE, ContactSource::Advert))
        .unwrap();

    assert!(h.manager.set_contact_protected(ALICE, true).ok);
    let refused = h.manager.delete_contact(ALICE).await;
    assert!(!refused.ok);
    assert!(h.store.get_contact(ALICE).unwrap().is_some());

    assert!(h.manager.set_contact_protected(ALICE, false).ok);
    let deleted = h.manager.delete_contact(ALICE).await;
    assert!(deleted.ok, "{:?}", deleted);
    assert!(h.store.get_contact(ALICE).unwrap().is_none());
    assert_eq!(h.radio.sent_count(|r| matches!(r, DeviceRequest::RemoveContact(_))), 1);
    h.manager.stop().await;
}

#[tokio::test]
async fn manual_approval_setting_is_persisted() {
    let h = connected().await;

    let outcome = h.manager.set_manual_add_contacts(true).await;
    assert!(outcome.ok, "{:?}", outcome);
    assert_eq!(
        h.store.get_setting("manual_add_contacts").unwrap().as_deref(),
        Some("true")
    );
    assert_eq!(
        h.radio.sent_count(|r| matches!(r, DeviceRequest::SetOtherParams { manual_add_contacts: true, .. })),
        1
    );
    h.manager.stop().await;
}

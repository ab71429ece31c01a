use meshgate::storage::{
    ContactSource, ContactUpsert, Direction, NewAdvertisement, NewChannelMessage,
    NewDirectMessage, SearchHit, SqliteStore, Store,
};

const KEY: &str = "c0ffee00c0ffee00c0ffee00c0ffee00c0ffee00c0ffee00c0ffee00c0ffee00";
const OTHER: &str = "c0ffee11223344556677889900aabbccddeeff00112233445566778899aabbcc";

fn channel_row(content: &str, timestamp: i64) -> NewChannelMessage {
    NewChannelMessage {
        channel_idx: 0,
        sender: "Carol".to_string(),
        content: content.to_string(),
        timestamp,
        sender_timestamp: Some(timestamp),
        is_own: false,
        txt_type: 0,
        snr: None,
        path_len: None,
        pkt_payload: None,
    }
}

fn dm_row(key: &str, content: &str, timestamp: i64, ack: Option<&str>) -> NewDirectMessage {
    NewDirectMessage {
        contact_pubkey: key.to_string(),
        direction: if ack.is_some() { Direction::Out } else { Direction::In },
        content: content.to_string(),
        timestamp,
        sender_timestamp: Some(timestamp),
        txt_type: 0,
        snr: None,
        path_len: None,
        expected_ack: ack.map(str::to_string),
        signature: None,
        pkt_payload: None,
    }
}

#[test]
fn data_survives_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("nested").join("meshgate.db");
    {
        let store = SqliteStore::open(&path).unwrap();
        store.set_device_info(KEY, "Base Camp", None).unwrap();
        store.insert_channel_message(&channel_row("summit at noon", 10)).unwrap();
        store.set_setting("manual_add_contacts", "true").unwrap();
    }

    let store = SqliteStore::open(&path).unwrap();
    assert_eq!(store.get_device_info().unwrap().unwrap().name, "Base Camp");
    assert_eq!(store.get_stats().unwrap().channel_messages, 1);
    assert_eq!(
        store.get_setting("manual_add_contacts").unwrap().as_deref(),
        Some("true")
    );
}

#[test]
fn contact_upsert_never_erases_known_fields() {
    let store = SqliteStore::in_memory().unwrap();
    let mut first = ContactUpsert::new(KEY, ContactSource::Advert);
    first.name = "Ridge".to_string();
    first.adv_type = Some(2);
    first.adv_lat = Some(46.5);
    first.out_path = "a1b2".to_string();
    first.out_path_len = Some(2);
    store.upsert_contact(&first).unwrap();

    // A bare message-sourced touch carries nothing but the key.
    store
        .upsert_contact(&ContactUpsert::new(&KEY.to_uppercase(), ContactSource::Message))
        .unwrap();

    let contacts = store.get_contacts().unwrap();
    assert_eq!(contacts.len(), 1);
    let c = &contacts[0];
    assert_eq!(c.name, "Ridge");
    assert_eq!(c.adv_type, Some(2));
    assert_eq!(c.adv_lat, Some(46.5));
    assert_eq!(c.out_path, "a1b2");
    assert_eq!(c.out_path_len, 2);
    assert_eq!(c.source, "message");
}

#[test]
fn protection_is_sticky_across_upserts() {
    let store = SqliteStore::in_memory().unwrap();
    store
        .upsert_contact(&ContactUpsert::new(KEY, ContactSource::Device))
        .unwrap();
    assert!(store.set_contact_protected(KEY, true).unwrap());

    let mut refresh = ContactUpsert::new(KEY, ContactSource::Device);
    refresh.name = "Renamed".to_string();
    store.upsert_contact(&refresh).unwrap();

    let c = store.get_contact(KEY).unwrap().unwrap();
    assert!(c.is_protected);
    assert_eq!(c.name, "Renamed");
    assert!(!store.set_contact_protected(OTHER, true).unwrap());
}

#[test]
fn contacts_resolve_by_prefix_and_name() {
    let store = SqliteStore::in_memory().unwrap();
    store
        .upsert_contact(&ContactUpsert::new(KEY, ContactSource::Advert))
        .unwrap();
    let mut named = ContactUpsert::new(OTHER, ContactSource::Advert);
    named.name = "Other".to_string();
    store.upsert_contact(&named).unwrap();

    let found = store.find_contact_by_prefix("C0FFEE11").unwrap().unwrap();
    assert_eq!(found.public_key, OTHER);
    assert!(store.find_contact_by_prefix("deadbeef").unwrap().is_none());
    assert_eq!(
        store.find_contact_by_name("other").unwrap().unwrap().public_key,
        OTHER
    );
}

#[test]
fn dm_history_matches_by_key_prefix() {
    let store = SqliteStore::in_memory().unwrap();
    store.insert_direct_message(&dm_row(KEY, "one", 1, None)).unwrap();
    store.insert_direct_message(&dm_row(KEY, "two", 2, Some("0a0b0c0d"))).unwrap();
    store.insert_direct_message(&dm_row(OTHER, "elsewhere", 3, None)).unwrap();

    let exact = store.get_dm_messages(KEY, 10, 0).unwrap();
    assert_eq!(exact.len(), 2);
    assert_eq!(exact[0].content, "two");

    let by_prefix = store.get_dm_messages("c0ffee", 10, 0).unwrap();
    assert_eq!(by_prefix.len(), 3);
    let paged = store.get_dm_messages(KEY, 1, 1).unwrap();
    assert_eq!(paged[0].content, "one");
}

#[test]
fn full_text_search_spans_channels_and_dms() {
    let store = SqliteStore::in_memory().unwrap();
    store.insert_channel_message(&channel_row("storm coming over the pass", 10)).unwrap();
    store.insert_channel_message(&channel_row("all clear", 20)).unwrap();
    store.insert_direct_message(&dm_row(KEY, "watch the storm", 30, None)).unwrap();

    let hits = store.search_messages("storm", 10).unwrap();
    assert_eq!(hits.len(), 2);
    // Newest first.
    assert!(matches!(&hits[0], SearchHit::Dm { content, .. } if content == "watch the storm"));
    assert!(matches!(&hits[1], SearchHit::Channel { channel_idx: 0, .. }));

    assert!(store.search_messages("   ", 10).unwrap().is_empty());
    // FTS operators in user input are treated as plain words.
    assert!(store.search_messages("storm OR \"", 10).is_ok());
}

#[test]
fn identical_adverts_are_stored_once() {
    let store = SqliteStore::in_memory().unwrap();
    let advert = NewAdvertisement {
        public_key: KEY.to_string(),
        name: Some("Ridge".to_string()),
        adv_type: Some(2),
        lat: None,
        lon: None,
        timestamp: 1_760_000_000,
        snr: Some(5.5),
        raw_payload: None,
    };
    assert!(store.insert_advertisement(&advert).unwrap());
    assert!(!store.insert_advertisement(&advert).unwrap());

    let later = NewAdvertisement {
        timestamp: 1_760_000_600,
        ..advert
    };
    assert!(store.insert_advertisement(&later).unwrap());
    assert_eq!(store.get_stats().unwrap().advertisements, 2);
}

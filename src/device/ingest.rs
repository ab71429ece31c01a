//! Event ingestion: one handler per event kind.
//!
//! Handlers translate an event into storage rows, then publish a live update.
//! They run on the ingest line, so they only do short synchronous writes and
//! never wait on the command bridge.

use chrono::Utc;
use log::{debug, info};
use serde_json::json;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use super::events::{DeviceEvent, EventBus, EventHandler, EventKind, Subscription};
use super::types::DeviceContact;
use crate::error::GatewayResult;
use crate::live::LiveSink;
use crate::logutil::{escape_log, short_key, truncate_for_log};
use crate::storage::{
    ContactSource, ContactUpsert, Direction, NewAck, NewAdvertisement, NewChannelMessage,
    NewDirectMessage, NewPath, Store,
};

/// Contacts the device discovered while manual approval is on, waiting for
/// the operator to add them.
#[derive(Default)]
pub struct PendingContacts {
    enabled: AtomicBool,
    entries: Mutex<BTreeMap<String, DeviceContact>>,
}

impl PendingContacts {
    pub fn set_enabled(&self, enabled: bool) {
        self.enabled.store(enabled, Ordering::Relaxed);
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled.load(Ordering::Relaxed)
    }

    pub fn insert(&self, contact: DeviceContact) {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(contact.public_key.clone(), contact);
    }

    pub fn take(&self, public_key: &str) -> Option<DeviceContact> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(&public_key.to_ascii_lowercase())
    }

    /// Put a contact back after a failed approval.
    pub fn restore(&self, contact: DeviceContact) {
        self.insert(contact);
    }

    pub fn list(&self) -> Vec<DeviceContact> {
        self.entries
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }
}

/// What every handler writes to.
#[derive(Clone)]
pub struct IngestContext {
    pub store: Arc<dyn Store>,
    pub sink: Arc<dyn LiveSink>,
    pub pending: Arc<PendingContacts>,
}

/// `"Sender: text"` → `("Sender", "text")`; anything else is from `Unknown`.
pub fn split_channel_text(text: &str) -> (String, String) {
    match text.split_once(':') {
        Some((sender, body)) if !sender.trim().is_empty() => {
            (sender.trim().to_string(), body.trim().to_string())
        }
        _ => ("Unknown".to_string(), text.trim().to_string()),
    }
}

/// Map a device contact record onto a contact write.
pub fn contact_from_device(contact: &DeviceContact, source: ContactSource) -> ContactUpsert {
    let mut up = ContactUpsert::new(&contact.public_key, source);
    up.name = contact.name.clone();
    up.adv_type = Some(contact.adv_type);
    up.flags = Some(contact.flags);
    up.out_path = contact.out_path_hex();
    up.out_path_len = Some(i32::from(contact.out_path_len));
    up.last_advert = (contact.last_advert > 0).then_some(i64::from(contact.last_advert));
    up.adv_lat = contact.adv_lat;
    up.adv_lon = contact.adv_lon;
    up.lastmod = (contact.lastmod > 0).then_some(i64::from(contact.lastmod));
    up
}

fn now() -> i64 {
    Utc::now().timestamp()
}

struct ChannelMessageHandler(IngestContext);

impl EventHandler for ChannelMessageHandler {
    fn name(&self) -> &str {
        "channel_message"
    }

    fn handle(&self, event: &DeviceEvent) -> GatewayResult<()> {
        let DeviceEvent::ChannelMessage(m) = event else {
            return Ok(());
        };
        let (sender, content) = split_channel_text(&m.text);
        let row = NewChannelMessage {
            channel_idx: m.channel_idx,
            sender,
            content,
            timestamp: now(),
            sender_timestamp: Some(i64::from(m.sender_timestamp)),
            is_own: false,
            txt_type: m.txt_type,
            snr: m.snr,
            path_len: m.path_len,
            pkt_payload: m.raw.clone(),
        };
        let id = self.0.store.insert_channel_message(&row)?;
        debug!(
            "ch{} <{}> {}",
            row.channel_idx,
            escape_log(&row.sender),
            truncate_for_log(&row.content, 80)
        );
        self.0.sink.publish(
            "channel_message",
            json!({
                "id": id,
                "channel_idx": row.channel_idx,
                "sender": row.sender,
                "content": row.content,
                "timestamp": row.timestamp,
                "snr": row.snr,
                "path_len": row.path_len,
            }),
        );
        Ok(())
    }
}

struct DirectMessageHandler(IngestContext);

impl EventHandler for DirectMessageHandler {
    fn name(&self) -> &str {
        "direct_message"
    }

    fn handle(&self, event: &DeviceEvent) -> GatewayResult<()> {
        let DeviceEvent::DirectMessage(m) = event else {
            return Ok(());
        };
        let prefix = m.pubkey_prefix.to_ascii_lowercase();
        let contact_key = match self.0.store.find_contact_by_prefix(&prefix)? {
            Some(known) => {
                self.0
                    .store
                    .upsert_contact(&ContactUpsert::new(&known.public_key, ContactSource::Message))?;
                known.public_key
            }
            None => {
                debug!("DM from unknown sender prefix {}", prefix);
                prefix
            }
        };
        let row = NewDirectMessage {
            contact_pubkey: contact_key,
            direction: Direction::In,
            content: m.text.clone(),
            timestamp: now(),
            sender_timestamp: Some(i64::from(m.sender_timestamp)),
            txt_type: m.txt_type,
            snr: m.snr,
            path_len: m.path_len,
            expected_ack: None,
            signature: m.signature.clone(),
            pkt_payload: m.raw.clone(),
        };
        let id = self.0.store.insert_direct_message(&row)?;
        debug!(
            "DM from {}: {}",
            short_key(&row.contact_pubkey),
            truncate_for_log(&row.content, 80)
        );
        self.0.sink.publish(
            "direct_message",
            json!({
                "id": id,
                "contact_pubkey": row.contact_pubkey,
                "direction": row.direction,
                "content": row.content,
                "timestamp": row.timestamp,
                "snr": row.snr,
            }),
        );
        Ok(())
    }
}

struct AckHandler(IngestContext);

impl EventHandler for AckHandler {
    fn name(&self) -> &str {
        "ack"
    }

    fn handle(&self, event: &DeviceEvent) -> GatewayResult<()> {
        let DeviceEvent::DeliveryAck(a) = event else {
            return Ok(());
        };
        let id = self.0.store.insert_ack(&NewAck {
            expected_ack: a.code.clone(),
            round_trip_ms: a.round_trip_ms,
            ..Default::default()
        })?;
        debug!("Delivery ack {} ({:?} ms)", a.code, a.round_trip_ms);
        self.0.sink.publish(
            "ack",
            json!({ "id": id, "code": a.code, "round_trip_ms": a.round_trip_ms }),
        );
        Ok(())
    }
}

struct AdvertHandler(IngestContext);

impl EventHandler for AdvertHandler {
    fn name(&self) -> &str {
        "advert"
    }

    fn handle(&self, event: &DeviceEvent) -> GatewayResult<()> {
        let DeviceEvent::Advertisement(a) = event else {
            return Ok(());
        };
        let key = a.public_key.to_ascii_lowercase();
        let stored = self.0.store.get_contact(&key)?;
        let timestamp = a.timestamp.map(i64::from).unwrap_or_else(now);

        let name = a
            .name
            .clone()
            .filter(|n| !n.trim().is_empty())
            .or_else(|| stored.as_ref().map(|c| c.name.clone()).filter(|n| !n.is_empty()));
        let adv_type = a.adv_type.or(stored.as_ref().and_then(|c| c.adv_type));
        let lat = a.lat.or(stored.as_ref().and_then(|c| c.adv_lat));
        let lon = a.lon.or(stored.as_ref().and_then(|c| c.adv_lon));

        let fresh = self.0.store.insert_advertisement(&NewAdvertisement {
            public_key: key.clone(),
            name: name.clone(),
            adv_type,
            lat,
            lon,
            timestamp,
            snr: a.snr,
            raw_payload: None,
        })?;

        let mut up = ContactUpsert::new(&key, ContactSource::Advert);
        up.name = a.name.clone().unwrap_or_default();
        up.adv_type = a.adv_type;
        up.adv_lat = a.lat;
        up.adv_lon = a.lon;
        up.last_advert = Some(timestamp);
        self.0.store.upsert_contact(&up)?;

        debug!(
            "Advert from {} ({})",
            short_key(&key),
            escape_log(name.as_deref().unwrap_or("?"))
        );
        self.0.sink.publish(
            "advert",
            json!({
                "public_key": key,
                "name": name,
                "adv_type": adv_type,
                "lat": lat,
                "lon": lon,
                "timestamp": timestamp,
                "duplicate": !fresh,
            }),
        );
        Ok(())
    }
}

struct PathHandler(IngestContext);

impl EventHandler for PathHandler {
    fn name(&self) -> &str {
        "path"
    }

    fn handle(&self, event: &DeviceEvent) -> GatewayResult<()> {
        let DeviceEvent::PathUpdate(p) = event else {
            return Ok(());
        };
        let row = NewPath {
            contact_pubkey: p.public_key.to_ascii_lowercase(),
            path: p.path.clone(),
            snr: p.snr,
            path_len: p.path_len,
        };
        let id = self.0.store.insert_path(&row)?;
        self.0.sink.publish(
            "path",
            json!({
                "id": id,
                "public_key": row.contact_pubkey,
                "path": row.path,
                "path_len": row.path_len,
                "snr": row.snr,
            }),
        );
        Ok(())
    }
}

struct NewContactHandler(IngestContext);

impl EventHandler for NewContactHandler {
    fn name(&self) -> &str {
        "new_contact"
    }

    fn handle(&self, event: &DeviceEvent) -> GatewayResult<()> {
        let DeviceEvent::NewContact(c) = event else {
            return Ok(());
        };
        self.0
            .store
            .upsert_contact(&contact_from_device(c, ContactSource::Device))?;
        let pending = self.0.pending.is_enabled();
        if pending {
            info!(
                "New contact {} ({}) awaiting approval",
                short_key(&c.public_key),
                escape_log(&c.name)
            );
            self.0.pending.insert(c.clone());
        }
        self.0.sink.publish(
            "new_contact",
            json!({
                "public_key": c.public_key,
                "name": c.name,
                "adv_type": c.adv_type,
                "pending": pending,
            }),
        );
        Ok(())
    }
}

struct SentHandler;

impl EventHandler for SentHandler {
    fn name(&self) -> &str {
        "message_sent"
    }

    fn handle(&self, event: &DeviceEvent) -> GatewayResult<()> {
        if let DeviceEvent::MessageSent(sent) = event {
            debug!(
                "Message queued by device (ack {}, flood {}, timeout {} ms)",
                sent.expected_ack, sent.flood, sent.suggested_timeout_ms
            );
        }
        Ok(())
    }
}

struct DisconnectHandler(IngestContext);

impl EventHandler for DisconnectHandler {
    fn name(&self) -> &str {
        "disconnected"
    }

    fn handle(&self, event: &DeviceEvent) -> GatewayResult<()> {
        if let DeviceEvent::Disconnected { reason } = event {
            self.0
                .sink
                .publish("status", json!({ "connected": false, "reason": reason }));
        }
        Ok(())
    }
}

/// Subscribe one handler per event kind for the current bus epoch.
pub fn register_handlers(bus: &EventBus, ctx: &IngestContext) -> Vec<Subscription> {
    EventKind::ALL
        .iter()
        .map(|&kind| {
            let handler: Arc<dyn EventHandler> = match kind {
                EventKind::ChannelMessage => Arc::new(ChannelMessageHandler(ctx.clone())),
                EventKind::DirectMessage => Arc::new(DirectMessageHandler(ctx.clone())),
                EventKind::MessageSent => Arc::new(SentHandler),
                EventKind::DeliveryAck => Arc::new(AckHandler(ctx.clone())),
                EventKind::Advertisement => Arc::new(AdvertHandler(ctx.clone())),
                EventKind::PathUpdate => Arc::new(PathHandler(ctx.clone())),
                EventKind::NewContact => Arc::new(NewContactHandler(ctx.clone())),
                EventKind::Disconnected => Arc::new(DisconnectHandler(ctx.clone())),
            };
            bus.subscribe(kind, handler)
        })
        .collect()
}

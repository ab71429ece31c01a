//! Typed device events and the in-process bus that delivers them.
//!
//! Every event the link decodes becomes one [`DeviceEvent`]. The driver stamps
//! it with the bus epoch current at arrival and hands it to the ingest line,
//! a single task that dispatches events in arrival order to the handlers
//! subscribed for that kind.
//!
//! `unsubscribe_all` bumps the epoch. Anything stamped with an older epoch is
//! dropped at dispatch, so events from a dead connection never reach the
//! handlers registered for the next one.

use log::{debug, error, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, PoisonError, RwLock};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use super::types::{DeviceContact, SentInfo};
use crate::error::GatewayResult;
use crate::logutil::short_key;
use crate::metrics;
use crate::storage;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelMessage {
    pub channel_idx: u8,
    pub path_len: Option<u8>,
    pub txt_type: u8,
    pub sender_timestamp: u32,
    /// `"Sender: body"` as transmitted on the channel.
    pub text: String,
    pub snr: Option<f32>,
    /// Hex of the undecoded frame, kept for diagnostics.
    pub raw: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectMessage {
    /// First 6 bytes of the sender key, lowercase hex.
    pub pubkey_prefix: String,
    pub path_len: Option<u8>,
    pub txt_type: u8,
    pub sender_timestamp: u32,
    pub text: String,
    pub snr: Option<f32>,
    pub signature: Option<String>,
    pub raw: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeliveryAck {
    pub code: String,
    pub round_trip_ms: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Advertisement {
    pub public_key: String,
    pub name: Option<String>,
    pub adv_type: Option<u8>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    /// Advert timestamp when the transport carried one.
    pub timestamp: Option<u32>,
    pub snr: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PathUpdate {
    pub public_key: String,
    pub path: Option<String>,
    pub path_len: Option<i32>,
    pub snr: Option<f32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DeviceEvent {
    ChannelMessage(ChannelMessage),
    DirectMessage(DirectMessage),
    MessageSent(SentInfo),
    DeliveryAck(DeliveryAck),
    Advertisement(Advertisement),
    PathUpdate(PathUpdate),
    NewContact(DeviceContact),
    Disconnected { reason: String },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ChannelMessage,
    DirectMessage,
    MessageSent,
    DeliveryAck,
    Advertisement,
    PathUpdate,
    NewContact,
    Disconnected,
}

impl EventKind {
    pub const ALL: [EventKind; 8] = [
        EventKind::ChannelMessage,
        EventKind::DirectMessage,
        EventKind::MessageSent,
        EventKind::DeliveryAck,
        EventKind::Advertisement,
        EventKind::PathUpdate,
        EventKind::NewContact,
        EventKind::Disconnected,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventKind::ChannelMessage => "channel_message",
            EventKind::DirectMessage => "direct_message",
            EventKind::MessageSent => "message_sent",
            EventKind::DeliveryAck => "delivery_ack",
            EventKind::Advertisement => "advertisement",
            EventKind::PathUpdate => "path_update",
            EventKind::NewContact => "new_contact",
            EventKind::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl DeviceEvent {
    pub fn kind(&self) -> EventKind {
        match self {
            DeviceEvent::ChannelMessage(_) => EventKind::ChannelMessage,
            DeviceEvent::DirectMessage(_) => EventKind::DirectMessage,
            DeviceEvent::MessageSent(_) => EventKind::MessageSent,
            DeviceEvent::DeliveryAck(_) => EventKind::DeliveryAck,
            DeviceEvent::Advertisement(_) => EventKind::Advertisement,
            DeviceEvent::PathUpdate(_) => EventKind::PathUpdate,
            DeviceEvent::NewContact(_) => EventKind::NewContact,
            DeviceEvent::Disconnected { .. } => EventKind::Disconnected,
        }
    }

    /// Short identifier used when logging handler failures.
    pub fn correlation_key(&self) -> String {
        match self {
            DeviceEvent::ChannelMessage(m) => format!("ch{}@{}", m.channel_idx, m.sender_timestamp),
            DeviceEvent::DirectMessage(m) => format!("{}@{}", m.pubkey_prefix, m.sender_timestamp),
            DeviceEvent::MessageSent(s) => s.expected_ack.clone(),
            DeviceEvent::DeliveryAck(a) => a.code.clone(),
            DeviceEvent::Advertisement(a) => short_key(&a.public_key).to_string(),
            DeviceEvent::PathUpdate(p) => short_key(&p.public_key).to_string(),
            DeviceEvent::NewContact(c) => short_key(&c.public_key).to_string(),
            DeviceEvent::Disconnected { .. } => "-".to_string(),
        }
    }
}

/// Receives events of the kinds it was subscribed for.
///
/// Handlers run on the ingest line and must not wait on the command bridge.
pub trait EventHandler: Send + Sync {
    fn name(&self) -> &str {
        "handler"
    }

    fn handle(&self, event: &DeviceEvent) -> GatewayResult<()>;
}

impl<F> EventHandler for F
where
    F: Fn(&DeviceEvent) -> GatewayResult<()> + Send + Sync,
{
    fn handle(&self, event: &DeviceEvent) -> GatewayResult<()> {
        self(event)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Subscription {
    pub kind: EventKind,
    pub id: u64,
    pub epoch: u64,
}

#[derive(Debug, Clone)]
pub struct StampedEvent {
    pub epoch: u64,
    pub event: DeviceEvent,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct DispatchReport {
    pub delivered: usize,
    pub failed: usize,
    pub stale: bool,
}

struct Registered {
    id: u64,
    handler: Arc<dyn EventHandler>,
}

#[derive(Default)]
struct SubscriberTable {
    epoch: u64,
    next_id: u64,
    handlers: HashMap<EventKind, Vec<Registered>>,
}

#[derive(Default)]
pub struct EventBus {
    table: RwLock<SubscriberTable>,
}

impl EventBus {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn epoch(&self) -> u64 {
        self.table
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .epoch
    }

    pub fn subscribe(&self, kind: EventKind, handler: Arc<dyn EventHandler>) -> Subscription {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        table.next_id += 1;
        let id = table.next_id;
        let epoch = table.epoch;
        table
            .handlers
            .entry(kind)
            .or_default()
            .push(Registered { id, handler });
        Subscription { kind, id, epoch }
    }

    pub fn unsubscribe(&self, sub: &Subscription) -> bool {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        if table.epoch != sub.epoch {
            return false;
        }
        match table.handlers.get_mut(&sub.kind) {
            Some(list) => {
                let before = list.len();
                list.retain(|r| r.id != sub.id);
                list.len() != before
            }
            None => false,
        }
    }

    /// Drop every handler and start a new epoch. Returns the new epoch.
    pub fn unsubscribe_all(&self) -> u64 {
        let mut table = self.table.write().unwrap_or_else(PoisonError::into_inner);
        table.handlers.clear();
        table.epoch += 1;
        table.epoch
    }

    pub fn is_active(&self, sub: &Subscription) -> bool {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table.epoch == sub.epoch
            && table
                .handlers
                .get(&sub.kind)
                .map(|list| list.iter().any(|r| r.id == sub.id))
                .unwrap_or(false)
    }

    pub fn subscriber_count(&self) -> usize {
        let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
        table.handlers.values().map(Vec::len).sum()
    }

    pub fn stamp(&self, event: DeviceEvent) -> StampedEvent {
        StampedEvent {
            epoch: self.epoch(),
            event,
        }
    }

    /// Run every handler for the event's kind. Errors and panics are logged
    /// and counted; the remaining handlers still run.
    pub fn dispatch(&self, stamped: &StampedEvent) -> DispatchReport {
        let kind = stamped.event.kind();
        let handlers: Vec<Arc<dyn EventHandler>> = {
            let table = self.table.read().unwrap_or_else(PoisonError::into_inner);
            if table.epoch != stamped.epoch {
                debug!(
                    "Dropping {} from epoch {} (bus at {})",
                    kind, stamped.epoch, table.epoch
                );
                metrics::inc_events_dropped_stale();
                return DispatchReport {
                    stale: true,
                    ..Default::default()
                };
            }
            table
                .handlers
                .get(&kind)
                .map(|list| list.iter().map(|r| r.handler.clone()).collect())
                .unwrap_or_default()
        };

        let mut report = DispatchReport::default();
        for handler in handlers {
            let outcome = catch_unwind(AssertUnwindSafe(|| handler.handle(&stamped.event)));
            match outcome {
                Ok(Ok(())) => report.delivered += 1,
                Ok(Err(e)) => {
                    report.failed += 1;
                    metrics::inc_handler_failures();
                    warn!(
                        "{} handler '{}' failed for {}: {}",
                        kind,
                        handler.name(),
                        stamped.event.correlation_key(),
                        e
                    );
                }
                Err(panic) => {
                    report.failed += 1;
                    metrics::inc_handler_failures();
                    let msg = panic
                        .downcast_ref::<&str>()
                        .map(|s| s.to_string())
                        .or_else(|| panic.downcast_ref::<String>().cloned())
                        .unwrap_or_else(|| "non-string panic".to_string());
                    error!(
                        "{} handler '{}' panicked for {}: {}",
                        kind,
                        handler.name(),
                        stamped.event.correlation_key(),
                        msg
                    );
                }
            }
        }
        if report.delivered > 0 {
            metrics::inc_events_ingested();
        }
        report
    }
}

/// Items carried by the ingest line.
pub(crate) enum IngestItem {
    Event(StampedEvent),
    /// Answered once every item queued before it has been dispatched.
    Barrier(oneshot::Sender<()>),
}

/// The single dispatch line. Runs until every sender is dropped.
///
/// Handlers write to SQLite synchronously; each dispatch goes through
/// [`storage::blocking`] so a slow write never parks a runtime worker.
pub(crate) fn spawn_ingest(
    bus: Arc<EventBus>,
    mut rx: mpsc::UnboundedReceiver<IngestItem>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        while let Some(item) = rx.recv().await {
            match item {
                IngestItem::Event(stamped) => {
                    storage::blocking(|| bus.dispatch(&stamped));
                }
                IngestItem::Barrier(done) => {
                    let _ = done.send(());
                }
            }
        }
        debug!("Ingest line closed");
    })
}

//! Live-update fan-out to UI sessions.
//!
//! Ingest handlers publish a topic and a JSON payload after each write. A
//! publish never fails ingestion: with nobody listening the update is dropped.

use chrono::{DateTime, Utc};
use log::trace;
use serde::Serialize;
use tokio::sync::broadcast;

pub trait LiveSink: Send + Sync {
    fn publish(&self, topic: &str, payload: serde_json::Value);
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LiveUpdate {
    pub topic: String,
    pub payload: serde_json::Value,
    pub at: DateTime<Utc>,
}

/// Broadcast fan-out. Slow subscribers lag and lose the oldest updates
/// rather than holding up ingest.
pub struct BroadcastSink {
    tx: broadcast::Sender<LiveUpdate>,
}

impl BroadcastSink {
    pub fn new(capacity: usize) -> Self {
        let (tx, _) = broadcast::channel(capacity.max(1));
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<LiveUpdate> {
        self.tx.subscribe()
    }

    pub fn receiver_count(&self) -> usize {
        self.tx.receiver_count()
    }
}

impl Default for BroadcastSink {
    fn default() -> Self {
        Self::new(256)
    }
}

impl LiveSink for BroadcastSink {
    fn publish(&self, topic: &str, payload: serde_json::Value) {
        let update = LiveUpdate {
            topic: topic.to_string(),
            payload,
            at: Utc::now(),
        };
        if self.tx.send(update).is_err() {
            trace!("No live subscribers for {}", topic);
        }
    }
}

/// Discards everything; used by the CLI and tests that do not watch updates.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullSink;

impl LiveSink for NullSink {
    fn publish(&self, _topic: &str, _payload: serde_json::Value) {}
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn subscribers_receive_published_updates() {
        let sink = BroadcastSink::new(8);
        let mut rx = sink.subscribe();
        sink.publish("ack", json!({"code": "01020304"}));
        let update = rx.recv().await.unwrap();
        assert_eq!(update.topic, "ack");
        assert_eq!(update.payload["code"], "01020304");
    }

    #[test]
    fn publishing_without_subscribers_is_harmless() {
        let sink = BroadcastSink::default();
        assert_eq!(sink.receiver_count(), 0);
        sink.publish("status", json!({"connected": false}));
        NullSink.publish("status", json!(null));
    }
}

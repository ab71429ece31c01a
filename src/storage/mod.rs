//! # Storage Module - Data Persistence Layer
//!
//! Durable tables for everything the gateway learns from the radio: the device
//! identity, contacts, channels, channel and direct messages, delivery acks,
//! advertisements and path updates, plus a small key/value settings table.
//!
//! ## Features
//!
//! - **Idempotent writes**: contacts upsert by public key; duplicate adverts converge
//! - **Merge rules**: an empty name or out-path never overwrites a known one, and
//!   contact protection is sticky
//! - **Full-text search**: FTS5 indexes over channel and direct message bodies
//! - **WAL mode**: readers (web UI) never block the ingest writer
//!
//! ## Usage
//!
//! ```rust,no_run
//! use meshgate::storage::{SqliteStore, Store, ContactUpsert, ContactSource};
//!
//! fn main() -> Result<(), meshgate::error::StorageError> {
//!     let store = SqliteStore::open(std::path::Path::new("./data/meshgate.db"))?;
//!     let mut contact = ContactUpsert::new(
//!         "a1b2c3d4e5f60718293a4b5c6d7e8f90a1b2c3d4e5f60718293a4b5c6d7e8f90",
//!         ContactSource::Advert,
//!     );
//!     contact.name = "Base Camp".to_string();
//!     store.upsert_contact(&contact)?;
//!     println!("{} contacts", store.get_contacts()?.len());
//!     Ok(())
//! }
//! ```
//!
//! The [`Store`] trait is what the device manager and ingest handlers see;
//! [`SqliteStore`] is the only implementation shipped.

use serde::{Deserialize, Serialize};
use tokio::runtime::RuntimeFlavor;

use crate::error::StorageResult;

mod sqlite;

pub use sqlite::SqliteStore;

/// Run a storage call from async code. On a multi-threaded runtime the worker
/// hands its other tasks off first, so a write waiting on the SQLite busy
/// timeout never stalls the runtime. Elsewhere the call runs inline.
pub fn blocking<T>(f: impl FnOnce() -> T) -> T {
    match tokio::runtime::Handle::try_current() {
        Ok(handle) if handle.runtime_flavor() == RuntimeFlavor::MultiThread => {
            tokio::task::block_in_place(f)
        }
        _ => f(),
    }
}

/// How a contact row was last learned about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ContactSource {
    Advert,
    Message,
    Device,
}

impl ContactSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContactSource::Advert => "advert",
            ContactSource::Message => "message",
            ContactSource::Device => "device",
        }
    }
}

/// Short label for a contact type byte, as shown in contact lists.
pub fn contact_type_label(adv_type: Option<u8>) -> &'static str {
    match adv_type {
        Some(2) => "REP",
        Some(3) => "ROOM",
        Some(4) => "SENS",
        _ => "CLI",
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    In,
    Out,
}

impl Direction {
    pub fn as_str(&self) -> &'static str {
        match self {
            Direction::In => "in",
            Direction::Out => "out",
        }
    }

    fn parse(s: &str) -> Self {
        if s == "out" {
            Direction::Out
        } else {
            Direction::In
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DeviceRecord {
    pub public_key: String,
    pub name: String,
    pub self_info: Option<serde_json::Value>,
    pub updated_at: i64,
}

/// Contact write. `None` / empty fields leave the stored value untouched.
#[derive(Debug, Clone, PartialEq)]
pub struct ContactUpsert {
    pub public_key: String,
    pub name: String,
    pub adv_type: Option<u8>,
    pub flags: Option<u8>,
    /// Hex encoded out-path bytes.
    pub out_path: String,
    pub out_path_len: Option<i32>,
    pub last_advert: Option<i64>,
    pub adv_lat: Option<f64>,
    pub adv_lon: Option<f64>,
    pub lastmod: Option<i64>,
    pub source: ContactSource,
    pub is_protected: bool,
}

impl ContactUpsert {
    pub fn new(public_key: &str, source: ContactSource) -> Self {
        Self {
            public_key: public_key.to_ascii_lowercase(),
            name: String::new(),
            adv_type: None,
            flags: None,
            out_path: String::new(),
            out_path_len: None,
            last_advert: None,
            adv_lat: None,
            adv_lon: None,
            lastmod: None,
            source,
            is_protected: false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContactRecord {
    pub public_key: String,
    pub name: String,
    pub adv_type: Option<u8>,
    pub flags: Option<u8>,
    pub out_path: String,
    pub out_path_len: i32,
    pub last_seen: i64,
    pub last_advert: Option<i64>,
    pub adv_lat: Option<f64>,
    pub adv_lon: Option<f64>,
    pub source: String,
    pub is_protected: bool,
    pub first_seen: i64,
}

impl ContactRecord {
    pub fn type_label(&self) -> &'static str {
        contact_type_label(self.adv_type)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelRecord {
    pub idx: u8,
    pub name: String,
    pub secret: Option<String>,
    pub updated_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewChannelMessage {
    pub channel_idx: u8,
    pub sender: String,
    pub content: String,
    pub timestamp: i64,
    pub sender_timestamp: Option<i64>,
    pub is_own: bool,
    pub txt_type: u8,
    pub snr: Option<f32>,
    pub path_len: Option<u8>,
    pub pkt_payload: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelMessageRecord {
    pub id: i64,
    pub channel_idx: u8,
    pub sender: String,
    pub content: String,
    pub timestamp: i64,
    pub sender_timestamp: Option<i64>,
    pub is_own: bool,
    pub txt_type: u8,
    pub snr: Option<f32>,
    pub path_len: Option<u8>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewDirectMessage {
    pub contact_pubkey: String,
    pub direction: Direction,
    pub content: String,
    pub timestamp: i64,
    pub sender_timestamp: Option<i64>,
    pub txt_type: u8,
    pub snr: Option<f32>,
    pub path_len: Option<u8>,
    pub expected_ack: Option<String>,
    pub signature: Option<String>,
    pub pkt_payload: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct DirectMessageRecord {
    pub id: i64,
    pub contact_pubkey: String,
    pub direction: Direction,
    pub content: String,
    pub timestamp: i64,
    pub sender_timestamp: Option<i64>,
    pub txt_type: u8,
    pub snr: Option<f32>,
    pub path_len: Option<u8>,
    pub expected_ack: Option<String>,
    pub signature: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Default)]
pub struct NewAck {
    pub expected_ack: String,
    pub snr: Option<f32>,
    pub rssi: Option<i32>,
    pub route_type: Option<String>,
    pub is_retry: bool,
    pub round_trip_ms: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AckRecord {
    pub id: i64,
    pub expected_ack: String,
    pub snr: Option<f32>,
    pub rssi: Option<i32>,
    pub route_type: Option<String>,
    pub is_retry: bool,
    pub round_trip_ms: Option<u32>,
    /// Outgoing DM this ack confirms, when one was recorded with the same code.
    pub dm_id: Option<i64>,
    pub received_at: i64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewAdvertisement {
    pub public_key: String,
    pub name: Option<String>,
    pub adv_type: Option<u8>,
    pub lat: Option<f64>,
    pub lon: Option<f64>,
    pub timestamp: i64,
    pub snr: Option<f32>,
    pub raw_payload: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct NewPath {
    pub contact_pubkey: String,
    pub path: Option<String>,
    pub snr: Option<f32>,
    pub path_len: Option<i32>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "source", rename_all = "lowercase")]
pub enum SearchHit {
    Channel {
        id: i64,
        channel_idx: u8,
        sender: String,
        content: String,
        timestamp: i64,
    },
    Dm {
        id: i64,
        contact_pubkey: String,
        direction: Direction,
        content: String,
        timestamp: i64,
    },
}

impl SearchHit {
    pub fn timestamp(&self) -> i64 {
        match self {
            SearchHit::Channel { timestamp, .. } | SearchHit::Dm { timestamp, .. } => *timestamp,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct StoreStats {
    pub contacts: u64,
    pub channels: u64,
    pub channel_messages: u64,
    pub direct_messages: u64,
    pub acks: u64,
    pub advertisements: u64,
    pub paths: u64,
}

/// Persistence operations used by the device manager and the ingest handlers.
///
/// Implementations must be safe to call from the ingest task and from command
/// methods at the same time.
pub trait Store: Send + Sync {
    fn set_device_info(
        &self,
        public_key: &str,
        name: &str,
        self_info: Option<&serde_json::Value>,
    ) -> StorageResult<()>;
    fn get_device_info(&self) -> StorageResult<Option<DeviceRecord>>;

    fn upsert_contact(&self, contact: &ContactUpsert) -> StorageResult<()>;
    fn get_contacts(&self) -> StorageResult<Vec<ContactRecord>>;
    fn get_contact(&self, public_key: &str) -> StorageResult<Option<ContactRecord>>;
    /// Most recently seen contact whose key starts with `prefix`.
    fn find_contact_by_prefix(&self, prefix: &str) -> StorageResult<Option<ContactRecord>>;
    /// Case-insensitive exact name match.
    fn find_contact_by_name(&self, name: &str) -> StorageResult<Option<ContactRecord>>;
    fn delete_contact(&self, public_key: &str) -> StorageResult<bool>;
    fn set_contact_protected(&self, public_key: &str, protected: bool) -> StorageResult<bool>;

    fn upsert_channel(&self, idx: u8, name: &str, secret: Option<&str>) -> StorageResult<()>;
    fn get_channels(&self) -> StorageResult<Vec<ChannelRecord>>;
    fn delete_channel(&self, idx: u8) -> StorageResult<bool>;

    fn insert_channel_message(&self, msg: &NewChannelMessage) -> StorageResult<i64>;
    fn get_channel_messages(
        &self,
        channel_idx: Option<u8>,
        limit: usize,
        offset: usize,
    ) -> StorageResult<Vec<ChannelMessageRecord>>;

    fn insert_direct_message(&self, msg: &NewDirectMessage) -> StorageResult<i64>;
    /// DMs for a contact; keys shorter than a full key match by prefix.
    fn get_dm_messages(
        &self,
        contact_key: &str,
        limit: usize,
        offset: usize,
    ) -> StorageResult<Vec<DirectMessageRecord>>;

    fn insert_ack(&self, ack: &NewAck) -> StorageResult<i64>;
    fn get_ack_for_code(&self, code: &str) -> StorageResult<Option<AckRecord>>;

    /// Returns false when an identical advertisement (same key and timestamp) exists.
    fn insert_advertisement(&self, advert: &NewAdvertisement) -> StorageResult<bool>;
    fn insert_path(&self, path: &NewPath) -> StorageResult<i64>;

    fn search_messages(&self, query: &str, limit: usize) -> StorageResult<Vec<SearchHit>>;
    fn get_stats(&self) -> StorageResult<StoreStats>;

    fn get_setting(&self, key: &str) -> StorageResult<Option<String>>;
    fn set_setting(&self, key: &str, value: &str) -> StorageResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn blocking_runs_on_multi_thread_runtime() {
        let store = SqliteStore::in_memory().unwrap();
        blocking(|| store.set_setting("k", "v")).unwrap();
        assert_eq!(blocking(|| store.get_setting("k")).unwrap().as_deref(), Some("v"));
    }

    #[tokio::test]
    async fn blocking_runs_inline_on_current_thread_runtime() {
        assert_eq!(blocking(|| 7), 7);
    }

    #[test]
    fn blocking_works_outside_a_runtime() {
        assert_eq!(blocking(|| "ok"), "ok");
    }
}

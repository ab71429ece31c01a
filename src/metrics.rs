//! In-process counters for the device connection and ingest path.
//! Read with [`snapshot`]; the `status` command prints them.
use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};

static CONNECT_ATTEMPTS: AtomicU64 = AtomicU64::new(0);
static CONNECTS: AtomicU64 = AtomicU64::new(0);
static RECONNECTS: AtomicU64 = AtomicU64::new(0);
static COMMANDS_OK: AtomicU64 = AtomicU64::new(0);
static COMMANDS_FAILED: AtomicU64 = AtomicU64::new(0);
static COMMANDS_TIMED_OUT: AtomicU64 = AtomicU64::new(0);
static COMMANDS_ABANDONED: AtomicU64 = AtomicU64::new(0);
static LATE_RESPONSES: AtomicU64 = AtomicU64::new(0);
static EVENTS_INGESTED: AtomicU64 = AtomicU64::new(0);
static EVENTS_DROPPED_STALE: AtomicU64 = AtomicU64::new(0);
static HANDLER_FAILURES: AtomicU64 = AtomicU64::new(0);
static MALFORMED_FRAMES: AtomicU64 = AtomicU64::new(0);

pub fn inc_connect_attempts() {
    CONNECT_ATTEMPTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_connects() {
    CONNECTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_reconnects() {
    RECONNECTS.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_commands_ok() {
    COMMANDS_OK.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_commands_failed() {
    COMMANDS_FAILED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_commands_timed_out() {
    COMMANDS_TIMED_OUT.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_commands_abandoned() {
    COMMANDS_ABANDONED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_late_responses() {
    LATE_RESPONSES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_events_ingested() {
    EVENTS_INGESTED.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_events_dropped_stale() {
    EVENTS_DROPPED_STALE.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_handler_failures() {
    HANDLER_FAILURES.fetch_add(1, Ordering::Relaxed);
}
pub fn inc_malformed_frames() {
    MALFORMED_FRAMES.fetch_add(1, Ordering::Relaxed);
}

#[derive(Debug, Default, Clone, Serialize)]
pub struct Snapshot {
    pub connect_attempts: u64,
    pub connects: u64,
    pub reconnects: u64,
    pub commands_ok: u64,
    pub commands_failed: u64,
    pub commands_timed_out: u64,
    pub commands_abandoned: u64,
    pub late_responses: u64,
    pub events_ingested: u64,
    pub events_dropped_stale: u64,
    pub handler_failures: u64,
    pub malformed_frames: u64,
}

pub fn snapshot() -> Snapshot {
    Snapshot {
        connect_attempts: CONNECT_ATTEMPTS.load(Ordering::Relaxed),
        connects: CONNECTS.load(Ordering::Relaxed),
        reconnects: RECONNECTS.load(Ordering::Relaxed),
        commands_ok: COMMANDS_OK.load(Ordering::Relaxed),
        commands_failed: COMMANDS_FAILED.load(Ordering::Relaxed),
        commands_timed_out: COMMANDS_TIMED_OUT.load(Ordering::Relaxed),
        commands_abandoned: COMMANDS_ABANDONED.load(Ordering::Relaxed),
        late_responses: LATE_RESPONSES.load(Ordering::Relaxed),
        events_ingested: EVENTS_INGESTED.load(Ordering::Relaxed),
        events_dropped_stale: EVENTS_DROPPED_STALE.load(Ordering::Relaxed),
        handler_failures: HANDLER_FAILURES.load(Ordering::Relaxed),
        malformed_frames: MALFORMED_FRAMES.load(Ordering::Relaxed),
    }
}

use log::{debug, warn};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::Mutex;

use super::*;
use crate::error::{StorageError, StorageResult};

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS device (
    id INTEGER PRIMARY KEY CHECK (id = 1),
    public_key TEXT NOT NULL,
    name TEXT NOT NULL,
    self_info TEXT,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS contacts (
    public_key TEXT PRIMARY KEY,
    name TEXT NOT NULL DEFAULT '',
    type INTEGER,
    flags INTEGER,
    out_path TEXT NOT NULL DEFAULT '',
    out_path_len INTEGER NOT NULL DEFAULT -1,
    last_seen INTEGER NOT NULL,
    last_advert INTEGER,
    adv_lat REAL,
    adv_lon REAL,
    lastmod INTEGER,
    source TEXT NOT NULL,
    is_protected INTEGER NOT NULL DEFAULT 0,
    first_seen INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_contacts_name ON contacts(name COLLATE NOCASE);

CREATE TABLE IF NOT EXISTS channels (
    idx INTEGER PRIMARY KEY,
    name TEXT NOT NULL,
    secret TEXT,
    updated_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS channel_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    channel_idx INTEGER NOT NULL,
    sender TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    sender_timestamp INTEGER,
    is_own INTEGER NOT NULL DEFAULT 0,
    txt_type INTEGER NOT NULL DEFAULT 0,
    snr REAL,
    path_len INTEGER,
    pkt_payload TEXT
);
CREATE INDEX IF NOT EXISTS idx_channel_messages_chan ON channel_messages(channel_idx, timestamp);

CREATE TABLE IF NOT EXISTS direct_messages (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    contact_pubkey TEXT NOT NULL,
    direction TEXT NOT NULL,
    content TEXT NOT NULL,
    timestamp INTEGER NOT NULL,
    sender_timestamp INTEGER,
    txt_type INTEGER NOT NULL DEFAULT 0,
    snr REAL,
    path_len INTEGER,
    expected_ack TEXT,
    signature TEXT,
    pkt_payload TEXT
);
CREATE INDEX IF NOT EXISTS idx_dm_contact ON direct_messages(contact_pubkey, timestamp);
CREATE INDEX IF NOT EXISTS idx_dm_ack ON direct_messages(expected_ack);

CREATE TABLE IF NOT EXISTS acks (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    expected_ack TEXT NOT NULL,
    snr REAL,
    rssi INTEGER,
    route_type TEXT,
    is_retry INTEGER NOT NULL DEFAULT 0,
    round_trip_ms INTEGER,
    dm_id INTEGER,
    received_at INTEGER NOT NULL
);
CREATE INDEX IF NOT EXISTS idx_acks_code ON acks(expected_ack);

CREATE TABLE IF NOT EXISTS advertisements (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    public_key TEXT NOT NULL,
    name TEXT,
    type INTEGER,
    lat REAL,
    lon REAL,
    timestamp INTEGER NOT NULL,
    snr REAL,
    raw_payload TEXT,
    received_at INTEGER NOT NULL,
    UNIQUE(public_key, timestamp)
);

CREATE TABLE IF NOT EXISTS paths (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    contact_pubkey TEXT NOT NULL,
    path TEXT,
    snr REAL,
    path_len INTEGER,
    received_at INTEGER NOT NULL
);

CREATE TABLE IF NOT EXISTS settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE VIRTUAL TABLE IF NOT EXISTS channel_messages_fts USING fts5(
    content, sender, content='channel_messages', content_rowid='id'
);
CREATE TRIGGER IF NOT EXISTS channel_messages_ai AFTER INSERT ON channel_messages BEGIN
    INSERT INTO channel_messages_fts(rowid, content, sender) VALUES (new.id, new.content, new.sender);
END;
CREATE TRIGGER IF NOT EXISTS channel_messages_ad AFTER DELETE ON channel_messages BEGIN
    INSERT INTO channel_messages_fts(channel_messages_fts, rowid, content, sender)
    VALUES ('delete', old.id, old.content, old.sender);
END;

CREATE VIRTUAL TABLE IF NOT EXISTS direct_messages_fts USING fts5(
    content, content='direct_messages', content_rowid='id'
);
CREATE TRIGGER IF NOT EXISTS direct_messages_ai AFTER INSERT ON direct_messages BEGIN
    INSERT INTO direct_messages_fts(rowid, content) VALUES (new.id, new.content);
END;
CREATE TRIGGER IF NOT EXISTS direct_messages_ad AFTER DELETE ON direct_messages BEGIN
    INSERT INTO direct_messages_fts(direct_messages_fts, rowid, content)
    VALUES ('delete', old.id, old.content);
END;
"#;

const CONTACT_COLUMNS: &str = "public_key, name, type, flags, out_path, out_path_len, last_seen, \
     last_advert, adv_lat, adv_lon, source, is_protected, first_seen";

const DM_COLUMNS: &str = "id, contact_pubkey, direction, content, timestamp, sender_timestamp, \
     txt_type, snr, path_len, expected_ack, signature";

fn now_secs() -> i64 {
    chrono::Utc::now().timestamp()
}

fn contact_from_row(row: &Row<'_>) -> rusqlite::Result<ContactRecord> {
    Ok(ContactRecord {
        public_key: row.get(0)?,
        name: row.get(1)?,
        adv_type: row.get(2)?,
        flags: row.get(3)?,
        out_path: row.get(4)?,
        out_path_len: row.get(5)?,
        last_seen: row.get(6)?,
        last_advert: row.get(7)?,
        adv_lat: row.get(8)?,
        adv_lon: row.get(9)?,
        source: row.get(10)?,
        is_protected: row.get(11)?,
        first_seen: row.get(12)?,
    })
}

fn dm_from_row(row: &Row<'_>) -> rusqlite::Result<DirectMessageRecord> {
    let direction: String = row.get(2)?;
    let snr: Option<f64> = row.get(7)?;
    Ok(DirectMessageRecord {
        id: row.get(0)?,
        contact_pubkey: row.get(1)?,
        direction: Direction::parse(&direction),
        content: row.get(3)?,
        timestamp: row.get(4)?,
        sender_timestamp: row.get(5)?,
        txt_type: row.get(6)?,
        snr: snr.map(|v| v as f32),
        path_len: row.get(8)?,
        expected_ack: row.get(9)?,
        signature: row.get(10)?,
    })
}

/// Quote every whitespace separated term so user input is never parsed as
/// FTS5 query syntax. Terms are ANDed.
fn fts_query(raw: &str) -> Option<String> {
    let terms: Vec<String> = raw
        .split_whitespace()
        .map(|t| format!("\"{}\"", t.replace('"', "\"\"")))
        .collect();
    if terms.is_empty() {
        None
    } else {
        Some(terms.join(" "))
    }
}

/// SQLite-backed [`Store`].
///
/// One connection behind a mutex: the ingest line and the command methods
/// write through the same handle, readers in other processes use WAL.
pub struct SqliteStore {
    conn: Mutex<Connection>,
}

impl SqliteStore {
    pub fn in_memory() -> StorageResult<Self> {
        let conn = Connection::open_in_memory()?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        Ok(store)
    }

    pub fn open(path: &Path) -> StorageResult<Self> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let conn = Connection::open(path)?;
        let mode: String = conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get(0))?;
        if !mode.eq_ignore_ascii_case("wal") {
            warn!("SQLite refused WAL mode for {}; using {}", path.display(), mode);
        }
        conn.busy_timeout(std::time::Duration::from_secs(5))?;
        let store = Self {
            conn: Mutex::new(conn),
        };
        store.init_schema()?;
        debug!("Opened message database at {}", path.display());
        Ok(store)
    }

    fn init_schema(&self) -> StorageResult<()> {
        self.with_conn(|conn| conn.execute_batch(SCHEMA))
    }

    fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> rusqlite::Result<T>,
    ) -> StorageResult<T> {
        let guard = self.conn.lock().map_err(|_| StorageError::Poisoned)?;
        Ok(f(&guard)?)
    }

    fn count(conn: &Connection, table: &str) -> rusqlite::Result<u64> {
        let n: i64 = conn.query_row(&format!("SELECT COUNT(*) FROM {}", table), [], |row| {
            row.get(0)
        })?;
        Ok(n.max(0) as u64)
    }
}

impl Store for SqliteStore {
    fn set_device_info(
        &self,
        public_key: &str,
        name: &str,
        self_info: Option<&serde_json::Value>,
    ) -> StorageResult<()> {
        let info = self_info.map(serde_json::to_string).transpose()?;
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO device (id, public_key, name, self_info, updated_at)
                 VALUES (1, ?1, ?2, ?3, ?4)
                 ON CONFLICT(id) DO UPDATE SET
                    public_key = excluded.public_key,
                    name = excluded.name,
                    self_info = COALESCE(excluded.self_info, device.self_info),
                    updated_at = excluded.updated_at",
                params![public_key.to_ascii_lowercase(), name, info, now_secs()],
            )?;
            Ok(())
        })
    }

    fn get_device_info(&self) -> StorageResult<Option<DeviceRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT public_key, name, self_info, updated_at FROM device WHERE id = 1",
                [],
                |row| {
                    let info: Option<String> = row.get(2)?;
                    Ok(DeviceRecord {
                        public_key: row.get(0)?,
                        name: row.get(1)?,
                        self_info: info.and_then(|s| serde_json::from_str(&s).ok()),
                        updated_at: row.get(3)?,
                    })
                },
            )
            .optional()
        })
    }

    fn upsert_contact(&self, c: &ContactUpsert) -> StorageResult<()> {
        let now = now_secs();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO contacts (public_key, name, type, flags, out_path, out_path_len,
                    last_seen, last_advert, adv_lat, adv_lon, lastmod, source, is_protected, first_seen)
                 VALUES (?1, ?2, ?3, ?4, ?5, COALESCE(?6, -1), ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?7)
                 ON CONFLICT(public_key) DO UPDATE SET
                    name = CASE WHEN excluded.name != '' THEN excluded.name ELSE contacts.name END,
                    type = COALESCE(excluded.type, contacts.type),
                    flags = COALESCE(excluded.flags, contacts.flags),
                    out_path = CASE WHEN excluded.out_path != '' THEN excluded.out_path ELSE contacts.out_path END,
                    out_path_len = CASE WHEN ?6 IS NOT NULL AND ?6 > 0 THEN ?6 ELSE contacts.out_path_len END,
                    last_seen = excluded.last_seen,
                    last_advert = COALESCE(excluded.last_advert, contacts.last_advert),
                    adv_lat = COALESCE(excluded.adv_lat, contacts.adv_lat),
                    adv_lon = COALESCE(excluded.adv_lon, contacts.adv_lon),
                    lastmod = COALESCE(excluded.lastmod, contacts.lastmod),
                    source = excluded.source,
                    is_protected = MAX(contacts.is_protected, excluded.is_protected)",
                params![
                    c.public_key.to_ascii_lowercase(),
                    c.name.trim(),
                    c.adv_type,
                    c.flags,
                    c.out_path,
                    c.out_path_len,
                    now,
                    c.last_advert,
                    c.adv_lat,
                    c.adv_lon,
                    c.lastmod,
                    c.source.as_str(),
                    c.is_protected,
                ],
            )?;
            Ok(())
        })
    }

    fn get_contacts(&self) -> StorageResult<Vec<ContactRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM contacts ORDER BY last_seen DESC",
                CONTACT_COLUMNS
            ))?;
            let rows = stmt.query_map([], contact_from_row)?;
            rows.collect()
        })
    }

    fn get_contact(&self, public_key: &str) -> StorageResult<Option<ContactRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!("SELECT {} FROM contacts WHERE public_key = ?1", CONTACT_COLUMNS),
                params![public_key.to_ascii_lowercase()],
                contact_from_row,
            )
            .optional()
        })
    }

    fn find_contact_by_prefix(&self, prefix: &str) -> StorageResult<Option<ContactRecord>> {
        let pattern = format!("{}%", prefix.to_ascii_lowercase().replace('%', ""));
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM contacts WHERE public_key LIKE ?1 ORDER BY last_seen DESC LIMIT 1",
                    CONTACT_COLUMNS
                ),
                params![pattern],
                contact_from_row,
            )
            .optional()
        })
    }

    fn find_contact_by_name(&self, name: &str) -> StorageResult<Option<ContactRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {} FROM contacts WHERE name = ?1 COLLATE NOCASE ORDER BY last_seen DESC LIMIT 1",
                    CONTACT_COLUMNS
                ),
                params![name.trim()],
                contact_from_row,
            )
            .optional()
        })
    }

    fn delete_contact(&self, public_key: &str) -> StorageResult<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "DELETE FROM contacts WHERE public_key = ?1",
                params![public_key.to_ascii_lowercase()],
            )?;
            Ok(n > 0)
        })
    }

    fn set_contact_protected(&self, public_key: &str, protected: bool) -> StorageResult<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "UPDATE contacts SET is_protected = ?2 WHERE public_key = ?1",
                params![public_key.to_ascii_lowercase(), protected],
            )?;
            Ok(n > 0)
        })
    }

    fn upsert_channel(&self, idx: u8, name: &str, secret: Option<&str>) -> StorageResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO channels (idx, name, secret, updated_at) VALUES (?1, ?2, ?3, ?4)
                 ON CONFLICT(idx) DO UPDATE SET
                    name = excluded.name,
                    secret = COALESCE(excluded.secret, channels.secret),
                    updated_at = excluded.updated_at",
                params![idx, name, secret.map(|s| s.to_ascii_lowercase()), now_secs()],
            )?;
            Ok(())
        })
    }

    fn get_channels(&self) -> StorageResult<Vec<ChannelRecord>> {
        self.with_conn(|conn| {
            let mut stmt =
                conn.prepare("SELECT idx, name, secret, updated_at FROM channels ORDER BY idx")?;
            let rows = stmt.query_map([], |row| {
                Ok(ChannelRecord {
                    idx: row.get(0)?,
                    name: row.get(1)?,
                    secret: row.get(2)?,
                    updated_at: row.get(3)?,
                })
            })?;
            rows.collect()
        })
    }

    fn delete_channel(&self, idx: u8) -> StorageResult<bool> {
        self.with_conn(|conn| {
            let n = conn.execute("DELETE FROM channels WHERE idx = ?1", params![idx])?;
            Ok(n > 0)
        })
    }

    fn insert_channel_message(&self, m: &NewChannelMessage) -> StorageResult<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO channel_messages (channel_idx, sender, content, timestamp,
                    sender_timestamp, is_own, txt_type, snr, path_len, pkt_payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    m.channel_idx,
                    m.sender,
                    m.content,
                    m.timestamp,
                    m.sender_timestamp,
                    m.is_own,
                    m.txt_type,
                    m.snr.map(f64::from),
                    m.path_len,
                    m.pkt_payload,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    fn get_channel_messages(
        &self,
        channel_idx: Option<u8>,
        limit: usize,
        offset: usize,
    ) -> StorageResult<Vec<ChannelMessageRecord>> {
        self.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, channel_idx, sender, content, timestamp, sender_timestamp, is_own,
                        txt_type, snr, path_len
                 FROM channel_messages
                 WHERE (?1 IS NULL OR channel_idx = ?1)
                 ORDER BY timestamp DESC, id DESC
                 LIMIT ?2 OFFSET ?3",
            )?;
            let rows = stmt.query_map(
                params![channel_idx, limit as i64, offset as i64],
                |row| {
                    let snr: Option<f64> = row.get(8)?;
                    Ok(ChannelMessageRecord {
                        id: row.get(0)?,
                        channel_idx: row.get(1)?,
                        sender: row.get(2)?,
                        content: row.get(3)?,
                        timestamp: row.get(4)?,
                        sender_timestamp: row.get(5)?,
                        is_own: row.get(6)?,
                        txt_type: row.get(7)?,
                        snr: snr.map(|v| v as f32),
                        path_len: row.get(9)?,
                    })
                },
            )?;
            rows.collect()
        })
    }

    fn insert_direct_message(&self, m: &NewDirectMessage) -> StorageResult<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO direct_messages (contact_pubkey, direction, content, timestamp,
                    sender_timestamp, txt_type, snr, path_len, expected_ack, signature, pkt_payload)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
                params![
                    m.contact_pubkey.to_ascii_lowercase(),
                    m.direction.as_str(),
                    m.content,
                    m.timestamp,
                    m.sender_timestamp,
                    m.txt_type,
                    m.snr.map(f64::from),
                    m.path_len,
                    m.expected_ack,
                    m.signature,
                    m.pkt_payload,
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    fn get_dm_messages(
        &self,
        contact_key: &str,
        limit: usize,
        offset: usize,
    ) -> StorageResult<Vec<DirectMessageRecord>> {
        let key = contact_key.to_ascii_lowercase();
        self.with_conn(|conn| {
            let (filter, arg) = if key.len() < crate::validation::PUBLIC_KEY_HEX_LEN {
                ("contact_pubkey LIKE ?1", format!("{}%", key.replace('%', "")))
            } else {
                ("contact_pubkey = ?1", key.clone())
            };
            let mut stmt = conn.prepare(&format!(
                "SELECT {} FROM direct_messages WHERE {} ORDER BY timestamp DESC, id DESC LIMIT ?2 OFFSET ?3",
                DM_COLUMNS, filter
            ))?;
            let rows = stmt.query_map(params![arg, limit as i64, offset as i64], dm_from_row)?;
            rows.collect()
        })
    }

    fn insert_ack(&self, ack: &NewAck) -> StorageResult<i64> {
        let code = ack.expected_ack.to_ascii_lowercase();
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO acks (expected_ack, snr, rssi, route_type, is_retry, round_trip_ms,
                    dm_id, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6,
                    (SELECT id FROM direct_messages WHERE expected_ack = ?1 ORDER BY id DESC LIMIT 1),
                    ?7)",
                params![
                    code,
                    ack.snr.map(f64::from),
                    ack.rssi,
                    ack.route_type,
                    ack.is_retry,
                    ack.round_trip_ms,
                    now_secs(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    fn get_ack_for_code(&self, code: &str) -> StorageResult<Option<AckRecord>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT id, expected_ack, snr, rssi, route_type, is_retry, round_trip_ms, dm_id,
                        received_at
                 FROM acks WHERE expected_ack = ?1 ORDER BY id DESC LIMIT 1",
                params![code.to_ascii_lowercase()],
                |row| {
                    let snr: Option<f64> = row.get(2)?;
                    Ok(AckRecord {
                        id: row.get(0)?,
                        expected_ack: row.get(1)?,
                        snr: snr.map(|v| v as f32),
                        rssi: row.get(3)?,
                        route_type: row.get(4)?,
                        is_retry: row.get(5)?,
                        round_trip_ms: row.get(6)?,
                        dm_id: row.get(7)?,
                        received_at: row.get(8)?,
                    })
                },
            )
            .optional()
        })
    }

    fn insert_advertisement(&self, a: &NewAdvertisement) -> StorageResult<bool> {
        self.with_conn(|conn| {
            let n = conn.execute(
                "INSERT OR IGNORE INTO advertisements (public_key, name, type, lat, lon, timestamp,
                    snr, raw_payload, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    a.public_key.to_ascii_lowercase(),
                    a.name,
                    a.adv_type,
                    a.lat,
                    a.lon,
                    a.timestamp,
                    a.snr.map(f64::from),
                    a.raw_payload,
                    now_secs(),
                ],
            )?;
            Ok(n > 0)
        })
    }

    fn insert_path(&self, p: &NewPath) -> StorageResult<i64> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO paths (contact_pubkey, path, snr, path_len, received_at)
                 VALUES (?1, ?2, ?3, ?4, ?5)",
                params![
                    p.contact_pubkey.to_ascii_lowercase(),
                    p.path,
                    p.snr.map(f64::from),
                    p.path_len,
                    now_secs(),
                ],
            )?;
            Ok(conn.last_insert_rowid())
        })
    }

    fn search_messages(&self, query: &str, limit: usize) -> StorageResult<Vec<SearchHit>> {
        let Some(fts) = fts_query(query) else {
            return Ok(Vec::new());
        };
        let mut hits = self.with_conn(|conn| {
            let mut hits = Vec::new();
            let mut stmt = conn.prepare(
                "SELECT m.id, m.channel_idx, m.sender, m.content, m.timestamp
                 FROM channel_messages_fts f JOIN channel_messages m ON m.id = f.rowid
                 WHERE channel_messages_fts MATCH ?1
                 ORDER BY m.timestamp DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![fts, limit as i64], |row| {
                Ok(SearchHit::Channel {
                    id: row.get(0)?,
                    channel_idx: row.get(1)?,
                    sender: row.get(2)?,
                    content: row.get(3)?,
                    timestamp: row.get(4)?,
                })
            })?;
            for hit in rows {
                hits.push(hit?);
            }

            let mut stmt = conn.prepare(
                "SELECT m.id, m.contact_pubkey, m.direction, m.content, m.timestamp
                 FROM direct_messages_fts f JOIN direct_messages m ON m.id = f.rowid
                 WHERE direct_messages_fts MATCH ?1
                 ORDER BY m.timestamp DESC LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![fts, limit as i64], |row| {
                let direction: String = row.get(2)?;
                Ok(SearchHit::Dm {
                    id: row.get(0)?,
                    contact_pubkey: row.get(1)?,
                    direction: Direction::parse(&direction),
                    content: row.get(3)?,
                    timestamp: row.get(4)?,
                })
            })?;
            for hit in rows {
                hits.push(hit?);
            }
            Ok(hits)
        })?;
        hits.sort_by(|a, b| b.timestamp().cmp(&a.timestamp()));
        hits.truncate(limit);
        Ok(hits)
    }

    fn get_stats(&self) -> StorageResult<StoreStats> {
        self.with_conn(|conn| {
            Ok(StoreStats {
                contacts: Self::count(conn, "contacts")?,
                channels: Self::count(conn, "channels")?,
                channel_messages: Self::count(conn, "channel_messages")?,
                direct_messages: Self::count(conn, "direct_messages")?,
                acks: Self::count(conn, "acks")?,
                advertisements: Self::count(conn, "advertisements")?,
                paths: Self::count(conn, "paths")?,
            })
        })
    }

    fn get_setting(&self, key: &str) -> StorageResult<Option<String>> {
        self.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM settings WHERE key = ?1",
                params![key],
                |row| row.get(0),
            )
            .optional()
        })
    }

    fn set_setting(&self, key: &str, value: &str) -> StorageResult<()> {
        self.with_conn(|conn| {
            conn.execute(
                "INSERT INTO settings (key, value) VALUES (?1, ?2)
                 ON CONFLICT(key) DO UPDATE SET value = excluded.value",
                params![key, value],
            )?;
            Ok(())
        })
    }
}

//! SQLite-backed store for the attribution record
//!
//! One connection behind a mutex; every multi-row operation runs inside a
//! SQLite transaction so the atomicity contracts (profile upsert, edge
//! versioning, two-phase persistence) hold under concurrent callers.

use std::path::Path;
use std::sync::Mutex;

use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;
use sha2::{Digest, Sha256};
use uuid::Uuid;

use memlens_core::AttributionConfig;

use crate::error::{Result, StoreError};
use crate::migrations::Migrator;

/// SQLite store holding the full attribution record
pub struct MemLensStore {
    pub(crate) conn: Mutex<Connection>,
    config: AttributionConfig,
}

impl MemLensStore {
    /// Open or create the database at `path`
    pub fn open<P: AsRef<Path>>(path: P, config: AttributionConfig) -> Result<Self> {
        let conn = Connection::open(path)?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
            config,
        };
        store.init()?;
        Ok(store)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory(config: AttributionConfig) -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys = ON;")?;
        let store = Self {
            conn: Mutex::new(conn),
            config,
        };
        store.init()?;
        Ok(store)
    }

    fn init(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        Migrator::new(&conn).migrate()
    }

    pub fn config(&self) -> &AttributionConfig {
        &self.config
    }
}

// ── Row codecs ─────────────────────────────────────────────────────────

/// Encode an embedding as a little-endian f32 blob
pub(crate) fn embedding_to_blob(embedding: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(embedding.len() * 4);
    for value in embedding {
        out.extend_from_slice(&value.to_le_bytes());
    }
    out
}

/// Decode a little-endian f32 blob back into an embedding
pub(crate) fn blob_to_embedding(blob: &[u8]) -> Result<Vec<f32>> {
    if blob.len() % 4 != 0 {
        return Err(StoreError::Decode(format!(
            "embedding blob length {} is not a multiple of 4",
            blob.len()
        )));
    }
    Ok(blob
        .chunks_exact(4)
        .map(|chunk| f32::from_le_bytes([chunk[0], chunk[1], chunk[2], chunk[3]]))
        .collect())
}

pub(crate) fn ts_to_millis(ts: DateTime<Utc>) -> i64 {
    ts.timestamp_millis()
}

pub(crate) fn millis_to_ts(millis: i64) -> Result<DateTime<Utc>> {
    Utc.timestamp_millis_opt(millis)
        .single()
        .ok_or_else(|| StoreError::Decode(format!("invalid timestamp {millis}")))
}

pub(crate) fn parse_uuid(s: &str) -> Result<Uuid> {
    Uuid::parse_str(s).map_err(|e| StoreError::Decode(format!("invalid uuid {s:?}: {e}")))
}

pub(crate) fn parse_json(s: &str) -> Result<serde_json::Value> {
    serde_json::from_str(s).map_err(|e| StoreError::Serialization(e.to_string()))
}

/// Encode a memory-id list as a JSON array of uuid strings
pub(crate) fn ids_to_json(ids: &[Uuid]) -> String {
    let strings: Vec<String> = ids.iter().map(Uuid::to_string).collect();
    serde_json::to_string(&strings).unwrap_or_else(|_| "[]".into())
}

pub(crate) fn json_to_ids(json: &str) -> Result<Vec<Uuid>> {
    let strings: Vec<String> =
        serde_json::from_str(json).map_err(|e| StoreError::Serialization(e.to_string()))?;
    strings.iter().map(|s| parse_uuid(s)).collect()
}

/// Owner-hash shard assignment, stable across processes
pub(crate) fn shard_for(owner_id: &str, shard_count: u32) -> u32 {
    let digest = Sha256::digest(owner_id.as_bytes());
    let mut bytes = [0u8; 8];
    bytes.copy_from_slice(&digest[..8]);
    (u64::from_le_bytes(bytes) % u64::from(shard_count.max(1))) as u32
}

/// Rough token estimate used when the caller does not supply counts
pub(crate) fn estimate_tokens(text: &str) -> u32 {
    text.split_whitespace().count() as u32
}

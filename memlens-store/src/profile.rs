//! Per-memory quality profiles backed by a single-statement Welford upsert
//!
//! The entire mean/m2/count update happens in one SQL statement, so two
//! concurrent writers can never interleave a read-modify-write on the same
//! profile. Column references on the right-hand side of `DO UPDATE SET`
//! resolve to the pre-update row, which is exactly what the recurrence needs.

use rusqlite::{params, OptionalExtension};
use uuid::Uuid;

use crate::error::{Result, StoreError};
use crate::store::{millis_to_ts, MemLensStore};
use crate::types::{MemoryProfile, Trend};

const WELFORD_UPSERT: &str = "\
INSERT INTO memory_profiles \
    (memory_id, mean_attribution, m2, retrieval_count, total_attribution, trend, updated_at) \
VALUES (?1, ?2, 0.0, 1, ?2, 'stable', ?3) \
ON CONFLICT(memory_id) DO UPDATE SET \
    retrieval_count = retrieval_count + 1, \
    total_attribution = total_attribution + excluded.mean_attribution, \
    mean_attribution = mean_attribution + \
        (excluded.mean_attribution - mean_attribution) / (retrieval_count + 1), \
    m2 = m2 + (excluded.mean_attribution - mean_attribution) * \
        (excluded.mean_attribution - (mean_attribution + \
            (excluded.mean_attribution - mean_attribution) / (retrieval_count + 1))), \
    trend = CASE \
        WHEN excluded.mean_attribution > mean_attribution * 1.1 THEN 'up' \
        WHEN excluded.mean_attribution < mean_attribution * 0.9 THEN 'down' \
        ELSE 'stable' \
    END, \
    updated_at = excluded.updated_at";

/// Fold one attribution score into a profile inside an open transaction
pub(crate) fn upsert_profile(
    tx: &rusqlite::Transaction<'_>,
    memory_id: Uuid,
    score: f64,
    now_millis: i64,
) -> rusqlite::Result<()> {
    tx.execute(WELFORD_UPSERT, params![memory_id.to_string(), score, now_millis])?;
    Ok(())
}

impl MemLensStore {
    /// Fold one attribution score into a profile as a standalone operation
    pub fn update_profile(&self, memory_id: Uuid, score: f64) -> Result<()> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        upsert_profile(&tx, memory_id, score, crate::store::ts_to_millis(chrono::Utc::now()))?;
        tx.commit()?;
        Ok(())
    }

    /// Read a memory's profile
    pub fn get_profile(&self, memory_id: Uuid) -> Result<Option<MemoryProfile>> {
        let conn = self.conn.lock().unwrap();
        let row = conn
            .query_row(
                "SELECT memory_id, mean_attribution, m2, retrieval_count, total_attribution, \
                 trend, updated_at FROM memory_profiles WHERE memory_id = ?1",
                params![memory_id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, i64>(3)?,
                        row.get::<_, f64>(4)?,
                        row.get::<_, String>(5)?,
                        row.get::<_, i64>(6)?,
                    ))
                },
            )
            .optional()?;

        row.map(|(id, mean, m2, count, total, trend, updated)| {
            Ok(MemoryProfile {
                memory_id: crate::store::parse_uuid(&id)?,
                mean_attribution: mean,
                m2,
                retrieval_count: count as u64,
                total_attribution: total,
                trend: Trend::parse(&trend)
                    .ok_or_else(|| StoreError::Decode(format!("bad trend {trend:?}")))?,
                updated_at: millis_to_ts(updated)?,
            })
        })
        .transpose()
    }
}

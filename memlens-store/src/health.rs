//! Contradictions, health snapshots, and calibration-pair reads

use chrono::Utc;
use rusqlite::params;
use uuid::Uuid;

use memlens_core::types::ScoreMethod;

use crate::error::{Result, StoreError};
use crate::store::{millis_to_ts, parse_uuid, ts_to_millis, MemLensStore};
use crate::types::{CalibrationPair, Contradiction, HealthSnapshot};

impl MemLensStore {
    /// Record a detected contradiction between two memories
    pub fn record_contradiction(
        &self,
        memory_id_1: Uuid,
        memory_id_2: Uuid,
        kind: &str,
        confidence: f64,
    ) -> Result<Contradiction> {
        let contradiction = Contradiction {
            id: Uuid::now_v7(),
            memory_id_1,
            memory_id_2,
            kind: kind.to_string(),
            confidence,
            detected_at: Utc::now(),
            resolved: false,
        };
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO contradictions (id, memory_id_1, memory_id_2, kind, confidence, detected_at, resolved) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)",
            params![
                contradiction.id.to_string(),
                memory_id_1.to_string(),
                memory_id_2.to_string(),
                contradiction.kind,
                confidence,
                ts_to_millis(contradiction.detected_at),
            ],
        )?;
        Ok(contradiction)
    }

    /// Mark a contradiction resolved
    pub fn resolve_contradiction(&self, id: Uuid) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE contradictions SET resolved = 1 WHERE id = ?1",
            params![id.to_string()],
        )?;
        if changed == 0 {
            return Err(StoreError::Decode(format!("no contradiction {id}")));
        }
        Ok(())
    }

    /// Recent contradictions, optionally filtered by resolution state
    pub fn list_contradictions(&self, resolved: Option<bool>) -> Result<Vec<Contradiction>> {
        let conn = self.conn.lock().unwrap();
        let sql = match resolved {
            Some(_) => {
                "SELECT id, memory_id_1, memory_id_2, kind, confidence, detected_at, resolved \
                 FROM contradictions WHERE resolved = ?1 ORDER BY detected_at DESC LIMIT 100"
            }
            None => {
                "SELECT id, memory_id_1, memory_id_2, kind, confidence, detected_at, resolved \
                 FROM contradictions WHERE ?1 IS NULL ORDER BY detected_at DESC LIMIT 100"
            }
        };
        let mut stmt = conn.prepare(sql)?;
        let raws: Vec<(String, String, String, String, f64, i64, bool)> = stmt
            .query_map(params![resolved], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);
        drop(conn);

        raws.into_iter()
            .map(|(id, m1, m2, kind, confidence, detected, resolved)| {
                Ok(Contradiction {
                    id: parse_uuid(&id)?,
                    memory_id_1: parse_uuid(&m1)?,
                    memory_id_2: parse_uuid(&m2)?,
                    kind,
                    confidence,
                    detected_at: millis_to_ts(detected)?,
                    resolved,
                })
            })
            .collect()
    }

    /// Unresolved contradictions touching any of the given memories
    pub fn unresolved_contradiction_count(&self, memory_ids: &[Uuid]) -> Result<u64> {
        if memory_ids.is_empty() {
            return Ok(0);
        }
        let conn = self.conn.lock().unwrap();
        let placeholders = vec!["?"; memory_ids.len()].join(", ");
        let id_strings: Vec<String> = memory_ids.iter().map(Uuid::to_string).collect();
        let mut args = id_strings.clone();
        args.extend(id_strings);
        let count: i64 = conn.query_row(
            &format!(
                "SELECT COUNT(*) FROM contradictions WHERE resolved = 0 AND \
                 (memory_id_1 IN ({placeholders}) OR memory_id_2 IN ({placeholders}))"
            ),
            rusqlite::params_from_iter(args.iter()),
            |row| row.get(0),
        )?;
        Ok(count as u64)
    }

    /// Record a per-agent health reading
    pub fn record_health_snapshot(&self, snapshot: &HealthSnapshot) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO health_snapshots \
             (id, agent_id, contradiction_rate, retrieval_efficiency, semantic_drift, memory_quality, timestamp) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                snapshot.id.to_string(),
                snapshot.agent_id,
                snapshot.contradiction_rate,
                snapshot.retrieval_efficiency,
                snapshot.semantic_drift,
                snapshot.memory_quality,
                ts_to_millis(snapshot.timestamp),
            ],
        )?;
        Ok(())
    }

    /// Most recent health readings for an agent
    pub fn recent_health_snapshots(
        &self,
        agent_id: &str,
        limit: u32,
    ) -> Result<Vec<HealthSnapshot>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, agent_id, contradiction_rate, retrieval_efficiency, semantic_drift, \
             memory_quality, timestamp FROM health_snapshots \
             WHERE agent_id = ?1 ORDER BY timestamp DESC LIMIT ?2",
        )?;
        let raws: Vec<(String, String, f64, f64, f64, f64, i64)> = stmt
            .query_map(params![agent_id, limit], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);
        drop(conn);

        raws.into_iter()
            .map(|(id, agent_id, rate, efficiency, drift, quality, ts)| {
                Ok(HealthSnapshot {
                    id: parse_uuid(&id)?,
                    agent_id,
                    contradiction_rate: rate,
                    retrieval_efficiency: efficiency,
                    semantic_drift: drift,
                    memory_quality: quality,
                    timestamp: millis_to_ts(ts)?,
                })
            })
            .collect()
    }

    /// Calibration pairs collected for one memory
    pub fn calibration_pairs_for_memory(&self, memory_id: Uuid) -> Result<Vec<CalibrationPair>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, memory_id, transaction_id, eas_score, exact_score, method, created_at \
             FROM calibration_pairs WHERE memory_id = ?1 ORDER BY created_at",
        )?;
        let raws: Vec<(String, String, String, f64, f64, String, i64)> = stmt
            .query_map(params![memory_id.to_string()], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                    row.get(6)?,
                ))
            })?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);
        drop(conn);

        raws.into_iter()
            .map(|(id, memory_id, transaction_id, eas, exact, method, created)| {
                Ok(CalibrationPair {
                    id: parse_uuid(&id)?,
                    memory_id: parse_uuid(&memory_id)?,
                    transaction_id: parse_uuid(&transaction_id)?,
                    eas_score: eas,
                    exact_score: exact,
                    method: ScoreMethod::parse(&method)
                        .ok_or_else(|| StoreError::Decode(format!("bad method {method:?}")))?,
                    created_at: millis_to_ts(created)?,
                })
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use memlens_core::AttributionConfig;

    fn store() -> MemLensStore {
        MemLensStore::open_in_memory(AttributionConfig::default()).unwrap()
    }

    #[test]
    fn test_contradiction_lifecycle() {
        let store = store();
        let m1 = Uuid::now_v7();
        let m2 = Uuid::now_v7();

        let contradiction = store
            .record_contradiction(m1, m2, "logical", 0.8)
            .unwrap();
        assert!(!contradiction.resolved);

        assert_eq!(store.unresolved_contradiction_count(&[m1]).unwrap(), 1);
        assert_eq!(store.unresolved_contradiction_count(&[m2]).unwrap(), 1);
        assert_eq!(
            store.unresolved_contradiction_count(&[Uuid::now_v7()]).unwrap(),
            0
        );

        let unresolved = store.list_contradictions(Some(false)).unwrap();
        assert_eq!(unresolved.len(), 1);

        store.resolve_contradiction(contradiction.id).unwrap();
        assert_eq!(store.unresolved_contradiction_count(&[m1]).unwrap(), 0);
        assert!(store.list_contradictions(Some(false)).unwrap().is_empty());
        assert_eq!(store.list_contradictions(None).unwrap().len(), 1);
    }

    #[test]
    fn test_health_snapshots_newest_first() {
        let store = store();
        for i in 0..3 {
            let mut snapshot = HealthSnapshot {
                id: Uuid::now_v7(),
                agent_id: "a".into(),
                contradiction_rate: 0.1 * i as f64,
                retrieval_efficiency: 0.9,
                semantic_drift: 0.05,
                memory_quality: 0.8,
                timestamp: Utc::now(),
            };
            snapshot.timestamp = snapshot.timestamp + chrono::Duration::seconds(i);
            store.record_health_snapshot(&snapshot).unwrap();
        }

        let recent = store.recent_health_snapshots("a", 2).unwrap();
        assert_eq!(recent.len(), 2);
        assert!(recent[0].timestamp >= recent[1].timestamp);
        assert!(store.recent_health_snapshots("missing", 5).unwrap().is_empty());
    }
}

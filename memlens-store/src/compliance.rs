//! Compliance deletion: certificates, grace-window cascade, verification
//!
//! A deletion request snapshots the user's footprint F(u) into an append-only
//! certificate whose hash is reproducible from the snapshot bytes. Memory
//! nodes advance to `pending_deletion` immediately; after the grace window
//! the cascade finalizes by advancing them to `deleted` and zeroing every
//! current positive attribution edge out of the footprint. The verification
//! pass re-checks closure, attribution-zero, and embedding tombstones, and
//! leaves the certificate unverified (with an alert) when any check fails.

use chrono::{Duration, Utc};
use rusqlite::{params, OptionalExtension};
use sha2::{Digest, Sha256};
use tracing::{info, instrument, warn};
use uuid::Uuid;

use memlens_core::types::{MemoryStatus, RequestType, ScoreMethod};

use crate::error::{Result, StoreError};
use crate::store::{millis_to_ts, parse_json, parse_uuid, ts_to_millis, MemLensStore};
use crate::types::ComplianceCertificate;

/// Outcome of the post-deletion verification pass
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DeletionVerification {
    /// No derivation edge escapes the recorded footprint
    pub closure_ok: bool,
    /// No current positive attribution edge leaves a footprint memory
    pub attributions_zeroed: bool,
    /// All footprint memory nodes are deleted and operational embeddings dropped
    pub embeddings_tombstoned: bool,
}

impl DeletionVerification {
    pub fn passed(&self) -> bool {
        self.closure_ok && self.attributions_zeroed && self.embeddings_tombstoned
    }
}

impl MemLensStore {
    /// Open a compliance request: snapshot F(u), issue a certificate, and
    /// schedule the footprint's memories for deletion
    #[instrument(skip(self))]
    pub fn request_deletion(
        &self,
        user_id: &str,
        request_type: RequestType,
    ) -> Result<ComplianceCertificate> {
        let footprint = self.user_footprint(user_id)?;
        let now = Utc::now();
        let grace = Duration::days(self.config().protocol.deletion_grace_days);
        let grace_period_end = now + grace;

        let edges_affected = {
            let conn = self.conn.lock().unwrap();
            let placeholders = vec!["?"; footprint.memory_node_ids.len()].join(", ");
            if footprint.memory_node_ids.is_empty() {
                0i64
            } else {
                let ids: Vec<String> = footprint
                    .memory_node_ids
                    .iter()
                    .map(Uuid::to_string)
                    .collect();
                conn.query_row(
                    &format!(
                        "SELECT COUNT(*) FROM attribution_edges \
                         WHERE is_current = 1 AND source_id IN ({placeholders})"
                    ),
                    rusqlite::params_from_iter(ids.iter()),
                    |row| row.get(0),
                )?
            }
        };

        let certificate = ComplianceCertificate {
            id: Uuid::now_v7(),
            user_id: user_id.to_string(),
            request_type,
            footprint_snapshot: footprint.canonical_json(),
            nodes_deleted: footprint.all_node_ids().len() as u32,
            edges_affected: edges_affected as u32,
            deletion_timestamp: now,
            grace_period_end,
            hard_deleted_at: None,
            verified: false,
            verified_at: None,
            certificate_hash: footprint.certificate_hash(),
        };
        self.insert_certificate(&certificate)?;

        if request_type == RequestType::GdprDeletion {
            for memory_id in &footprint.memory_node_ids {
                self.advance_memory_node_status(
                    *memory_id,
                    MemoryStatus::PendingDeletion,
                    Some(grace_period_end),
                )?;
                // The operational row, if linked, enters the same grace window.
                if self.get_memory(*memory_id)?.is_some() {
                    self.soft_delete_memory(*memory_id)?;
                }
            }
        }

        info!(
            certificate = %certificate.id,
            nodes = certificate.nodes_deleted,
            "compliance request recorded"
        );
        Ok(certificate)
    }

    /// Finalize a deletion whose grace window has elapsed
    ///
    /// Advances footprint memory nodes to `deleted`, zeroes their current
    /// positive attribution edges with calibrated corrections, and stamps the
    /// certificate. Returns the number of nodes advanced.
    #[instrument(skip(self))]
    pub fn finalize_deletion(&self, certificate_id: Uuid) -> Result<u32> {
        let certificate = self
            .get_certificate(certificate_id)?
            .ok_or(StoreError::CertificateNotFound(certificate_id))?;
        let now = Utc::now();
        if now < certificate.grace_period_end {
            warn!("finalize requested before grace window elapsed; ignoring");
            return Ok(0);
        }

        let memory_ids = snapshot_memory_ids(&certificate)?;
        let mut advanced = 0u32;
        for memory_id in &memory_ids {
            if let Some(node) = self.get_memory_node(*memory_id)? {
                if node.status.can_transition_to(MemoryStatus::Deleted) {
                    self.advance_memory_node_status(*memory_id, MemoryStatus::Deleted, None)?;
                    advanced += 1;
                }
            }
            for edge in self.current_positive_edges_from(*memory_id)? {
                self.update_attribution(*memory_id, edge, 0.0, ScoreMethod::Calibrated)?;
            }
        }
        self.hard_delete_expired()?;

        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE compliance_certificates SET hard_deleted_at = ?2 WHERE id = ?1",
                params![certificate_id.to_string(), ts_to_millis(now)],
            )?;
        }

        info!(advanced, "deletion finalized");
        Ok(advanced)
    }

    /// Run the verification pass over a finalized deletion
    ///
    /// All checks passing marks the certificate verified; any failure leaves
    /// it unverified and surfaces an alert.
    #[instrument(skip(self))]
    pub fn verify_deletion(&self, certificate_id: Uuid) -> Result<DeletionVerification> {
        let certificate = self
            .get_certificate(certificate_id)?
            .ok_or(StoreError::CertificateNotFound(certificate_id))?;
        let memory_ids = snapshot_memory_ids(&certificate)?;
        let all_ids = snapshot_all_ids(&certificate)?;

        // Closure: every derivation edge out of the footprint must land in it.
        let id_set: std::collections::HashSet<Uuid> = all_ids.iter().copied().collect();
        let closure_ok = self
            .derivation_edges_from(&all_ids)?
            .iter()
            .all(|edge| id_set.contains(&edge.target_id));

        // Attribution-zero: no live positive influence remains.
        let mut attributions_zeroed = true;
        for memory_id in &memory_ids {
            if !self.current_positive_edges_from(*memory_id)?.is_empty() {
                attributions_zeroed = false;
                break;
            }
        }

        // Tombstones: nodes deleted and operational embeddings dropped.
        let mut embeddings_tombstoned = true;
        for memory_id in &memory_ids {
            if let Some(node) = self.get_memory_node(*memory_id)? {
                if node.status != MemoryStatus::Deleted {
                    embeddings_tombstoned = false;
                    break;
                }
            }
            if let Some(memory) = self.get_memory_any_status(*memory_id)? {
                if !memory.embedding.is_empty() {
                    embeddings_tombstoned = false;
                    break;
                }
            }
        }

        let verification = DeletionVerification {
            closure_ok,
            attributions_zeroed,
            embeddings_tombstoned,
        };

        if verification.passed() {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "UPDATE compliance_certificates SET verified = 1, verified_at = ?2 WHERE id = ?1",
                params![certificate_id.to_string(), ts_to_millis(Utc::now())],
            )?;
        } else {
            warn!(
                certificate = %certificate_id,
                ?verification,
                "deletion verification failed; certificate left unverified"
            );
        }

        Ok(verification)
    }

    /// Recompute the certificate hash from the stored snapshot
    pub fn audit_certificate(&self, certificate_id: Uuid) -> Result<bool> {
        let certificate = self
            .get_certificate(certificate_id)?
            .ok_or(StoreError::CertificateNotFound(certificate_id))?;
        let bytes = certificate.footprint_snapshot.to_string();
        let recomputed = hex::encode(Sha256::digest(bytes.as_bytes()));
        Ok(recomputed == certificate.certificate_hash)
    }

    /// Fetch one certificate
    pub fn get_certificate(&self, id: Uuid) -> Result<Option<ComplianceCertificate>> {
        let conn = self.conn.lock().unwrap();
        let raw = conn
            .query_row(
                "SELECT id, user_id, request_type, footprint_snapshot, nodes_deleted, \
                 edges_affected, deletion_timestamp, grace_period_end, hard_deleted_at, \
                 verified, verified_at, certificate_hash \
                 FROM compliance_certificates WHERE id = ?1",
                params![id.to_string()],
                read_certificate_row,
            )
            .optional()?;
        raw.map(raw_to_certificate).transpose()
    }

    /// All certificates for a user, newest first
    pub fn certificates_for_user(&self, user_id: &str) -> Result<Vec<ComplianceCertificate>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, user_id, request_type, footprint_snapshot, nodes_deleted, \
             edges_affected, deletion_timestamp, grace_period_end, hard_deleted_at, \
             verified, verified_at, certificate_hash \
             FROM compliance_certificates WHERE user_id = ?1 ORDER BY deletion_timestamp DESC",
        )?;
        let raws: Vec<RawCertificate> = stmt
            .query_map(params![user_id], read_certificate_row)?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);
        drop(conn);
        raws.into_iter().map(raw_to_certificate).collect()
    }

    fn insert_certificate(&self, certificate: &ComplianceCertificate) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO compliance_certificates \
             (id, user_id, request_type, footprint_snapshot, nodes_deleted, edges_affected, \
              deletion_timestamp, grace_period_end, hard_deleted_at, verified, verified_at, \
              certificate_hash) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)",
            params![
                certificate.id.to_string(),
                certificate.user_id,
                certificate.request_type.as_str(),
                certificate.footprint_snapshot.to_string(),
                certificate.nodes_deleted,
                certificate.edges_affected,
                ts_to_millis(certificate.deletion_timestamp),
                ts_to_millis(certificate.grace_period_end),
                certificate.hard_deleted_at.map(ts_to_millis),
                certificate.verified,
                certificate.verified_at.map(ts_to_millis),
                certificate.certificate_hash,
            ],
        )?;
        Ok(())
    }

    /// Interactions still influenced by a memory through current positive edges
    fn current_positive_edges_from(&self, memory_id: Uuid) -> Result<Vec<Uuid>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT target_id FROM attribution_edges \
             WHERE source_id = ?1 AND is_current = 1 AND score > 0",
        )?;
        let ids: Vec<String> = stmt
            .query_map(params![memory_id.to_string()], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);
        drop(conn);
        ids.iter().map(|s| parse_uuid(s)).collect()
    }
}

type RawCertificate = (
    String,
    String,
    String,
    String,
    i64,
    i64,
    i64,
    i64,
    Option<i64>,
    bool,
    Option<i64>,
    String,
);

fn read_certificate_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawCertificate> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
        row.get(8)?,
        row.get(9)?,
        row.get(10)?,
        row.get(11)?,
    ))
}

fn raw_to_certificate(raw: RawCertificate) -> Result<ComplianceCertificate> {
    let (
        id,
        user_id,
        request_type,
        snapshot,
        nodes_deleted,
        edges_affected,
        deletion_timestamp,
        grace_period_end,
        hard_deleted_at,
        verified,
        verified_at,
        certificate_hash,
    ) = raw;
    Ok(ComplianceCertificate {
        id: parse_uuid(&id)?,
        user_id,
        request_type: RequestType::parse(&request_type)
            .ok_or_else(|| StoreError::Decode(format!("bad request_type {request_type:?}")))?,
        footprint_snapshot: parse_json(&snapshot)?,
        nodes_deleted: nodes_deleted as u32,
        edges_affected: edges_affected as u32,
        deletion_timestamp: millis_to_ts(deletion_timestamp)?,
        grace_period_end: millis_to_ts(grace_period_end)?,
        hard_deleted_at: hard_deleted_at.map(millis_to_ts).transpose()?,
        verified,
        verified_at: verified_at.map(millis_to_ts).transpose()?,
        certificate_hash,
    })
}

fn snapshot_ids(certificate: &ComplianceCertificate, key: &str) -> Result<Vec<Uuid>> {
    certificate
        .footprint_snapshot
        .get(key)
        .and_then(|v| v.as_array())
        .map(|ids| {
            ids.iter()
                .map(|v| {
                    v.as_str()
                        .ok_or_else(|| StoreError::Decode(format!("non-string id under {key}")))
                        .and_then(parse_uuid)
                })
                .collect()
        })
        .unwrap_or_else(|| Ok(Vec::new()))
}

fn snapshot_memory_ids(certificate: &ComplianceCertificate) -> Result<Vec<Uuid>> {
    snapshot_ids(certificate, "memory_node_ids")
}

fn snapshot_all_ids(certificate: &ComplianceCertificate) -> Result<Vec<Uuid>> {
    let mut all = snapshot_ids(certificate, "memory_node_ids")?;
    all.extend(snapshot_ids(certificate, "summary_node_ids")?);
    all.extend(snapshot_ids(certificate, "embedding_node_ids")?);
    all.extend(snapshot_ids(certificate, "interaction_node_ids")?);
    Ok(all)
}

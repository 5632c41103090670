//! Memory CRUD: auto-embedding creation, patching, soft deletion with a
//! grace window, and the ordered fetches the transaction protocol relies on

use chrono::{Duration, Utc};
use rusqlite::{params, params_from_iter, OptionalExtension};
use tracing::{debug, instrument};
use uuid::Uuid;

use memlens_core::types::{Criticality, MemoryStatus, MemoryTier, MemoryType};
use memlens_core::Embedder;

use crate::error::{Result, StoreError};
use crate::provenance::RecordMemoryCreation;
use crate::store::{
    blob_to_embedding, embedding_to_blob, estimate_tokens, millis_to_ts, parse_json, parse_uuid,
    shard_for, ts_to_millis, MemLensStore,
};
use crate::types::{MemoryCreate, MemoryFilter, MemoryPatch, MemoryUnit};

const MEMORY_COLUMNS: &str = "id, content, embedding, tokens, agent_id, owner_id, tier, \
     criticality, status, shard_id, metadata, retrieval_count, created_at, last_accessed, deleted_at";

struct RawMemory {
    id: String,
    content: String,
    embedding: Option<Vec<u8>>,
    tokens: i64,
    agent_id: String,
    owner_id: String,
    tier: String,
    criticality: String,
    status: String,
    shard_id: i64,
    metadata: String,
    retrieval_count: i64,
    created_at: i64,
    last_accessed: Option<i64>,
    deleted_at: Option<i64>,
}

fn read_raw(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawMemory> {
    Ok(RawMemory {
        id: row.get(0)?,
        content: row.get(1)?,
        embedding: row.get(2)?,
        tokens: row.get(3)?,
        agent_id: row.get(4)?,
        owner_id: row.get(5)?,
        tier: row.get(6)?,
        criticality: row.get(7)?,
        status: row.get(8)?,
        shard_id: row.get(9)?,
        metadata: row.get(10)?,
        retrieval_count: row.get(11)?,
        created_at: row.get(12)?,
        last_accessed: row.get(13)?,
        deleted_at: row.get(14)?,
    })
}

fn raw_to_memory(raw: RawMemory) -> Result<MemoryUnit> {
    Ok(MemoryUnit {
        id: parse_uuid(&raw.id)?,
        content: raw.content,
        embedding: match raw.embedding {
            Some(blob) => blob_to_embedding(&blob)?,
            None => Vec::new(),
        },
        tokens: raw.tokens as u32,
        agent_id: raw.agent_id,
        owner_id: raw.owner_id,
        tier: MemoryTier::parse(&raw.tier)
            .ok_or_else(|| StoreError::Decode(format!("bad tier {:?}", raw.tier)))?,
        criticality: Criticality::parse(&raw.criticality)
            .ok_or_else(|| StoreError::Decode(format!("bad criticality {:?}", raw.criticality)))?,
        status: MemoryStatus::parse(&raw.status)
            .ok_or_else(|| StoreError::Decode(format!("bad status {:?}", raw.status)))?,
        shard_id: raw.shard_id as u32,
        metadata: parse_json(&raw.metadata)?,
        retrieval_count: raw.retrieval_count as u64,
        created_at: millis_to_ts(raw.created_at)?,
        last_accessed: raw.last_accessed.map(millis_to_ts).transpose()?,
        deleted_at: raw.deleted_at.map(millis_to_ts).transpose()?,
    })
}

impl MemLensStore {
    /// Create a memory, embedding its content
    ///
    /// When the request names a source interaction, the creation is also
    /// recorded in the provenance graph (memory node, creation edge,
    /// embedding node, derivation edge).
    #[instrument(skip_all, fields(owner = %req.owner_id))]
    pub async fn create_memory(
        &self,
        embedder: &dyn Embedder,
        req: MemoryCreate,
    ) -> Result<MemoryUnit> {
        let embedding = embedder.embed(&req.content).await?;
        let now = Utc::now();
        let memory = MemoryUnit {
            id: Uuid::now_v7(),
            content: req.content.clone(),
            embedding,
            tokens: estimate_tokens(&req.content),
            agent_id: req.agent_id,
            owner_id: req.owner_id.clone(),
            tier: req.tier,
            criticality: req.criticality,
            status: MemoryStatus::Active,
            shard_id: shard_for(&req.owner_id, self.config().protocol.shard_count),
            metadata: req.metadata,
            retrieval_count: 0,
            created_at: now,
            last_accessed: None,
            deleted_at: None,
        };
        self.insert_memory(&memory)?;

        if let Some(interaction_id) = req.source_interaction_id {
            self.record_memory_creation(&RecordMemoryCreation {
                interaction_id,
                content: memory.content.clone(),
                user_id: req.owner_id.clone(),
                memory_type: MemoryType::Raw,
                vector_ref: format!("mem/{}", memory.id),
                model_version: "external".into(),
                embedding_dim: embedder.dimensions() as u32,
                token_count: memory.tokens,
                criticality: memory.criticality,
                memory_id: Some(memory.id),
            })?;
        }

        debug!(memory_id = %memory.id, shard = memory.shard_id, "memory created");
        Ok(memory)
    }

    /// Insert a fully-built memory row
    pub fn insert_memory(&self, memory: &MemoryUnit) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO memories (id, content, embedding, tokens, agent_id, owner_id, tier, \
             criticality, status, shard_id, metadata, retrieval_count, created_at, last_accessed, deleted_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
            params![
                memory.id.to_string(),
                memory.content,
                embedding_to_blob(&memory.embedding),
                memory.tokens,
                memory.agent_id,
                memory.owner_id,
                memory.tier.as_str(),
                memory.criticality.as_str(),
                memory.status.as_str(),
                memory.shard_id,
                memory.metadata.to_string(),
                memory.retrieval_count,
                ts_to_millis(memory.created_at),
                memory.last_accessed.map(ts_to_millis),
                memory.deleted_at.map(ts_to_millis),
            ],
        )?;
        Ok(())
    }

    /// Fetch a memory visible to the live path (soft-deleted rows excluded)
    pub fn get_memory(&self, id: Uuid) -> Result<Option<MemoryUnit>> {
        let conn = self.conn.lock().unwrap();
        let raw = conn
            .query_row(
                &format!(
                    "SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1 AND deleted_at IS NULL"
                ),
                params![id.to_string()],
                read_raw,
            )
            .optional()?;
        raw.map(raw_to_memory).transpose()
    }

    /// Fetch a memory regardless of deletion state
    pub fn get_memory_any_status(&self, id: Uuid) -> Result<Option<MemoryUnit>> {
        let conn = self.conn.lock().unwrap();
        let raw = conn
            .query_row(
                &format!("SELECT {MEMORY_COLUMNS} FROM memories WHERE id = ?1"),
                params![id.to_string()],
                read_raw,
            )
            .optional()?;
        raw.map(raw_to_memory).transpose()
    }

    /// Update tier, criticality, or metadata of a live memory
    pub fn patch_memory(&self, id: Uuid, patch: MemoryPatch) -> Result<MemoryUnit> {
        {
            let conn = self.conn.lock().unwrap();
            let changed = conn.execute(
                "UPDATE memories SET \
                 tier = COALESCE(?2, tier), \
                 criticality = COALESCE(?3, criticality), \
                 metadata = COALESCE(?4, metadata) \
                 WHERE id = ?1 AND deleted_at IS NULL",
                params![
                    id.to_string(),
                    patch.tier.map(|t| t.as_str()),
                    patch.criticality.map(|c| c.as_str()),
                    patch.metadata.map(|m| m.to_string()),
                ],
            )?;
            if changed == 0 {
                return Err(StoreError::MemoryNotFound(id));
            }
        }
        self.get_memory(id)?.ok_or(StoreError::MemoryNotFound(id))
    }

    /// Soft-delete: transition to `pending_deletion` and stamp `deleted_at`
    ///
    /// The row stays fetchable by snapshot reads for the whole grace window.
    pub fn soft_delete_memory(&self, id: Uuid) -> Result<()> {
        let current = self
            .get_memory_any_status(id)?
            .ok_or(StoreError::MemoryNotFound(id))?;
        if !current.status.can_transition_to(MemoryStatus::PendingDeletion) {
            return Err(StoreError::InvalidTransition {
                from: current.status.as_str().into(),
                to: MemoryStatus::PendingDeletion.as_str().into(),
            });
        }

        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE memories SET status = ?2, deleted_at = ?3 WHERE id = ?1",
            params![
                id.to_string(),
                MemoryStatus::PendingDeletion.as_str(),
                ts_to_millis(Utc::now()),
            ],
        )?;
        debug!(memory_id = %id, "memory soft-deleted");
        Ok(())
    }

    /// Hard-delete rows whose grace window has elapsed
    ///
    /// Content is retained for the audit trail; the embedding is dropped so
    /// the vector is no longer recoverable from this store.
    pub fn hard_delete_expired(&self) -> Result<u32> {
        let grace = Duration::days(self.config().protocol.deletion_grace_days);
        let cutoff = ts_to_millis(Utc::now() - grace);
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE memories SET status = ?1, embedding = NULL \
             WHERE status = ?2 AND deleted_at IS NOT NULL AND deleted_at <= ?3",
            params![
                MemoryStatus::Deleted.as_str(),
                MemoryStatus::PendingDeletion.as_str(),
                cutoff,
            ],
        )?;
        Ok(changed as u32)
    }

    /// Paginated listing of live memories
    pub fn list_memories(&self, filter: &MemoryFilter) -> Result<(Vec<MemoryUnit>, u64)> {
        let conn = self.conn.lock().unwrap();
        let mut clauses = vec!["deleted_at IS NULL".to_string()];
        let mut args: Vec<String> = Vec::new();
        if let Some(agent_id) = &filter.agent_id {
            args.push(agent_id.clone());
            clauses.push(format!("agent_id = ?{}", args.len()));
        }
        if let Some(tier) = filter.tier {
            args.push(tier.as_str().to_string());
            clauses.push(format!("tier = ?{}", args.len()));
        }
        let where_clause = clauses.join(" AND ");

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM memories WHERE {where_clause}"),
            params_from_iter(args.iter()),
            |row| row.get(0),
        )?;

        let limit = if filter.limit == 0 { 50 } else { filter.limit };
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memories WHERE {where_clause} \
             ORDER BY created_at DESC LIMIT {limit} OFFSET {}",
            filter.offset
        );
        let mut stmt = conn.prepare(&sql)?;
        let raws: Vec<RawMemory> = stmt
            .query_map(params_from_iter(args.iter()), read_raw)?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);
        drop(conn);

        let memories = raws.into_iter().map(raw_to_memory).collect::<Result<_>>()?;
        Ok((memories, total as u64))
    }

    /// Fetch the given memories sorted by id
    ///
    /// The live path sees only active rows; snapshot reads (`include_deleted`)
    /// ignore soft-delete so two-phase completion scores the set captured at
    /// initiate time.
    pub(crate) fn fetch_memories_ordered(
        &self,
        ids: &[Uuid],
        include_deleted: bool,
    ) -> Result<Vec<MemoryUnit>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let placeholders = vec!["?"; ids.len()].join(", ");
        let status_clause = if include_deleted {
            String::new()
        } else {
            format!(" AND status = '{}'", MemoryStatus::Active.as_str())
        };
        let sql = format!(
            "SELECT {MEMORY_COLUMNS} FROM memories \
             WHERE id IN ({placeholders}){status_clause} ORDER BY id"
        );
        let id_strings: Vec<String> = ids.iter().map(Uuid::to_string).collect();
        let mut stmt = conn.prepare(&sql)?;
        let raws: Vec<RawMemory> = stmt
            .query_map(params_from_iter(id_strings.iter()), read_raw)?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);
        drop(conn);

        raws.into_iter().map(raw_to_memory).collect()
    }

    /// Distinct agent ids seen across memories and transactions
    pub fn list_agent_ids(&self) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT DISTINCT agent_id FROM memories WHERE deleted_at IS NULL \
             UNION SELECT DISTINCT agent_id FROM transactions ORDER BY agent_id",
        )?;
        let ids = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<rusqlite::Result<_>>()?;
        Ok(ids)
    }
}

/// Bump retrieval stats inside an open storage transaction
pub(crate) fn bump_memory_access(
    tx: &rusqlite::Transaction<'_>,
    id: Uuid,
    now_millis: i64,
) -> rusqlite::Result<()> {
    tx.execute(
        "UPDATE memories SET retrieval_count = retrieval_count + 1, last_accessed = ?2 \
         WHERE id = ?1",
        params![id.to_string(), now_millis],
    )?;
    Ok(())
}

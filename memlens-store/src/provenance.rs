//! Append-only provenance DAG
//!
//! Five node tables, four edge tables. Writes are grouped per operation into
//! one SQLite transaction; nodes are never mutated after creation except the
//! monotonic memory-node status. Attribution edges are versioned: a
//! calibration correction inserts a new row and flips `is_current` on the
//! previous one in the same transaction, so exactly one current edge exists
//! per (source, target) pair at any time.

use chrono::{DateTime, Utc};
use rusqlite::{params, OptionalExtension};
use serde::Serialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use tracing::{debug, instrument};
use uuid::Uuid;

use memlens_core::types::{
    Criticality, DerivationType, MemoryStatus, MemoryType, NodeType, ScoreMethod,
};

use crate::error::{Result, StoreError};
use crate::store::{millis_to_ts, parse_json, parse_uuid, shard_for, ts_to_millis, MemLensStore};
use crate::types::{
    AttributionEdge, DerivationEdge, EmbeddingNode, InteractionNode, MemoryNode, ResponseNode,
    Statement, StatementAttributionEdge, StatementScore, SummaryNode,
};

/// Arguments for [`MemLensStore::record_transaction`]
#[derive(Debug, Clone)]
pub struct RecordTransaction {
    pub user_id: String,
    pub query: String,
    pub response: String,
    pub agent_id: String,
    pub transaction_cost: f64,
    /// (memory_id, score) pairs in scoring order
    pub scores: Vec<(Uuid, f64)>,
    pub score_type: ScoreMethod,
    /// Reuse an externally assigned id (the protocol passes its transaction
    /// id so interaction nodes and transactions stay joinable)
    pub interaction_id: Option<Uuid>,
}

/// Arguments for [`MemLensStore::record_memory_creation`]
#[derive(Debug, Clone)]
pub struct RecordMemoryCreation {
    pub interaction_id: Uuid,
    pub content: String,
    pub user_id: String,
    pub memory_type: MemoryType,
    pub vector_ref: String,
    pub model_version: String,
    pub embedding_dim: u32,
    pub token_count: u32,
    pub criticality: Criticality,
    /// Reuse the operational memory id so both layers share one identity
    pub memory_id: Option<Uuid>,
}

/// Result of F(u): every node reachable from a user's interactions
///
/// Fields are kept sorted so the canonical serialization, and therefore the
/// certificate hash, is reproducible across runs.
#[derive(Debug, Clone, Serialize)]
pub struct UserFootprint {
    pub embedding_node_ids: Vec<Uuid>,
    pub interaction_node_ids: Vec<Uuid>,
    pub memory_node_ids: Vec<Uuid>,
    pub summary_node_ids: Vec<Uuid>,
    pub user_id: String,
}

impl UserFootprint {
    fn new(user_id: &str) -> Self {
        Self {
            embedding_node_ids: Vec::new(),
            interaction_node_ids: Vec::new(),
            memory_node_ids: Vec::new(),
            summary_node_ids: Vec::new(),
            user_id: user_id.to_string(),
        }
    }

    fn sort(&mut self) {
        self.embedding_node_ids.sort();
        self.interaction_node_ids.sort();
        self.memory_node_ids.sort();
        self.summary_node_ids.sort();
    }

    pub fn all_node_ids(&self) -> Vec<Uuid> {
        let mut all = Vec::with_capacity(
            self.embedding_node_ids.len()
                + self.interaction_node_ids.len()
                + self.memory_node_ids.len()
                + self.summary_node_ids.len(),
        );
        all.extend_from_slice(&self.memory_node_ids);
        all.extend_from_slice(&self.summary_node_ids);
        all.extend_from_slice(&self.embedding_node_ids);
        all.extend_from_slice(&self.interaction_node_ids);
        all
    }

    /// Canonical serialization: alphabetical keys, sorted id lists
    pub fn canonical_json(&self) -> serde_json::Value {
        let sorted = |ids: &[Uuid]| -> Vec<String> {
            let mut strings: Vec<String> = ids.iter().map(Uuid::to_string).collect();
            strings.sort();
            strings
        };
        json!({
            "embedding_node_ids": sorted(&self.embedding_node_ids),
            "interaction_node_ids": sorted(&self.interaction_node_ids),
            "memory_node_ids": sorted(&self.memory_node_ids),
            "summary_node_ids": sorted(&self.summary_node_ids),
            "user_id": self.user_id,
        })
    }

    /// SHA-256 over the canonical serialization, hex-encoded
    pub fn certificate_hash(&self) -> String {
        let bytes = self.canonical_json().to_string();
        hex::encode(Sha256::digest(bytes.as_bytes()))
    }
}

fn month_of(ts: DateTime<Utc>) -> String {
    ts.format("%Y-%m").to_string()
}

fn read_attribution_edge(row: &rusqlite::Row<'_>) -> rusqlite::Result<(String, String, String, f64, String, i64, i64, i64)> {
    Ok((
        row.get(0)?,
        row.get(1)?,
        row.get(2)?,
        row.get(3)?,
        row.get(4)?,
        row.get(5)?,
        row.get(6)?,
        row.get(7)?,
    ))
}

fn edge_from_raw(
    raw: (String, String, String, f64, String, i64, i64, i64),
) -> Result<AttributionEdge> {
    let (id, source, target, score, score_type, version, is_current, created_at) = raw;
    Ok(AttributionEdge {
        id: parse_uuid(&id)?,
        source_id: parse_uuid(&source)?,
        target_id: parse_uuid(&target)?,
        score,
        score_type: ScoreMethod::parse(&score_type)
            .ok_or_else(|| StoreError::Decode(format!("bad score_type {score_type:?}")))?,
        version: version as u32,
        is_current: is_current != 0,
        created_at: millis_to_ts(created_at)?,
    })
}

const EDGE_COLUMNS: &str =
    "id, source_id, target_id, score, score_type, version, is_current, created_at";

impl MemLensStore {
    /// Record a completed agent transaction: one interaction node plus one
    /// current attribution edge per scored memory, atomically
    #[instrument(skip_all, fields(user = %args.user_id, edges = args.scores.len()))]
    pub fn record_transaction(&self, args: &RecordTransaction) -> Result<InteractionNode> {
        let now = Utc::now();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        let node = record_transaction_tx(&tx, args, now)?;
        tx.commit()?;
        debug!(interaction = %node.id, "transaction recorded");
        Ok(node)
    }

    /// Record creation of a memory from an interaction: memory node,
    /// creation edge, embedding node, and derivation edge in one transaction
    pub fn record_memory_creation(
        &self,
        args: &RecordMemoryCreation,
    ) -> Result<(MemoryNode, EmbeddingNode)> {
        let now = Utc::now();
        let now_millis = ts_to_millis(now);
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let slice_id: i64 = tx.query_row(
            "SELECT COALESCE(MAX(slice_id), -1) + 1 FROM memory_nodes WHERE created_by_user_id = ?1",
            params![args.user_id],
            |row| row.get(0),
        )?;

        let memory_node = MemoryNode {
            id: args.memory_id.unwrap_or_else(Uuid::now_v7),
            shard_id: shard_for(&args.user_id, self.config().protocol.shard_count),
            content: args.content.clone(),
            memory_type: args.memory_type,
            status: MemoryStatus::Active,
            slice_id: slice_id as u32,
            created_at: now,
            created_by_user_id: args.user_id.clone(),
            token_count: args.token_count,
            criticality: args.criticality,
            metadata: json!({}),
            deletion_scheduled_at: None,
        };
        tx.execute(
            "INSERT INTO memory_nodes (id, shard_id, content, memory_type, status, slice_id, \
             created_at, created_by_user_id, token_count, criticality, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11)",
            params![
                memory_node.id.to_string(),
                memory_node.shard_id,
                memory_node.content,
                memory_node.memory_type.as_str(),
                memory_node.status.as_str(),
                memory_node.slice_id,
                now_millis,
                memory_node.created_by_user_id,
                memory_node.token_count,
                memory_node.criticality.as_str(),
                "{}",
            ],
        )?;

        tx.execute(
            "INSERT INTO creation_edges (id, source_id, target_id, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                Uuid::now_v7().to_string(),
                args.interaction_id.to_string(),
                memory_node.id.to_string(),
                now_millis,
            ],
        )?;

        let embedding_node = EmbeddingNode {
            id: Uuid::now_v7(),
            vector_ref: args.vector_ref.clone(),
            model_version: args.model_version.clone(),
            dimensions: args.embedding_dim,
            created_at: now,
            metadata: json!({}),
        };
        tx.execute(
            "INSERT INTO embedding_nodes (id, vector_ref, model_version, dimensions, created_at, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                embedding_node.id.to_string(),
                embedding_node.vector_ref,
                embedding_node.model_version,
                embedding_node.dimensions,
                now_millis,
                "{}",
            ],
        )?;

        insert_derivation_edge(
            &tx,
            memory_node.id,
            NodeType::Memory,
            embedding_node.id,
            NodeType::Embedding,
            DerivationType::Embedding,
            now_millis,
        )?;

        tx.commit()?;
        Ok((memory_node, embedding_node))
    }

    /// Record consolidation of several memories into a summary node, with
    /// one derivation edge per source memory
    pub fn record_consolidation(
        &self,
        source_memory_ids: &[Uuid],
        summary_content: &str,
        method: &str,
    ) -> Result<SummaryNode> {
        let now = Utc::now();
        let now_millis = ts_to_millis(now);
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let summary = SummaryNode {
            id: Uuid::now_v7(),
            content: summary_content.to_string(),
            source_memory_count: source_memory_ids.len() as u32,
            created_at: now,
            method: method.to_string(),
            metadata: json!({}),
        };
        tx.execute(
            "INSERT INTO summary_nodes (id, content, source_memory_count, created_at, method, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                summary.id.to_string(),
                summary.content,
                summary.source_memory_count,
                now_millis,
                summary.method,
                "{}",
            ],
        )?;

        for memory_id in source_memory_ids {
            insert_derivation_edge(
                &tx,
                *memory_id,
                NodeType::Memory,
                summary.id,
                NodeType::Summary,
                DerivationType::Consolidation,
                now_millis,
            )?;
        }

        tx.commit()?;
        Ok(summary)
    }

    /// Record a (re-)embedding of a memory or summary node
    pub fn record_embedding(
        &self,
        source_id: Uuid,
        source_type: NodeType,
        derivation_type: DerivationType,
        vector_ref: &str,
        model_version: &str,
        dimensions: u32,
    ) -> Result<EmbeddingNode> {
        let now = Utc::now();
        let now_millis = ts_to_millis(now);
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let node = EmbeddingNode {
            id: Uuid::now_v7(),
            vector_ref: vector_ref.to_string(),
            model_version: model_version.to_string(),
            dimensions,
            created_at: now,
            metadata: json!({}),
        };
        tx.execute(
            "INSERT INTO embedding_nodes (id, vector_ref, model_version, dimensions, created_at, metadata) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                node.id.to_string(),
                node.vector_ref,
                node.model_version,
                node.dimensions,
                now_millis,
                "{}",
            ],
        )?;
        insert_derivation_edge(
            &tx,
            source_id,
            source_type,
            node.id,
            NodeType::Embedding,
            derivation_type,
            now_millis,
        )?;

        tx.commit()?;
        Ok(node)
    }

    /// Record ContextCite statement-level attribution: one response node plus
    /// one statement attribution edge per (memory, statement) score
    pub fn record_contextcite(
        &self,
        interaction_id: Uuid,
        statements: &[Statement],
        scores: &[StatementScore],
    ) -> Result<ResponseNode> {
        let now = Utc::now();
        let now_millis = ts_to_millis(now);
        let statements_json = serde_json::to_value(statements)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;

        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let node = ResponseNode {
            id: Uuid::now_v7(),
            interaction_id,
            statements: statements_json,
            created_at: now,
        };
        tx.execute(
            "INSERT INTO response_nodes (id, interaction_id, statements, created_at) \
             VALUES (?1, ?2, ?3, ?4)",
            params![
                node.id.to_string(),
                interaction_id.to_string(),
                node.statements.to_string(),
                now_millis,
            ],
        )?;

        for score in scores {
            tx.execute(
                "INSERT INTO statement_attribution_edges \
                 (id, memory_id, response_id, statement_index, score, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![
                    Uuid::now_v7().to_string(),
                    score.memory_id.to_string(),
                    node.id.to_string(),
                    score.statement_index,
                    score.score,
                    now_millis,
                ],
            )?;
        }

        tx.commit()?;
        Ok(node)
    }

    /// Insert a new version of an attribution edge and retire the previous
    /// one, atomically
    #[instrument(skip(self))]
    pub fn update_attribution(
        &self,
        source_id: Uuid,
        target_id: Uuid,
        new_score: f64,
        new_score_type: ScoreMethod,
    ) -> Result<AttributionEdge> {
        let now = Utc::now();
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;

        let current: Option<i64> = tx
            .query_row(
                "SELECT version FROM attribution_edges \
                 WHERE source_id = ?1 AND target_id = ?2 AND is_current = 1",
                params![source_id.to_string(), target_id.to_string()],
                |row| row.get(0),
            )
            .optional()?;
        let next_version = current.unwrap_or(0) + 1;

        tx.execute(
            "UPDATE attribution_edges SET is_current = 0 \
             WHERE source_id = ?1 AND target_id = ?2 AND is_current = 1",
            params![source_id.to_string(), target_id.to_string()],
        )?;

        let edge = AttributionEdge {
            id: Uuid::now_v7(),
            source_id,
            target_id,
            score: new_score,
            score_type: new_score_type,
            version: next_version as u32,
            is_current: true,
            created_at: now,
        };
        tx.execute(
            "INSERT INTO attribution_edges \
             (id, source_id, target_id, score, score_type, version, is_current, created_at, created_month) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, 1, ?7, ?8)",
            params![
                edge.id.to_string(),
                source_id.to_string(),
                target_id.to_string(),
                new_score,
                new_score_type.as_str(),
                next_version,
                ts_to_millis(now),
                month_of(now),
            ],
        )?;

        tx.commit()?;
        Ok(edge)
    }

    /// All versions of the edge between one memory and one interaction
    pub fn attribution_edge_versions(
        &self,
        source_id: Uuid,
        target_id: Uuid,
    ) -> Result<Vec<AttributionEdge>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EDGE_COLUMNS} FROM attribution_edges \
             WHERE source_id = ?1 AND target_id = ?2 ORDER BY version"
        ))?;
        let raws: Vec<_> = stmt
            .query_map(
                params![source_id.to_string(), target_id.to_string()],
                read_attribution_edge,
            )?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);
        drop(conn);
        raws.into_iter().map(edge_from_raw).collect()
    }

    /// Current attribution edges pointing at one interaction
    pub fn current_attribution_edges_for_target(
        &self,
        target_id: Uuid,
    ) -> Result<Vec<AttributionEdge>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {EDGE_COLUMNS} FROM attribution_edges \
             WHERE target_id = ?1 AND is_current = 1 ORDER BY source_id"
        ))?;
        let raws: Vec<_> = stmt
            .query_map(params![target_id.to_string()], read_attribution_edge)?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);
        drop(conn);
        raws.into_iter().map(edge_from_raw).collect()
    }

    /// Compute F(u): fixed-point closure over creation and derivation edges
    /// seeded at the user's interactions
    #[instrument(skip(self))]
    pub fn user_footprint(&self, user_id: &str) -> Result<UserFootprint> {
        let conn = self.conn.lock().unwrap();
        let mut footprint = UserFootprint::new(user_id);

        let mut stmt = conn.prepare("SELECT id FROM interaction_nodes WHERE user_id = ?1")?;
        let interaction_ids: Vec<String> = stmt
            .query_map(params![user_id], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        for id in interaction_ids {
            footprint.interaction_node_ids.push(parse_uuid(&id)?);
        }
        drop(stmt);

        let mut stmt = conn.prepare(
            "WITH RECURSIVE user_footprint(node_id, node_type) AS ( \
                 SELECT ce.target_id, 'memory' \
                 FROM creation_edges ce \
                 JOIN interaction_nodes i ON ce.source_id = i.id \
                 WHERE i.user_id = ?1 \
                 UNION \
                 SELECT de.target_id, de.target_type \
                 FROM derivation_edges de \
                 JOIN user_footprint uf ON de.source_id = uf.node_id \
             ) \
             SELECT node_id, node_type FROM user_footprint",
        )?;
        let rows: Vec<(String, String)> = stmt
            .query_map(params![user_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);
        drop(conn);

        for (node_id, node_type) in rows {
            let id = parse_uuid(&node_id)?;
            match NodeType::parse(&node_type) {
                Some(NodeType::Memory) => footprint.memory_node_ids.push(id),
                Some(NodeType::Summary) => footprint.summary_node_ids.push(id),
                Some(NodeType::Embedding) => footprint.embedding_node_ids.push(id),
                None => {
                    return Err(StoreError::Decode(format!(
                        "unknown footprint node type {node_type:?}"
                    )))
                }
            }
        }

        footprint.sort();
        Ok(footprint)
    }

    /// Compute I(u): interactions influenced by the user's memories through
    /// current, positive attribution edges
    pub fn influence_footprint(&self, user_id: &str) -> Result<Vec<Uuid>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "WITH RECURSIVE user_footprint(node_id, node_type) AS ( \
                 SELECT ce.target_id, 'memory' \
                 FROM creation_edges ce \
                 JOIN interaction_nodes i ON ce.source_id = i.id \
                 WHERE i.user_id = ?1 \
                 UNION \
                 SELECT de.target_id, de.target_type \
                 FROM derivation_edges de \
                 JOIN user_footprint uf ON de.source_id = uf.node_id \
             ) \
             SELECT DISTINCT ae.target_id \
             FROM attribution_edges ae \
             JOIN user_footprint uf ON ae.source_id = uf.node_id \
             WHERE uf.node_type = 'memory' \
               AND ae.is_current = 1 \
               AND ae.score > 0 \
             ORDER BY ae.target_id",
        )?;
        let ids: Vec<String> = stmt
            .query_map(params![user_id], |row| row.get(0))?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);
        drop(conn);
        ids.iter().map(|s| parse_uuid(s)).collect()
    }

    /// Advance a memory node's status; the only node mutation the graph permits
    pub fn advance_memory_node_status(
        &self,
        id: Uuid,
        status: MemoryStatus,
        deletion_scheduled_at: Option<DateTime<Utc>>,
    ) -> Result<()> {
        let node = self
            .get_memory_node(id)?
            .ok_or(StoreError::MemoryNotFound(id))?;
        if !node.status.can_transition_to(status) {
            return Err(StoreError::InvalidTransition {
                from: node.status.as_str().into(),
                to: status.as_str().into(),
            });
        }
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE memory_nodes SET status = ?2, \
             deletion_scheduled_at = COALESCE(?3, deletion_scheduled_at) WHERE id = ?1",
            params![
                id.to_string(),
                status.as_str(),
                deletion_scheduled_at.map(ts_to_millis),
            ],
        )?;
        Ok(())
    }

    /// Fetch one memory node
    pub fn get_memory_node(&self, id: Uuid) -> Result<Option<MemoryNode>> {
        let conn = self.conn.lock().unwrap();
        let raw = conn
            .query_row(
                "SELECT id, shard_id, content, memory_type, status, slice_id, created_at, \
                 created_by_user_id, token_count, criticality, metadata, deletion_scheduled_at \
                 FROM memory_nodes WHERE id = ?1",
                params![id.to_string()],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, i64>(1)?,
                        row.get::<_, String>(2)?,
                        row.get::<_, String>(3)?,
                        row.get::<_, String>(4)?,
                        row.get::<_, i64>(5)?,
                        row.get::<_, i64>(6)?,
                        row.get::<_, String>(7)?,
                        row.get::<_, i64>(8)?,
                        row.get::<_, String>(9)?,
                        row.get::<_, String>(10)?,
                        row.get::<_, Option<i64>>(11)?,
                    ))
                },
            )
            .optional()?;

        raw.map(
            |(id, shard, content, mtype, status, slice, created, user, tokens, crit, meta, sched)| {
                Ok(MemoryNode {
                    id: parse_uuid(&id)?,
                    shard_id: shard as u32,
                    content,
                    memory_type: MemoryType::parse(&mtype)
                        .ok_or_else(|| StoreError::Decode(format!("bad memory_type {mtype:?}")))?,
                    status: MemoryStatus::parse(&status)
                        .ok_or_else(|| StoreError::Decode(format!("bad status {status:?}")))?,
                    slice_id: slice as u32,
                    created_at: millis_to_ts(created)?,
                    created_by_user_id: user,
                    token_count: tokens as u32,
                    criticality: Criticality::parse(&crit)
                        .ok_or_else(|| StoreError::Decode(format!("bad criticality {crit:?}")))?,
                    metadata: parse_json(&meta)?,
                    deletion_scheduled_at: sched.map(millis_to_ts).transpose()?,
                })
            },
        )
        .transpose()
    }

    /// All derivation edges whose source is in `source_ids`
    pub(crate) fn derivation_edges_from(&self, source_ids: &[Uuid]) -> Result<Vec<DerivationEdge>> {
        if source_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let placeholders = vec!["?"; source_ids.len()].join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT id, source_id, source_type, target_id, target_type, derivation_type, created_at \
             FROM derivation_edges WHERE source_id IN ({placeholders})"
        ))?;
        let id_strings: Vec<String> = source_ids.iter().map(Uuid::to_string).collect();
        let raws: Vec<(String, String, String, String, String, String, i64)> = stmt
            .query_map(rusqlite::params_from_iter(id_strings.iter()), |row| {
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
            .map(|(id, sid, stype, tid, ttype, dtype, created)| {
                Ok(DerivationEdge {
                    id: parse_uuid(&id)?,
                    source_id: parse_uuid(&sid)?,
                    source_type: NodeType::parse(&stype)
                        .ok_or_else(|| StoreError::Decode(format!("bad source_type {stype:?}")))?,
                    target_id: parse_uuid(&tid)?,
                    target_type: NodeType::parse(&ttype)
                        .ok_or_else(|| StoreError::Decode(format!("bad target_type {ttype:?}")))?,
                    derivation_type: DerivationType::parse(&dtype).ok_or_else(|| {
                        StoreError::Decode(format!("bad derivation_type {dtype:?}"))
                    })?,
                    created_at: millis_to_ts(created)?,
                })
            })
            .collect()
    }

    /// Statement attribution edges for one response node
    pub fn statement_attributions_for_response(
        &self,
        response_id: Uuid,
    ) -> Result<Vec<StatementAttributionEdge>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, memory_id, response_id, statement_index, score, created_at \
             FROM statement_attribution_edges WHERE response_id = ?1 \
             ORDER BY statement_index, memory_id",
        )?;
        let raws: Vec<(String, String, String, i64, f64, i64)> = stmt
            .query_map(params![response_id.to_string()], |row| {
                Ok((
                    row.get(0)?,
                    row.get(1)?,
                    row.get(2)?,
                    row.get(3)?,
                    row.get(4)?,
                    row.get(5)?,
                ))
            })?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);
        drop(conn);

        raws.into_iter()
            .map(|(id, mid, rid, idx, score, created)| {
                Ok(StatementAttributionEdge {
                    id: parse_uuid(&id)?,
                    memory_id: parse_uuid(&mid)?,
                    response_id: parse_uuid(&rid)?,
                    statement_index: idx as u32,
                    score,
                    created_at: millis_to_ts(created)?,
                })
            })
            .collect()
    }
}

/// Insert the interaction node and its attribution edges inside an already
/// open storage transaction
pub(crate) fn record_transaction_tx(
    tx: &rusqlite::Transaction<'_>,
    args: &RecordTransaction,
    now: DateTime<Utc>,
) -> Result<InteractionNode> {
    let now_millis = ts_to_millis(now);
    let node = InteractionNode {
        id: args.interaction_id.unwrap_or_else(Uuid::now_v7),
        user_id: args.user_id.clone(),
        query: args.query.clone(),
        response: args.response.clone(),
        timestamp: now,
        agent_id: args.agent_id.clone(),
        transaction_cost: args.transaction_cost,
        metadata: json!({}),
    };
    tx.execute(
        "INSERT INTO interaction_nodes \
         (id, user_id, query, response, timestamp, agent_id, transaction_cost, metadata) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
        params![
            node.id.to_string(),
            node.user_id,
            node.query,
            node.response,
            now_millis,
            node.agent_id,
            node.transaction_cost,
            "{}",
        ],
    )?;

    for (memory_id, score) in &args.scores {
        tx.execute(
            "INSERT INTO attribution_edges \
             (id, source_id, target_id, score, score_type, version, is_current, created_at, created_month) \
             VALUES (?1, ?2, ?3, ?4, ?5, 1, 1, ?6, ?7)",
            params![
                Uuid::now_v7().to_string(),
                memory_id.to_string(),
                node.id.to_string(),
                score,
                args.score_type.as_str(),
                now_millis,
                month_of(now),
            ],
        )?;
    }

    Ok(node)
}

fn insert_derivation_edge(
    tx: &rusqlite::Transaction<'_>,
    source_id: Uuid,
    source_type: NodeType,
    target_id: Uuid,
    target_type: NodeType,
    derivation_type: DerivationType,
    now_millis: i64,
) -> rusqlite::Result<()> {
    tx.execute(
        "INSERT INTO derivation_edges \
         (id, source_id, source_type, target_id, target_type, derivation_type, created_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            Uuid::now_v7().to_string(),
            source_id.to_string(),
            source_type.as_str(),
            target_id.to_string(),
            target_type.as_str(),
            derivation_type.as_str(),
            now_millis,
        ],
    )?;
    Ok(())
}

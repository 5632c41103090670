//! Transaction protocol: single-shot and two-phase attribution
//!
//! Both paths funnel through the same scoring routine over memory rows
//! fetched `ORDER BY id`, so identical inputs produce byte-identical score
//! vectors regardless of path. Two-phase completion reads the snapshot
//! captured at initiate time ignoring soft-delete; the live single-shot path
//! sees only active memories.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, OptionalExtension};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

use memlens_core::types::{AttributionScore, ScoreMethod};
use memlens_core::{
    compute_eas, ContextCiteEngine, Embedder, LogProbOracle, ShapleyEngine, ValueFunction,
};

use crate::error::{Result, StoreError};
use crate::memory::bump_memory_access;
use crate::profile::upsert_profile;
use crate::provenance::{record_transaction_tx, RecordTransaction};
use crate::store::{
    blob_to_embedding, embedding_to_blob, estimate_tokens, ids_to_json, json_to_ids, millis_to_ts,
    parse_uuid, ts_to_millis, MemLensStore,
};
use crate::types::{
    AgentCostConfig, InitiateRequest, MemoryUnit, SingleShotRequest, TransactionRecord,
    TransactionStatus, TransactionWithScores,
};

/// Filter for paginated transaction listings
#[derive(Debug, Clone, Default)]
pub struct TransactionFilter {
    pub agent_id: Option<String>,
    pub status: Option<TransactionStatus>,
    pub offset: u32,
    pub limit: u32,
}

/// Drives attribution over the store: embeds, scores, persists
///
/// Owns the engine instances and the oracle handle; the EAS fast path needs
/// neither. Engines are seeded so a replayed transaction reproduces its mask
/// and permutation draws.
pub struct TransactionProtocol {
    store: Arc<MemLensStore>,
    embedder: Arc<dyn Embedder>,
    oracle: Option<Arc<dyn LogProbOracle>>,
    contextcite: ContextCiteEngine,
    shapley: ShapleyEngine,
    deadline: Option<std::time::Duration>,
}

/// Engine output in sorted-row order, before persistence
struct EngineOutput {
    scores: Vec<f64>,
    raw_scores: Vec<f64>,
    confidences: Vec<f64>,
    method: ScoreMethod,
    compute_ms: f64,
}

/// Adapts the log-prob oracle into a coalition value function over one
/// transaction's memories
struct OracleValueFunction<'a> {
    oracle: &'a dyn LogProbOracle,
    query: &'a str,
    response: &'a str,
    contents: &'a [String],
}

#[async_trait]
impl ValueFunction for OracleValueFunction<'_> {
    async fn value(&self, subset: &[usize]) -> memlens_core::Result<f64> {
        let context: Vec<String> = subset
            .iter()
            .map(|&i| self.contents[i].clone())
            .collect();
        self.oracle
            .log_prob(self.query, self.response, &context)
            .await
    }
}

impl TransactionProtocol {
    pub fn new(store: Arc<MemLensStore>, embedder: Arc<dyn Embedder>) -> Self {
        let config = store.config().clone();
        Self {
            contextcite: ContextCiteEngine::with_seed(config.contextcite.clone(), 0),
            shapley: ShapleyEngine::with_seed(config.shapley.clone(), 0),
            store,
            embedder,
            oracle: None,
            deadline: None,
        }
    }

    /// Attach the log-prob oracle that powers ContextCite and Shapley
    pub fn with_oracle(mut self, oracle: Arc<dyn LogProbOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    /// Deadline handed to every oracle-driven attribution call
    ///
    /// On elapse ContextCite returns a low-confidence partial, approximate
    /// Shapley returns its running mean, and exact Shapley fails hard.
    pub fn with_deadline(mut self, deadline: std::time::Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }

    /// Re-seed both oracle-driven engines
    pub fn with_seed(mut self, seed: u64) -> Self {
        let config = self.store.config().clone();
        self.contextcite = ContextCiteEngine::with_seed(config.contextcite, seed);
        self.shapley = ShapleyEngine::with_seed(config.shapley, seed);
        self
    }

    pub fn store(&self) -> &Arc<MemLensStore> {
        &self.store
    }

    /// Single-shot path: embed, score, persist, all attribution writes in one
    /// storage transaction
    #[instrument(skip_all, fields(agent = %req.agent_id, k = req.retrieved_memory_ids.len()))]
    pub async fn single_shot(&self, req: SingleShotRequest) -> Result<TransactionWithScores> {
        let embeddings = self
            .embedder
            .embed_batch(&[req.query_text.as_str(), req.response_text.as_str()])
            .await?;
        let query_embedding = embeddings[0].clone();
        let response_embedding = embeddings[1].clone();

        let memories = self
            .store
            .fetch_memories_ordered(&req.retrieved_memory_ids, false)?;
        let method = self.resolve_method(req.method)?;
        let output = self
            .run_engine(
                method,
                &req.query_text,
                &req.response_text,
                &query_embedding,
                &response_embedding,
                &memories,
            )
            .await?;

        let now = Utc::now();
        let input_tokens = req
            .input_tokens
            .unwrap_or_else(|| estimate_tokens(&req.query_text));
        let output_tokens = req
            .output_tokens
            .unwrap_or_else(|| estimate_tokens(&req.response_text));
        let cost = self.cost_for(&req.agent_id, input_tokens, output_tokens)?;

        let record = TransactionRecord {
            id: Uuid::now_v7(),
            query_text: req.query_text.clone(),
            query_embedding,
            response_text: Some(req.response_text.clone()),
            response_embedding: Some(response_embedding.clone()),
            retrieved_memory_ids: req.retrieved_memory_ids.clone(),
            agent_id: req.agent_id.clone(),
            user_id: req.user_id.clone(),
            input_tokens,
            output_tokens,
            model: req.model.clone(),
            status: TransactionStatus::Completed,
            cost,
            created_at: now,
            completed_at: Some(now),
        };

        let scores = self.persist_scoring(&record, &output, &memories, true, now)?;
        info!(transaction = %record.id, scores = scores.len(), method = method.as_str(), "single-shot scored");
        Ok(TransactionWithScores {
            transaction: record,
            scores: order_scores(&req.retrieved_memory_ids, scores),
        })
    }

    /// Phase one: embed the query and snapshot the retrieved id list
    #[instrument(skip_all, fields(agent = %req.agent_id, k = req.retrieved_memory_ids.len()))]
    pub async fn initiate(&self, req: InitiateRequest) -> Result<Uuid> {
        let query_embedding = self.embedder.embed(&req.query_text).await?;
        let now = Utc::now();
        let record = TransactionRecord {
            id: Uuid::now_v7(),
            query_text: req.query_text,
            query_embedding,
            response_text: None,
            response_embedding: None,
            retrieved_memory_ids: req.retrieved_memory_ids,
            agent_id: req.agent_id,
            user_id: req.user_id,
            input_tokens: 0,
            output_tokens: 0,
            model: req.model,
            status: TransactionStatus::Pending,
            cost: 0.0,
            created_at: now,
            completed_at: None,
        };

        let mut conn = self.store.conn.lock().unwrap();
        let tx = conn.transaction()?;
        insert_transaction_tx(&tx, &record)?;
        tx.commit()?;
        debug!(transaction = %record.id, "transaction initiated");
        Ok(record.id)
    }

    /// Phase two: embed the response, score the snapshot, persist
    ///
    /// Duplicate completion is idempotent and returns the stored scores.
    #[instrument(skip_all, fields(transaction = %transaction_id))]
    pub async fn complete(
        &self,
        transaction_id: Uuid,
        response_text: &str,
        method: Option<ScoreMethod>,
    ) -> Result<TransactionWithScores> {
        let record = self
            .store
            .get_transaction(transaction_id)?
            .ok_or(StoreError::UnknownTransaction(transaction_id))?;

        match record.status {
            TransactionStatus::Completed => {
                debug!("duplicate complete; returning stored scores");
                let scores = self.store.attribution_by_transaction(transaction_id)?;
                return Ok(TransactionWithScores {
                    scores: order_scores(&record.retrieved_memory_ids, scores),
                    transaction: record,
                });
            }
            TransactionStatus::Failed => {
                return Err(StoreError::ExpiredTransaction(transaction_id));
            }
            TransactionStatus::Pending => {}
        }

        let ttl = Duration::hours(self.store.config().protocol.pending_ttl_hours);
        let now = Utc::now();
        if record.created_at + ttl < now {
            self.store.mark_transaction_failed(transaction_id)?;
            warn!("pending transaction outlived its TTL");
            return Err(StoreError::ExpiredTransaction(transaction_id));
        }

        let response_embedding = self.embedder.embed(response_text).await?;

        // Snapshot read: soft-deleted rows are included so the score vector
        // matches what a single-shot run over the same set would produce.
        let memories = self
            .store
            .fetch_memories_ordered(&record.retrieved_memory_ids, true)?;
        let unique_ids: std::collections::HashSet<Uuid> =
            record.retrieved_memory_ids.iter().copied().collect();
        if memories.len() != unique_ids.len() {
            return Err(StoreError::SnapshotCorrupted {
                transaction_id,
                detail: format!(
                    "snapshot expected {} rows, found {}",
                    unique_ids.len(),
                    memories.len()
                ),
            });
        }
        if let Some(lost) = memories.iter().find(|m| m.embedding.is_empty()) {
            return Err(StoreError::SnapshotCorrupted {
                transaction_id,
                detail: format!("memory {} lost its embedding", lost.id),
            });
        }

        let resolved = self.resolve_method(method)?;
        let output = self
            .run_engine(
                resolved,
                &record.query_text,
                response_text,
                &record.query_embedding,
                &response_embedding,
                &memories,
            )
            .await?;

        let input_tokens = estimate_tokens(&record.query_text);
        let output_tokens = estimate_tokens(response_text);
        let cost = self.cost_for(&record.agent_id, input_tokens, output_tokens)?;

        let completed = TransactionRecord {
            response_text: Some(response_text.to_string()),
            response_embedding: Some(response_embedding),
            input_tokens,
            output_tokens,
            cost,
            status: TransactionStatus::Completed,
            completed_at: Some(now),
            ..record
        };

        let scores = self.persist_scoring(&completed, &output, &memories, false, now)?;
        info!(scores = scores.len(), method = resolved.as_str(), "two-phase transaction completed");
        Ok(TransactionWithScores {
            scores: order_scores(&completed.retrieved_memory_ids, scores),
            transaction: completed,
        })
    }

    /// Statement-level ContextCite over a completed transaction
    ///
    /// Fits one surrogate per response statement and records the response
    /// node plus statement attribution edges in the provenance graph.
    #[instrument(skip_all, fields(transaction = %transaction_id, statements = statements.len()))]
    pub async fn contextcite_statements(
        &self,
        transaction_id: Uuid,
        statements: &[String],
    ) -> Result<crate::types::ResponseNode> {
        let oracle = self
            .oracle
            .as_deref()
            .ok_or(StoreError::OracleUnavailable("contextcite"))?;
        let record = self
            .store
            .get_transaction(transaction_id)?
            .ok_or(StoreError::UnknownTransaction(transaction_id))?;
        let memories = self
            .store
            .fetch_memories_ordered(&record.retrieved_memory_ids, true)?;
        let contents: Vec<String> = memories.iter().map(|m| m.content.clone()).collect();

        let attributions = self
            .contextcite
            .attribute_statements(oracle, &record.query_text, statements, &contents, self.deadline)
            .await?;

        let statement_rows: Vec<crate::types::Statement> = statements
            .iter()
            .enumerate()
            .map(|(index, text)| crate::types::Statement {
                index: index as u32,
                text: text.clone(),
            })
            .collect();
        let mut scores = Vec::new();
        for attribution in &attributions {
            for (memory, score) in memories.iter().zip(attribution.scores.iter()) {
                scores.push(crate::types::StatementScore {
                    memory_id: memory.id,
                    statement_index: attribution.statement_index as u32,
                    score: *score,
                });
            }
        }

        self.store
            .record_contextcite(transaction_id, &statement_rows, &scores)
    }

    /// Garbage-collect pending transactions older than the TTL
    pub fn gc_expired(&self) -> Result<u32> {
        let ttl = Duration::hours(self.store.config().protocol.pending_ttl_hours);
        let cutoff = ts_to_millis(Utc::now() - ttl);
        let conn = self.store.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE transactions SET status = 'failed' \
             WHERE status = 'pending' AND created_at <= ?1",
            params![cutoff],
        )?;
        if changed > 0 {
            info!(count = changed, "expired pending transactions marked failed");
        }
        Ok(changed as u32)
    }

    fn resolve_method(&self, requested: Option<ScoreMethod>) -> Result<ScoreMethod> {
        let method = requested.unwrap_or(self.store.config().tiering.default_method);
        match method {
            ScoreMethod::Calibrated => Err(StoreError::InvalidMethod("calibrated")),
            ScoreMethod::Contextcite | ScoreMethod::Exact | ScoreMethod::Approx
                if self.oracle.is_none() =>
            {
                Err(StoreError::OracleUnavailable(method.as_str()))
            }
            other => Ok(other),
        }
    }

    async fn run_engine(
        &self,
        method: ScoreMethod,
        query_text: &str,
        response_text: &str,
        query_embedding: &[f32],
        response_embedding: &[f32],
        memories: &[MemoryUnit],
    ) -> Result<EngineOutput> {
        if memories.is_empty() {
            return Ok(EngineOutput {
                scores: Vec::new(),
                raw_scores: Vec::new(),
                confidences: Vec::new(),
                method,
                compute_ms: 0.0,
            });
        }
        let embeddings: Vec<Vec<f32>> = memories.iter().map(|m| m.embedding.clone()).collect();
        let contents: Vec<String> = memories.iter().map(|m| m.content.clone()).collect();

        match method {
            ScoreMethod::Eas => {
                let outcome = compute_eas(&embeddings, query_embedding, response_embedding)?;
                Ok(EngineOutput {
                    confidences: vec![1.0; outcome.scores.len()],
                    scores: outcome.scores,
                    raw_scores: outcome.raw_scores,
                    method,
                    compute_ms: outcome.compute_ms,
                })
            }
            ScoreMethod::Contextcite => {
                let oracle = self
                    .oracle
                    .as_deref()
                    .ok_or(StoreError::OracleUnavailable("contextcite"))?;
                let outcome = self
                    .contextcite
                    .attribute(oracle, query_text, response_text, &contents, self.deadline)
                    .await?;
                Ok(EngineOutput {
                    raw_scores: outcome.scores.clone(),
                    confidences: vec![outcome.confidence; outcome.scores.len()],
                    scores: outcome.scores,
                    method,
                    compute_ms: outcome.compute_ms,
                })
            }
            ScoreMethod::Exact | ScoreMethod::Approx => {
                let oracle = self
                    .oracle
                    .as_deref()
                    .ok_or(StoreError::OracleUnavailable("shapley"))?;
                let value_fn = OracleValueFunction {
                    oracle,
                    query: query_text,
                    response: response_text,
                    contents: &contents,
                };
                let outcome = if method == ScoreMethod::Exact {
                    self.shapley
                        .exact(&value_fn, memories.len(), self.deadline)
                        .await?
                } else {
                    self.shapley
                        .approximate(&value_fn, memories.len(), self.deadline)
                        .await?
                };
                Ok(EngineOutput {
                    raw_scores: outcome.values.clone(),
                    scores: outcome.values,
                    confidences: outcome.confidences,
                    method: outcome.method,
                    compute_ms: outcome.compute_ms,
                })
            }
            ScoreMethod::Calibrated => Err(StoreError::InvalidMethod("calibrated")),
        }
    }

    /// Persist transaction, scores, profiles, access bumps, provenance, and
    /// calibration pairs in one storage transaction
    fn persist_scoring(
        &self,
        record: &TransactionRecord,
        output: &EngineOutput,
        memories: &[MemoryUnit],
        insert_transaction: bool,
        now: DateTime<Utc>,
    ) -> Result<Vec<AttributionScore>> {
        let now_millis = ts_to_millis(now);
        let mut scores = Vec::with_capacity(memories.len());
        for (i, memory) in memories.iter().enumerate() {
            scores.push(AttributionScore::new(
                memory.id,
                record.id,
                output.scores.get(i).copied().unwrap_or(0.0),
                output.raw_scores.get(i).copied().unwrap_or(0.0),
                output.method,
                output.confidences.get(i).copied().unwrap_or(0.0),
                output.compute_ms,
            ));
        }

        // Slow-path runs also compute the free EAS score so the calibration
        // loop accumulates (fast, slow) pairs.
        let calibration = if output.method != ScoreMethod::Eas && !memories.is_empty() {
            let embeddings: Vec<Vec<f32>> =
                memories.iter().map(|m| m.embedding.clone()).collect();
            let response = record
                .response_embedding
                .as_deref()
                .unwrap_or(&[]);
            match compute_eas(&embeddings, &record.query_embedding, response) {
                Ok(eas) => Some(eas.scores),
                Err(err) => {
                    warn!(%err, "calibration EAS failed; skipping pair capture");
                    None
                }
            }
        } else {
            None
        };

        let mut conn = self.store.conn.lock().unwrap();
        let tx = conn.transaction()?;

        if insert_transaction {
            insert_transaction_tx(&tx, record)?;
        } else {
            tx.execute(
                "UPDATE transactions SET response_text = ?2, response_embedding = ?3, \
                 input_tokens = ?4, output_tokens = ?5, cost = ?6, status = ?7, completed_at = ?8 \
                 WHERE id = ?1",
                params![
                    record.id.to_string(),
                    record.response_text,
                    record.response_embedding.as_deref().map(embedding_to_blob),
                    record.input_tokens,
                    record.output_tokens,
                    record.cost,
                    record.status.as_str(),
                    record.completed_at.map(ts_to_millis),
                ],
            )?;
        }

        for score in &scores {
            tx.execute(
                "INSERT INTO attribution_scores \
                 (id, memory_id, transaction_id, score, raw_score, method, confidence, compute_time_ms, created_at) \
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)",
                params![
                    score.id.to_string(),
                    score.memory_id.to_string(),
                    score.transaction_id.to_string(),
                    score.score,
                    score.raw_score,
                    score.method.as_str(),
                    score.confidence,
                    score.compute_time_ms,
                    now_millis,
                ],
            )?;
            upsert_profile(&tx, score.memory_id, score.score, now_millis)?;
            bump_memory_access(&tx, score.memory_id, now_millis)?;
        }

        if let Some(eas_scores) = calibration {
            for (i, score) in scores.iter().enumerate() {
                tx.execute(
                    "INSERT INTO calibration_pairs \
                     (id, memory_id, transaction_id, eas_score, exact_score, method, created_at) \
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
                    params![
                        Uuid::now_v7().to_string(),
                        score.memory_id.to_string(),
                        record.id.to_string(),
                        eas_scores.get(i).copied().unwrap_or(0.0),
                        score.score,
                        output.method.as_str(),
                        now_millis,
                    ],
                )?;
            }
        }

        record_transaction_tx(
            &tx,
            &RecordTransaction {
                user_id: record.user_id.clone(),
                query: record.query_text.clone(),
                response: record.response_text.clone().unwrap_or_default(),
                agent_id: record.agent_id.clone(),
                transaction_cost: record.cost,
                scores: scores.iter().map(|s| (s.memory_id, s.score)).collect(),
                score_type: output.method,
                interaction_id: Some(record.id),
            },
            now,
        )?;

        tx.commit()?;
        Ok(scores)
    }

    fn cost_for(&self, agent_id: &str, input_tokens: u32, output_tokens: u32) -> Result<f64> {
        let pricing = &self.store.config().pricing;
        let (input_cost, output_cost) = match self.store.get_agent_cost_config(agent_id)? {
            Some(config) => (config.input_token_cost, config.output_token_cost),
            None => (pricing.input_token_cost, pricing.output_token_cost),
        };
        Ok(f64::from(input_tokens) * input_cost + f64::from(output_tokens) * output_cost)
    }
}

/// Reorder persisted scores to the positional order of the request id list
fn order_scores(requested: &[Uuid], scores: Vec<AttributionScore>) -> Vec<AttributionScore> {
    let mut by_memory: std::collections::HashMap<Uuid, AttributionScore> =
        scores.into_iter().map(|s| (s.memory_id, s)).collect();
    requested
        .iter()
        .filter_map(|id| by_memory.remove(id))
        .collect()
}

// ── Store-level transaction rows ───────────────────────────────────────

const TXN_COLUMNS: &str = "id, query_text, query_embedding, response_text, response_embedding, \
     retrieved_memory_ids, agent_id, user_id, input_tokens, output_tokens, model, status, cost, \
     created_at, completed_at";

type RawTransaction = (
    String,
    String,
    Option<Vec<u8>>,
    Option<String>,
    Option<Vec<u8>>,
    String,
    String,
    String,
    i64,
    i64,
    String,
    String,
    f64,
    i64,
    Option<i64>,
);

fn read_raw_transaction(row: &rusqlite::Row<'_>) -> rusqlite::Result<RawTransaction> {
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
        row.get(12)?,
        row.get(13)?,
        row.get(14)?,
    ))
}

fn raw_to_transaction(raw: RawTransaction) -> Result<TransactionRecord> {
    let (
        id,
        query_text,
        query_embedding,
        response_text,
        response_embedding,
        memory_ids,
        agent_id,
        user_id,
        input_tokens,
        output_tokens,
        model,
        status,
        cost,
        created_at,
        completed_at,
    ) = raw;
    Ok(TransactionRecord {
        id: parse_uuid(&id)?,
        query_text,
        query_embedding: match query_embedding {
            Some(blob) => blob_to_embedding(&blob)?,
            None => Vec::new(),
        },
        response_text,
        response_embedding: response_embedding
            .map(|blob| blob_to_embedding(&blob))
            .transpose()?,
        retrieved_memory_ids: json_to_ids(&memory_ids)?,
        agent_id,
        user_id,
        input_tokens: input_tokens as u32,
        output_tokens: output_tokens as u32,
        model,
        status: TransactionStatus::parse(&status)
            .ok_or_else(|| StoreError::Decode(format!("bad status {status:?}")))?,
        cost,
        created_at: millis_to_ts(created_at)?,
        completed_at: completed_at.map(millis_to_ts).transpose()?,
    })
}

fn insert_transaction_tx(
    tx: &rusqlite::Transaction<'_>,
    record: &TransactionRecord,
) -> Result<()> {
    tx.execute(
        "INSERT INTO transactions (id, query_text, query_embedding, response_text, \
         response_embedding, retrieved_memory_ids, agent_id, user_id, input_tokens, \
         output_tokens, model, status, cost, created_at, completed_at) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13, ?14, ?15)",
        params![
            record.id.to_string(),
            record.query_text,
            embedding_to_blob(&record.query_embedding),
            record.response_text,
            record.response_embedding.as_deref().map(embedding_to_blob),
            ids_to_json(&record.retrieved_memory_ids),
            record.agent_id,
            record.user_id,
            record.input_tokens,
            record.output_tokens,
            record.model,
            record.status.as_str(),
            record.cost,
            ts_to_millis(record.created_at),
            record.completed_at.map(ts_to_millis),
        ],
    )?;
    Ok(())
}

impl MemLensStore {
    /// Fetch one transaction
    pub fn get_transaction(&self, id: Uuid) -> Result<Option<TransactionRecord>> {
        let conn = self.conn.lock().unwrap();
        let raw = conn
            .query_row(
                &format!("SELECT {TXN_COLUMNS} FROM transactions WHERE id = ?1"),
                params![id.to_string()],
                read_raw_transaction,
            )
            .optional()?;
        raw.map(raw_to_transaction).transpose()
    }

    /// Paginated transaction listing, newest first
    pub fn list_transactions(
        &self,
        filter: &TransactionFilter,
    ) -> Result<(Vec<TransactionRecord>, u64)> {
        let conn = self.conn.lock().unwrap();
        let mut clauses = vec!["1 = 1".to_string()];
        let mut args: Vec<String> = Vec::new();
        if let Some(agent_id) = &filter.agent_id {
            args.push(agent_id.clone());
            clauses.push(format!("agent_id = ?{}", args.len()));
        }
        if let Some(status) = filter.status {
            args.push(status.as_str().to_string());
            clauses.push(format!("status = ?{}", args.len()));
        }
        let where_clause = clauses.join(" AND ");

        let total: i64 = conn.query_row(
            &format!("SELECT COUNT(*) FROM transactions WHERE {where_clause}"),
            rusqlite::params_from_iter(args.iter()),
            |row| row.get(0),
        )?;

        let limit = if filter.limit == 0 { 50 } else { filter.limit };
        let mut stmt = conn.prepare(&format!(
            "SELECT {TXN_COLUMNS} FROM transactions WHERE {where_clause} \
             ORDER BY created_at DESC LIMIT {limit} OFFSET {}",
            filter.offset
        ))?;
        let raws: Vec<RawTransaction> = stmt
            .query_map(rusqlite::params_from_iter(args.iter()), read_raw_transaction)?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);
        drop(conn);

        let records = raws
            .into_iter()
            .map(raw_to_transaction)
            .collect::<Result<_>>()?;
        Ok((records, total as u64))
    }

    pub(crate) fn mark_transaction_failed(&self, id: Uuid) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE transactions SET status = 'failed' WHERE id = ?1 AND status = 'pending'",
            params![id.to_string()],
        )?;
        Ok(())
    }

    /// Attribution scores stored for one transaction
    pub fn attribution_by_transaction(&self, transaction_id: Uuid) -> Result<Vec<AttributionScore>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT id, memory_id, transaction_id, score, raw_score, method, confidence, \
             compute_time_ms, created_at FROM attribution_scores \
             WHERE transaction_id = ?1 ORDER BY memory_id",
        )?;
        let raws: Vec<(String, String, String, f64, f64, String, f64, f64, i64)> = stmt
            .query_map(params![transaction_id.to_string()], |row| {
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
                ))
            })?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);
        drop(conn);

        raws.into_iter().map(raw_to_score).collect()
    }

    /// Attribution history for one memory, highest scores first, plus its
    /// profile snapshot
    pub fn attribution_by_memory(
        &self,
        memory_id: Uuid,
    ) -> Result<(Vec<AttributionScore>, Option<crate::types::MemoryProfile>)> {
        let scores = {
            let conn = self.conn.lock().unwrap();
            let mut stmt = conn.prepare(
                "SELECT id, memory_id, transaction_id, score, raw_score, method, confidence, \
                 compute_time_ms, created_at FROM attribution_scores \
                 WHERE memory_id = ?1 ORDER BY score DESC",
            )?;
            let raws: Vec<(String, String, String, f64, f64, String, f64, f64, i64)> = stmt
                .query_map(params![memory_id.to_string()], |row| {
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
                    ))
                })?
                .collect::<rusqlite::Result<_>>()?;
            drop(stmt);
            raws.into_iter().map(raw_to_score).collect::<Result<Vec<_>>>()?
        };
        let profile = self.get_profile(memory_id)?;
        Ok((scores, profile))
    }

    /// (memory_id, score) pairs for a set of memories, for dashboards
    pub fn scores_for_memories(&self, memory_ids: &[Uuid]) -> Result<Vec<(Uuid, f64)>> {
        if memory_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let placeholders = vec!["?"; memory_ids.len()].join(", ");
        let mut stmt = conn.prepare(&format!(
            "SELECT memory_id, score FROM attribution_scores WHERE memory_id IN ({placeholders})"
        ))?;
        let id_strings: Vec<String> = memory_ids.iter().map(Uuid::to_string).collect();
        let raws: Vec<(String, f64)> = stmt
            .query_map(rusqlite::params_from_iter(id_strings.iter()), |row| {
                Ok((row.get(0)?, row.get(1)?))
            })?
            .collect::<rusqlite::Result<_>>()?;
        drop(stmt);
        drop(conn);

        raws.into_iter()
            .map(|(id, score)| Ok((parse_uuid(&id)?, score)))
            .collect()
    }

    /// Total stored attribution scores
    pub fn count_attribution_scores(&self) -> Result<u64> {
        let conn = self.conn.lock().unwrap();
        let count: i64 =
            conn.query_row("SELECT COUNT(*) FROM attribution_scores", [], |row| row.get(0))?;
        Ok(count as u64)
    }

    /// Per-agent transaction aggregates: count, token sums, last activity
    pub fn transaction_stats(
        &self,
        agent_id: &str,
    ) -> Result<(u64, u64, u64, Option<DateTime<Utc>>)> {
        let conn = self.conn.lock().unwrap();
        let (count, input, output, last): (i64, i64, i64, Option<i64>) = conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(input_tokens), 0), COALESCE(SUM(output_tokens), 0), \
             MAX(created_at) FROM transactions WHERE agent_id = ?1",
            params![agent_id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?)),
        )?;
        Ok((
            count as u64,
            input as u64,
            output as u64,
            last.map(millis_to_ts).transpose()?,
        ))
    }

    /// Per-agent pricing override
    pub fn get_agent_cost_config(&self, agent_id: &str) -> Result<Option<AgentCostConfig>> {
        let conn = self.conn.lock().unwrap();
        let raw = conn
            .query_row(
                "SELECT agent_id, input_token_cost, output_token_cost, provider, model_id, \
                 updated_at FROM agent_cost_configs WHERE agent_id = ?1",
                params![agent_id],
                |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, f64>(1)?,
                        row.get::<_, f64>(2)?,
                        row.get::<_, Option<String>>(3)?,
                        row.get::<_, Option<String>>(4)?,
                        row.get::<_, i64>(5)?,
                    ))
                },
            )
            .optional()?;
        raw.map(|(agent_id, input, output, provider, model_id, updated)| {
            Ok(AgentCostConfig {
                agent_id,
                input_token_cost: input,
                output_token_cost: output,
                provider,
                model_id,
                updated_at: millis_to_ts(updated)?,
            })
        })
        .transpose()
    }

    /// Insert or replace a per-agent pricing override
    pub fn set_agent_cost_config(&self, config: &AgentCostConfig) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT INTO agent_cost_configs \
             (agent_id, input_token_cost, output_token_cost, provider, model_id, updated_at) \
             VALUES (?1, ?2, ?3, ?4, ?5, ?6) \
             ON CONFLICT(agent_id) DO UPDATE SET \
                 input_token_cost = excluded.input_token_cost, \
                 output_token_cost = excluded.output_token_cost, \
                 provider = excluded.provider, \
                 model_id = excluded.model_id, \
                 updated_at = excluded.updated_at",
            params![
                config.agent_id,
                config.input_token_cost,
                config.output_token_cost,
                config.provider,
                config.model_id,
                ts_to_millis(config.updated_at),
            ],
        )?;
        Ok(())
    }
}

fn raw_to_score(
    raw: (String, String, String, f64, f64, String, f64, f64, i64),
) -> Result<AttributionScore> {
    let (id, memory_id, transaction_id, score, raw_score, method, confidence, compute_ms, created) =
        raw;
    Ok(AttributionScore {
        id: parse_uuid(&id)?,
        memory_id: parse_uuid(&memory_id)?,
        transaction_id: parse_uuid(&transaction_id)?,
        score,
        raw_score,
        method: ScoreMethod::parse(&method)
            .ok_or_else(|| StoreError::Decode(format!("bad method {method:?}")))?,
        confidence,
        compute_time_ms: compute_ms,
        created_at: millis_to_ts(created)?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use memlens_core::{AttributionConfig, HashEmbedder};

    use crate::types::MemoryCreate;

    async fn protocol_with_memories(
        count: usize,
    ) -> (TransactionProtocol, Vec<Uuid>) {
        let store = Arc::new(MemLensStore::open_in_memory(AttributionConfig::default()).unwrap());
        let embedder = Arc::new(HashEmbedder::new(64));
        let mut ids = Vec::new();
        for i in 0..count {
            let m = store
                .create_memory(
                    embedder.as_ref(),
                    MemoryCreate::new(format!("memory number {i}"), "user-t"),
                )
                .await
                .unwrap();
            ids.push(m.id);
        }
        (TransactionProtocol::new(store, embedder), ids)
    }

    #[tokio::test]
    async fn test_single_shot_persists_everything() {
        let (protocol, ids) = protocol_with_memories(3).await;
        let result = protocol
            .single_shot(SingleShotRequest::new(
                "what is rust",
                "rust is a systems language",
                ids.clone(),
                "agent-1",
            ))
            .await
            .unwrap();

        assert_eq!(result.scores.len(), 3);
        let sum: f64 = result.scores.iter().map(|s| s.score).sum();
        assert!((sum - 1.0).abs() < 1e-9);
        assert_eq!(result.transaction.status, TransactionStatus::Completed);
        assert!(result.transaction.cost > 0.0);

        // Scores are positionally aligned with the request id list.
        let score_ids: Vec<Uuid> = result.scores.iter().map(|s| s.memory_id).collect();
        assert_eq!(score_ids, ids);

        let store = protocol.store();
        let stored = store
            .attribution_by_transaction(result.transaction.id)
            .unwrap();
        assert_eq!(stored.len(), 3);
        for id in &ids {
            let profile = store.get_profile(*id).unwrap().unwrap();
            assert_eq!(profile.retrieval_count, 1);
            let memory = store.get_memory(*id).unwrap().unwrap();
            assert_eq!(memory.retrieval_count, 1);
            assert!(memory.last_accessed.is_some());
        }
        // Provenance edges mirror the stored scores.
        let edges = store
            .current_attribution_edges_for_target(result.transaction.id)
            .unwrap();
        assert_eq!(edges.len(), 3);
    }

    #[tokio::test]
    async fn test_two_phase_matches_single_shot_bytes() {
        let (protocol, ids) = protocol_with_memories(4).await;
        let query = "how do lifetimes work";
        let response = "lifetimes bound borrows";

        let single = protocol
            .single_shot(SingleShotRequest::new(query, response, ids.clone(), "a"))
            .await
            .unwrap();

        let txn_id = protocol
            .initiate(InitiateRequest::new(query, ids.clone(), "a"))
            .await
            .unwrap();
        let two_phase = protocol.complete(txn_id, response, None).await.unwrap();

        assert_eq!(single.scores.len(), two_phase.scores.len());
        for (a, b) in single.scores.iter().zip(two_phase.scores.iter()) {
            assert_eq!(a.memory_id, b.memory_id);
            assert_eq!(a.score.to_bits(), b.score.to_bits(), "scores must be byte-identical");
            assert_eq!(a.raw_score.to_bits(), b.raw_score.to_bits());
        }
    }

    #[tokio::test]
    async fn test_duplicate_complete_is_idempotent() {
        let (protocol, ids) = protocol_with_memories(2).await;
        let txn_id = protocol
            .initiate(InitiateRequest::new("q", ids.clone(), "a"))
            .await
            .unwrap();

        let first = protocol.complete(txn_id, "r", None).await.unwrap();
        let second = protocol.complete(txn_id, "r", None).await.unwrap();

        assert_eq!(first.scores.len(), second.scores.len());
        for (a, b) in first.scores.iter().zip(second.scores.iter()) {
            assert_eq!(a.id, b.id, "idempotent complete returns stored rows");
            assert_eq!(a.score.to_bits(), b.score.to_bits());
        }
        // No double-counting in profiles.
        let profile = protocol.store().get_profile(ids[0]).unwrap().unwrap();
        assert_eq!(profile.retrieval_count, 1);
    }

    #[tokio::test]
    async fn test_complete_unknown_transaction() {
        let (protocol, _) = protocol_with_memories(1).await;
        let missing = Uuid::now_v7();
        assert!(matches!(
            protocol.complete(missing, "r", None).await,
            Err(StoreError::UnknownTransaction(id)) if id == missing
        ));
    }

    #[tokio::test]
    async fn test_expired_pending_transaction() {
        let (protocol, ids) = protocol_with_memories(1).await;
        let txn_id = protocol
            .initiate(InitiateRequest::new("q", ids, "a"))
            .await
            .unwrap();

        // Backdate the pending row beyond the TTL.
        {
            let conn = protocol.store().conn.lock().unwrap();
            let old = ts_to_millis(Utc::now() - Duration::hours(25));
            conn.execute(
                "UPDATE transactions SET created_at = ?2 WHERE id = ?1",
                params![txn_id.to_string(), old],
            )
            .unwrap();
        }

        assert!(matches!(
            protocol.complete(txn_id, "r", None).await,
            Err(StoreError::ExpiredTransaction(id)) if id == txn_id
        ));
        // The row was moved to failed; a retry still reports expiry.
        assert!(matches!(
            protocol.complete(txn_id, "r", None).await,
            Err(StoreError::ExpiredTransaction(_))
        ));
    }

    #[tokio::test]
    async fn test_gc_expired_marks_failed() {
        let (protocol, ids) = protocol_with_memories(1).await;
        let txn_id = protocol
            .initiate(InitiateRequest::new("q", ids, "a"))
            .await
            .unwrap();
        {
            let conn = protocol.store().conn.lock().unwrap();
            let old = ts_to_millis(Utc::now() - Duration::hours(30));
            conn.execute(
                "UPDATE transactions SET created_at = ?2 WHERE id = ?1",
                params![txn_id.to_string(), old],
            )
            .unwrap();
        }

        assert_eq!(protocol.gc_expired().unwrap(), 1);
        let record = protocol.store().get_transaction(txn_id).unwrap().unwrap();
        assert_eq!(record.status, TransactionStatus::Failed);
    }

    #[tokio::test]
    async fn test_oracle_methods_require_oracle() {
        let (protocol, ids) = protocol_with_memories(2).await;
        let result = protocol
            .single_shot(
                SingleShotRequest::new("q", "r", ids, "a").with_method(ScoreMethod::Contextcite),
            )
            .await;
        assert!(matches!(result, Err(StoreError::OracleUnavailable("contextcite"))));
    }

    #[tokio::test]
    async fn test_calibrated_method_rejected() {
        let (protocol, ids) = protocol_with_memories(1).await;
        let result = protocol
            .single_shot(
                SingleShotRequest::new("q", "r", ids, "a").with_method(ScoreMethod::Calibrated),
            )
            .await;
        assert!(matches!(result, Err(StoreError::InvalidMethod("calibrated"))));
    }

    #[tokio::test]
    async fn test_agent_cost_config_overrides_pricing() {
        let (protocol, ids) = protocol_with_memories(1).await;
        protocol
            .store()
            .set_agent_cost_config(&AgentCostConfig {
                agent_id: "priced".into(),
                input_token_cost: 1.0,
                output_token_cost: 2.0,
                provider: None,
                model_id: None,
                updated_at: Utc::now(),
            })
            .unwrap();

        let result = protocol
            .single_shot(SingleShotRequest::new("two words", "three words here", ids, "priced"))
            .await
            .unwrap();
        // 2 input tokens * 1.0 + 3 output tokens * 2.0
        assert!((result.transaction.cost - 8.0).abs() < 1e-9);
    }

    #[tokio::test]
    async fn test_snapshot_missing_row_is_corruption() {
        let (protocol, mut ids) = protocol_with_memories(2).await;
        ids.push(Uuid::now_v7());
        let txn_id = protocol
            .initiate(InitiateRequest::new("q", ids, "a"))
            .await
            .unwrap();
        assert!(matches!(
            protocol.complete(txn_id, "r", None).await,
            Err(StoreError::SnapshotCorrupted { .. })
        ));
    }

    #[tokio::test]
    async fn test_contextcite_run_records_calibration_pairs() {
        use memlens_core::FnLogProbOracle;

        let (protocol, ids) = protocol_with_memories(2).await;
        let oracle = Arc::new(FnLogProbOracle::new(|_q, _r, ctx: &[String]| {
            ctx.len() as f64 * 0.5 - 2.0
        }));
        let protocol = protocol.with_oracle(oracle).with_seed(11);

        let result = protocol
            .single_shot(
                SingleShotRequest::new("q", "r", ids.clone(), "a")
                    .with_method(ScoreMethod::Contextcite),
            )
            .await
            .unwrap();
        assert!(result
            .scores
            .iter()
            .all(|s| s.method == ScoreMethod::Contextcite));

        let conn = protocol.store().conn.lock().unwrap();
        let pairs: i64 = conn
            .query_row("SELECT COUNT(*) FROM calibration_pairs", [], |row| row.get(0))
            .unwrap();
        assert_eq!(pairs, 2);
    }

    #[tokio::test]
    async fn test_contextcite_statements_record_edges() {
        use memlens_core::FnLogProbOracle;

        let (protocol, ids) = protocol_with_memories(2).await;
        let oracle = Arc::new(FnLogProbOracle::new(|_q, _r, ctx: &[String]| {
            ctx.len() as f64 - 3.0
        }));
        let protocol = protocol.with_oracle(oracle).with_seed(5);

        let result = protocol
            .single_shot(SingleShotRequest::new("q", "first. second.", ids, "a"))
            .await
            .unwrap();
        let statements = vec!["first.".to_string(), "second.".to_string()];
        let response_node = protocol
            .contextcite_statements(result.transaction.id, &statements)
            .await
            .unwrap();

        let edges = protocol
            .store()
            .statement_attributions_for_response(response_node.id)
            .unwrap();
        // One edge per (statement, memory) pair.
        assert_eq!(edges.len(), 4);
        assert!(edges.iter().any(|e| e.statement_index == 1));
    }

    #[tokio::test]
    async fn test_list_transactions_filters() {
        let (protocol, ids) = protocol_with_memories(1).await;
        protocol
            .single_shot(SingleShotRequest::new("q1", "r1", ids.clone(), "agent-a"))
            .await
            .unwrap();
        protocol
            .initiate(InitiateRequest::new("q2", ids, "agent-b"))
            .await
            .unwrap();

        let (all, total) = protocol
            .store()
            .list_transactions(&TransactionFilter::default())
            .unwrap();
        assert_eq!(total, 2);
        assert_eq!(all.len(), 2);

        let (pending, total) = protocol
            .store()
            .list_transactions(&TransactionFilter {
                status: Some(TransactionStatus::Pending),
                ..TransactionFilter::default()
            })
            .unwrap();
        assert_eq!(total, 1);
        assert_eq!(pending[0].agent_id, "agent-b");
    }
}

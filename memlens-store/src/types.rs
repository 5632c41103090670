//! Row types for the persisted record
//!
//! These mirror the stored tables one-to-one. Embeddings are fixed-dimension
//! f32 vectors; all ids are time-sortable UUIDv7.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use memlens_core::types::{
    Criticality, DerivationType, MemoryStatus, MemoryTier, MemoryType, NodeType, RequestType,
    ScoreMethod,
};

/// A stored memory unit
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryUnit {
    pub id: Uuid,
    pub content: String,
    /// Unit-norm embedding; empty after hard deletion
    pub embedding: Vec<f32>,
    pub tokens: u32,
    pub agent_id: String,
    pub owner_id: String,
    pub tier: MemoryTier,
    pub criticality: Criticality,
    pub status: MemoryStatus,
    pub shard_id: u32,
    pub metadata: Value,
    pub retrieval_count: u64,
    pub created_at: DateTime<Utc>,
    pub last_accessed: Option<DateTime<Utc>>,
    pub deleted_at: Option<DateTime<Utc>>,
}

/// Input to memory creation; content is embedded automatically
#[derive(Debug, Clone)]
pub struct MemoryCreate {
    pub content: String,
    pub agent_id: String,
    pub owner_id: String,
    pub tier: MemoryTier,
    pub criticality: Criticality,
    pub metadata: Value,
    /// When set, the creation is also recorded in the provenance graph
    pub source_interaction_id: Option<Uuid>,
}

impl MemoryCreate {
    pub fn new(content: impl Into<String>, owner_id: impl Into<String>) -> Self {
        let owner_id = owner_id.into();
        Self {
            content: content.into(),
            agent_id: owner_id.clone(),
            owner_id,
            tier: MemoryTier::Warm,
            criticality: Criticality::Normal,
            metadata: Value::Object(Default::default()),
            source_interaction_id: None,
        }
    }

    pub fn with_agent(mut self, agent_id: impl Into<String>) -> Self {
        self.agent_id = agent_id.into();
        self
    }

    pub fn with_tier(mut self, tier: MemoryTier) -> Self {
        self.tier = tier;
        self
    }

    pub fn with_criticality(mut self, criticality: Criticality) -> Self {
        self.criticality = criticality;
        self
    }

    pub fn from_interaction(mut self, interaction_id: Uuid) -> Self {
        self.source_interaction_id = Some(interaction_id);
        self
    }
}

/// Partial update for a memory
#[derive(Debug, Clone, Default)]
pub struct MemoryPatch {
    pub tier: Option<MemoryTier>,
    pub criticality: Option<Criticality>,
    pub metadata: Option<Value>,
}

/// Filter for paginated memory listings
#[derive(Debug, Clone, Default)]
pub struct MemoryFilter {
    pub agent_id: Option<String>,
    pub tier: Option<MemoryTier>,
    pub offset: u32,
    pub limit: u32,
}

/// Lifecycle status of a transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransactionStatus {
    Pending,
    Completed,
    Failed,
}

impl TransactionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A stored transaction (interaction)
///
/// `response_text` and `response_embedding` are null while pending; the
/// snapshotted `retrieved_memory_ids` list is immutable after initiate.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionRecord {
    pub id: Uuid,
    pub query_text: String,
    pub query_embedding: Vec<f32>,
    pub response_text: Option<String>,
    pub response_embedding: Option<Vec<f32>>,
    pub retrieved_memory_ids: Vec<Uuid>,
    pub agent_id: String,
    pub user_id: String,
    pub input_tokens: u32,
    pub output_tokens: u32,
    pub model: String,
    pub status: TransactionStatus,
    pub cost: f64,
    pub created_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Input to the single-shot path
#[derive(Debug, Clone)]
pub struct SingleShotRequest {
    pub query_text: String,
    pub response_text: String,
    pub retrieved_memory_ids: Vec<Uuid>,
    pub agent_id: String,
    pub user_id: String,
    pub model: String,
    pub method: Option<ScoreMethod>,
    pub input_tokens: Option<u32>,
    pub output_tokens: Option<u32>,
}

impl SingleShotRequest {
    pub fn new(
        query_text: impl Into<String>,
        response_text: impl Into<String>,
        retrieved_memory_ids: Vec<Uuid>,
        agent_id: impl Into<String>,
    ) -> Self {
        let agent_id = agent_id.into();
        Self {
            query_text: query_text.into(),
            response_text: response_text.into(),
            retrieved_memory_ids,
            user_id: agent_id.clone(),
            agent_id,
            model: "unknown".into(),
            method: None,
            input_tokens: None,
            output_tokens: None,
        }
    }

    pub fn with_method(mut self, method: ScoreMethod) -> Self {
        self.method = Some(method);
        self
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }
}

/// Input to phase one of the two-phase protocol
#[derive(Debug, Clone)]
pub struct InitiateRequest {
    pub query_text: String,
    pub retrieved_memory_ids: Vec<Uuid>,
    pub agent_id: String,
    pub user_id: String,
    pub model: String,
}

impl InitiateRequest {
    pub fn new(
        query_text: impl Into<String>,
        retrieved_memory_ids: Vec<Uuid>,
        agent_id: impl Into<String>,
    ) -> Self {
        let agent_id = agent_id.into();
        Self {
            query_text: query_text.into(),
            retrieved_memory_ids,
            user_id: agent_id.clone(),
            agent_id,
            model: "unknown".into(),
        }
    }

    pub fn with_user(mut self, user_id: impl Into<String>) -> Self {
        self.user_id = user_id.into();
        self
    }
}

/// Transaction plus the attribution it produced
#[derive(Debug, Clone)]
pub struct TransactionWithScores {
    pub transaction: TransactionRecord,
    pub scores: Vec<memlens_core::AttributionScore>,
}

/// Direction of a profile's recent movement relative to its running mean
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Trend {
    Up,
    Down,
    Stable,
}

impl Trend {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Up => "up",
            Self::Down => "down",
            Self::Stable => "stable",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "up" => Some(Self::Up),
            "down" => Some(Self::Down),
            "stable" => Some(Self::Stable),
            _ => None,
        }
    }
}

/// Running quality profile for one memory (Welford state)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryProfile {
    pub memory_id: Uuid,
    pub mean_attribution: f64,
    /// Welford M2 accumulator; variance = m2 / max(count − 1, 1)
    pub m2: f64,
    pub retrieval_count: u64,
    pub total_attribution: f64,
    pub trend: Trend,
    pub updated_at: DateTime<Utc>,
}

impl MemoryProfile {
    pub fn variance(&self) -> f64 {
        self.m2 / (self.retrieval_count.saturating_sub(1).max(1)) as f64
    }
}

// ── Provenance nodes ───────────────────────────────────────────────────

/// An agent query-response cycle in the provenance graph
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InteractionNode {
    pub id: Uuid,
    pub user_id: String,
    pub query: String,
    pub response: String,
    pub timestamp: DateTime<Utc>,
    pub agent_id: String,
    pub transaction_cost: f64,
    pub metadata: Value,
}

/// A memory unit in the provenance graph, sharded by owner hash
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryNode {
    pub id: Uuid,
    pub shard_id: u32,
    pub content: String,
    pub memory_type: MemoryType,
    pub status: MemoryStatus,
    /// SISA slice, monotonically increasing per user
    pub slice_id: u32,
    pub created_at: DateTime<Utc>,
    pub created_by_user_id: String,
    pub token_count: u32,
    pub criticality: Criticality,
    pub metadata: Value,
    pub deletion_scheduled_at: Option<DateTime<Utc>>,
}

/// A consolidation summary derived from multiple memories
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SummaryNode {
    pub id: Uuid,
    pub content: String,
    pub source_memory_count: u32,
    pub created_at: DateTime<Utc>,
    pub method: String,
    pub metadata: Value,
}

/// A vector embedding reference; the vector itself lives in the vector store
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EmbeddingNode {
    pub id: Uuid,
    pub vector_ref: String,
    pub model_version: String,
    pub dimensions: u32,
    pub created_at: DateTime<Utc>,
    pub metadata: Value,
}

/// Statement-level response decomposition, created on ContextCite runs
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseNode {
    pub id: Uuid,
    pub interaction_id: Uuid,
    pub statements: Value,
    pub created_at: DateTime<Utc>,
}

// ── Provenance edges (append-only) ─────────────────────────────────────

/// Interaction → memory creation link
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CreationEdge {
    pub id: Uuid,
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub created_at: DateTime<Utc>,
}

/// Memory → interaction attribution, versioned and never mutated
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributionEdge {
    pub id: Uuid,
    pub source_id: Uuid,
    pub target_id: Uuid,
    pub score: f64,
    pub score_type: ScoreMethod,
    pub version: u32,
    pub is_current: bool,
    pub created_at: DateTime<Utc>,
}

/// Polymorphic source → derived-node link; endpoints span three node tables
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DerivationEdge {
    pub id: Uuid,
    pub source_id: Uuid,
    pub source_type: NodeType,
    pub target_id: Uuid,
    pub target_type: NodeType,
    pub derivation_type: DerivationType,
    pub created_at: DateTime<Utc>,
}

/// Memory → response statement-level attribution
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatementAttributionEdge {
    pub id: Uuid,
    pub memory_id: Uuid,
    pub response_id: Uuid,
    pub statement_index: u32,
    pub score: f64,
    pub created_at: DateTime<Utc>,
}

/// One statement of a decomposed response, as passed to `record_contextcite`
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Statement {
    pub index: u32,
    pub text: String,
}

/// One statement-level score, as passed to `record_contextcite`
#[derive(Debug, Clone)]
pub struct StatementScore {
    pub memory_id: Uuid,
    pub statement_index: u32,
    pub score: f64,
}

// ── Compliance ─────────────────────────────────────────────────────────

/// Cryptographic audit record for a compliance request; never deleted
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComplianceCertificate {
    pub id: Uuid,
    pub user_id: String,
    pub request_type: RequestType,
    pub footprint_snapshot: Value,
    pub nodes_deleted: u32,
    pub edges_affected: u32,
    pub deletion_timestamp: DateTime<Utc>,
    pub grace_period_end: DateTime<Utc>,
    pub hard_deleted_at: Option<DateTime<Utc>>,
    pub verified: bool,
    pub verified_at: Option<DateTime<Utc>>,
    /// SHA-256 over the canonical footprint snapshot
    pub certificate_hash: String,
}

// ── Health ─────────────────────────────────────────────────────────────

/// A detected contradiction between two memories
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Contradiction {
    pub id: Uuid,
    pub memory_id_1: Uuid,
    pub memory_id_2: Uuid,
    pub kind: String,
    pub confidence: f64,
    pub detected_at: DateTime<Utc>,
    pub resolved: bool,
}

/// Periodic per-agent memory health reading
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct HealthSnapshot {
    pub id: Uuid,
    pub agent_id: String,
    pub contradiction_rate: f64,
    pub retrieval_efficiency: f64,
    pub semantic_drift: f64,
    pub memory_quality: f64,
    pub timestamp: DateTime<Utc>,
}

/// Paired (fast, slow) score observation for calibrating the fast path
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CalibrationPair {
    pub id: Uuid,
    pub memory_id: Uuid,
    pub transaction_id: Uuid,
    pub eas_score: f64,
    pub exact_score: f64,
    pub method: ScoreMethod,
    pub created_at: DateTime<Utc>,
}

/// Per-agent token pricing override
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentCostConfig {
    pub agent_id: String,
    pub input_token_cost: f64,
    pub output_token_cost: f64,
    pub provider: Option<String>,
    pub model_id: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transaction_status_roundtrip() {
        for s in [
            TransactionStatus::Pending,
            TransactionStatus::Completed,
            TransactionStatus::Failed,
        ] {
            assert_eq!(TransactionStatus::parse(s.as_str()), Some(s));
        }
        assert_eq!(TransactionStatus::parse("bogus"), None);
    }

    #[test]
    fn test_profile_variance() {
        let profile = MemoryProfile {
            memory_id: Uuid::now_v7(),
            mean_attribution: 0.5,
            m2: 0.08,
            retrieval_count: 5,
            total_attribution: 2.5,
            trend: Trend::Stable,
            updated_at: Utc::now(),
        };
        assert!((profile.variance() - 0.02).abs() < 1e-12);

        let fresh = MemoryProfile {
            retrieval_count: 1,
            m2: 0.0,
            ..profile
        };
        assert_eq!(fresh.variance(), 0.0);
    }

    #[test]
    fn test_memory_create_builder() {
        let req = MemoryCreate::new("note", "user-1")
            .with_agent("agent-9")
            .with_tier(MemoryTier::Hot)
            .with_criticality(Criticality::Protected);
        assert_eq!(req.owner_id, "user-1");
        assert_eq!(req.agent_id, "agent-9");
        assert_eq!(req.tier, MemoryTier::Hot);
        assert!(req.source_interaction_id.is_none());
    }
}

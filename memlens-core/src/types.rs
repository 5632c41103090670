//! Shared domain types for attribution and provenance
//!
//! Enum wire strings are fixed: they appear verbatim in stored rows and must
//! never change once written.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Attribution engine that produced a score
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScoreMethod {
    /// Closed-form embedding attribution, the zero-oracle default path
    Eas,
    /// Ablation masks + sparse linear surrogate
    Contextcite,
    /// Exact Shapley enumeration
    Exact,
    /// Monte-Carlo permutation Shapley
    Approx,
    /// Calibration correction layered on a previous score
    Calibrated,
}

impl ScoreMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Eas => "eas",
            Self::Contextcite => "contextcite",
            Self::Exact => "exact",
            Self::Approx => "approx",
            Self::Calibrated => "calibrated",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "eas" => Some(Self::Eas),
            "contextcite" => Some(Self::Contextcite),
            "exact" => Some(Self::Exact),
            "approx" => Some(Self::Approx),
            "calibrated" => Some(Self::Calibrated),
            _ => None,
        }
    }
}

/// Storage tier of a memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryTier {
    Hot,
    Warm,
    Cold,
}

impl MemoryTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Hot => "hot",
            Self::Warm => "warm",
            Self::Cold => "cold",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "hot" => Some(Self::Hot),
            "warm" => Some(Self::Warm),
            "cold" => Some(Self::Cold),
            _ => None,
        }
    }
}

/// Lifecycle status of a memory
///
/// The sequence only advances: `active → archived → pending_deletion →
/// deleted`. A deleted memory can never return to active.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryStatus {
    Active,
    Archived,
    PendingDeletion,
    Deleted,
}

impl MemoryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Archived => "archived",
            Self::PendingDeletion => "pending_deletion",
            Self::Deleted => "deleted",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "archived" => Some(Self::Archived),
            "pending_deletion" => Some(Self::PendingDeletion),
            "deleted" => Some(Self::Deleted),
            _ => None,
        }
    }

    fn rank(&self) -> u8 {
        match self {
            Self::Active => 0,
            Self::Archived => 1,
            Self::PendingDeletion => 2,
            Self::Deleted => 3,
        }
    }

    /// Whether a status transition is permitted (monotonic advance only)
    pub fn can_transition_to(&self, next: MemoryStatus) -> bool {
        next.rank() > self.rank()
    }
}

/// Criticality classification of a memory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Criticality {
    Normal,
    SafetyCritical,
    Protected,
}

impl Criticality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Normal => "normal",
            Self::SafetyCritical => "safety_critical",
            Self::Protected => "protected",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "normal" => Some(Self::Normal),
            "safety_critical" => Some(Self::SafetyCritical),
            "protected" => Some(Self::Protected),
            _ => None,
        }
    }
}

/// Kind of memory node in the provenance graph
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemoryType {
    Raw,
    Consolidated,
    Critical,
}

impl MemoryType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Raw => "raw",
            Self::Consolidated => "consolidated",
            Self::Critical => "critical",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "raw" => Some(Self::Raw),
            "consolidated" => Some(Self::Consolidated),
            "critical" => Some(Self::Critical),
            _ => None,
        }
    }
}

/// How a derived provenance node was produced
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DerivationType {
    Consolidation,
    Embedding,
    ReEmbedding,
    Summary,
}

impl DerivationType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Consolidation => "consolidation",
            Self::Embedding => "embedding",
            Self::ReEmbedding => "re_embedding",
            Self::Summary => "summary",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "consolidation" => Some(Self::Consolidation),
            "embedding" => Some(Self::Embedding),
            "re_embedding" => Some(Self::ReEmbedding),
            "summary" => Some(Self::Summary),
            _ => None,
        }
    }
}

/// Node table a polymorphic derivation edge endpoint lives in
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Memory,
    Summary,
    Embedding,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Memory => "memory",
            Self::Summary => "summary",
            Self::Embedding => "embedding",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "memory" => Some(Self::Memory),
            "summary" => Some(Self::Summary),
            "embedding" => Some(Self::Embedding),
            _ => None,
        }
    }
}

/// Kind of compliance request backing a certificate
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RequestType {
    GdprDeletion,
    AuditRequest,
    DataExport,
}

impl RequestType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::GdprDeletion => "gdpr_deletion",
            Self::AuditRequest => "audit_request",
            Self::DataExport => "data_export",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "gdpr_deletion" => Some(Self::GdprDeletion),
            "audit_request" => Some(Self::AuditRequest),
            "data_export" => Some(Self::DataExport),
            _ => None,
        }
    }
}

/// A single attribution score: the causal share of one memory in one
/// transaction's response
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AttributionScore {
    pub id: Uuid,
    pub memory_id: Uuid,
    pub transaction_id: Uuid,
    /// Normalized score; EAS scores sum to 1 across the transaction
    pub score: f64,
    /// Score before normalization
    pub raw_score: f64,
    pub method: ScoreMethod,
    /// Engine self-confidence: 1.0 for EAS, LDS for ContextCite,
    /// permutation-stderr-derived for approximate Shapley
    pub confidence: f64,
    pub compute_time_ms: f64,
    pub created_at: DateTime<Utc>,
}

impl AttributionScore {
    pub fn new(
        memory_id: Uuid,
        transaction_id: Uuid,
        score: f64,
        raw_score: f64,
        method: ScoreMethod,
        confidence: f64,
        compute_time_ms: f64,
    ) -> Self {
        Self {
            id: Uuid::now_v7(),
            memory_id,
            transaction_id,
            score,
            raw_score,
            method,
            confidence,
            compute_time_ms,
            created_at: Utc::now(),
        }
    }
}

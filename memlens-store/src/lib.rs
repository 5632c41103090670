//! memlens-store - Persistence and protocol for memory attribution
//!
//! This crate owns the stored record: memories with soft-delete lifecycle,
//! the single-shot / two-phase transaction protocol, atomic Welford profile
//! upserts, the append-only provenance DAG with versioned attribution edges,
//! and compliance certificates with reproducible footprint hashes. Storage is
//! SQLite behind a single connection; every multi-row write runs inside one
//! storage transaction.

pub mod compliance;
pub mod error;
pub mod health;
pub mod memory;
pub mod migrations;
pub mod profile;
pub mod provenance;
pub mod store;
pub mod transaction;
pub mod types;

pub use compliance::DeletionVerification;
pub use error::{Result, StoreError};
pub use provenance::{RecordMemoryCreation, RecordTransaction, UserFootprint};
pub use store::MemLensStore;
pub use transaction::{TransactionFilter, TransactionProtocol};
pub use types::{
    AgentCostConfig, AttributionEdge, CalibrationPair, ComplianceCertificate, Contradiction,
    CreationEdge, DerivationEdge, EmbeddingNode, HealthSnapshot, InitiateRequest, InteractionNode,
    MemoryCreate, MemoryFilter, MemoryNode, MemoryPatch, MemoryProfile, MemoryUnit, ResponseNode,
    SingleShotRequest, Statement, StatementAttributionEdge, StatementScore, SummaryNode,
    TransactionRecord, TransactionStatus, TransactionWithScores, Trend,
};

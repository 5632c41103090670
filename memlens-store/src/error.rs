//! Error types for storage and protocol operations

use thiserror::Error;
use uuid::Uuid;

use memlens_core::CoreError;

/// Error type for store and transaction-protocol operations
#[derive(Debug, Error)]
pub enum StoreError {
    /// Underlying SQLite failure
    #[error("Database error: {0}")]
    Database(#[from] rusqlite::Error),

    /// Attribution kernel failure bubbled through the protocol
    #[error(transparent)]
    Core(#[from] CoreError),

    /// `complete` referenced a transaction that was never initiated
    #[error("Unknown transaction: {0}")]
    UnknownTransaction(Uuid),

    /// The pending window elapsed before `complete` arrived
    #[error("Transaction expired: {0}")]
    ExpiredTransaction(Uuid),

    /// A snapshotted memory vanished or lost its embedding between phases
    #[error("Snapshot corrupted for transaction {transaction_id}: {detail}")]
    SnapshotCorrupted { transaction_id: Uuid, detail: String },

    /// Memory row does not exist (or is not visible to the live path)
    #[error("Memory not found: {0}")]
    MemoryNotFound(Uuid),

    /// Compliance certificate does not exist
    #[error("Certificate not found: {0}")]
    CertificateNotFound(Uuid),

    /// The requested scoring method needs an oracle that was not configured
    #[error("No oracle configured for method {0}")]
    OracleUnavailable(&'static str),

    /// The requested scoring method is not directly runnable
    #[error("Method {0} cannot be requested directly")]
    InvalidMethod(&'static str),

    /// A status change would move backwards in the monotonic lifecycle
    #[error("Invalid status transition: {from} -> {to}")]
    InvalidTransition { from: String, to: String },

    /// A stored row failed to decode
    #[error("Corrupt stored value: {0}")]
    Decode(String),

    /// JSON (de)serialization failed
    #[error("Serialization error: {0}")]
    Serialization(String),
}

/// Result type alias for store operations
pub type Result<T> = std::result::Result<T, StoreError>;

//! Error types for the attribution kernel

use thiserror::Error;

/// Error type for attribution kernel operations
#[derive(Debug, Error)]
pub enum CoreError {
    /// Two vectors of different dimensionality were combined
    #[error("Dimension mismatch: {left} vs {right}")]
    DimensionMismatch { left: usize, right: usize },

    /// An attribution engine was invoked with no retrieved memories
    #[error("Retrieved memory set is empty")]
    EmptyRetrievedSet,

    /// Exact Shapley enumeration requested beyond the feasible subset count
    #[error("Exact Shapley is infeasible for k={k} (max {max})")]
    InfeasibleExactShapley { k: usize, max: usize },

    /// A hard deadline elapsed before the engine could produce a result
    #[error("Deadline elapsed after {elapsed_ms}ms")]
    DeadlineExceeded { elapsed_ms: u64 },

    /// The log-prob oracle or value function failed beyond retry budget
    #[error("Oracle failure: {0}")]
    OracleFailed(String),

    /// Embedding generation failed
    #[error("Embedding error: {0}")]
    Embedding(String),
}

/// Result type alias for kernel operations
pub type Result<T> = std::result::Result<T, CoreError>;

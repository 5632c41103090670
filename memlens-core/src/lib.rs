//! memlens-core - Attribution kernel for agent memory observability
//!
//! This crate computes causal attribution of an agent response to the
//! memories retrieved for it, at three cost/precision tiers: the closed-form
//! Embedding Attribution Score (the zero-oracle production default),
//! ContextCite (ablation masks + LASSO surrogate), and Shapley values (exact
//! enumeration or Monte-Carlo sampling). It also provides the Welford
//! accumulator that backs per-memory quality profiles and the trait seams
//! (`Embedder`, `LogProbOracle`, `ValueFunction`) the engines consume.

pub mod config;
pub mod contextcite;
pub mod eas;
pub mod embedder;
pub mod error;
pub mod lasso;
pub mod oracle;
pub mod shapley;
pub mod types;
pub mod vector;
pub mod welford;

pub use config::{
    AttributionConfig, ContextCiteConfig, PortfolioConfig, PricingConfig, ProtocolConfig,
    ShapleyConfig, TieringConfig,
};
pub use contextcite::{ContextCiteEngine, ContextCiteOutcome, StatementAttribution, pearson};
pub use eas::{EasOutcome, compute_eas};
pub use embedder::{Embedder, FixedEmbedder, HashEmbedder};
pub use error::{CoreError, Result};
pub use lasso::{LassoFit, lasso, lasso_default};
pub use oracle::{FnLogProbOracle, FnValueFunction, LogProbOracle, ValueFunction};
pub use shapley::{ShapleyEngine, ShapleyOutcome};
pub use types::{
    AttributionScore, Criticality, DerivationType, MemoryStatus, MemoryTier, MemoryType, NodeType,
    RequestType, ScoreMethod,
};
pub use vector::{cosine, dot, is_unit_norm, norm, normalize};
pub use welford::WelfordAccumulator;

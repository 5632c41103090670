//! Configuration for the attribution kernel and transaction protocol
//!
//! Every tunable the engines recognize lives here with its default, so
//! deployments can tier engine usage instead of hard-coding it.

use serde::{Deserialize, Serialize};

use crate::types::ScoreMethod;

/// Top-level configuration bundle
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AttributionConfig {
    /// ContextCite engine settings
    #[serde(default)]
    pub contextcite: ContextCiteConfig,
    /// Shapley engine settings
    #[serde(default)]
    pub shapley: ShapleyConfig,
    /// Token pricing used for cost accounting
    #[serde(default)]
    pub pricing: PricingConfig,
    /// Portfolio metric thresholds
    #[serde(default)]
    pub portfolio: PortfolioConfig,
    /// Engine tiering for production traffic
    #[serde(default)]
    pub tiering: TieringConfig,
    /// Transaction protocol lifecycle settings
    #[serde(default)]
    pub protocol: ProtocolConfig,
}

/// Configuration for the ContextCite engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextCiteConfig {
    /// Number of ablation masks, including the all-zeros and all-ones masks (default: 64)
    pub num_samples: usize,
    /// L1 regularization strength for the LASSO fit (default: 0.1)
    pub lasso_lambda: f64,
    /// LDS below this marks the surrogate as low-confidence (default: 0.8)
    pub min_confidence: f64,
    /// Oracle retries before a mask is abandoned (default: 3)
    pub max_retries: u32,
    /// Base delay for exponential retry backoff, in milliseconds (default: 50)
    pub retry_base_ms: u64,
    /// Concurrent oracle calls in flight (default: 8)
    pub oracle_concurrency: usize,
}

impl Default for ContextCiteConfig {
    fn default() -> Self {
        Self {
            num_samples: 64,
            lasso_lambda: 0.1,
            min_confidence: 0.8,
            max_retries: 3,
            retry_base_ms: 50,
            oracle_concurrency: 8,
        }
    }
}

/// Configuration for the Shapley engine
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ShapleyConfig {
    /// Largest k for exact enumeration; 2^k value calls (default: 15)
    pub max_exact_k: usize,
    /// Permutations sampled by the Monte-Carlo variant (default: 100)
    pub mc_samples: usize,
    /// Concurrent value-function calls during exact enumeration (default: 8)
    pub value_concurrency: usize,
    /// Value-function retries before a run is abandoned (default: 3)
    pub max_retries: u32,
    /// Base delay for exponential retry backoff, in milliseconds (default: 50)
    pub retry_base_ms: u64,
}

impl Default for ShapleyConfig {
    fn default() -> Self {
        Self {
            max_exact_k: 15,
            mc_samples: 100,
            value_concurrency: 8,
            max_retries: 3,
            retry_base_ms: 50,
        }
    }
}

/// Token pricing for cost accounting
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PricingConfig {
    /// Cost per input token in dollars (default: GPT-4-class 1e-5)
    pub input_token_cost: f64,
    /// Cost per output token in dollars (default: 3e-5)
    pub output_token_cost: f64,
    /// Queries per day used to project monthly costs (default: 1000)
    pub queries_per_day: f64,
    /// Memories retrieved per query, for retrieval cost projections (default: 5)
    pub retrieval_count: u32,
}

impl Default for PricingConfig {
    fn default() -> Self {
        Self {
            input_token_cost: 0.00001,
            output_token_cost: 0.00003,
            queries_per_day: 1000.0,
            retrieval_count: 5,
        }
    }
}

/// Thresholds for portfolio metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PortfolioConfig {
    /// Cosine similarity above which two memories count as redundant (default: 0.92)
    pub similarity_threshold: f64,
    /// Fraction of queries where redundant pairs are co-retrieved (default: 0.3)
    pub co_retrieval_rate: f64,
    /// Memories older than this many days count as stale (default: 90)
    pub staleness_window_days: i64,
    /// Memories accessed within this many days form the frequent set (default: 30)
    pub frequent_window_days: i64,
    /// |score| below this counts toward token waste (default: 0.01)
    pub waste_threshold: f64,
}

impl Default for PortfolioConfig {
    fn default() -> Self {
        Self {
            similarity_threshold: 0.92,
            co_retrieval_rate: 0.3,
            staleness_window_days: 90,
            frequent_window_days: 30,
            waste_threshold: 0.01,
        }
    }
}

/// Engine tiering for production traffic
///
/// EAS is the O(kd) zero-oracle default; ContextCite runs on a small slice of
/// low-confidence or debug traffic; exact enumeration is reserved for offline
/// ground-truth generation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TieringConfig {
    /// Engine used when a transaction does not request one (default: eas)
    pub default_method: ScoreMethod,
    /// Fraction of traffic routed through ContextCite (default: 0.01)
    pub contextcite_fraction: f64,
}

impl Default for TieringConfig {
    fn default() -> Self {
        Self {
            default_method: ScoreMethod::Eas,
            contextcite_fraction: 0.01,
        }
    }
}

/// Transaction protocol lifecycle settings
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProtocolConfig {
    /// Hours a pending transaction may wait for `complete` (default: 24)
    pub pending_ttl_hours: i64,
    /// Days a soft-deleted memory survives before hard deletion (default: 30)
    pub deletion_grace_days: i64,
    /// Shard count for owner-hash partitioning of memory nodes (default: 16)
    pub shard_count: u32,
}

impl Default for ProtocolConfig {
    fn default() -> Self {
        Self {
            pending_ttl_hours: 24,
            deletion_grace_days: 30,
            shard_count: 16,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = AttributionConfig::default();
        assert_eq!(config.contextcite.num_samples, 64);
        assert!((config.contextcite.lasso_lambda - 0.1).abs() < f64::EPSILON);
        assert!((config.contextcite.min_confidence - 0.8).abs() < f64::EPSILON);
        assert_eq!(config.shapley.max_exact_k, 15);
        assert_eq!(config.shapley.mc_samples, 100);
        assert!((config.portfolio.similarity_threshold - 0.92).abs() < f64::EPSILON);
        assert!((config.portfolio.co_retrieval_rate - 0.3).abs() < f64::EPSILON);
        assert_eq!(config.portfolio.staleness_window_days, 90);
        assert_eq!(config.tiering.default_method, ScoreMethod::Eas);
        assert_eq!(config.protocol.pending_ttl_hours, 24);
        assert_eq!(config.protocol.shard_count, 16);
    }

    #[test]
    fn test_partial_deserialization_fills_defaults() {
        let config: AttributionConfig =
            serde_json::from_str(r#"{"tiering": {"default_method": "eas", "contextcite_fraction": 0.05}}"#)
                .unwrap();
        assert!((config.tiering.contextcite_fraction - 0.05).abs() < f64::EPSILON);
        assert_eq!(config.contextcite.num_samples, 64);
        assert_eq!(config.shapley.max_exact_k, 15);
    }
}

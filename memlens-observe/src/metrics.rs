//! Portfolio metrics over attribution scores and memory economics
//!
//! Pure functions over slices of the persisted record: token economics,
//! attribution concentration, signal quality, contradiction risk, and
//! staleness. Thresholds and pricing come from configuration, never
//! constants baked into the math.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use memlens_core::vector::cosine;
use memlens_core::{PortfolioConfig, PricingConfig};

/// Floor for the SNR noise term so the ratio stays finite
const SNR_EPSILON: f64 = 1e-10;

/// Cost breakdown of one transaction
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionCost {
    pub input_cost: f64,
    pub output_cost: f64,
    pub total_cost: f64,
}

/// `Cost(ξ) = π_in · |C| + π_out · |r|`
pub fn transaction_cost(
    input_tokens: u64,
    output_tokens: u64,
    pricing: &PricingConfig,
) -> TransactionCost {
    let input_cost = input_tokens as f64 * pricing.input_token_cost;
    let output_cost = output_tokens as f64 * pricing.output_token_cost;
    TransactionCost {
        input_cost,
        output_cost,
        total_cost: input_cost + output_cost,
    }
}

/// Daily token cost of keeping one memory in the retrieval set
pub fn memory_token_cost(tokens: u64, pricing: &PricingConfig) -> f64 {
    tokens as f64 * pricing.input_token_cost * pricing.queries_per_day
}

/// Percentage of retrieved tokens carrying near-zero attribution
pub fn token_waste_rate(scores: &[f64], token_counts: &[u64], threshold: f64) -> f64 {
    if scores.is_empty() || token_counts.is_empty() {
        return 0.0;
    }
    let mut total = 0u64;
    let mut wasted = 0u64;
    for (score, tokens) in scores.iter().zip(token_counts.iter()) {
        total += tokens;
        if score.abs() < threshold {
            wasted += tokens;
        }
    }
    if total == 0 {
        return 0.0;
    }
    wasted as f64 / total as f64 * 100.0
}

/// Input row for the ROI ranking
#[derive(Debug, Clone)]
pub struct RoiInput {
    pub memory_id: Uuid,
    pub mean_attribution: f64,
    pub tokens: u64,
}

/// One memory's return on its monthly token spend
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryRoi {
    pub memory_id: Uuid,
    pub monthly_cost: f64,
    /// mean attribution per dollar of monthly cost, scaled by 1000
    pub roi: f64,
}

/// Rank memories by attribution return per monthly token cost, descending
pub fn memory_roi(inputs: &[RoiInput], pricing: &PricingConfig) -> Vec<MemoryRoi> {
    let mut out: Vec<MemoryRoi> = inputs
        .iter()
        .map(|input| {
            let monthly_cost = memory_token_cost(input.tokens, pricing) * 30.0;
            let roi = if monthly_cost > 0.0 {
                input.mean_attribution / monthly_cost * 1000.0
            } else {
                0.0
            };
            MemoryRoi {
                memory_id: input.memory_id,
                monthly_cost,
                roi,
            }
        })
        .collect();
    out.sort_by(|a, b| b.roi.total_cmp(&a.roi));
    out
}

/// Revenue − cost for one memory
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryPnl {
    pub memory_id: Uuid,
    /// Total attribution delivered, the revenue proxy
    pub revenue: f64,
    /// Token cost across every retrieval
    pub cost: f64,
    pub pnl: f64,
    pub roi: f64,
}

pub fn memory_pnl(
    memory_id: Uuid,
    total_attribution: f64,
    retrieval_count: u64,
    tokens: u64,
    pricing: &PricingConfig,
) -> MemoryPnl {
    let cost = tokens as f64 * pricing.input_token_cost * retrieval_count as f64;
    let roi = if cost > 0.0 {
        total_attribution / cost
    } else {
        0.0
    };
    MemoryPnl {
        memory_id,
        revenue: total_attribution,
        cost,
        pnl: total_attribution - cost,
        roi,
    }
}

/// Cost of near-duplicate memories being co-retrieved
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RedundancyTax {
    /// Index pairs over the input slice with similarity above threshold
    pub redundant_pairs: Vec<(usize, usize)>,
    pub redundant_tokens: u64,
    pub monthly_cost: f64,
}

/// Find memory pairs above the similarity threshold and price the smaller
/// member of each pair at the co-retrieval rate
pub fn redundancy_tax(
    embeddings: &[Vec<f32>],
    token_counts: &[u64],
    pricing: &PricingConfig,
    portfolio: &PortfolioConfig,
) -> RedundancyTax {
    let mut redundant_pairs = Vec::new();
    let mut redundant_tokens = 0u64;
    for i in 0..embeddings.len() {
        for j in (i + 1)..embeddings.len() {
            if let Ok(similarity) = cosine(&embeddings[i], &embeddings[j]) {
                if similarity > portfolio.similarity_threshold {
                    redundant_pairs.push((i, j));
                    redundant_tokens += token_counts[i].min(token_counts[j]);
                }
            }
        }
    }
    let monthly_cost = redundant_tokens as f64
        * pricing.input_token_cost
        * pricing.queries_per_day
        * 30.0
        * portfolio.co_retrieval_rate;
    RedundancyTax {
        redundant_pairs,
        redundant_tokens,
        monthly_cost,
    }
}

/// Percent change in outcome scores attributable to memory availability
pub fn accuracy_delta(scores_with_memory: &[f64], scores_without: &[f64]) -> f64 {
    if scores_with_memory.is_empty() || scores_without.is_empty() {
        return 0.0;
    }
    let mean_with = scores_with_memory.iter().sum::<f64>() / scores_with_memory.len() as f64;
    let mean_without = scores_without.iter().sum::<f64>() / scores_without.len() as f64;
    if mean_without == 0.0 {
        return 0.0;
    }
    (mean_with - mean_without) / mean_without * 100.0
}

/// Attribution concentration: 0 = perfectly equal, 1 = one memory dominates
pub fn gini(scores: &[f64]) -> f64 {
    let n = scores.len();
    if n == 0 {
        return 0.0;
    }
    let mean = scores.iter().sum::<f64>() / n as f64;
    if mean == 0.0 {
        return 0.0;
    }
    let mut diff_sum = 0.0;
    for a in scores {
        for b in scores {
            diff_sum += (a - b).abs();
        }
    }
    diff_sum / (2.0 * (n * n) as f64 * mean)
}

/// Signal-to-noise ratio of an attribution distribution, in decibels
///
/// Positive scores are signal, non-positive are noise; the epsilon keeps the
/// result finite when there is no noise at all.
pub fn snr_db(scores: &[f64]) -> f64 {
    if scores.is_empty() {
        return 0.0;
    }
    // Epsilon on both sides keeps the ratio finite for all-noise and
    // all-signal distributions alike.
    let signal: f64 =
        scores.iter().filter(|s| **s > 0.0).map(|s| s * s).sum::<f64>() + SNR_EPSILON;
    let noise: f64 =
        scores.iter().filter(|s| **s <= 0.0).map(|s| s * s).sum::<f64>() + SNR_EPSILON;
    10.0 * (signal / noise).log10()
}

/// `CRS = 1 − Π(1 − pᵢⱼ)` over pairwise contradiction probabilities
pub fn contradiction_risk(probabilities: &[f64]) -> f64 {
    if probabilities.is_empty() {
        return 0.0;
    }
    let survival: f64 = probabilities.iter().map(|p| 1.0 - p).product();
    1.0 - survival
}

/// Input row for the staleness index
#[derive(Debug, Clone, Copy)]
pub struct StalenessInput {
    pub created_at: DateTime<Utc>,
    pub last_accessed: Option<DateTime<Utc>>,
}

/// Among frequently-accessed memories, the percentage created before the
/// staleness window
pub fn staleness_index(
    memories: &[StalenessInput],
    now: DateTime<Utc>,
    portfolio: &PortfolioConfig,
) -> f64 {
    let frequent_cutoff = now - Duration::days(portfolio.frequent_window_days);
    let stale_cutoff = now - Duration::days(portfolio.staleness_window_days);

    let frequent: Vec<&StalenessInput> = memories
        .iter()
        .filter(|m| m.last_accessed.is_some_and(|at| at >= frequent_cutoff))
        .collect();
    if frequent.is_empty() {
        return 0.0;
    }
    let stale = frequent
        .iter()
        .filter(|m| m.created_at < stale_cutoff)
        .count();
    stale as f64 / frequent.len() as f64 * 100.0
}

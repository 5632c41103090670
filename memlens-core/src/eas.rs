//! Embedding Attribution Score, the closed-form fast path
//!
//! EAS attributes a response to retrieved memories using only embeddings:
//!
//! ```text
//! rawᵢ = max(cos(φᵢ, r), 0) · max(cos(φᵢ, q), 0)
//! aᵢ   = rawᵢ / Σⱼ rawⱼ        (uniform 1/k when the total is zero)
//! ```
//!
//! Negative cosines are clamped to zero: a memory pointing away from the
//! query or response is treated as irrelevant, not as anti-evidence. O(k·d),
//! zero oracle calls, which is why it is the default production path.

use std::time::Instant;

use crate::error::Result;
use crate::vector::cosine;

/// Output of one EAS computation
#[derive(Debug, Clone, PartialEq)]
pub struct EasOutcome {
    /// Normalized scores; non-negative, sum to 1 when any raw score is positive
    pub scores: Vec<f64>,
    /// Unnormalized clamped cosine products
    pub raw_scores: Vec<f64>,
    /// Wall-clock compute time in milliseconds
    pub compute_ms: f64,
}

/// Compute EAS scores for `memories` against a query and response embedding
///
/// Output order matches input order. An empty memory slice yields an empty
/// outcome rather than an error so callers can decide how to surface it.
pub fn compute_eas(
    memories: &[Vec<f32>],
    query: &[f32],
    response: &[f32],
) -> Result<EasOutcome> {
    let started = Instant::now();

    let k = memories.len();
    if k == 0 {
        return Ok(EasOutcome {
            scores: Vec::new(),
            raw_scores: Vec::new(),
            compute_ms: elapsed_ms(started),
        });
    }

    let mut raw_scores = Vec::with_capacity(k);
    for embedding in memories {
        let sim_response = cosine(embedding, response)?.max(0.0);
        let sim_query = cosine(embedding, query)?.max(0.0);
        raw_scores.push(sim_response * sim_query);
    }

    let total: f64 = raw_scores.iter().sum();
    let scores = if total > 0.0 {
        raw_scores.iter().map(|r| r / total).collect()
    } else {
        vec![1.0 / k as f64; k]
    };

    Ok(EasOutcome {
        scores,
        raw_scores,
        compute_ms: elapsed_ms(started),
    })
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

//! Shapley-value attribution over a coalition value function
//!
//! Two variants: exact enumeration of all 2ᵏ subsets (bounded at
//! `max_exact_k`, used offline for ground truth) and truncation-free
//! Monte-Carlo permutation sampling (TMC) whose per-memory confidence is
//! derived from the spread of sampled marginals.

use std::time::Instant;

use futures::stream::{self, StreamExt};
use rand::rngs::StdRng;
use rand::seq::SliceRandom;
use rand::SeedableRng;
use tokio::time::Duration;
use tracing::{debug, instrument, warn};

use crate::config::ShapleyConfig;
use crate::error::{CoreError, Result};
use crate::oracle::ValueFunction;
use crate::types::ScoreMethod;
use crate::welford::WelfordAccumulator;

/// Outcome of a Shapley run
#[derive(Debug, Clone)]
pub struct ShapleyOutcome {
    /// Shapley value per memory, in input order
    pub values: Vec<f64>,
    /// Per-memory confidence: 1.0 for exact, `1/(1 + σ̂/√m)` for sampled
    pub confidences: Vec<f64>,
    pub method: ScoreMethod,
    /// Permutations actually walked (0 for exact)
    pub permutations_used: usize,
    /// True when a deadline cut sampling short
    pub partial: bool,
    pub compute_ms: f64,
}

/// Exact and Monte-Carlo Shapley engine
pub struct ShapleyEngine {
    config: ShapleyConfig,
    seed: Option<u64>,
}

impl ShapleyEngine {
    pub fn new(config: ShapleyConfig) -> Self {
        Self { config, seed: None }
    }

    /// Fix the permutation RNG seed for reproducible sampling
    pub fn with_seed(config: ShapleyConfig, seed: u64) -> Self {
        Self {
            config,
            seed: Some(seed),
        }
    }

    pub fn config(&self) -> &ShapleyConfig {
        &self.config
    }

    /// Exact Shapley values by full subset enumeration
    ///
    /// Fails with [`CoreError::InfeasibleExactShapley`] above `max_exact_k`
    /// and hard on deadline elapse: partial enumerations cannot produce
    /// ground truth.
    #[instrument(skip_all, fields(k))]
    pub async fn exact(
        &self,
        value_fn: &dyn ValueFunction,
        k: usize,
        deadline: Option<Duration>,
    ) -> Result<ShapleyOutcome> {
        let started = Instant::now();
        if k == 0 {
            return Err(CoreError::EmptyRetrievedSet);
        }
        if k > self.config.max_exact_k {
            return Err(CoreError::InfeasibleExactShapley {
                k,
                max: self.config.max_exact_k,
            });
        }

        let subset_count = 1usize << k;
        let deadline_at = deadline.map(|d| tokio::time::Instant::now() + d);

        let jobs = (0..subset_count).map(|mask| async move {
            let subset = indices_of(mask, k);
            (mask, self.call_with_retry(value_fn, &subset).await)
        });
        let mut in_flight = stream::iter(jobs).buffer_unordered(self.config.value_concurrency);

        let mut subset_values = vec![0.0f64; subset_count];
        let mut completed = 0usize;
        loop {
            let next = match deadline_at {
                Some(at) => match tokio::time::timeout_at(at, in_flight.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        return Err(CoreError::DeadlineExceeded {
                            elapsed_ms: started.elapsed().as_millis() as u64,
                        });
                    }
                },
                None => in_flight.next().await,
            };
            match next {
                Some((mask, Some(value))) => {
                    subset_values[mask] = value;
                    completed += 1;
                }
                // Exact enumeration cannot tolerate a missing subset value;
                // fabricating one would corrupt every φᵢ.
                Some((_, None)) => {
                    return Err(CoreError::OracleFailed(
                        "value function retries exhausted during exact enumeration".into(),
                    ));
                }
                None => break,
            }
        }
        drop(in_flight);
        debug_assert_eq!(completed, subset_count);

        // φᵢ = Σ_{S ⊆ N\{i}} |S|!(k−|S|−1)!/k! · (v(S∪{i}) − v(S))
        let factorials = factorials(k);
        let mut values = vec![0.0f64; k];
        for i in 0..k {
            let bit = 1usize << i;
            for mask in 0..subset_count {
                if mask & bit != 0 {
                    continue;
                }
                let s = mask.count_ones() as usize;
                let weight = factorials[s] * factorials[k - s - 1] / factorials[k];
                values[i] += weight * (subset_values[mask | bit] - subset_values[mask]);
            }
        }

        Ok(ShapleyOutcome {
            values,
            confidences: vec![1.0; k],
            method: ScoreMethod::Exact,
            permutations_used: 0,
            partial: false,
            compute_ms: elapsed_ms(started),
        })
    }

    /// Monte-Carlo permutation Shapley (TMC without truncation)
    ///
    /// Each sampled permutation is walked in full so its marginals telescope
    /// to `v(full) − v(∅)` exactly, preserving the efficiency axiom in the
    /// averaged estimate. On deadline elapse the running means are returned
    /// with the confidence the completed samples support.
    #[instrument(skip_all, fields(k))]
    pub async fn approximate(
        &self,
        value_fn: &dyn ValueFunction,
        k: usize,
        deadline: Option<Duration>,
    ) -> Result<ShapleyOutcome> {
        let started = Instant::now();
        if k == 0 {
            return Err(CoreError::EmptyRetrievedSet);
        }

        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let deadline_at = deadline.map(|d| Instant::now() + d);

        let empty_value = match self.call_with_retry(value_fn, &[]).await {
            Some(v) => v,
            None => {
                warn!("value function exhausted retries on the empty coalition");
                return Ok(self.zeroed_outcome(k, started));
            }
        };

        let mut marginals: Vec<WelfordAccumulator> = vec![WelfordAccumulator::new(); k];
        let mut order: Vec<usize> = (0..k).collect();
        let mut included: Vec<usize> = Vec::with_capacity(k);
        let mut permutations_used = 0usize;
        let mut partial = false;
        let mut exhausted = false;

        'sampling: for _ in 0..self.config.mc_samples {
            if let Some(at) = deadline_at {
                if Instant::now() >= at {
                    partial = true;
                    break;
                }
            }

            order.shuffle(&mut rng);
            included.clear();
            let mut previous = empty_value;
            for &idx in &order {
                included.push(idx);
                included.sort_unstable();
                let current = match self.call_with_retry(value_fn, &included).await {
                    Some(v) => v,
                    None => {
                        exhausted = true;
                        break 'sampling;
                    }
                };
                marginals[idx].push(current - previous);
                previous = current;
            }
            permutations_used += 1;
        }

        if exhausted || permutations_used == 0 {
            warn!(
                permutations_used,
                "approximate Shapley returning zero-confidence partial"
            );
            let values = marginals.iter().map(|m| m.mean).collect();
            return Ok(ShapleyOutcome {
                values,
                confidences: vec![0.0; k],
                method: ScoreMethod::Approx,
                permutations_used,
                partial: true,
                compute_ms: elapsed_ms(started),
            });
        }

        let m = permutations_used as f64;
        let values: Vec<f64> = marginals.iter().map(|acc| acc.mean).collect();
        let confidences: Vec<f64> = marginals
            .iter()
            .map(|acc| 1.0 / (1.0 + acc.stddev() / m.sqrt()))
            .collect();

        debug!(permutations_used, partial, "tmc sampling complete");

        Ok(ShapleyOutcome {
            values,
            confidences,
            method: ScoreMethod::Approx,
            permutations_used,
            partial,
            compute_ms: elapsed_ms(started),
        })
    }

    fn zeroed_outcome(&self, k: usize, started: Instant) -> ShapleyOutcome {
        ShapleyOutcome {
            values: vec![0.0; k],
            confidences: vec![0.0; k],
            method: ScoreMethod::Approx,
            permutations_used: 0,
            partial: true,
            compute_ms: elapsed_ms(started),
        }
    }

    async fn call_with_retry(
        &self,
        value_fn: &dyn ValueFunction,
        subset: &[usize],
    ) -> Option<f64> {
        for attempt in 0..=self.config.max_retries {
            match value_fn.value(subset).await {
                Ok(v) => return Some(v),
                Err(err) => {
                    if attempt == self.config.max_retries {
                        warn!(%err, attempt, "value function retries exhausted");
                        return None;
                    }
                    let backoff = self.config.retry_base_ms * (1 << attempt);
                    debug!(%err, attempt, backoff, "value function failed; retrying");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
            }
        }
        None
    }
}

fn indices_of(mask: usize, k: usize) -> Vec<usize> {
    (0..k).filter(|i| mask & (1 << i) != 0).collect()
}

fn factorials(k: usize) -> Vec<f64> {
    let mut out = vec![1.0f64; k + 1];
    for i in 1..=k {
        out[i] = out[i - 1] * i as f64;
    }
    out
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::oracle::FnValueFunction;
    use crate::vector::{cosine, normalize};

    fn engine() -> ShapleyEngine {
        ShapleyEngine::with_seed(ShapleyConfig::default(), 1234)
    }

    #[tokio::test]
    async fn test_exact_rejects_infeasible_k() {
        let v = FnValueFunction::new(|_: &[usize]| 0.0);
        let result = engine().exact(&v, 16, None).await;
        assert!(matches!(
            result,
            Err(CoreError::InfeasibleExactShapley { k: 16, max: 15 })
        ));
    }

    #[tokio::test]
    async fn test_empty_set_rejected() {
        let v = FnValueFunction::new(|_: &[usize]| 0.0);
        assert!(matches!(
            engine().exact(&v, 0, None).await,
            Err(CoreError::EmptyRetrievedSet)
        ));
        assert!(matches!(
            engine().approximate(&v, 0, None).await,
            Err(CoreError::EmptyRetrievedSet)
        ));
    }

    #[tokio::test]
    async fn test_exact_efficiency_on_cosine_value() {
        // v(S) = 0.3 + 0.7 · mean cos(mᵢ, q); the memory cosines below are
        // 1.0, 0.6, and 0.0 against q = e₁.
        let q = vec![1.0f32, 0.0, 0.0];
        let memories = vec![
            vec![1.0f32, 0.0, 0.0],
            normalize(&[0.6, 0.8, 0.0]),
            vec![0.0f32, 1.0, 0.0],
        ];
        let cosines: Vec<f64> = memories.iter().map(|m| cosine(m, &q).unwrap()).collect();

        let v = FnValueFunction::new(move |s: &[usize]| {
            if s.is_empty() {
                return 0.3;
            }
            let mean = s.iter().map(|&i| cosines[i]).sum::<f64>() / s.len() as f64;
            0.3 + 0.7 * mean
        });

        let outcome = engine().exact(&v, 3, None).await.unwrap();
        let total: f64 = outcome.values.iter().sum();
        let full = v.value(&[0, 1, 2]).await.unwrap();
        let empty = v.value(&[]).await.unwrap();
        assert!(
            (total - (full - empty)).abs() < 1e-6,
            "efficiency violated: Σφ={total}, v(M)−v(∅)={}",
            full - empty
        );
        assert_eq!(outcome.method, ScoreMethod::Exact);
        assert!(outcome.confidences.iter().all(|c| *c == 1.0));
    }

    #[tokio::test]
    async fn test_exact_symmetry() {
        // Memories 0 and 1 are interchangeable in v; their values must match.
        let v = FnValueFunction::new(|s: &[usize]| {
            let twins = s.iter().filter(|&&i| i == 0 || i == 1).count() as f64;
            let third = if s.contains(&2) { 0.4 } else { 0.0 };
            0.25 * twins + third
        });

        let outcome = engine().exact(&v, 3, None).await.unwrap();
        assert!(
            (outcome.values[0] - outcome.values[1]).abs() < 1e-3,
            "symmetric players diverged: {:?}",
            outcome.values
        );
    }

    #[tokio::test]
    async fn test_exact_null_player() {
        // Memory 3 never changes v.
        let v = FnValueFunction::new(|s: &[usize]| {
            s.iter().filter(|&&i| i < 3).count() as f64 * 0.2
        });

        let outcome = engine().exact(&v, 4, None).await.unwrap();
        assert!(
            outcome.values[3].abs() < 1e-9,
            "null player got {}",
            outcome.values[3]
        );
    }

    #[tokio::test]
    async fn test_approximate_efficiency_and_method_label() {
        let v = FnValueFunction::new(|s: &[usize]| {
            s.iter().map(|&i| (i + 1) as f64 * 0.1).sum::<f64>()
        });

        let outcome = engine().approximate(&v, 4, None).await.unwrap();
        let total: f64 = outcome.values.iter().sum();
        let full = v.value(&[0, 1, 2, 3]).await.unwrap();
        assert!(
            (total - full).abs() < 1e-3,
            "Σφ={total} should telescope to v(full)={full}"
        );
        // Sampled results must never masquerade as exact.
        assert_eq!(outcome.method, ScoreMethod::Approx);
        assert_eq!(outcome.permutations_used, 100);
        assert!(outcome.confidences.iter().all(|c| *c > 0.0 && *c <= 1.0));
    }

    #[tokio::test]
    async fn test_approximate_agrees_with_exact() {
        let v = FnValueFunction::new(|s: &[usize]| {
            let mut total = 0.0;
            if s.contains(&0) {
                total += 0.5;
            }
            if s.contains(&1) {
                total += 0.3;
            }
            if s.contains(&0) && s.contains(&1) {
                total += 0.1;
            }
            total
        });

        let exact = engine().exact(&v, 2, None).await.unwrap();
        let approx = ShapleyEngine::with_seed(
            ShapleyConfig {
                mc_samples: 400,
                ..ShapleyConfig::default()
            },
            7,
        )
        .approximate(&v, 2, None)
        .await
        .unwrap();

        for (e, a) in exact.values.iter().zip(approx.values.iter()) {
            assert!((e - a).abs() < 0.05, "exact {e} vs approx {a}");
        }
    }

    #[tokio::test]
    async fn test_approximate_additive_game_has_high_confidence() {
        // Marginals are constant in an additive game, so σ̂ = 0 and
        // confidence should be exactly 1.
        let v = FnValueFunction::new(|s: &[usize]| s.len() as f64 * 0.25);
        let outcome = engine().approximate(&v, 3, None).await.unwrap();
        assert!(outcome.confidences.iter().all(|c| (*c - 1.0).abs() < 1e-9));
    }

    #[tokio::test]
    async fn test_exact_deadline_fails_hard() {
        struct SlowValue;
        #[async_trait::async_trait]
        impl ValueFunction for SlowValue {
            async fn value(&self, _subset: &[usize]) -> crate::error::Result<f64> {
                tokio::time::sleep(Duration::from_millis(25)).await;
                Ok(0.0)
            }
        }

        let result = engine()
            .exact(&SlowValue, 6, Some(Duration::from_millis(30)))
            .await;
        assert!(matches!(result, Err(CoreError::DeadlineExceeded { .. })));
    }

    #[tokio::test]
    async fn test_approximate_deadline_returns_running_mean() {
        struct SlowValue;
        #[async_trait::async_trait]
        impl ValueFunction for SlowValue {
            async fn value(&self, subset: &[usize]) -> crate::error::Result<f64> {
                tokio::time::sleep(Duration::from_millis(5)).await;
                Ok(subset.len() as f64)
            }
        }

        let outcome = engine()
            .approximate(&SlowValue, 3, Some(Duration::from_millis(80)))
            .await
            .unwrap();
        assert!(outcome.partial);
        assert!(outcome.permutations_used < 100);
        if outcome.permutations_used > 0 {
            // Additive game: every completed marginal is exactly 1.
            assert!(outcome.values.iter().all(|v| (*v - 1.0).abs() < 1e-9));
        }
    }

    #[tokio::test]
    async fn test_value_function_exhaustion_zeroes_confidence() {
        struct FailingValue;
        #[async_trait::async_trait]
        impl ValueFunction for FailingValue {
            async fn value(&self, subset: &[usize]) -> crate::error::Result<f64> {
                if subset.len() > 1 {
                    Err(CoreError::OracleFailed("down".into()))
                } else {
                    Ok(subset.len() as f64)
                }
            }
        }

        let engine = ShapleyEngine::with_seed(
            ShapleyConfig {
                max_retries: 1,
                retry_base_ms: 1,
                ..ShapleyConfig::default()
            },
            9,
        );
        let outcome = engine.approximate(&FailingValue, 3, None).await.unwrap();
        assert!(outcome.partial);
        assert!(outcome.confidences.iter().all(|c| *c == 0.0));
    }
}

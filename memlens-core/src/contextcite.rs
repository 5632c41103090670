//! ContextCite: ablation-based attribution with a sparse linear surrogate
//!
//! The engine samples inclusion masks over the retrieved memories, asks the
//! log-prob oracle to score the response under each masked context, fits a
//! LASSO surrogate of log-prob as a function of the mask, and reports the
//! Linear Datamodeling Score (Pearson correlation of surrogate vs oracle) as
//! its confidence.

use std::time::Instant;

use futures::stream::{self, StreamExt};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use tokio::time::Duration;
use tracing::{debug, instrument, warn};

use crate::config::ContextCiteConfig;
use crate::error::{CoreError, Result};
use crate::lasso::{lasso, DEFAULT_MAX_ITER, DEFAULT_TOL};
use crate::oracle::LogProbOracle;

/// Outcome of a ContextCite attribution run
#[derive(Debug, Clone)]
pub struct ContextCiteOutcome {
    /// Surrogate weight per memory, in input order; may be negative
    pub scores: Vec<f64>,
    /// Linear Datamodeling Score of the fit
    pub lds: f64,
    /// Reported confidence: the LDS, forced below `min_confidence` on
    /// deadline partials and to 0 on oracle exhaustion
    pub confidence: f64,
    pub samples_requested: usize,
    pub samples_used: usize,
    /// True when the deadline cut sampling short
    pub partial: bool,
    pub compute_ms: f64,
}

/// Per-statement attribution produced by [`ContextCiteEngine::attribute_statements`]
#[derive(Debug, Clone)]
pub struct StatementAttribution {
    pub statement_index: usize,
    pub scores: Vec<f64>,
    pub lds: f64,
}

/// Ablation + sparse regression attribution engine
pub struct ContextCiteEngine {
    config: ContextCiteConfig,
    seed: Option<u64>,
}

impl ContextCiteEngine {
    pub fn new(config: ContextCiteConfig) -> Self {
        Self { config, seed: None }
    }

    /// Fix the mask RNG seed for reproducible runs
    pub fn with_seed(config: ContextCiteConfig, seed: u64) -> Self {
        Self {
            config,
            seed: Some(seed),
        }
    }

    pub fn config(&self) -> &ContextCiteConfig {
        &self.config
    }

    /// Generate `n` inclusion masks over `k` memories
    ///
    /// The first two masks are always all-zeros and all-ones; the rest are
    /// i.i.d. Bernoulli(½).
    pub fn generate_masks(&self, k: usize, rng: &mut StdRng) -> Vec<Vec<bool>> {
        let n = self.config.num_samples.max(2);
        let mut masks = Vec::with_capacity(n);
        masks.push(vec![false; k]);
        masks.push(vec![true; k]);
        for _ in 2..n {
            masks.push((0..k).map(|_| rng.gen_bool(0.5)).collect());
        }
        masks
    }

    /// Attribute `response` to `memories` for the given query
    #[instrument(skip_all, fields(k = memories.len()))]
    pub async fn attribute(
        &self,
        oracle: &dyn LogProbOracle,
        query: &str,
        response: &str,
        memories: &[String],
        deadline: Option<Duration>,
    ) -> Result<ContextCiteOutcome> {
        let started = Instant::now();
        let k = memories.len();
        if k == 0 {
            return Err(CoreError::EmptyRetrievedSet);
        }

        let mut rng = match self.seed {
            Some(seed) => StdRng::seed_from_u64(seed),
            None => StdRng::from_entropy(),
        };
        let masks = self.generate_masks(k, &mut rng);
        let n = masks.len();

        // Fan out oracle calls; each slot records whether the call finished
        // and whether its retries were exhausted.
        let deadline_at = deadline.map(|d| tokio::time::Instant::now() + d);
        let jobs = masks.iter().enumerate().map(|(idx, mask)| {
            let context: Vec<String> = mask
                .iter()
                .zip(memories.iter())
                .filter(|(included, _)| **included)
                .map(|(_, m)| m.clone())
                .collect();
            async move {
                (
                    idx,
                    self.call_with_retry(oracle, query, response, &context).await,
                )
            }
        });
        let mut in_flight = stream::iter(jobs).buffer_unordered(self.config.oracle_concurrency);

        let mut outcomes: Vec<Option<Option<f64>>> = vec![None; n];
        let mut partial = false;
        loop {
            let next = match deadline_at {
                Some(at) => match tokio::time::timeout_at(at, in_flight.next()).await {
                    Ok(next) => next,
                    Err(_) => {
                        partial = true;
                        break;
                    }
                },
                None => in_flight.next().await,
            };
            match next {
                Some((idx, result)) => outcomes[idx] = Some(result),
                None => break,
            }
        }
        drop(in_flight);

        let exhausted = outcomes
            .iter()
            .any(|slot| matches!(slot, Some(None)));

        let mut rows: Vec<Vec<f64>> = Vec::new();
        let mut y: Vec<f64> = Vec::new();
        for (mask, slot) in masks.iter().zip(outcomes.iter()) {
            if let Some(Some(log_prob)) = slot {
                rows.push(mask.iter().map(|b| f64::from(u8::from(*b))).collect());
                y.push(*log_prob);
            }
        }
        let samples_used = rows.len();

        if samples_used == 0 {
            warn!("no oracle samples completed; returning zero attribution");
            return Ok(ContextCiteOutcome {
                scores: vec![0.0; k],
                lds: 0.0,
                confidence: 0.0,
                samples_requested: n,
                samples_used: 0,
                partial,
                compute_ms: elapsed_ms(started),
            });
        }

        let fit = lasso(
            &rows,
            &y,
            self.config.lasso_lambda,
            DEFAULT_MAX_ITER,
            DEFAULT_TOL,
        );

        let predictions: Vec<f64> = rows
            .iter()
            .map(|row| {
                row.iter()
                    .zip(fit.weights.iter())
                    .map(|(z, w)| z * w)
                    .sum()
            })
            .collect();
        let lds = pearson(&predictions, &y);

        let confidence = if exhausted {
            0.0
        } else if partial {
            // Deadline partials must route to the slow path downstream.
            lds.min(self.config.min_confidence - 1e-6)
        } else {
            lds
        };

        debug!(
            samples_used,
            lds, confidence, partial, "contextcite fit complete"
        );

        Ok(ContextCiteOutcome {
            scores: fit.weights,
            lds,
            confidence,
            samples_requested: n,
            samples_used,
            partial,
            compute_ms: elapsed_ms(started),
        })
    }

    /// Statement-level attribution: one surrogate fit per response statement
    ///
    /// Feeds the provenance layer's statement attribution edges.
    pub async fn attribute_statements(
        &self,
        oracle: &dyn LogProbOracle,
        query: &str,
        statements: &[String],
        memories: &[String],
        deadline: Option<Duration>,
    ) -> Result<Vec<StatementAttribution>> {
        if memories.is_empty() {
            return Err(CoreError::EmptyRetrievedSet);
        }
        let mut out = Vec::with_capacity(statements.len());
        for (statement_index, statement) in statements.iter().enumerate() {
            let outcome = self
                .attribute(oracle, query, statement, memories, deadline)
                .await?;
            out.push(StatementAttribution {
                statement_index,
                scores: outcome.scores,
                lds: outcome.lds,
            });
        }
        Ok(out)
    }

    async fn call_with_retry(
        &self,
        oracle: &dyn LogProbOracle,
        query: &str,
        response: &str,
        context: &[String],
    ) -> Option<f64> {
        for attempt in 0..=self.config.max_retries {
            match oracle.log_prob(query, response, context).await {
                Ok(log_prob) => return Some(log_prob),
                Err(err) => {
                    if attempt == self.config.max_retries {
                        warn!(%err, attempt, "log-prob oracle retries exhausted");
                        return None;
                    }
                    let backoff = self.config.retry_base_ms * (1 << attempt);
                    debug!(%err, attempt, backoff, "log-prob oracle failed; retrying");
                    tokio::time::sleep(Duration::from_millis(backoff)).await;
                }
            }
        }
        None
    }
}

/// Pearson correlation coefficient; 0.0 for degenerate inputs
pub fn pearson(a: &[f64], b: &[f64]) -> f64 {
    if a.len() != b.len() || a.len() < 2 {
        return 0.0;
    }
    let n = a.len() as f64;
    let mean_a = a.iter().sum::<f64>() / n;
    let mean_b = b.iter().sum::<f64>() / n;

    let mut cov = 0.0;
    let mut var_a = 0.0;
    let mut var_b = 0.0;
    for (x, y) in a.iter().zip(b.iter()) {
        let da = x - mean_a;
        let db = y - mean_b;
        cov += da * db;
        var_a += da * da;
        var_b += db * db;
    }
    if var_a == 0.0 || var_b == 0.0 {
        return 0.0;
    }
    cov / (var_a.sqrt() * var_b.sqrt())
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;
    use crate::error::CoreError;
    use crate::oracle::FnLogProbOracle;

    fn engine_with(num_samples: usize, lambda: f64) -> ContextCiteEngine {
        ContextCiteEngine::with_seed(
            ContextCiteConfig {
                num_samples,
                lasso_lambda: lambda,
                ..ContextCiteConfig::default()
            },
            42,
        )
    }

    #[test]
    fn test_mask_generation_shape() {
        let engine = engine_with(16, 0.1);
        let mut rng = StdRng::seed_from_u64(7);
        let masks = engine.generate_masks(5, &mut rng);
        assert_eq!(masks.len(), 16);
        assert_eq!(masks[0], vec![false; 5]);
        assert_eq!(masks[1], vec![true; 5]);
        assert!(masks.iter().all(|m| m.len() == 5));
    }

    #[test]
    fn test_pearson_perfect_and_degenerate() {
        let a = vec![1.0, 2.0, 3.0, 4.0];
        let b: Vec<f64> = a.iter().map(|x| 2.0 * x + 1.0).collect();
        assert!((pearson(&a, &b) - 1.0).abs() < 1e-12);

        let inverted: Vec<f64> = a.iter().map(|x| -x).collect();
        assert!((pearson(&a, &inverted) + 1.0).abs() < 1e-12);

        let flat = vec![5.0; 4];
        assert_eq!(pearson(&a, &flat), 0.0);
        assert_eq!(pearson(&[1.0], &[1.0]), 0.0);
    }

    #[tokio::test]
    async fn test_empty_memory_set_rejected() {
        let engine = engine_with(8, 0.1);
        let oracle = FnLogProbOracle::new(|_, _, _: &[String]| 0.0);
        let result = engine.attribute(&oracle, "q", "r", &[], None).await;
        assert!(matches!(result, Err(CoreError::EmptyRetrievedSet)));
    }

    #[tokio::test]
    async fn test_irrelevant_memory_gets_zero_weight() {
        // Log-prob rises with the two informative memories and ignores the
        // third entirely; strong regularization must zero w3.
        let memories = vec![
            "capital of france".to_string(),
            "population of paris".to_string(),
            "banana bread recipe".to_string(),
        ];
        let oracle = FnLogProbOracle::new(|_q, _r, ctx: &[String]| {
            let mut lp = -10.0;
            if ctx.iter().any(|c| c.contains("france")) {
                lp += 8.0;
            }
            if ctx.iter().any(|c| c.contains("paris")) {
                lp += 6.0;
            }
            lp
        });

        let engine = engine_with(64, 2.0);
        let outcome = engine
            .attribute(&oracle, "q", "r", &memories, None)
            .await
            .unwrap();

        assert!(outcome.scores[2].abs() < 0.01, "w3 {}", outcome.scores[2]);
        assert!(outcome.scores[0] > 1.0, "w1 {}", outcome.scores[0]);
        assert!(outcome.scores[1] > 1.0, "w2 {}", outcome.scores[1]);
        assert!(outcome.lds > 0.95, "lds {}", outcome.lds);
        assert_eq!(outcome.confidence, outcome.lds);
        assert_eq!(outcome.samples_used, 64);
        assert!(!outcome.partial);
    }

    #[tokio::test]
    async fn test_oracle_exhaustion_zeroes_confidence() {
        let calls = AtomicU32::new(0);
        let memories = vec!["a".to_string(), "b".to_string()];

        struct FailingOracle<'a> {
            calls: &'a AtomicU32,
        }
        #[async_trait::async_trait]
        impl LogProbOracle for FailingOracle<'_> {
            async fn log_prob(
                &self,
                _query: &str,
                _response: &str,
                context: &[String],
            ) -> crate::error::Result<f64> {
                self.calls.fetch_add(1, Ordering::SeqCst);
                // One mask's context size always fails.
                if context.len() == 2 {
                    return Err(CoreError::OracleFailed("flaky".into()));
                }
                Ok(context.len() as f64)
            }
        }

        let engine = ContextCiteEngine::with_seed(
            ContextCiteConfig {
                num_samples: 8,
                max_retries: 1,
                retry_base_ms: 1,
                ..ContextCiteConfig::default()
            },
            42,
        );
        let oracle = FailingOracle { calls: &calls };
        let outcome = engine
            .attribute(&oracle, "q", "r", &memories, None)
            .await
            .unwrap();

        assert_eq!(outcome.confidence, 0.0);
        assert!(outcome.samples_used < outcome.samples_requested);
        // The all-ones mask retried once before exhaustion.
        assert!(calls.load(Ordering::SeqCst) > 8);
    }

    #[tokio::test]
    async fn test_deadline_produces_flagged_partial() {
        let memories = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        struct SlowOracle;
        #[async_trait::async_trait]
        impl LogProbOracle for SlowOracle {
            async fn log_prob(
                &self,
                _query: &str,
                _response: &str,
                context: &[String],
            ) -> crate::error::Result<f64> {
                tokio::time::sleep(Duration::from_millis(20)).await;
                Ok(context.len() as f64)
            }
        }

        let engine = ContextCiteEngine::with_seed(
            ContextCiteConfig {
                num_samples: 64,
                oracle_concurrency: 2,
                ..ContextCiteConfig::default()
            },
            42,
        );
        let outcome = engine
            .attribute(
                &SlowOracle,
                "q",
                "r",
                &memories,
                Some(Duration::from_millis(60)),
            )
            .await
            .unwrap();

        assert!(outcome.partial);
        assert!(outcome.samples_used < 64);
        assert!(
            outcome.confidence < engine.config().min_confidence,
            "partial confidence {} must sit below the threshold",
            outcome.confidence
        );
    }

    #[tokio::test]
    async fn test_statement_attribution_indexes_statements() {
        let memories = vec!["x".to_string(), "y".to_string()];
        let oracle = FnLogProbOracle::new(|_q, r: &str, ctx: &[String]| {
            let relevant = if r == "s0" { "x" } else { "y" };
            if ctx.iter().any(|c| c == relevant) {
                0.0
            } else {
                -5.0
            }
        });

        let engine = engine_with(32, 0.05);
        let statements = vec!["s0".to_string(), "s1".to_string()];
        let results = engine
            .attribute_statements(&oracle, "q", &statements, &memories, None)
            .await
            .unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0].statement_index, 0);
        assert!(results[0].scores[0] > results[0].scores[1]);
        assert!(results[1].scores[1] > results[1].scores[0]);
    }

    #[tokio::test]
    async fn test_seeded_runs_are_reproducible() {
        let memories = vec!["a".to_string(), "b".to_string()];
        let oracle = FnLogProbOracle::new(|_, _, ctx: &[String]| ctx.len() as f64 * 1.5);
        let engine = engine_with(32, 0.1);

        let first = engine
            .attribute(&oracle, "q", "r", &memories, None)
            .await
            .unwrap();
        let second = engine
            .attribute(&oracle, "q", "r", &memories, None)
            .await
            .unwrap();
        assert_eq!(first.scores, second.scores);
        assert_eq!(first.lds, second.lds);
    }
}

//! Oracle traits for the slow attribution paths
//!
//! ContextCite consumes a [`LogProbOracle`] that scores a response given a
//! masked memory subset; Shapley consumes a [`ValueFunction`] over subset
//! indices. Both are async because they wrap LLM calls. Closure-backed
//! implementations are provided for tests and offline evaluation.

use async_trait::async_trait;

use crate::error::Result;

/// Scores `log P(response | query, context)` for an ablated memory subset
#[async_trait]
pub trait LogProbOracle: Send + Sync {
    /// `context` holds the contents of the memories included by the mask,
    /// in retrieval order.
    async fn log_prob(&self, query: &str, response: &str, context: &[String]) -> Result<f64>;
}

/// Coalition value function `v(S)` over memory indices `0..k`
#[async_trait]
pub trait ValueFunction: Send + Sync {
    /// `subset` holds the included memory indices in ascending order.
    async fn value(&self, subset: &[usize]) -> Result<f64>;
}

/// [`LogProbOracle`] backed by a synchronous closure
pub struct FnLogProbOracle<F>
where
    F: Fn(&str, &str, &[String]) -> f64 + Send + Sync,
{
    f: F,
}

impl<F> FnLogProbOracle<F>
where
    F: Fn(&str, &str, &[String]) -> f64 + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> LogProbOracle for FnLogProbOracle<F>
where
    F: Fn(&str, &str, &[String]) -> f64 + Send + Sync,
{
    async fn log_prob(&self, query: &str, response: &str, context: &[String]) -> Result<f64> {
        Ok((self.f)(query, response, context))
    }
}

/// [`ValueFunction`] backed by a synchronous closure
pub struct FnValueFunction<F>
where
    F: Fn(&[usize]) -> f64 + Send + Sync,
{
    f: F,
}

impl<F> FnValueFunction<F>
where
    F: Fn(&[usize]) -> f64 + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> ValueFunction for FnValueFunction<F>
where
    F: Fn(&[usize]) -> f64 + Send + Sync,
{
    async fn value(&self, subset: &[usize]) -> Result<f64> {
        Ok((self.f)(subset))
    }
}

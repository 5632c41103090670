//! Embedding trait and deterministic test doubles
//!
//! The embedding model is external: this crate only consumes unit-norm
//! fixed-dimension vectors through the [`Embedder`] trait. The doubles here
//! exist so the protocol and store can be exercised without a model.

use std::collections::HashMap;

use async_trait::async_trait;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use sha2::{Digest, Sha256};

use crate::error::{CoreError, Result};
use crate::vector::normalize;

/// Trait for generating text embeddings
///
/// Implementations must return unit-norm vectors of exactly `dimensions()`
/// components. The trait is async to support remote inference backends.
#[async_trait]
pub trait Embedder: Send + Sync {
    /// Embed a single text
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Embed a batch of texts
    ///
    /// Default implementation embeds sequentially; backends with real batch
    /// inference should override.
    async fn embed_batch(&self, texts: &[&str]) -> Result<Vec<Vec<f32>>> {
        let mut out = Vec::with_capacity(texts.len());
        for text in texts {
            out.push(self.embed(text).await?);
        }
        Ok(out)
    }

    /// Dimensionality of produced embeddings
    fn dimensions(&self) -> usize;
}

/// Deterministic content-hash embedder
///
/// Seeds an RNG from the SHA-256 of the text and samples a unit-norm vector.
/// The same text always maps to the same embedding, and distinct texts land
/// in effectively random directions, which is enough for protocol and store
/// tests.
pub struct HashEmbedder {
    dims: usize,
}

impl HashEmbedder {
    pub fn new(dims: usize) -> Self {
        Self { dims }
    }
}

#[async_trait]
impl Embedder for HashEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        let digest = Sha256::digest(text.as_bytes());
        let mut seed_bytes = [0u8; 8];
        seed_bytes.copy_from_slice(&digest[..8]);
        let mut rng = StdRng::seed_from_u64(u64::from_le_bytes(seed_bytes));

        let raw: Vec<f32> = (0..self.dims).map(|_| rng.gen::<f32>() - 0.5).collect();
        Ok(normalize(&raw))
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

/// Embedder backed by an explicit text → vector table
///
/// Used by tests that need exact control over geometry. Vectors are
/// normalized on insert. Unknown texts fail with an embedding error.
pub struct FixedEmbedder {
    dims: usize,
    table: HashMap<String, Vec<f32>>,
}

impl FixedEmbedder {
    pub fn new(dims: usize) -> Self {
        Self {
            dims,
            table: HashMap::new(),
        }
    }

    /// Register a text → vector mapping, normalizing the vector
    pub fn insert(mut self, text: impl Into<String>, vector: &[f32]) -> Self {
        self.table.insert(text.into(), normalize(vector));
        self
    }
}

#[async_trait]
impl Embedder for FixedEmbedder {
    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        self.table
            .get(text)
            .cloned()
            .ok_or_else(|| CoreError::Embedding(format!("no fixed embedding for {text:?}")))
    }

    fn dimensions(&self) -> usize {
        self.dims
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vector::is_unit_norm;

    #[tokio::test]
    async fn test_hash_embedder_is_deterministic() {
        let embedder = HashEmbedder::new(384);
        let a = embedder.embed("the same text").await.unwrap();
        let b = embedder.embed("the same text").await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 384);
        assert!(is_unit_norm(&a));
    }

    #[tokio::test]
    async fn test_hash_embedder_distinct_texts_diverge() {
        let embedder = HashEmbedder::new(64);
        let a = embedder.embed("alpha").await.unwrap();
        let b = embedder.embed("beta").await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn test_fixed_embedder_lookup_and_normalization() {
        let embedder = FixedEmbedder::new(2).insert("x", &[3.0, 4.0]);
        let v = embedder.embed("x").await.unwrap();
        assert!((v[0] - 0.6).abs() < 1e-6);
        assert!((v[1] - 0.8).abs() < 1e-6);
        assert!(embedder.embed("missing").await.is_err());
    }

    #[tokio::test]
    async fn test_batch_default_matches_sequential() {
        let embedder = HashEmbedder::new(32);
        let batch = embedder.embed_batch(&["a", "b"]).await.unwrap();
        assert_eq!(batch[0], embedder.embed("a").await.unwrap());
        assert_eq!(batch[1], embedder.embed("b").await.unwrap());
    }
}

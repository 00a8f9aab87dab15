//! Embedding/completion provider trait and vector utilities.
//!
//! Defines the [`EmbeddingProvider`] trait the orchestrator calls to turn
//! query text into vectors and to rewrite free-text questions into catalogue
//! queries. The OpenAI implementation and its response cache live in the
//! `catalogue-bot` app crate.

use anyhow::Result;
use async_trait::async_trait;

/// Trait for embedding/completion providers.
///
/// Implementations are created by the application and shared across all
/// channels; they must tolerate concurrent calls.
#[async_trait]
pub trait EmbeddingProvider: Send + Sync {
    /// Returns the embedding model identifier (e.g. `"text-embedding-3-small"`).
    fn model_name(&self) -> &str;

    /// Embed a single query text.
    async fn embed(&self, text: &str) -> Result<Vec<f32>>;

    /// Rewrite a free-text question into a query better suited for the
    /// catalogue index.
    async fn rewrite_query(&self, text: &str) -> Result<String>;
}

/// Compute cosine similarity between two embedding vectors.
///
/// Returns a value in `[-1.0, 1.0]`, or `0.0` for empty vectors or vectors
/// of different lengths.
pub fn cosine_similarity(a: &[f32], b: &[f32]) -> f32 {
    if a.len() != b.len() || a.is_empty() {
        return 0.0;
    }

    let mut dot = 0.0f32;
    let mut norm_a = 0.0f32;
    let mut norm_b = 0.0f32;

    for (x, y) in a.iter().zip(b.iter()) {
        dot += x * y;
        norm_a += x * x;
        norm_b += y * y;
    }

    let denom = norm_a.sqrt() * norm_b.sqrt();
    if denom < f32::EPSILON {
        return 0.0;
    }

    dot / denom
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cosine_identical() {
        let v = vec![1.0, 2.0, 3.0];
        let sim = cosine_similarity(&v, &v);
        assert!((sim - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_orthogonal() {
        let a = vec![1.0, 0.0, 0.0];
        let b = vec![0.0, 1.0, 0.0];
        assert!(cosine_similarity(&a, &b).abs() < 1e-6);
    }

    #[test]
    fn test_cosine_zero_vector() {
        let a = vec![0.0, 0.0];
        let b = vec![1.0, 0.0];
        assert_eq!(cosine_similarity(&a, &b), 0.0);
    }

    #[test]
    fn test_cosine_different_lengths() {
        assert_eq!(cosine_similarity(&[1.0, 2.0], &[1.0]), 0.0);
    }
}

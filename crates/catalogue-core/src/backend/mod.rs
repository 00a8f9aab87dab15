//! Search backend abstraction.
//!
//! The [`SearchBackend`] trait is everything the orchestrator needs from the
//! catalogue index: an offset-capable exact search, a top-k nearest-neighbour
//! search, and lookup by identifier. Ranking is the backend's business; the
//! orchestrator keeps whatever order it gets.
//!
//! Implementations must be `Send + Sync`; one instance serves every channel.

pub mod memory;

use anyhow::Result;
use async_trait::async_trait;

use crate::filter::Filter;
use crate::models::{Document, SearchMode, SearchPage};

/// Inputs for an exact (offset/limit) search.
#[derive(Debug, Clone)]
pub struct SearchRequest<'a> {
    /// Query text. Empty for similarity searches, which rank by vector only.
    pub query: &'a str,
    pub filter: &'a Filter,
    /// Query vector for the mode's embedding field; `None` in simple mode.
    pub vector: Option<&'a [f32]>,
    pub mode: SearchMode,
    pub offset: usize,
    pub limit: usize,
}

/// Inputs for an approximate nearest-neighbour search.
#[derive(Debug, Clone)]
pub struct KnnRequest<'a> {
    pub filter: &'a Filter,
    pub vector: &'a [f32],
    pub mode: SearchMode,
    pub k: usize,
    pub num_candidates: usize,
}

/// Abstract catalogue index.
///
/// | Method | Purpose |
/// |--------|---------|
/// | [`search`](SearchBackend::search) | Full-text and/or exact vector search with pagination |
/// | [`search_knn`](SearchBackend::search_knn) | Approximate k-NN over one embedding field |
/// | [`get_documents`](SearchBackend::get_documents) | Fetch records by identifier |
#[async_trait]
pub trait SearchBackend: Send + Sync {
    async fn search(&self, req: &SearchRequest<'_>) -> Result<SearchPage>;

    async fn search_knn(&self, req: &KnnRequest<'_>) -> Result<SearchPage>;

    /// Fetch documents by identifier. Unknown identifiers are simply absent
    /// from the result.
    async fn get_documents(&self, ids: &[String]) -> Result<Vec<Document>>;
}

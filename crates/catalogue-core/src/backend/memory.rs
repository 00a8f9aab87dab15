//! In-memory [`SearchBackend`] for tests, demos, and offline use.
//!
//! Documents live in a `Vec` behind a `tokio::sync::RwLock`. Exact search is
//! a brute-force scan: query terms gate the match, and in vector modes the
//! score is `cosine + 1.0` against the mode's embedding field, mirroring the
//! `script_score` the Elasticsearch adapter sends. k-NN ranks by cosine only.
//!
//! Every call is recorded so callers can assert which offsets and limits
//! were requested.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::time::Duration;

use anyhow::{bail, Result};
use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::{Mutex, RwLock};

use super::{KnnRequest, SearchBackend, SearchRequest};
use crate::embedding::cosine_similarity;
use crate::filter::Filter;
use crate::models::{Document, SearchMode, SearchPage};

/// A backend call as seen by [`InMemoryIndex`].
#[derive(Debug, Clone, PartialEq)]
pub enum BackendCall {
    Search {
        query: String,
        mode: SearchMode,
        has_vector: bool,
        offset: usize,
        limit: usize,
    },
    Knn {
        mode: SearchMode,
        k: usize,
        num_candidates: usize,
    },
    Get {
        ids: Vec<String>,
    },
}

/// In-memory catalogue index.
#[derive(Default)]
pub struct InMemoryIndex {
    docs: RwLock<Vec<Document>>,
    calls: Mutex<Vec<BackendCall>>,
    latency: Option<Duration>,
    unavailable: AtomicBool,
}

impl InMemoryIndex {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_documents(docs: Vec<Document>) -> Self {
        Self {
            docs: RwLock::new(docs),
            ..Self::default()
        }
    }

    /// Delays every call, to simulate a slow backend.
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = Some(latency);
        self
    }

    /// Inserts or replaces a document by id.
    pub async fn upsert(&self, doc: Document) {
        let mut docs = self.docs.write().await;
        match docs.iter_mut().find(|d| d.id == doc.id) {
            Some(existing) => *existing = doc,
            None => docs.push(doc),
        }
    }

    pub async fn len(&self) -> usize {
        self.docs.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.docs.read().await.is_empty()
    }

    /// Makes every subsequent call fail until reset.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, AtomicOrdering::SeqCst);
    }

    /// Calls received so far, oldest first.
    pub async fn calls(&self) -> Vec<BackendCall> {
        self.calls.lock().await.clone()
    }

    async fn enter(&self, call: BackendCall) -> Result<()> {
        self.calls.lock().await.push(call);
        if let Some(latency) = self.latency {
            tokio::time::sleep(latency).await;
        }
        if self.unavailable.load(AtomicOrdering::SeqCst) {
            bail!("index unavailable");
        }
        Ok(())
    }
}

#[async_trait]
impl SearchBackend for InMemoryIndex {
    async fn search(&self, req: &SearchRequest<'_>) -> Result<SearchPage> {
        self.enter(BackendCall::Search {
            query: req.query.to_string(),
            mode: req.mode,
            has_vector: req.vector.is_some(),
            offset: req.offset,
            limit: req.limit,
        })
        .await?;

        let terms: Vec<String> = req
            .query
            .split_whitespace()
            .map(|t| t.to_lowercase())
            .collect();

        let docs = self.docs.read().await;
        let mut hits: Vec<Document> = docs
            .iter()
            .filter(|doc| matches_filter(doc, req.filter))
            .filter_map(|doc| {
                let text_score = term_score(doc, &terms);
                if !terms.is_empty() && text_score == 0 {
                    return None;
                }
                let score = match req.vector {
                    Some(vector) => {
                        let stored = doc.embedding(req.mode)?;
                        cosine_similarity(vector, stored) as f64 + 1.0
                    }
                    None if terms.is_empty() => 1.0,
                    None => text_score as f64,
                };
                let mut hit = doc.clone();
                hit.score = score;
                Some(hit)
            })
            .collect();

        sort_hits(&mut hits);
        let total = hits.len() as u64;
        let docs = hits.into_iter().skip(req.offset).take(req.limit).collect();
        Ok(SearchPage { total, docs })
    }

    async fn search_knn(&self, req: &KnnRequest<'_>) -> Result<SearchPage> {
        self.enter(BackendCall::Knn {
            mode: req.mode,
            k: req.k,
            num_candidates: req.num_candidates,
        })
        .await?;

        if !req.mode.requires_embedding() {
            bail!("k-NN search needs a vector search type, got {}", req.mode);
        }

        let docs = self.docs.read().await;
        let mut hits: Vec<Document> = docs
            .iter()
            .filter(|doc| matches_filter(doc, req.filter))
            .filter_map(|doc| {
                let stored = doc.embedding(req.mode)?;
                let mut hit = doc.clone();
                hit.score = cosine_similarity(req.vector, stored) as f64;
                Some(hit)
            })
            .collect();

        sort_hits(&mut hits);
        hits.truncate(req.k);
        Ok(SearchPage {
            total: hits.len() as u64,
            docs: hits,
        })
    }

    async fn get_documents(&self, ids: &[String]) -> Result<Vec<Document>> {
        self.enter(BackendCall::Get { ids: ids.to_vec() }).await?;
        let docs = self.docs.read().await;
        Ok(docs
            .iter()
            .filter(|doc| ids.contains(&doc.id))
            .cloned()
            .collect())
    }
}

/// Score descending, id ascending for a stable order across pages.
fn sort_hits(hits: &mut [Document]) {
    hits.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(Ordering::Equal)
            .then_with(|| a.id.cmp(&b.id))
    });
}

fn term_score(doc: &Document, terms: &[String]) -> usize {
    if terms.is_empty() {
        return 0;
    }
    let mut haystack = doc.title.to_lowercase();
    collect_text(&doc.source, &mut haystack);
    terms.iter().filter(|t| haystack.contains(t.as_str())).count()
}

fn collect_text(value: &Value, out: &mut String) {
    match value {
        Value::String(s) => {
            out.push(' ');
            out.push_str(&s.to_lowercase());
        }
        Value::Array(items) => items.iter().for_each(|v| collect_text(v, out)),
        Value::Object(map) => map.values().for_each(|v| collect_text(v, out)),
        _ => {}
    }
}

fn matches_filter(doc: &Document, filter: &Filter) -> bool {
    filter.iter().all(|(field, pattern)| {
        let pattern = pattern.to_lowercase();
        field_values(&doc.source, field).iter().any(|value| {
            let value = value.to_lowercase();
            if pattern.contains('*') {
                wildcard_match(&pattern, &value)
            } else {
                value.contains(&pattern)
            }
        })
    })
}

/// Scalar values at a dotted path, descending into arrays.
fn field_values(source: &Value, path: &str) -> Vec<String> {
    let mut current = vec![source];
    for key in path.split('.') {
        current = current
            .into_iter()
            .flat_map(|v| match v {
                Value::Array(items) => items.iter().filter_map(|i| i.get(key)).collect(),
                other => other.get(key).into_iter().collect::<Vec<_>>(),
            })
            .collect();
    }
    let mut out = Vec::new();
    for value in current {
        match value {
            Value::Array(items) => out.extend(items.iter().filter_map(scalar)),
            other => out.extend(scalar(other)),
        }
    }
    out
}

fn scalar(value: &Value) -> Option<String> {
    match value {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        _ => None,
    }
}

/// Glob match where `*` spans any run of characters.
fn wildcard_match(pattern: &str, value: &str) -> bool {
    let parts: Vec<&str> = pattern.split('*').collect();
    if parts.len() == 1 {
        return pattern == value;
    }
    let (first, last) = (parts[0], parts[parts.len() - 1]);
    if !value.starts_with(first) {
        return false;
    }
    let mut rest = &value[first.len()..];
    for part in &parts[1..parts.len() - 1] {
        match rest.find(part) {
            Some(pos) => rest = &rest[pos + part.len()..],
            None => return false,
        }
    }
    rest.ends_with(last)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(id: &str, title: &str, source: Value, marc: Option<Vec<f32>>) -> Document {
        Document {
            id: id.to_string(),
            title: title.to_string(),
            embedding_marc: marc,
            source,
            ..Default::default()
        }
    }

    fn index() -> InMemoryIndex {
        InMemoryIndex::with_documents(vec![
            doc("1", "Faust", json!({"lang": "ger", "author": {"name": "Goethe"}}), Some(vec![1.0, 0.0])),
            doc("2", "Werther", json!({"lang": "ger", "author": {"name": "Goethe"}}), Some(vec![0.0, 1.0])),
            doc("3", "Hamlet", json!({"lang": "eng", "author": {"name": "Shakespeare"}}), None),
        ])
    }

    fn filter(pairs: &[(&str, &str)]) -> Filter {
        pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect()
    }

    #[tokio::test]
    async fn test_text_search_pages() {
        let idx = index();
        let empty = Filter::new();
        let req = SearchRequest {
            query: "goethe",
            filter: &empty,
            vector: None,
            mode: SearchMode::Simple,
            offset: 1,
            limit: 5,
        };
        let page = idx.search(&req).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.docs.len(), 1);
        assert_eq!(page.docs[0].id, "2");
    }

    #[tokio::test]
    async fn test_filter_wildcard_on_nested_field() {
        let idx = index();
        let f = filter(&[("author.name", "Shake*")]);
        let req = SearchRequest {
            query: "",
            filter: &f,
            vector: None,
            mode: SearchMode::Simple,
            offset: 0,
            limit: 10,
        };
        let page = idx.search(&req).await.unwrap();
        assert_eq!(page.docs.len(), 1);
        assert_eq!(page.docs[0].id, "3");
    }

    #[tokio::test]
    async fn test_vector_search_skips_docs_without_embedding() {
        let idx = index();
        let empty = Filter::new();
        let v = [1.0, 0.0];
        let req = SearchRequest {
            query: "",
            filter: &empty,
            vector: Some(&v),
            mode: SearchMode::Marc,
            offset: 0,
            limit: 10,
        };
        let page = idx.search(&req).await.unwrap();
        assert_eq!(page.total, 2);
        assert_eq!(page.docs[0].id, "1");
        assert!((page.docs[0].score - 2.0).abs() < 1e-6);
    }

    #[tokio::test]
    async fn test_knn_truncates_to_k_and_records_call() {
        let idx = index();
        let empty = Filter::new();
        let v = [0.0, 1.0];
        let req = KnnRequest {
            filter: &empty,
            vector: &v,
            mode: SearchMode::Marc,
            k: 1,
            num_candidates: 1,
        };
        let page = idx.search_knn(&req).await.unwrap();
        assert_eq!(page.docs.len(), 1);
        assert_eq!(page.docs[0].id, "2");
        assert_eq!(
            idx.calls().await,
            vec![BackendCall::Knn {
                mode: SearchMode::Marc,
                k: 1,
                num_candidates: 1
            }]
        );
    }

    #[tokio::test]
    async fn test_knn_rejects_simple_mode() {
        let idx = index();
        let empty = Filter::new();
        let req = KnnRequest {
            filter: &empty,
            vector: &[],
            mode: SearchMode::Simple,
            k: 9,
            num_candidates: 9,
        };
        assert!(idx.search_knn(&req).await.is_err());
    }

    #[tokio::test]
    async fn test_get_documents_ignores_unknown_ids() {
        let idx = index();
        let docs = idx
            .get_documents(&["3".to_string(), "nope".to_string()])
            .await
            .unwrap();
        assert_eq!(docs.len(), 1);
        assert_eq!(docs[0].title, "Hamlet");
    }

    #[tokio::test]
    async fn test_unavailable_fails_calls() {
        let idx = index();
        idx.set_unavailable(true);
        assert!(idx.get_documents(&["1".to_string()]).await.is_err());
        idx.set_unavailable(false);
        assert!(idx.get_documents(&["1".to_string()]).await.is_ok());
    }

    #[test]
    fn test_wildcard_match() {
        assert!(wildcard_match("goe*", "goethe"));
        assert!(wildcard_match("*the", "goethe"));
        assert!(wildcard_match("g*t*e", "goethe"));
        assert!(wildcard_match("*", "anything"));
        assert!(!wildcard_match("sch*", "goethe"));
        assert!(!wildcard_match("goe*x", "goethe"));
    }
}

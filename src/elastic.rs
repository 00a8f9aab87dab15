//! Elasticsearch search backend.
//!
//! Talks to `POST {url}/{index}/_search` over plain HTTP with `reqwest`.
//! Expected `_source` shape of a catalogue record:
//!
//! ```json
//! {
//!   "title": "Faust",                      // or an array, first entry wins
//!   "persons": { "author": [{ "name": "Goethe", "date": "1749-1832" }] },
//!   "record_identifiers": ["(EXLNZ-41SLSP_NETWORK)991170525505504"],
//!   "embedding_marc": [0.1, ...], "embedding_prose": [...], "embedding_json": [...]
//! }
//! ```
//!
//! Requests that fail with 429, 502, 503 or 504, or with a network error,
//! are retried with exponential backoff up to `elastic.retries` times.

use anyhow::{bail, Context, Result};
use async_trait::async_trait;
use catalogue_core::backend::{KnnRequest, SearchBackend, SearchRequest};
use catalogue_core::filter::Filter;
use catalogue_core::models::{Document, Person, SearchMode, SearchPage};
use serde_json::{json, Value};
use std::collections::BTreeMap;
use std::time::Duration;
use tracing::{debug, warn};

use crate::config::ElasticConfig;

pub struct ElasticBackend {
    client: reqwest::Client,
    search_url: String,
    api_key: Option<String>,
    retries: u32,
    backoff_base: Duration,
}

impl ElasticBackend {
    pub fn new(config: &ElasticConfig, api_key: Option<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(60))
            .build()?;
        Ok(Self {
            client,
            search_url: format!("{}/{}/_search", config.url.trim_end_matches('/'), config.index),
            api_key,
            retries: config.retries,
            backoff_base: Duration::from_millis(500),
        })
    }

    pub fn from_config(config: &ElasticConfig) -> Result<Self> {
        Self::new(config, config.api_key())
    }

    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    async fn post_search(&self, body: &Value) -> Result<SearchPage> {
        let mut last_err = None;

        for attempt in 0..=self.retries {
            if attempt > 0 {
                let delay = self.backoff_base * (1u32 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let mut request = self.client.post(&self.search_url).json(body);
            if let Some(key) = &self.api_key {
                request = request.header("Authorization", format!("ApiKey {}", key));
            }

            match request.send().await {
                Ok(response) => {
                    let status = response.status();
                    if status.is_success() {
                        let json: Value = response.json().await?;
                        return parse_search_response(&json);
                    }

                    let body_text = response.text().await.unwrap_or_default();
                    if matches!(status.as_u16(), 429 | 502 | 503 | 504) {
                        warn!(%status, attempt, "elasticsearch request failed, retrying");
                        last_err = Some(anyhow::anyhow!("elasticsearch error {}: {}", status, body_text));
                        continue;
                    }
                    bail!("elasticsearch error {}: {}", status, body_text);
                }
                Err(e) => {
                    warn!(error = %e, attempt, "elasticsearch request failed, retrying");
                    last_err = Some(e.into());
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("elasticsearch request failed after retries")))
    }
}

#[async_trait]
impl SearchBackend for ElasticBackend {
    async fn search(&self, req: &SearchRequest<'_>) -> Result<SearchPage> {
        let body = search_body(req)?;
        debug!(offset = req.offset, limit = req.limit, mode = %req.mode, "elasticsearch search");
        self.post_search(&body).await
    }

    async fn search_knn(&self, req: &KnnRequest<'_>) -> Result<SearchPage> {
        let body = knn_body(req)?;
        debug!(k = req.k, mode = %req.mode, "elasticsearch knn");
        self.post_search(&body).await
    }

    async fn get_documents(&self, ids: &[String]) -> Result<Vec<Document>> {
        let body = json!({
            "size": ids.len(),
            "query": { "ids": { "values": ids } },
        });
        Ok(self.post_search(&body).await?.docs)
    }
}

fn filter_clauses(filter: &Filter) -> Vec<Value> {
    filter
        .iter()
        .map(|(field, value)| {
            if value.contains('*') {
                json!({ "wildcard": { field: { "value": value, "case_insensitive": true } } })
            } else {
                json!({ "match": { field: value } })
            }
        })
        .collect()
}

fn vector_field(mode: SearchMode) -> Result<&'static str> {
    mode.embedding_field()
        .with_context(|| format!("search type {} has no vector field", mode))
}

/// Builds the `_search` body for an exact (offset-capable) search.
pub fn search_body(req: &SearchRequest<'_>) -> Result<Value> {
    let mut filters = filter_clauses(req.filter);
    let mut bool_query = serde_json::Map::new();

    if !req.query.trim().is_empty() {
        bool_query.insert(
            "must".into(),
            json!([{ "query_string": { "query": req.query, "default_operator": "AND" } }]),
        );
    }

    let query = match req.vector {
        Some(vector) => {
            let field = vector_field(req.mode)?;
            filters.push(json!({ "exists": { "field": field } }));
            bool_query.insert("filter".into(), Value::Array(filters));
            json!({
                "script_score": {
                    "query": { "bool": bool_query },
                    "script": {
                        "source": format!("cosineSimilarity(params.query_vector, '{}') + 1.0", field),
                        "params": { "query_vector": vector },
                    },
                },
            })
        }
        None => {
            bool_query.insert("filter".into(), Value::Array(filters));
            json!({ "bool": bool_query })
        }
    };

    Ok(json!({
        "from": req.offset,
        "size": req.limit,
        "track_total_hits": true,
        "query": query,
    }))
}

/// Builds the `_search` body for a top-k nearest-neighbour search.
pub fn knn_body(req: &KnnRequest<'_>) -> Result<Value> {
    let field = vector_field(req.mode)?;
    Ok(json!({
        "size": req.k,
        "track_total_hits": true,
        "knn": {
            "field": field,
            "query_vector": req.vector,
            "k": req.k,
            "num_candidates": req.num_candidates,
            "filter": filter_clauses(req.filter),
        },
    }))
}

fn parse_search_response(json: &Value) -> Result<SearchPage> {
    let hits = json
        .get("hits")
        .context("Invalid elasticsearch response: missing hits")?;
    let total = hits
        .pointer("/total/value")
        .or_else(|| hits.get("total"))
        .and_then(|t| t.as_u64())
        .unwrap_or(0);
    let docs = hits
        .get("hits")
        .and_then(|h| h.as_array())
        .map(|arr| arr.iter().map(document_from_hit).collect::<Result<Vec<_>>>())
        .transpose()?
        .unwrap_or_default();
    Ok(SearchPage { total, docs })
}

/// Maps one `hits.hits[]` entry to a [`Document`].
pub fn document_from_hit(hit: &Value) -> Result<Document> {
    let id = hit
        .get("_id")
        .and_then(|v| v.as_str())
        .context("hit without _id")?
        .to_string();
    let score = hit.get("_score").and_then(|s| s.as_f64()).unwrap_or(0.0);
    let source = hit.get("_source").cloned().unwrap_or(Value::Null);

    let title = match source.get("title") {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(items)) => items
            .iter()
            .find_map(|t| t.as_str())
            .unwrap_or_default()
            .to_string(),
        _ => String::new(),
    };

    let persons: BTreeMap<String, Vec<Person>> = source
        .get("persons")
        .cloned()
        .map(serde_json::from_value::<BTreeMap<String, Vec<Person>>>)
        .transpose()
        .with_context(|| format!("invalid persons in document {}", id))?
        .unwrap_or_default();

    let record_identifiers = source
        .get("record_identifiers")
        .or_else(|| source.pointer("/mapping/recordIdentifier"))
        .and_then(|v| v.as_array())
        .map(|ids| {
            ids.iter()
                .filter_map(|i| i.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default();

    let embedding = |field: &str| -> Option<Vec<f32>> {
        source.get(field).and_then(|v| v.as_array()).map(|arr| {
            arr.iter()
                .map(|x| x.as_f64().unwrap_or(0.0) as f32)
                .collect()
        })
    };

    Ok(Document {
        embedding_marc: embedding("embedding_marc"),
        embedding_prose: embedding("embedding_prose"),
        embedding_json: embedding("embedding_json"),
        id,
        title,
        score,
        persons,
        record_identifiers,
        source,
    })
}

//! OpenAI embedding and completion provider.
//!
//! [`OpenAiProvider`] implements the core
//! [`EmbeddingProvider`](catalogue_core::embedding::EmbeddingProvider) trait:
//! `embed` calls `POST {base_url}/embeddings`, `rewrite_query` calls
//! `POST {base_url}/chat/completions` with a system prompt that turns a
//! free-text question into a catalogue query. Both consult the
//! [`ResponseCache`] first when one is attached.
//!
//! # Retry Strategy
//!
//! - HTTP 429 (rate limited) and 5xx (server error) → retry
//! - HTTP 4xx (client error, not 429) → fail immediately
//! - Network errors → retry
//! - Backoff: 1s, 2s, 4s, 8s, 16s, 32s (capped at 2^5)

use anyhow::{bail, Result};
use async_trait::async_trait;
use catalogue_core::embedding::EmbeddingProvider;
use serde_json::{json, Value};
use std::time::Duration;
use tracing::{debug, warn};

use crate::cache::{CacheKind, ResponseCache};
use crate::config::OpenAiConfig;

pub const DEFAULT_REWRITE_PROMPT: &str = "You turn questions about a library's holdings into \
search queries for its catalogue. Reply with the query only: names, titles, subjects, places \
and years that should match the records. No explanations, no quotes.";

// ============ Disabled Provider ============

/// Provider used when no OpenAI key is configured.
///
/// Simple searches still work; anything that needs an embedding or a
/// rewrite fails with a descriptive error.
pub struct DisabledProvider;

#[async_trait]
impl EmbeddingProvider for DisabledProvider {
    fn model_name(&self) -> &str {
        "disabled"
    }

    async fn embed(&self, _text: &str) -> Result<Vec<f32>> {
        bail!("embeddings are disabled: OPENAI_API_KEY not set")
    }

    async fn rewrite_query(&self, _text: &str) -> Result<String> {
        bail!("query rewriting is disabled: OPENAI_API_KEY not set")
    }
}

// ============ OpenAI Provider ============

pub struct OpenAiProvider {
    client: reqwest::Client,
    base_url: String,
    api_key: String,
    embedding_model: String,
    completion_model: String,
    rewrite_prompt: String,
    max_retries: u32,
    backoff_base: Duration,
    cache: Option<ResponseCache>,
}

impl OpenAiProvider {
    /// Builds a provider reading `OPENAI_API_KEY` from the environment.
    pub fn from_config(config: &OpenAiConfig) -> Result<Self> {
        Self::new(config, config.api_key()?)
    }

    pub fn new(config: &OpenAiConfig, api_key: String) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.timeout_secs))
            .build()?;

        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
            api_key,
            embedding_model: config.embedding_model.clone(),
            completion_model: config.completion_model.clone(),
            rewrite_prompt: config
                .rewrite_prompt
                .clone()
                .unwrap_or_else(|| DEFAULT_REWRITE_PROMPT.to_string()),
            max_retries: config.max_retries,
            backoff_base: Duration::from_secs(1),
            cache: None,
        })
    }

    pub fn with_cache(mut self, cache: ResponseCache) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Scales the retry delays; `1s` in production.
    pub fn with_backoff_base(mut self, base: Duration) -> Self {
        self.backoff_base = base;
        self
    }

    pub fn completion_model(&self) -> &str {
        &self.completion_model
    }

    /// POST with retry/backoff, returning the parsed JSON body.
    async fn post_json(&self, path: &str, body: &Value) -> Result<Value> {
        let url = format!("{}/{}", self.base_url, path);
        let mut last_err = None;

        for attempt in 0..=self.max_retries {
            if attempt > 0 {
                // Exponential backoff: 1s, 2s, 4s, 8s, ...
                let delay = self.backoff_base * (1u32 << (attempt - 1).min(5));
                tokio::time::sleep(delay).await;
            }

            let resp = self
                .client
                .post(&url)
                .bearer_auth(&self.api_key)
                .json(body)
                .send()
                .await;

            match resp {
                Ok(response) => {
                    let status = response.status();

                    if status.is_success() {
                        return Ok(response.json().await?);
                    }

                    let body_text = response.text().await.unwrap_or_default();

                    // Rate limited or server error: retry
                    if status.as_u16() == 429 || status.is_server_error() {
                        warn!(%status, attempt, path, "OpenAI request failed, retrying");
                        last_err = Some(anyhow::anyhow!("OpenAI API error {}: {}", status, body_text));
                        continue;
                    }

                    bail!("OpenAI API error {}: {}", status, body_text);
                }
                Err(e) => {
                    warn!(error = %e, attempt, path, "OpenAI request failed, retrying");
                    last_err = Some(e.into());
                    continue;
                }
            }
        }

        Err(last_err.unwrap_or_else(|| anyhow::anyhow!("OpenAI request failed after retries")))
    }

    fn rewrite_cache_input(&self, text: &str) -> String {
        format!("{}\0{}", self.rewrite_prompt, text)
    }
}

#[async_trait]
impl EmbeddingProvider for OpenAiProvider {
    fn model_name(&self) -> &str {
        &self.embedding_model
    }

    async fn embed(&self, text: &str) -> Result<Vec<f32>> {
        if let Some(cache) = &self.cache {
            match cache.get_embedding(&self.embedding_model, text).await {
                Ok(Some(vector)) => {
                    debug!(model = %self.embedding_model, "embedding cache hit");
                    return Ok(vector);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "embedding cache read failed"),
            }
        }

        let body = json!({
            "model": self.embedding_model,
            "input": [text],
        });
        let json = self.post_json("embeddings", &body).await?;
        let vector = parse_embedding_response(&json)?;

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.put_embedding(&self.embedding_model, text, &vector).await {
                warn!(error = %e, "embedding cache write failed");
            }
        }
        Ok(vector)
    }

    async fn rewrite_query(&self, text: &str) -> Result<String> {
        let cache_input = self.rewrite_cache_input(text);
        if let Some(cache) = &self.cache {
            match cache
                .get(CacheKind::Rewrite, &self.completion_model, &cache_input)
                .await
            {
                Ok(Some(rewritten)) => {
                    debug!(model = %self.completion_model, "rewrite cache hit");
                    return Ok(rewritten);
                }
                Ok(None) => {}
                Err(e) => warn!(error = %e, "rewrite cache read failed"),
            }
        }

        let body = json!({
            "model": self.completion_model,
            "temperature": 0,
            "messages": [
                {"role": "system", "content": self.rewrite_prompt},
                {"role": "user", "content": text},
            ],
        });
        let json = self.post_json("chat/completions", &body).await?;
        let rewritten = parse_completion_response(&json)?;

        if let Some(cache) = &self.cache {
            if let Err(e) = cache
                .put(CacheKind::Rewrite, &self.completion_model, &cache_input, &rewritten)
                .await
            {
                warn!(error = %e, "rewrite cache write failed");
            }
        }
        Ok(rewritten)
    }
}

/// Extracts `data[0].embedding` from an embeddings response.
fn parse_embedding_response(json: &Value) -> Result<Vec<f32>> {
    let data = json
        .get("data")
        .and_then(|d| d.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing data array"))?;

    let embedding = data
        .first()
        .and_then(|item| item.get("embedding"))
        .and_then(|e| e.as_array())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing embedding"))?;

    Ok(embedding
        .iter()
        .map(|v| v.as_f64().unwrap_or(0.0) as f32)
        .collect())
}

/// Extracts `choices[0].message.content` from a chat completion response.
fn parse_completion_response(json: &Value) -> Result<String> {
    let content = json
        .pointer("/choices/0/message/content")
        .and_then(|c| c.as_str())
        .ok_or_else(|| anyhow::anyhow!("Invalid OpenAI response: missing message content"))?;
    Ok(content.trim().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_embedding_response() {
        let json = json!({"data": [{"index": 0, "embedding": [0.5, -1.0, 2]}]});
        assert_eq!(parse_embedding_response(&json).unwrap(), vec![0.5, -1.0, 2.0]);
        assert!(parse_embedding_response(&json!({"data": []})).is_err());
        assert!(parse_embedding_response(&json!({"error": "x"})).is_err());
    }

    #[test]
    fn test_parse_completion_response() {
        let json = json!({"choices": [{"message": {"role": "assistant", "content": "  Goethe Faust \n"}}]});
        assert_eq!(parse_completion_response(&json).unwrap(), "Goethe Faust");
        assert!(parse_completion_response(&json!({"choices": []})).is_err());
    }

    #[tokio::test]
    async fn test_disabled_provider_refuses() {
        let err = DisabledProvider.embed("faust").await.unwrap_err();
        assert!(err.to_string().contains("disabled"));
        assert!(DisabledProvider.rewrite_query("faust").await.is_err());
    }

    #[test]
    fn test_rewrite_prompt_defaults() {
        let provider = OpenAiProvider::new(&OpenAiConfig::default(), "k".into()).unwrap();
        assert_eq!(provider.rewrite_prompt, DEFAULT_REWRITE_PROMPT);
        assert_eq!(provider.model_name(), "text-embedding-3-small");
    }
}

//! Persistent cache for embedding and completion responses.
//!
//! Identical inputs to the same model always produce the same vector, and
//! rewrites are cheap to replay, so both are memoised in SQLite. Keys are
//! the hex SHA-256 of `kind \0 model \0 input`.
//!
//! The cache is an optimisation only: callers log its errors and carry on.

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use sqlx::{Row, SqlitePool};
use std::path::Path;

use crate::{db, migrate};

/// What a cached value holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheKind {
    /// JSON array of `f32`.
    Embedding,
    /// Rewritten query text.
    Rewrite,
}

impl CacheKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            CacheKind::Embedding => "embedding",
            CacheKind::Rewrite => "rewrite",
        }
    }
}

#[derive(Clone)]
pub struct ResponseCache {
    pool: SqlitePool,
}

impl ResponseCache {
    /// Opens the cache database at `path`, creating file and schema as needed.
    pub async fn open(path: &Path) -> Result<Self> {
        let pool = db::connect(path)
            .await
            .with_context(|| format!("Failed to open cache database: {}", path.display()))?;
        migrate::run_migrations(&pool).await?;
        Ok(Self { pool })
    }

    pub fn key(kind: CacheKind, model: &str, input: &str) -> String {
        let mut hasher = Sha256::new();
        hasher.update(kind.as_str().as_bytes());
        hasher.update([0u8]);
        hasher.update(model.as_bytes());
        hasher.update([0u8]);
        hasher.update(input.as_bytes());
        hex::encode(hasher.finalize())
    }

    pub async fn get(&self, kind: CacheKind, model: &str, input: &str) -> Result<Option<String>> {
        let row = sqlx::query("SELECT value FROM llm_cache WHERE key = ?")
            .bind(Self::key(kind, model, input))
            .fetch_optional(&self.pool)
            .await?;
        Ok(row.map(|r| r.get::<String, _>("value")))
    }

    pub async fn put(&self, kind: CacheKind, model: &str, input: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO llm_cache (key, kind, model, value, created_at)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET value = excluded.value, created_at = excluded.created_at
            "#,
        )
        .bind(Self::key(kind, model, input))
        .bind(kind.as_str())
        .bind(model)
        .bind(value)
        .bind(chrono::Utc::now().timestamp())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn get_embedding(&self, model: &str, input: &str) -> Result<Option<Vec<f32>>> {
        match self.get(CacheKind::Embedding, model, input).await? {
            Some(raw) => {
                let vector: Vec<f32> =
                    serde_json::from_str(&raw).with_context(|| "corrupt cached embedding")?;
                Ok(Some(vector))
            }
            None => Ok(None),
        }
    }

    pub async fn put_embedding(&self, model: &str, input: &str, vector: &[f32]) -> Result<()> {
        let raw = serde_json::to_string(vector)?;
        self.put(CacheKind::Embedding, model, input, &raw).await
    }

    /// Number of cached entries of `kind`.
    pub async fn count(&self, kind: CacheKind) -> Result<i64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM llm_cache WHERE kind = ?")
            .bind(kind.as_str())
            .fetch_one(&self.pool)
            .await?;
        Ok(count)
    }

    pub async fn close(&self) {
        self.pool.close().await;
    }
}

use anyhow::Result;
use sqlx::SqlitePool;

/// Creates the cache schema. Idempotent.
pub async fn run_migrations(pool: &SqlitePool) -> Result<()> {
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS llm_cache (
            key TEXT PRIMARY KEY,
            kind TEXT NOT NULL,
            model TEXT NOT NULL,
            value TEXT NOT NULL,
            created_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_llm_cache_kind_model ON llm_cache(kind, model)")
        .execute(pool)
        .await?;

    Ok(())
}

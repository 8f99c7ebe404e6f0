use anyhow::Result;
use tracing::info;

use crate::config::Config;
use crate::db;

/// Create the schema. Idempotent.
pub async fn run_migrations(config: &Config) -> Result<()> {
    let pool = db::connect(config).await?;

    // One row per sheet row; cells are a JSON array.
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS sheet_rows (
            position INTEGER PRIMARY KEY,
            cells_json TEXT NOT NULL DEFAULT '[]',
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    // Process-wide slots: header map, selection, cursors, recommendation
    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS properties (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL,
            updated_at INTEGER NOT NULL
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query(
        r#"
        CREATE TABLE IF NOT EXISTS layer_cache (
            row_position INTEGER NOT NULL,
            layer TEXT NOT NULL,
            payload_json TEXT NOT NULL,
            cached_at INTEGER NOT NULL,
            selection_fingerprint TEXT NOT NULL DEFAULT '',
            PRIMARY KEY (row_position, layer)
        )
        "#,
    )
    .execute(&pool)
    .await?;

    sqlx::query("CREATE INDEX IF NOT EXISTS idx_layer_cache_layer ON layer_cache(layer)")
        .execute(&pool)
        .await?;

    pool.close().await;
    info!(db = %config.db.path.display(), "migrations applied");
    Ok(())
}

//! SQLite-backed implementations of the core storage traits.
//!
//! | Trait | Table |
//! |-------|-------|
//! | [`RowStore`] | `sheet_rows` (one JSON array of cells per position) |
//! | [`PropertyStore`] | `properties` |
//! | [`LayerCache`] | `layer_cache`, keyed by `(row_position, layer)` |
//!
//! All three wrap the same [`SqlitePool`]; see [`crate::migrate`] for the
//! schema.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::{Row, SqlitePool};

use field_cache_core::models::{CacheEntry, Cell, Layer, RowPosition, RowRange};
use field_cache_core::store::{
    ClearScope, LayerCache, LayerCacheStats, PropertyStore, RowStore, Stores,
};

fn now_ts() -> i64 {
    Utc::now().timestamp()
}

fn parse_cells(position: RowPosition, json: &str) -> Result<Vec<Cell>> {
    serde_json::from_str(json).with_context(|| format!("Corrupt cells for row {}", position))
}

fn from_millis(ms: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp_millis(ms).ok_or_else(|| anyhow!("Invalid timestamp: {}", ms))
}

/// Build all three SQLite stores over one pool.
pub fn sqlite_stores(pool: &SqlitePool) -> Stores {
    Stores {
        rows: Arc::new(SqliteRowStore::new(pool.clone())),
        props: Arc::new(SqlitePropertyStore::new(pool.clone())),
        cache: Arc::new(SqliteLayerCache::new(pool.clone())),
    }
}

/// The sheet, one row per `sheet_rows` record.
pub struct SqliteRowStore {
    pool: SqlitePool,
}

impl SqliteRowStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Insert or overwrite whole rows starting at `first`, in one
    /// transaction. Returns the last position written.
    pub async fn put_rows(&self, first: RowPosition, rows: &[Vec<Cell>]) -> Result<RowPosition> {
        let mut tx = self.pool.begin().await?;
        let ts = now_ts();
        let mut pos = first - 1;
        for cells in rows {
            pos += 1;
            sqlx::query(
                r#"
                INSERT INTO sheet_rows (position, cells_json, updated_at)
                VALUES (?, ?, ?)
                ON CONFLICT(position) DO UPDATE SET
                    cells_json = excluded.cells_json,
                    updated_at = excluded.updated_at
                "#,
            )
            .bind(pos)
            .bind(serde_json::to_string(cells)?)
            .bind(ts)
            .execute(&mut *tx)
            .await?;
        }
        tx.commit().await?;
        Ok(pos)
    }

    /// Remove every row after `last`.
    pub async fn truncate_after(&self, last: RowPosition) -> Result<u64> {
        let result = sqlx::query("DELETE FROM sheet_rows WHERE position > ?")
            .bind(last)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }
}

#[async_trait]
impl RowStore for SqliteRowStore {
    async fn get_rows(&self, range: RowRange) -> Result<Vec<Vec<Cell>>> {
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let last = self.last_row_position().await?;
        let start = range.start.max(1);
        let end = range.end.min(last);
        if start > end {
            return Ok(Vec::new());
        }

        let rows = sqlx::query(
            "SELECT position, cells_json FROM sheet_rows WHERE position BETWEEN ? AND ? ORDER BY position",
        )
        .bind(start)
        .bind(end)
        .fetch_all(&self.pool)
        .await?;

        let mut by_pos = BTreeMap::new();
        for row in rows {
            let pos: i64 = row.get("position");
            let json: String = row.get("cells_json");
            by_pos.insert(pos, parse_cells(pos, &json)?);
        }
        // Gaps read as empty rows so positions stay contiguous.
        Ok((start..=end)
            .map(|pos| by_pos.remove(&pos).unwrap_or_default())
            .collect())
    }

    async fn get_row(&self, pos: RowPosition) -> Result<Vec<Cell>> {
        let json: Option<String> =
            sqlx::query_scalar("SELECT cells_json FROM sheet_rows WHERE position = ?")
                .bind(pos)
                .fetch_optional(&self.pool)
                .await?;
        match json {
            Some(json) => parse_cells(pos, &json),
            None => Ok(Vec::new()),
        }
    }

    async fn set_cell(&self, pos: RowPosition, column: usize, value: Cell) -> Result<()> {
        let mut tx = self.pool.begin().await?;

        let json: Option<String> =
            sqlx::query_scalar("SELECT cells_json FROM sheet_rows WHERE position = ?")
                .bind(pos)
                .fetch_optional(&mut *tx)
                .await?;
        let Some(json) = json else {
            bail!("row {} does not exist", pos);
        };

        let mut cells = parse_cells(pos, &json)?;
        if cells.len() <= column {
            cells.resize(column + 1, Cell::Null);
        }
        cells[column] = value;

        sqlx::query("UPDATE sheet_rows SET cells_json = ?, updated_at = ? WHERE position = ?")
            .bind(serde_json::to_string(&cells)?)
            .bind(now_ts())
            .bind(pos)
            .execute(&mut *tx)
            .await?;

        tx.commit().await?;
        Ok(())
    }

    async fn last_row_position(&self) -> Result<RowPosition> {
        let last: i64 = sqlx::query_scalar("SELECT COALESCE(MAX(position), 0) FROM sheet_rows")
            .fetch_one(&self.pool)
            .await?;
        Ok(last)
    }
}

pub struct SqlitePropertyStore {
    pool: SqlitePool,
}

impl SqlitePropertyStore {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl PropertyStore for SqlitePropertyStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        let value: Option<String> = sqlx::query_scalar("SELECT value FROM properties WHERE key = ?")
            .bind(key)
            .fetch_optional(&self.pool)
            .await?;
        Ok(value)
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO properties (key, value, updated_at) VALUES (?, ?, ?)
            ON CONFLICT(key) DO UPDATE SET
                value = excluded.value,
                updated_at = excluded.updated_at
            "#,
        )
        .bind(key)
        .bind(value)
        .bind(now_ts())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        sqlx::query("DELETE FROM properties WHERE key = ?")
            .bind(key)
            .execute(&self.pool)
            .await?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let result = sqlx::query("DELETE FROM properties WHERE substr(key, 1, ?) = ?")
            .bind(prefix.chars().count() as i64)
            .bind(prefix)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        let keys: Vec<String> =
            sqlx::query_scalar("SELECT key FROM properties WHERE substr(key, 1, ?) = ? ORDER BY key")
                .bind(prefix.chars().count() as i64)
                .bind(prefix)
                .fetch_all(&self.pool)
                .await?;
        Ok(keys)
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool> {
        let result = match expected {
            None => {
                sqlx::query(
                    "INSERT INTO properties (key, value, updated_at) VALUES (?, ?, ?) ON CONFLICT(key) DO NOTHING",
                )
                .bind(key)
                .bind(new)
                .bind(now_ts())
                .execute(&self.pool)
                .await?
            }
            Some(expected) => {
                sqlx::query(
                    "UPDATE properties SET value = ?, updated_at = ? WHERE key = ? AND value = ?",
                )
                .bind(new)
                .bind(now_ts())
                .bind(key)
                .bind(expected)
                .execute(&self.pool)
                .await?
            }
        };
        Ok(result.rows_affected() == 1)
    }
}

pub struct SqliteLayerCache {
    pool: SqlitePool,
}

impl SqliteLayerCache {
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl LayerCache for SqliteLayerCache {
    async fn get(&self, row: RowPosition, layer: Layer) -> Result<Option<CacheEntry>> {
        let found = sqlx::query(
            "SELECT payload_json, cached_at, selection_fingerprint FROM layer_cache WHERE row_position = ? AND layer = ?",
        )
        .bind(row)
        .bind(layer.as_str())
        .fetch_optional(&self.pool)
        .await?;

        let Some(r) = found else {
            return Ok(None);
        };
        let payload: String = r.get("payload_json");
        Ok(Some(CacheEntry {
            row,
            layer,
            payload: serde_json::from_str(&payload)
                .with_context(|| format!("Corrupt cache payload for row {} layer {}", row, layer))?,
            cached_at: from_millis(r.get("cached_at"))?,
            selection_fingerprint: r.get("selection_fingerprint"),
        }))
    }

    async fn put_entry(&self, entry: CacheEntry) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO layer_cache (row_position, layer, payload_json, cached_at, selection_fingerprint)
            VALUES (?, ?, ?, ?, ?)
            ON CONFLICT(row_position, layer) DO UPDATE SET
                payload_json = excluded.payload_json,
                cached_at = excluded.cached_at,
                selection_fingerprint = excluded.selection_fingerprint
            "#,
        )
        .bind(entry.row)
        .bind(entry.layer.as_str())
        .bind(serde_json::to_string(&entry.payload)?)
        .bind(entry.cached_at.timestamp_millis())
        .bind(&entry.selection_fingerprint)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn clear(&self, scope: ClearScope) -> Result<u64> {
        let result = match scope {
            ClearScope::All => sqlx::query("DELETE FROM layer_cache")
                .execute(&self.pool)
                .await?,
            ClearScope::Layer(layer) => sqlx::query("DELETE FROM layer_cache WHERE layer = ?")
                .bind(layer.as_str())
                .execute(&self.pool)
                .await?,
            ClearScope::FromRow(first) => {
                sqlx::query("DELETE FROM layer_cache WHERE row_position >= ?")
                    .bind(first)
                    .execute(&self.pool)
                    .await?
            }
        };
        Ok(result.rows_affected())
    }

    async fn stats(&self, layer: Layer) -> Result<LayerCacheStats> {
        let r = sqlx::query(
            "SELECT COUNT(*) AS n, MIN(cached_at) AS oldest, MAX(cached_at) AS newest FROM layer_cache WHERE layer = ?",
        )
        .bind(layer.as_str())
        .fetch_one(&self.pool)
        .await?;

        let n: i64 = r.get("n");
        let oldest: Option<i64> = r.get("oldest");
        let newest: Option<i64> = r.get("newest");
        Ok(LayerCacheStats {
            layer,
            rows: n as u64,
            oldest: oldest.map(from_millis).transpose()?,
            newest: newest.map(from_millis).transpose()?,
        })
    }
}

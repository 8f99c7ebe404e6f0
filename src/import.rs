//! Sheet import.
//!
//! Loads a spreadsheet snapshot into the `sheet_rows` table. The input is a
//! JSON array of rows, each an array of cells, starting with the two header
//! rows:
//!
//! ```json
//! [
//!   ["Case_Organization", "", "Monitor_Vital_Signs"],
//!   ["Case_ID", "Spark_Title", "Initial_Vitals"],
//!   ["CASE-0001", "Chest pain", "{\"hr\": 88}"]
//! ]
//! ```
//!
//! Rows are written by position, replacing whatever was there; rows past
//! the end of the snapshot are removed. Appending rows leaves progress
//! alone. When an existing position changes or disappears, every batch
//! cursor is reset and cached layers from the first such data row on are
//! dropped, so no cursor points past rows whose cache no longer matches.
//! A header change invalidates from the first data row. The header map is
//! not refreshed implicitly: run `fcache headers refresh` after a layout
//! change.

use std::path::Path;

use anyhow::{bail, Context, Result};
use sqlx::SqlitePool;
use tracing::info;

use field_cache_core::cursor;
use field_cache_core::models::{Cell, RowPosition, RowRange, FIRST_DATA_ROW, HEADER_ROWS};
use field_cache_core::store::{ClearScope, RowStore};

use crate::config::Config;
use crate::db;
use crate::sqlite_store::{sqlite_stores, SqliteRowStore};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImportSummary {
    pub rows: usize,
    pub data_rows: usize,
    pub removed: u64,
    /// First data row whose cached layers were dropped, if any.
    pub invalidated_from: Option<RowPosition>,
    pub cursors_reset: u64,
    pub entries_removed: u64,
}

/// Parse a snapshot.
pub fn parse_snapshot(content: &str) -> Result<Vec<Vec<Cell>>> {
    let rows: Vec<Vec<Cell>> =
        serde_json::from_str(content).context("Snapshot must be a JSON array of rows")?;
    if rows.len() < HEADER_ROWS as usize {
        bail!(
            "Snapshot has {} rows; expected at least {} header rows",
            rows.len(),
            HEADER_ROWS
        );
    }
    Ok(rows)
}

/// First existing position whose contents differ from `incoming` or that
/// `incoming` no longer covers. Positions past the old end are appends.
pub async fn first_changed_row(
    store: &dyn RowStore,
    incoming: &[Vec<Cell>],
) -> Result<Option<RowPosition>> {
    let old_last = store.last_row_position().await?;
    if old_last < 1 {
        return Ok(None);
    }
    let existing = store.get_rows(RowRange::new(1, old_last)).await?;
    for (i, old) in existing.iter().enumerate() {
        let pos = i as RowPosition + 1;
        match incoming.get(i) {
            Some(new) if new == old => continue,
            _ => return Ok(Some(pos)),
        }
    }
    Ok(None)
}

/// Write `rows` into the sheet at `pool`, invalidating progress for any
/// position whose contents change.
pub async fn import_rows(pool: &SqlitePool, rows: &[Vec<Cell>]) -> Result<ImportSummary> {
    let stores = sqlite_stores(pool);
    let sheet = SqliteRowStore::new(pool.clone());

    let invalidated_from = first_changed_row(&sheet, rows)
        .await?
        .map(|pos| pos.max(FIRST_DATA_ROW));
    let (cursors_reset, entries_removed) = match invalidated_from {
        Some(first) => {
            let cursors_reset = cursor::reset_all(stores.props.as_ref()).await?;
            let entries_removed = stores.cache.clear(ClearScope::FromRow(first)).await?;
            info!(first, cursors_reset, entries_removed, "import invalidated cached rows");
            (cursors_reset, entries_removed)
        }
        None => (0, 0),
    };

    let last = sheet.put_rows(1, rows).await?;
    let removed = sheet.truncate_after(last).await?;
    Ok(ImportSummary {
        rows: rows.len(),
        data_rows: rows.len().saturating_sub(HEADER_ROWS as usize),
        removed,
        invalidated_from,
        cursors_reset,
        entries_removed,
    })
}

/// Run the import command.
pub async fn run_import(config: &Config, path: &Path) -> Result<ImportSummary> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read snapshot: {}", path.display()))?;
    let rows = parse_snapshot(&content)?;

    let pool = db::connect(config).await?;
    let summary = import_rows(&pool, &rows).await?;
    pool.close().await;

    info!(
        rows = summary.rows,
        data_rows = summary.data_rows,
        removed = summary.removed,
        "sheet imported"
    );
    Ok(summary)
}

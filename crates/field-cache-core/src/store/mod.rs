//! Storage abstractions for Field Cache.
//!
//! Three traits cover every piece of persistent state the engine touches:
//!
//! | Trait | Backs |
//! |-------|-------|
//! | [`RowStore`] | The tabular sheet (two header rows + data rows) |
//! | [`PropertyStore`] | Process-wide string slots: header map, selection, cursors |
//! | [`LayerCache`] | Per-(row, layer) enrichment documents |
//!
//! Implementations must be `Send + Sync` to work with async runtimes.
//! Errors from the backing medium propagate unchanged; nothing in this
//! layer retries.

pub mod memory;

use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use serde_json::Value;

use crate::models::{CacheEntry, Cell, Layer, RowPosition, RowRange};

/// Read/write access to the physical sheet.
///
/// Pure I/O: writes are visible to the very next read.
#[async_trait]
pub trait RowStore: Send + Sync {
    /// Rows in `range` (inclusive), clipped to the rows that exist.
    async fn get_rows(&self, range: RowRange) -> Result<Vec<Vec<Cell>>>;

    /// A single row; empty when the position does not exist.
    async fn get_row(&self, pos: RowPosition) -> Result<Vec<Cell>>;

    /// Overwrite one cell, growing the row with empty cells if needed.
    async fn set_cell(&self, pos: RowPosition, column: usize, value: Cell) -> Result<()>;

    /// Position of the last row, or `0` for an empty sheet.
    async fn last_row_position(&self) -> Result<RowPosition>;
}

/// String key → string value slots, JSON-encoded by callers.
#[async_trait]
pub trait PropertyStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<String>>;

    async fn set(&self, key: &str, value: &str) -> Result<()>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Delete every key starting with `prefix`. Returns the count removed.
    async fn delete_prefix(&self, prefix: &str) -> Result<u64>;

    /// All keys starting with `prefix`, sorted.
    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>>;

    /// Atomically replace `key` if its current value equals `expected`
    /// (`None` = key absent). Returns whether the swap happened.
    async fn compare_and_swap(&self, key: &str, expected: Option<&str>, new: &str)
        -> Result<bool>;
}

/// Which part of the layer cache to clear.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClearScope {
    Layer(Layer),
    /// Every layer of every row at or after this position.
    FromRow(RowPosition),
    All,
}

/// Aggregate numbers for one layer, used by the status view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerCacheStats {
    pub layer: Layer,
    pub rows: u64,
    pub oldest: Option<chrono::DateTime<Utc>>,
    pub newest: Option<chrono::DateTime<Utc>>,
}

/// Per-(row, layer) document cache.
#[async_trait]
pub trait LayerCache: Send + Sync {
    async fn get(&self, row: RowPosition, layer: Layer) -> Result<Option<CacheEntry>>;

    /// Replace the entry for `(entry.row, entry.layer)` whole.
    async fn put_entry(&self, entry: CacheEntry) -> Result<()>;

    /// Remove entries; returns how many were deleted.
    async fn clear(&self, scope: ClearScope) -> Result<u64>;

    async fn stats(&self, layer: Layer) -> Result<LayerCacheStats>;

    /// Store `payload` for `(row, layer)` stamped with the current time.
    async fn put(
        &self,
        row: RowPosition,
        layer: Layer,
        payload: Value,
        selection_fingerprint: &str,
    ) -> Result<CacheEntry> {
        let entry = CacheEntry {
            row,
            layer,
            payload,
            cached_at: Utc::now(),
            selection_fingerprint: selection_fingerprint.to_string(),
        };
        self.put_entry(entry.clone()).await?;
        Ok(entry)
    }

    /// Every layer's entry for `row`, in priority order.
    async fn get_all(&self, row: RowPosition) -> Result<Vec<(Layer, Option<CacheEntry>)>> {
        let mut out = Vec::with_capacity(Layer::ALL.len());
        for layer in Layer::ALL {
            out.push((layer, self.get(row, layer).await?));
        }
        Ok(out)
    }
}

/// The three stores an engine instance works against.
#[derive(Clone)]
pub struct Stores {
    pub rows: Arc<dyn RowStore>,
    pub props: Arc<dyn PropertyStore>,
    pub cache: Arc<dyn LayerCache>,
}

impl Stores {
    /// Fresh in-memory stores over `rows`.
    pub fn in_memory(rows: Vec<Vec<Cell>>) -> Self {
        Self {
            rows: Arc::new(memory::InMemoryRowStore::from_rows(rows)),
            props: Arc::new(memory::InMemoryPropertyStore::new()),
            cache: Arc::new(memory::InMemoryLayerCache::new()),
        }
    }
}

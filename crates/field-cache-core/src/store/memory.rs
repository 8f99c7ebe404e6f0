//! In-memory store implementations for testing and embedding.
//!
//! Uses `BTreeMap` and `Vec` behind `std::sync::RwLock` for thread safety.

use std::collections::BTreeMap;
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use anyhow::{anyhow, Result};
use async_trait::async_trait;

use crate::models::{CacheEntry, Cell, Layer, RowPosition, RowRange};

use super::{ClearScope, LayerCache, LayerCacheStats, PropertyStore, RowStore};

fn read<T>(lock: &RwLock<T>) -> Result<RwLockReadGuard<'_, T>> {
    lock.read().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

fn write<T>(lock: &RwLock<T>) -> Result<RwLockWriteGuard<'_, T>> {
    lock.write().map_err(|_| anyhow!("in-memory store lock poisoned"))
}

/// In-memory sheet. Row position `n` is `rows[n - 1]`.
pub struct InMemoryRowStore {
    rows: RwLock<Vec<Vec<Cell>>>,
}

impl InMemoryRowStore {
    pub fn new() -> Self {
        Self::from_rows(Vec::new())
    }

    pub fn from_rows(rows: Vec<Vec<Cell>>) -> Self {
        Self {
            rows: RwLock::new(rows),
        }
    }

    /// Replace the whole sheet, e.g. to simulate a column reorder.
    pub fn replace_rows(&self, rows: Vec<Vec<Cell>>) -> Result<()> {
        *write(&self.rows)? = rows;
        Ok(())
    }

    pub fn push_row(&self, row: Vec<Cell>) -> Result<RowPosition> {
        let mut rows = write(&self.rows)?;
        rows.push(row);
        Ok(rows.len() as RowPosition)
    }
}

impl Default for InMemoryRowStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RowStore for InMemoryRowStore {
    async fn get_rows(&self, range: RowRange) -> Result<Vec<Vec<Cell>>> {
        let rows = read(&self.rows)?;
        if range.is_empty() {
            return Ok(Vec::new());
        }
        let start = range.start.max(1) as usize - 1;
        let end = (range.end.max(0) as usize).min(rows.len());
        if start >= end {
            return Ok(Vec::new());
        }
        Ok(rows[start..end].to_vec())
    }

    async fn get_row(&self, pos: RowPosition) -> Result<Vec<Cell>> {
        let rows = read(&self.rows)?;
        if pos < 1 {
            return Ok(Vec::new());
        }
        Ok(rows.get(pos as usize - 1).cloned().unwrap_or_default())
    }

    async fn set_cell(&self, pos: RowPosition, column: usize, value: Cell) -> Result<()> {
        let mut rows = write(&self.rows)?;
        if pos < 1 || pos as usize > rows.len() {
            return Err(anyhow!("row {} does not exist", pos));
        }
        let row = &mut rows[pos as usize - 1];
        if row.len() <= column {
            row.resize(column + 1, Cell::Null);
        }
        row[column] = value;
        Ok(())
    }

    async fn last_row_position(&self) -> Result<RowPosition> {
        Ok(read(&self.rows)?.len() as RowPosition)
    }
}

/// In-memory property slots.
pub struct InMemoryPropertyStore {
    props: RwLock<BTreeMap<String, String>>,
}

impl InMemoryPropertyStore {
    pub fn new() -> Self {
        Self {
            props: RwLock::new(BTreeMap::new()),
        }
    }
}

impl Default for InMemoryPropertyStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl PropertyStore for InMemoryPropertyStore {
    async fn get(&self, key: &str) -> Result<Option<String>> {
        Ok(read(&self.props)?.get(key).cloned())
    }

    async fn set(&self, key: &str, value: &str) -> Result<()> {
        write(&self.props)?.insert(key.to_string(), value.to_string());
        Ok(())
    }

    async fn delete(&self, key: &str) -> Result<()> {
        write(&self.props)?.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<u64> {
        let mut props = write(&self.props)?;
        let before = props.len();
        props.retain(|k, _| !k.starts_with(prefix));
        Ok((before - props.len()) as u64)
    }

    async fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(read(&self.props)?
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn compare_and_swap(
        &self,
        key: &str,
        expected: Option<&str>,
        new: &str,
    ) -> Result<bool> {
        let mut props = write(&self.props)?;
        if props.get(key).map(String::as_str) != expected {
            return Ok(false);
        }
        props.insert(key.to_string(), new.to_string());
        Ok(true)
    }
}

/// In-memory layer cache keyed by `(row, layer)`.
pub struct InMemoryLayerCache {
    entries: RwLock<BTreeMap<(RowPosition, Layer), CacheEntry>>,
}

impl InMemoryLayerCache {
    pub fn new() -> Self {
        Self {
            entries: RwLock::new(BTreeMap::new()),
        }
    }

    pub fn len(&self) -> usize {
        self.entries.read().map(|e| e.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for InMemoryLayerCache {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl LayerCache for InMemoryLayerCache {
    async fn get(&self, row: RowPosition, layer: Layer) -> Result<Option<CacheEntry>> {
        Ok(read(&self.entries)?.get(&(row, layer)).cloned())
    }

    async fn put_entry(&self, entry: CacheEntry) -> Result<()> {
        write(&self.entries)?.insert((entry.row, entry.layer), entry);
        Ok(())
    }

    async fn clear(&self, scope: ClearScope) -> Result<u64> {
        let mut entries = write(&self.entries)?;
        let before = entries.len();
        match scope {
            ClearScope::All => entries.clear(),
            ClearScope::Layer(layer) => entries.retain(|(_, l), _| *l != layer),
            ClearScope::FromRow(first) => entries.retain(|(row, _), _| *row < first),
        }
        Ok((before - entries.len()) as u64)
    }

    async fn stats(&self, layer: Layer) -> Result<LayerCacheStats> {
        let entries = read(&self.entries)?;
        let stamps: Vec<_> = entries
            .values()
            .filter(|e| e.layer == layer)
            .map(|e| e.cached_at)
            .collect();
        Ok(LayerCacheStats {
            layer,
            rows: stamps.len() as u64,
            oldest: stamps.iter().min().copied(),
            newest: stamps.iter().max().copied(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn sheet() -> InMemoryRowStore {
        InMemoryRowStore::from_rows(vec![
            vec![json!("Case_Organization")],
            vec![json!("Case_ID")],
            vec![json!("C1")],
            vec![json!("C2")],
        ])
    }

    #[tokio::test]
    async fn get_rows_clips_to_existing() {
        let store = sheet();
        let rows = store.get_rows(RowRange::new(3, 10)).await.unwrap();
        assert_eq!(rows.len(), 2);
        assert!(store
            .get_rows(RowRange::new(9, 10))
            .await
            .unwrap()
            .is_empty());
        assert_eq!(store.last_row_position().await.unwrap(), 4);
    }

    #[tokio::test]
    async fn set_cell_is_visible_immediately() {
        let store = sheet();
        store.set_cell(3, 2, json!("x")).await.unwrap();
        let row = store.get_row(3).await.unwrap();
        assert_eq!(row, vec![json!("C1"), Cell::Null, json!("x")]);
        assert!(store.set_cell(99, 0, json!("y")).await.is_err());
    }

    #[tokio::test]
    async fn compare_and_swap_semantics() {
        let props = InMemoryPropertyStore::new();
        assert!(props.compare_and_swap("k", None, "1").await.unwrap());
        assert!(!props.compare_and_swap("k", None, "2").await.unwrap());
        assert!(props.compare_and_swap("k", Some("1"), "2").await.unwrap());
        assert_eq!(props.get("k").await.unwrap().as_deref(), Some("2"));
    }

    #[tokio::test]
    async fn delete_prefix_only_touches_prefix() {
        let props = InMemoryPropertyStore::new();
        props.set("cursor:a", "1").await.unwrap();
        props.set("cursor:b", "2").await.unwrap();
        props.set("selection", "[]").await.unwrap();
        assert_eq!(props.delete_prefix("cursor:").await.unwrap(), 2);
        assert_eq!(props.keys_with_prefix("").await.unwrap(), vec!["selection"]);
    }

    #[tokio::test]
    async fn layer_cache_clear_by_layer() {
        let cache = InMemoryLayerCache::new();
        cache.put(3, Layer::Basic, json!({}), "fp").await.unwrap();
        cache.put(3, Layer::Vitals, json!({}), "fp").await.unwrap();
        cache.put(4, Layer::Vitals, json!({}), "fp").await.unwrap();

        assert_eq!(cache.clear(ClearScope::Layer(Layer::Vitals)).await.unwrap(), 2);
        assert!(cache.get(3, Layer::Basic).await.unwrap().is_some());
        assert_eq!(cache.stats(Layer::Basic).await.unwrap().rows, 1);
        assert_eq!(cache.clear(ClearScope::All).await.unwrap(), 1);
        assert!(cache.is_empty());
    }

    #[tokio::test]
    async fn layer_cache_clear_from_row() {
        let cache = InMemoryLayerCache::new();
        cache.put(3, Layer::Basic, json!({}), "fp").await.unwrap();
        cache.put(4, Layer::Basic, json!({}), "fp").await.unwrap();
        cache.put(5, Layer::Vitals, json!({}), "fp").await.unwrap();

        assert_eq!(cache.clear(ClearScope::FromRow(4)).await.unwrap(), 2);
        assert!(cache.get(3, Layer::Basic).await.unwrap().is_some());
        assert!(cache.get(4, Layer::Basic).await.unwrap().is_none());
    }
}

//! Batch Cursor: positional resumption over the row store.
//!
//! One cursor exists per requested layer set, stored under
//! `batch_cursor:<layers>`. It records the last row position whose
//! requested layers were all committed. Resumption is strictly positional:
//! rows gain their case identifier during enrichment, so identity cannot
//! tell an unprocessed row apart from anything else.
//!
//! Advancement is a compare-and-swap from `P` to `P + 1`. A lost swap or an
//! out-of-order commit is an error, never a silent skip.

use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::debug;

use crate::models::{Layer, RowPosition, HEADER_ROWS};
use crate::store::{PropertyStore, RowStore};

/// Prefix shared by every cursor key.
pub const CURSOR_KEY_PREFIX: &str = "batch_cursor:";

/// Normalize a layer set: sorted by priority, deduplicated, empty → all.
pub fn normalize_layers(layers: &[Layer]) -> Vec<Layer> {
    let mut layers = layers.to_vec();
    if layers.is_empty() {
        layers.extend(Layer::ALL);
    }
    layers.sort();
    layers.dedup();
    layers
}

/// Property key of the cursor for a layer set.
pub fn cursor_key(layers: &[Layer]) -> String {
    let names: Vec<&str> = normalize_layers(layers).iter().map(Layer::as_str).collect();
    format!("{}{}", CURSOR_KEY_PREFIX, names.join(","))
}

/// Every committed cursor as `(layer set, position)`.
pub async fn committed_cursors(props: &dyn PropertyStore) -> Result<Vec<(String, RowPosition)>> {
    let mut out = Vec::new();
    for key in props.keys_with_prefix(CURSOR_KEY_PREFIX).await? {
        if let Some(raw) = props.get(&key).await? {
            let pos = parse_position(&key, &raw)?;
            out.push((key[CURSOR_KEY_PREFIX.len()..].to_string(), pos));
        }
    }
    Ok(out)
}

/// Reset every cursor to unset. Returns how many were removed.
pub async fn reset_all(props: &dyn PropertyStore) -> Result<u64> {
    props.delete_prefix(CURSOR_KEY_PREFIX).await
}

fn parse_position(key: &str, raw: &str) -> Result<RowPosition> {
    raw.trim()
        .parse::<RowPosition>()
        .with_context(|| format!("Corrupt cursor value '{}' in '{}'", raw, key))
}

pub struct BatchCursor {
    rows: Arc<dyn RowStore>,
    props: Arc<dyn PropertyStore>,
    layers: Vec<Layer>,
    key: String,
}

impl BatchCursor {
    pub fn new(rows: Arc<dyn RowStore>, props: Arc<dyn PropertyStore>, layers: &[Layer]) -> Self {
        let layers = normalize_layers(layers);
        let key = cursor_key(&layers);
        Self {
            rows,
            props,
            layers,
            key,
        }
    }

    pub fn layers(&self) -> &[Layer] {
        &self.layers
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    async fn raw(&self) -> Result<Option<String>> {
        self.props.get(&self.key).await
    }

    /// The last committed row position, or `None` when unset.
    pub async fn committed(&self) -> Result<Option<RowPosition>> {
        match self.raw().await? {
            Some(raw) => Ok(Some(parse_position(&self.key, &raw)?)),
            None => Ok(None),
        }
    }

    /// `P`: the committed position, or the last header row when unset.
    pub async fn position(&self) -> Result<RowPosition> {
        Ok(self.committed().await?.unwrap_or(HEADER_ROWS))
    }

    /// Up to `max_size` consecutive positions after `P` that exist.
    ///
    /// Empty when `P` has reached the last row: the job is complete.
    pub async fn next_batch(&self, max_size: usize) -> Result<Vec<RowPosition>> {
        let p = self.position().await?;
        let last = self.rows.last_row_position().await?;
        if max_size == 0 || p >= last {
            return Ok(Vec::new());
        }
        let take = RowPosition::try_from(max_size).unwrap_or(RowPosition::MAX);
        let end = p.saturating_add(take).min(last);
        debug!(cursor = %self.key, from = p + 1, to = end, "next batch");
        Ok(((p + 1)..=end).collect())
    }

    /// Advance the cursor to `row`, which must be exactly `P + 1`.
    pub async fn commit(&self, row: RowPosition) -> Result<RowPosition> {
        let current = self.raw().await?;
        let p = match &current {
            Some(raw) => parse_position(&self.key, raw)?,
            None => HEADER_ROWS,
        };
        if row != p + 1 {
            bail!(
                "Cannot commit row {} on cursor '{}': next expected row is {}",
                row,
                self.key,
                p + 1
            );
        }
        let swapped = self
            .props
            .compare_and_swap(&self.key, current.as_deref(), &row.to_string())
            .await?;
        if !swapped {
            bail!(
                "Cursor '{}' moved concurrently while committing row {}",
                self.key,
                row
            );
        }
        Ok(row)
    }
}

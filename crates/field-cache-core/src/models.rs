//! Core data models shared by every Field Cache component.
//!
//! Rows are addressed by their 1-based **row position** in the backing
//! sheet. Positions `1..=HEADER_ROWS` hold the two header tiers; data rows
//! start at [`FIRST_DATA_ROW`].

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// 1-based position of a row in the backing sheet.
pub type RowPosition = i64;

/// A single sheet cell. Empty cells are [`Value::Null`].
pub type Cell = Value;

/// Number of header rows (tier-1 category, tier-2 field name).
pub const HEADER_ROWS: RowPosition = 2;

/// Position of the first data row.
pub const FIRST_DATA_ROW: RowPosition = HEADER_ROWS + 1;

/// Render a cell as text. Returns `None` for empty or non-scalar cells.
pub fn cell_text(cell: &Cell) -> Option<String> {
    match cell {
        Value::String(s) => Some(s.clone()),
        Value::Number(n) => Some(n.to_string()),
        Value::Bool(b) => Some(b.to_string()),
        Value::Null | Value::Array(_) | Value::Object(_) => None,
    }
}

/// Inclusive range of row positions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RowRange {
    pub start: RowPosition,
    pub end: RowPosition,
}

impl RowRange {
    pub fn new(start: RowPosition, end: RowPosition) -> Self {
        Self { start, end }
    }

    pub fn is_empty(&self) -> bool {
        self.end < self.start
    }

    pub fn len(&self) -> usize {
        if self.is_empty() {
            0
        } else {
            (self.end - self.start + 1) as usize
        }
    }
}

/// One of the seven independently cacheable semantic slices of a row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Layer {
    Basic,
    Learning,
    Metadata,
    Demographics,
    Vitals,
    Clinical,
    Environment,
}

impl Layer {
    /// All layers in priority order.
    pub const ALL: [Layer; 7] = [
        Layer::Basic,
        Layer::Learning,
        Layer::Metadata,
        Layer::Demographics,
        Layer::Vitals,
        Layer::Clinical,
        Layer::Environment,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            Layer::Basic => "basic",
            Layer::Learning => "learning",
            Layer::Metadata => "metadata",
            Layer::Demographics => "demographics",
            Layer::Vitals => "vitals",
            Layer::Clinical => "clinical",
            Layer::Environment => "environment",
        }
    }

    /// 1-based enrichment priority (basic first).
    pub fn priority(&self) -> usize {
        Layer::ALL
            .iter()
            .position(|l| l == self)
            .map(|i| i + 1)
            .unwrap_or(0)
    }

    /// Parse a comma-separated layer list; `all` expands to every layer.
    ///
    /// The result is deduplicated and sorted by priority.
    pub fn parse_list(s: &str) -> Result<Vec<Layer>> {
        let mut layers = Vec::new();
        for part in s.split(',').map(str::trim).filter(|p| !p.is_empty()) {
            if part == "all" {
                layers.extend(Layer::ALL);
            } else {
                layers.push(part.parse()?);
            }
        }
        if layers.is_empty() {
            bail!("no layers given");
        }
        layers.sort();
        layers.dedup();
        Ok(layers)
    }
}

impl fmt::Display for Layer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Layer {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        Layer::ALL
            .iter()
            .copied()
            .find(|l| l.as_str() == s)
            .ok_or_else(|| {
                anyhow::anyhow!(
                    "Unknown layer: '{}'. Must be one of basic, learning, metadata, \
                     demographics, vitals, clinical, environment.",
                    s
                )
            })
    }
}

/// Semantic field name → physical column index, captured at refresh time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeaderMap {
    pub columns: BTreeMap<String, usize>,
    pub refreshed_at: DateTime<Utc>,
}

impl HeaderMap {
    pub fn get(&self, name: &str) -> Option<usize> {
        self.columns.get(name).copied()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }

    /// The field catalog in physical column order.
    pub fn catalog(&self) -> Vec<String> {
        let mut pairs: Vec<(&String, &usize)> = self.columns.iter().collect();
        pairs.sort_by_key(|(_, idx)| **idx);
        pairs.into_iter().map(|(name, _)| name.clone()).collect()
    }
}

/// A persisted enrichment result for one (row, layer) pair.
///
/// Entries are only ever replaced whole; there is no partial update.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub row: RowPosition,
    pub layer: Layer,
    pub payload: Value,
    pub cached_at: DateTime<Utc>,
    /// Fingerprint of the field selection in force when computed.
    pub selection_fingerprint: String,
}

/// The structured document produced by the enrichment computer.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LayerDocument {
    pub row: RowPosition,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub case_id: Option<String>,
    /// Layer-local short key → value. Unreadable cells are `null`.
    pub fields: BTreeMap<String, Value>,
    /// Selected fields outside every layer's fixed set (basic layer only).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extras: BTreeMap<String, Value>,
    /// Short keys whose structured value failed to parse and were kept raw.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub parse_failures: Vec<String>,
    /// Short keys whose column could not be resolved at all.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub unresolved: Vec<String>,
}

/// Per-layer bookkeeping inside a [`HolisticDocument`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LayerStatus {
    pub layer: Layer,
    pub present: bool,
    pub cached_at: Option<DateTime<Utc>>,
    /// `cached_at` is older than the TTL.
    pub expired: bool,
    /// The field selection changed since this layer was cached.
    pub selection_changed: bool,
}

/// Merged view across every cached layer of one row.
///
/// Derived and recomputed on demand; never a source of truth.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HolisticDocument {
    pub row: RowPosition,
    pub case_id: Option<String>,
    /// `"<layer>.<key>"` → value.
    pub fields: BTreeMap<String, Value>,
    pub layers: Vec<LayerStatus>,
    pub missing: Vec<Layer>,
    pub stale: bool,
    /// `"<layer>.<key>"` values kept raw because they failed to parse.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub parse_failures: Vec<String>,
    /// `"<layer>.<key>"` fields whose column could not be resolved.
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub unresolved: Vec<String>,
}

impl HolisticDocument {
    pub fn present_layers(&self) -> Vec<Layer> {
        self.layers
            .iter()
            .filter(|s| s.present)
            .map(|s| s.layer)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn layer_roundtrip_names() {
        for layer in Layer::ALL {
            assert_eq!(layer.as_str().parse::<Layer>().unwrap(), layer);
        }
        assert!("nope".parse::<Layer>().is_err());
    }

    #[test]
    fn layer_priority_follows_declaration_order() {
        assert_eq!(Layer::Basic.priority(), 1);
        assert_eq!(Layer::Environment.priority(), 7);
    }

    #[test]
    fn parse_list_sorts_and_dedups() {
        let layers = Layer::parse_list("vitals, basic,vitals").unwrap();
        assert_eq!(layers, vec![Layer::Basic, Layer::Vitals]);
        assert_eq!(Layer::parse_list("all").unwrap().len(), 7);
        assert!(Layer::parse_list(" , ").is_err());
    }

    #[test]
    fn row_range_len() {
        assert_eq!(RowRange::new(3, 27).len(), 25);
        assert_eq!(RowRange::new(5, 4).len(), 0);
        assert!(RowRange::new(5, 4).is_empty());
    }

    #[test]
    fn cell_text_scalars() {
        assert_eq!(cell_text(&Value::Null), None);
        assert_eq!(cell_text(&serde_json::json!(42)), Some("42".to_string()));
        assert_eq!(cell_text(&serde_json::json!("x")), Some("x".to_string()));
    }

    #[test]
    fn catalog_is_in_column_order() {
        let mut columns = BTreeMap::new();
        columns.insert("B".to_string(), 0);
        columns.insert("A".to_string(), 1);
        let map = HeaderMap {
            columns,
            refreshed_at: Utc::now(),
        };
        assert_eq!(map.catalog(), vec!["B".to_string(), "A".to_string()]);
    }
}

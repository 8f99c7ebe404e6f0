//! Schema Resolver: semantic field name → physical column index.
//!
//! The sheet carries two header rows. Row 1 holds tier-1 category labels
//! (only set on the first column of each merged category, so they carry
//! forward), row 2 holds tier-2 field names. The semantic name of a column
//! is `{tier1}_{tier2}`, or just tier-2 when it already carries the
//! category prefix or no category is in force.
//!
//! The resulting [`HeaderMap`] is cached in a single property slot. It has
//! no expiry: callers refresh it explicitly after a layout change. A
//! missing slot triggers an implicit refresh.

use std::collections::BTreeMap;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Utc};
use tracing::{debug, info, warn};

use crate::fields::FieldRef;
use crate::models::{cell_text, Cell, HeaderMap, RowRange, HEADER_ROWS};
use crate::store::{PropertyStore, RowStore};

/// Property key holding the JSON-encoded [`HeaderMap`].
pub const HEADER_MAP_KEY: &str = "header_map";

/// Outcome of resolving one semantic name against the header map.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Column(usize),
    /// The name is not in the header map. Not an error.
    NotFound,
}

impl Resolution {
    pub fn column(&self) -> Option<usize> {
        match self {
            Resolution::Column(c) => Some(*c),
            Resolution::NotFound => None,
        }
    }
}

/// Build a header map from the two raw header rows.
///
/// Fails when tier-2 carries no field names at all. Duplicate semantic
/// names keep their first column.
pub fn build_header_map(
    tier1: &[Cell],
    tier2: &[Cell],
    refreshed_at: DateTime<Utc>,
) -> Result<HeaderMap> {
    let mut columns = BTreeMap::new();
    let mut category = String::new();

    for (idx, cell) in tier2.iter().enumerate() {
        if let Some(label) = tier1.get(idx).and_then(cell_text) {
            let label = label.trim();
            if !label.is_empty() {
                category = label.to_string();
            }
        }

        let Some(name) = cell_text(cell) else {
            continue;
        };
        let name = name.trim();
        if name.is_empty() {
            continue;
        }

        let semantic = if category.is_empty() || name.starts_with(&format!("{}_", category)) {
            name.to_string()
        } else {
            format!("{}_{}", category, name)
        };
        columns.entry(semantic).or_insert(idx);
    }

    if columns.is_empty() {
        bail!("Header rows are empty or unreadable; cannot build header map");
    }

    Ok(HeaderMap {
        columns,
        refreshed_at,
    })
}

/// Resolve a field to a column, falling back to its legacy index.
///
/// The fallback is logged every time it is taken. Returns `None` only for
/// custom fields that have no legacy index.
pub fn resolve_with_fallback(map: &HeaderMap, field: &FieldRef) -> Option<usize> {
    if let Some(idx) = map.get(field.as_str()) {
        return Some(idx);
    }
    match field.legacy_index() {
        Some(idx) => {
            warn!(
                field = field.as_str(),
                index = idx,
                "header not found, using legacy fallback index"
            );
            Some(idx)
        }
        None => {
            warn!(field = field.as_str(), "header not found and no fallback index");
            None
        }
    }
}

/// Owns the header map slot.
pub struct SchemaResolver {
    rows: Arc<dyn RowStore>,
    props: Arc<dyn PropertyStore>,
}

impl SchemaResolver {
    pub fn new(rows: Arc<dyn RowStore>, props: Arc<dyn PropertyStore>) -> Self {
        Self { rows, props }
    }

    /// Re-read the header rows and replace the cached map.
    ///
    /// On failure the previous map is left in place.
    pub async fn refresh(&self) -> Result<HeaderMap> {
        let headers = self
            .rows
            .get_rows(RowRange::new(1, HEADER_ROWS))
            .await
            .context("Failed to read header rows")?;
        if headers.len() < HEADER_ROWS as usize {
            bail!(
                "Header rows are empty or unreadable: expected {} rows, found {}",
                HEADER_ROWS,
                headers.len()
            );
        }

        let map = build_header_map(&headers[0], &headers[1], Utc::now())?;
        let json = serde_json::to_string(&map)?;
        self.props.set(HEADER_MAP_KEY, &json).await?;
        info!(fields = map.len(), "header map refreshed");
        Ok(map)
    }

    /// The cached map, if any. Never refreshes.
    pub async fn cached(&self) -> Result<Option<HeaderMap>> {
        match self.props.get(HEADER_MAP_KEY).await? {
            Some(json) => {
                let map = serde_json::from_str(&json)
                    .with_context(|| format!("Corrupt header map in '{}'", HEADER_MAP_KEY))?;
                Ok(Some(map))
            }
            None => Ok(None),
        }
    }

    /// The cached map, refreshing implicitly when the slot is empty.
    pub async fn header_map(&self) -> Result<HeaderMap> {
        match self.cached().await? {
            Some(map) => Ok(map),
            None => {
                debug!("no cached header map, refreshing");
                self.refresh().await
            }
        }
    }

    /// Look up each name in the cached map.
    pub async fn resolve(&self, names: &[FieldRef]) -> Result<BTreeMap<String, Resolution>> {
        let map = self.header_map().await?;
        Ok(names
            .iter()
            .map(|name| {
                let res = match map.get(name.as_str()) {
                    Some(idx) => Resolution::Column(idx),
                    None => Resolution::NotFound,
                };
                (name.as_str().to_string(), res)
            })
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fields::KnownField;
    use crate::store::memory::{InMemoryPropertyStore, InMemoryRowStore};
    use serde_json::json;

    fn headers() -> Vec<Vec<Cell>> {
        vec![
            vec![
                json!("Case_Organization"),
                Cell::Null,
                json!("Patient_Demographics_and_Clinical_Data"),
                Cell::Null,
            ],
            vec![
                json!("Case_ID"),
                json!("Spark_Title"),
                json!("Age"),
                json!("Patient_Demographics_and_Clinical_Data_Gender"),
            ],
        ]
    }

    fn resolver(rows: Vec<Vec<Cell>>) -> (Arc<InMemoryRowStore>, SchemaResolver) {
        let store = Arc::new(InMemoryRowStore::from_rows(rows));
        let props = Arc::new(InMemoryPropertyStore::new());
        (store.clone(), SchemaResolver::new(store, props))
    }

    #[test]
    fn tier1_carries_forward() {
        let h = headers();
        let map = build_header_map(&h[0], &h[1], Utc::now()).unwrap();
        assert_eq!(map.get("Case_Organization_Case_ID"), Some(0));
        assert_eq!(map.get("Case_Organization_Spark_Title"), Some(1));
        assert_eq!(map.get("Patient_Demographics_and_Clinical_Data_Age"), Some(2));
        // Already prefixed names are not doubled.
        assert_eq!(map.get("Patient_Demographics_and_Clinical_Data_Gender"), Some(3));
    }

    #[test]
    fn empty_tier2_is_fatal() {
        let err = build_header_map(&[json!("X")], &[Cell::Null, json!("  ")], Utc::now());
        assert!(err.is_err());
    }

    #[test]
    fn duplicate_names_keep_first_column() {
        let map = build_header_map(&[], &[json!("A"), json!("A")], Utc::now()).unwrap();
        assert_eq!(map.get("A"), Some(0));
    }

    #[tokio::test]
    async fn resolve_refreshes_implicitly_and_is_idempotent() {
        let (_, resolver) = resolver(headers());
        assert!(resolver.cached().await.unwrap().is_none());

        let names = vec![
            FieldRef::from(KnownField::CaseId),
            FieldRef::from("Nope_Missing"),
        ];
        let first = resolver.resolve(&names).await.unwrap();
        let second = resolver.resolve(&names).await.unwrap();
        assert_eq!(first, second);
        assert_eq!(first["Case_Organization_Case_ID"], Resolution::Column(0));
        assert_eq!(first["Nope_Missing"], Resolution::NotFound);
        assert!(resolver.cached().await.unwrap().is_some());
    }

    #[tokio::test]
    async fn refresh_recovers_after_reorder() {
        let (store, resolver) = resolver(headers());
        resolver.refresh().await.unwrap();

        store
            .replace_rows(vec![
                vec![
                    json!("Patient_Demographics_and_Clinical_Data"),
                    json!("Case_Organization"),
                    Cell::Null,
                ],
                vec![json!("Age"), json!("Spark_Title"), json!("Case_ID")],
            ])
            .unwrap();

        let names = vec![
            FieldRef::from(KnownField::CaseId),
            FieldRef::from(KnownField::SparkTitle),
            FieldRef::from(KnownField::Age),
        ];
        // Stale until refreshed.
        let stale = resolver.resolve(&names).await.unwrap();
        assert_eq!(stale["Case_Organization_Case_ID"], Resolution::Column(0));

        resolver.refresh().await.unwrap();
        let fresh = resolver.resolve(&names).await.unwrap();
        assert_eq!(fresh["Case_Organization_Case_ID"], Resolution::Column(2));
        assert_eq!(fresh["Case_Organization_Spark_Title"], Resolution::Column(1));
        assert_eq!(
            fresh["Patient_Demographics_and_Clinical_Data_Age"],
            Resolution::Column(0)
        );
    }

    #[tokio::test]
    async fn failed_refresh_keeps_previous_map() {
        let (store, resolver) = resolver(headers());
        let before = resolver.refresh().await.unwrap();
        store.replace_rows(vec![vec![], vec![]]).unwrap();
        assert!(resolver.refresh().await.is_err());
        assert_eq!(resolver.cached().await.unwrap(), Some(before));
    }

    #[test]
    fn fallback_uses_legacy_index() {
        let map = build_header_map(&[], &[json!("Other")], Utc::now()).unwrap();
        assert_eq!(
            resolve_with_fallback(&map, &FieldRef::from(KnownField::InitialVitals)),
            Some(55)
        );
        assert_eq!(
            resolve_with_fallback(&map, &FieldRef::from("Custom_Field")),
            None
        );
        assert_eq!(resolve_with_fallback(&map, &FieldRef::from("Other")), Some(0));
    }
}

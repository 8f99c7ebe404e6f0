//! Merge Engine: combine the cached layers of a row into one view.
//!
//! Fields are namespaced as `<layer>.<key>` so layers never collide. The
//! result is flagged stale when any present layer is older than the TTL or
//! was cached under a different field selection. Staleness is reported,
//! never acted on here.

use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};

use crate::models::{
    CacheEntry, HolisticDocument, Layer, LayerDocument, LayerStatus, RowPosition,
};
use crate::store::LayerCache;

/// `cached_at` is at least `ttl` old as of `now`.
pub fn is_expired(entry: &CacheEntry, ttl: Duration, now: DateTime<Utc>) -> bool {
    now - entry.cached_at >= ttl
}

/// Within `ttl` and computed under `fingerprint`.
pub fn is_fresh(entry: &CacheEntry, fingerprint: &str, ttl: Duration, now: DateTime<Utc>) -> bool {
    !is_expired(entry, ttl, now) && entry.selection_fingerprint == fingerprint
}

pub struct MergeEngine {
    cache: Arc<dyn LayerCache>,
    ttl: Duration,
}

impl MergeEngine {
    pub fn new(cache: Arc<dyn LayerCache>, ttl: Duration) -> Self {
        Self { cache, ttl }
    }

    pub fn ttl(&self) -> Duration {
        self.ttl
    }

    pub async fn merge(&self, row: RowPosition, fingerprint: &str) -> Result<HolisticDocument> {
        self.merge_at(row, fingerprint, Utc::now()).await
    }

    /// Merge as of `now`.
    pub async fn merge_at(
        &self,
        row: RowPosition,
        fingerprint: &str,
        now: DateTime<Utc>,
    ) -> Result<HolisticDocument> {
        let mut merged = HolisticDocument {
            row,
            case_id: None,
            fields: Default::default(),
            layers: Vec::with_capacity(Layer::ALL.len()),
            missing: Vec::new(),
            stale: false,
            parse_failures: Vec::new(),
            unresolved: Vec::new(),
        };

        for (layer, entry) in self.cache.get_all(row).await? {
            let Some(entry) = entry else {
                merged.missing.push(layer);
                merged.layers.push(LayerStatus {
                    layer,
                    present: false,
                    cached_at: None,
                    expired: false,
                    selection_changed: false,
                });
                continue;
            };

            let doc: LayerDocument = serde_json::from_value(entry.payload.clone())
                .with_context(|| format!("Corrupt cache entry for row {} layer {}", row, layer))?;
            if merged.case_id.is_none() {
                merged.case_id = doc.case_id.clone();
            }
            for (key, value) in doc.fields.into_iter().chain(doc.extras) {
                merged.fields.insert(format!("{}.{}", layer, key), value);
            }
            let namespaced = |key: String| format!("{}.{}", layer, key);
            merged
                .parse_failures
                .extend(doc.parse_failures.into_iter().map(namespaced));
            merged
                .unresolved
                .extend(doc.unresolved.into_iter().map(namespaced));

            let expired = is_expired(&entry, self.ttl, now);
            let selection_changed = entry.selection_fingerprint != fingerprint;
            merged.stale |= expired || selection_changed;
            merged.layers.push(LayerStatus {
                layer,
                present: true,
                cached_at: Some(entry.cached_at),
                expired,
                selection_changed,
            });
        }

        Ok(merged)
    }
}

//! The owning service.
//!
//! [`EnrichmentService`] holds the three stores and builds every engine
//! component from them. No component keeps ambient state of its own: the
//! header map, selection, and cursors all live in the property store and
//! are reached through this service.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Result};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::info;

use field_cache_core::cursor::{self, committed_cursors};
use field_cache_core::job::{EnrichmentJob, JobOptions, JobPlan};
use field_cache_core::merge::MergeEngine;
use field_cache_core::models::{HeaderMap, HolisticDocument, Layer, RowPosition, FIRST_DATA_ROW};
use field_cache_core::progress::ProgressReporter;
use field_cache_core::schema::SchemaResolver;
use field_cache_core::selection::{fingerprint, FieldSelectionStore};
use field_cache_core::store::{ClearScope, LayerCacheStats, Stores};

use crate::config::Config;
use crate::db;
use crate::recommend::{create_recommender, load_recommendation, Recommendation, RecommendationSlot, Recommender};
use crate::sqlite_store::sqlite_stores;

/// What a clear removed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ClearSummary {
    pub cursors_reset: u64,
    pub entries_removed: u64,
}

/// Committed progress of one cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CursorStatus {
    pub layers: String,
    pub position: RowPosition,
    pub rows_done: u64,
}

/// Snapshot for `fcache status`.
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    pub data_rows: u64,
    pub header_refreshed_at: Option<DateTime<Utc>>,
    pub header_fields: usize,
    pub selected_fields: usize,
    pub cursors: Vec<CursorStatus>,
    pub layers: Vec<LayerStats>,
}

#[derive(Debug, Clone, Serialize)]
pub struct LayerStats {
    pub layer: Layer,
    pub rows: u64,
    pub percent: u64,
    pub oldest: Option<DateTime<Utc>>,
    pub newest: Option<DateTime<Utc>>,
}

fn percent(done: u64, total: u64) -> u64 {
    if total == 0 {
        0
    } else {
        (done * 100 / total).min(100)
    }
}

pub struct EnrichmentService {
    config: Config,
    stores: Stores,
    recommender: Arc<dyn Recommender>,
}

impl EnrichmentService {
    /// Open the SQLite-backed service described by `config`.
    pub async fn open(config: &Config) -> Result<Self> {
        let pool = db::connect(config).await?;
        let recommender = create_recommender(&config.recommend)?;
        Ok(Self::with_stores(config.clone(), sqlite_stores(&pool), recommender))
    }

    pub fn with_stores(config: Config, stores: Stores, recommender: Arc<dyn Recommender>) -> Self {
        Self {
            config,
            stores,
            recommender,
        }
    }

    pub fn stores(&self) -> &Stores {
        &self.stores
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    fn schema(&self) -> SchemaResolver {
        SchemaResolver::new(self.stores.rows.clone(), self.stores.props.clone())
    }

    fn selection(&self) -> FieldSelectionStore {
        FieldSelectionStore::new(self.stores.props.clone())
    }

    fn merge_engine(&self) -> MergeEngine {
        MergeEngine::new(self.stores.cache.clone(), self.config.enrichment.ttl())
    }

    // ─── Headers and fields ───

    pub async fn refresh_headers(&self) -> Result<HeaderMap> {
        self.schema().refresh().await
    }

    /// The cached header map, refreshing when none is cached.
    pub async fn header_map(&self) -> Result<HeaderMap> {
        self.schema().header_map().await
    }

    pub async fn catalog(&self) -> Result<Vec<String>> {
        Ok(self.header_map().await?.catalog())
    }

    pub async fn effective_selection(&self) -> Result<Vec<String>> {
        let catalog = self.catalog().await?;
        self.selection().resolve_effective(&catalog).await
    }

    /// Save a selection. Every name must be in the catalog.
    pub async fn select_fields(&self, names: &[String]) -> Result<Vec<String>> {
        let map = self.header_map().await?;
        let unknown: Vec<&str> = names
            .iter()
            .filter(|n| map.get(n).is_none())
            .map(String::as_str)
            .collect();
        if !unknown.is_empty() {
            bail!("Unknown field(s): {}. See `fcache fields catalog`.", unknown.join(", "));
        }
        let selection = self.selection();
        selection.save(names).await?;
        selection.load().await
    }

    pub async fn reset_selection(&self) -> Result<()> {
        self.selection().clear().await
    }

    // ─── Batches ───

    /// Build a job over `layers`. `max_rows = None` runs to the end.
    pub async fn job(
        &self,
        layers: &[Layer],
        max_rows: Option<usize>,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Result<EnrichmentJob> {
        let header_map = self.header_map().await?;
        let selection = self.selection().resolve_effective(&header_map.catalog()).await?;
        Ok(EnrichmentJob::new(
            &self.stores,
            JobPlan {
                header_map,
                selection,
            },
            JobOptions {
                layers: layers.to_vec(),
                batch_size: self.config.enrichment.batch_size,
                max_rows,
                max_value_chars: self.config.enrichment.max_value_chars,
                ttl: self.config.enrichment.ttl(),
            },
            reporter,
        ))
    }

    /// Run a job to completion; returns rows committed.
    pub async fn run(
        &self,
        layers: &[Layer],
        max_rows: Option<usize>,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Result<u64> {
        let mut job = self.job(layers, max_rows, reporter).await?;
        Ok(job.run().await?)
    }

    /// Reset cursors, then clear the cache. Any clear resets every cursor.
    pub async fn clear(&self, scope: ClearScope) -> Result<ClearSummary> {
        let cursors_reset = cursor::reset_all(self.stores.props.as_ref()).await?;
        let entries_removed = self.stores.cache.clear(scope).await?;
        info!(cursors_reset, entries_removed, ?scope, "cache cleared");
        Ok(ClearSummary {
            cursors_reset,
            entries_removed,
        })
    }

    // ─── Views ───

    pub async fn merge(&self, row: RowPosition) -> Result<HolisticDocument> {
        let last = self.stores.rows.last_row_position().await?;
        if row < FIRST_DATA_ROW || row > last {
            bail!(
                "Row {} is not a data row (data rows are {}..={})",
                row,
                FIRST_DATA_ROW,
                last
            );
        }
        let fp = fingerprint(&self.effective_selection().await?);
        self.merge_engine().merge(row, &fp).await
    }

    /// Merged documents for every data row.
    pub async fn merge_all(&self) -> Result<Vec<HolisticDocument>> {
        let fp = fingerprint(&self.effective_selection().await?);
        let engine = self.merge_engine();
        let last = self.stores.rows.last_row_position().await?;
        let mut out = Vec::new();
        for row in FIRST_DATA_ROW..=last {
            out.push(engine.merge(row, &fp).await?);
        }
        Ok(out)
    }

    pub async fn status(&self) -> Result<CacheStatus> {
        let last = self.stores.rows.last_row_position().await?;
        let data_rows = (last - FIRST_DATA_ROW + 1).max(0) as u64;
        let header = self.schema().cached().await?;
        let selected_fields = self.selection().load().await?.len();

        let cursors = committed_cursors(self.stores.props.as_ref())
            .await?
            .into_iter()
            .map(|(layers, position)| CursorStatus {
                layers,
                position,
                rows_done: (position - FIRST_DATA_ROW + 1).max(0) as u64,
            })
            .collect();

        let mut layers = Vec::with_capacity(Layer::ALL.len());
        for layer in Layer::ALL {
            let LayerCacheStats {
                rows,
                oldest,
                newest,
                ..
            } = self.stores.cache.stats(layer).await?;
            layers.push(LayerStats {
                layer,
                rows,
                percent: percent(rows, data_rows),
                oldest,
                newest,
            });
        }

        Ok(CacheStatus {
            data_rows,
            header_refreshed_at: header.as_ref().map(|h| h.refreshed_at),
            header_fields: header.as_ref().map(HeaderMap::len).unwrap_or(0),
            selected_fields,
            cursors,
            layers,
        })
    }

    // ─── Recommendations ───

    /// Start a recommendation in the background.
    pub async fn start_recommendation(&self) -> Result<RecommendationSlot> {
        let catalog = self.catalog().await?;
        let current = self.effective_selection().await?;
        Ok(RecommendationSlot::spawn(
            self.recommender.clone(),
            self.stores.props.clone(),
            catalog,
            current,
            Duration::from_secs(self.config.recommend.timeout_secs),
            self.config.recommend.max_fields,
        ))
    }

    pub async fn stored_recommendation(&self) -> Result<Option<Recommendation>> {
        load_recommendation(self.stores.props.as_ref()).await
    }
}

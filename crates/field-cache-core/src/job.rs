//! Step-wise enrichment job.
//!
//! [`EnrichmentJob::step`] processes exactly one row: every requested
//! layer is computed (or skipped when already fresh) and cached, then the
//! batch cursor advances by one. A driver calls `step` repeatedly until
//! the outcome reports `done`, and may stop between any two calls.
//!
//! A failure inside a step leaves the cursor untouched, so the next run
//! retries the same row. Layers that did make it into the cache are fresh
//! on that retry and are skipped.

use std::collections::VecDeque;
use std::fmt;
use std::sync::Arc;
use std::time::Instant;

use anyhow::Result;
use chrono::{Duration, Utc};
use tracing::{debug, info};

use crate::cursor::BatchCursor;
use crate::enrich::EnrichmentComputer;
use crate::merge::is_fresh;
use crate::models::{HeaderMap, Layer, RowPosition};
use crate::progress::{ProgressEvent, ProgressReporter};
use crate::selection::fingerprint;
use crate::store::{LayerCache, Stores};

/// Tunables for one job run.
#[derive(Debug, Clone)]
pub struct JobOptions {
    pub layers: Vec<Layer>,
    /// Rows fetched per cursor batch.
    pub batch_size: usize,
    /// Stop after this many committed rows; `None` runs to the end.
    pub max_rows: Option<usize>,
    pub max_value_chars: usize,
    pub ttl: Duration,
}

/// Inputs resolved before a batch starts.
#[derive(Debug, Clone)]
pub struct JobPlan {
    pub header_map: HeaderMap,
    pub selection: Vec<String>,
}

/// What one call to [`EnrichmentJob::step`] did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct StepOutcome {
    /// No more work: end of store or row limit reached.
    pub done: bool,
    /// The row committed by this step.
    pub row: Option<RowPosition>,
    pub computed: Vec<Layer>,
    pub skipped: Vec<Layer>,
    /// Rows committed so far in this run.
    pub processed: u64,
}

/// A failed step, naming the row and (when known) the layer.
#[derive(Debug)]
pub struct StepError {
    pub row: RowPosition,
    pub layer: Option<Layer>,
    pub cause: anyhow::Error,
}

impl fmt::Display for StepError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.layer {
            Some(layer) => write!(f, "row {} layer {}: {:#}", self.row, layer, self.cause),
            None => write!(f, "row {}: {:#}", self.row, self.cause),
        }
    }
}

impl std::error::Error for StepError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        Some(&*self.cause)
    }
}

pub struct EnrichmentJob {
    cursor: BatchCursor,
    cache: Arc<dyn LayerCache>,
    computer: EnrichmentComputer,
    plan: JobPlan,
    fingerprint: String,
    options: JobOptions,
    reporter: Arc<dyn ProgressReporter>,
    pending: VecDeque<RowPosition>,
    processed: u64,
    finished: bool,
}

impl EnrichmentJob {
    pub fn new(
        stores: &Stores,
        plan: JobPlan,
        options: JobOptions,
        reporter: Arc<dyn ProgressReporter>,
    ) -> Self {
        let cursor = BatchCursor::new(stores.rows.clone(), stores.props.clone(), &options.layers);
        let computer = EnrichmentComputer::new(stores.rows.clone(), options.max_value_chars);
        let fingerprint = fingerprint(&plan.selection);
        Self {
            cursor,
            cache: stores.cache.clone(),
            computer,
            plan,
            fingerprint,
            options,
            reporter,
            pending: VecDeque::new(),
            processed: 0,
            finished: false,
        }
    }

    pub fn layers(&self) -> &[Layer] {
        self.cursor.layers()
    }

    pub fn processed(&self) -> u64 {
        self.processed
    }

    fn limit_reached(&self) -> bool {
        self.options
            .max_rows
            .is_some_and(|max| self.processed >= max as u64)
    }

    fn finish(&mut self) -> StepOutcome {
        if !self.finished {
            self.finished = true;
            info!(processed = self.processed, cursor = self.cursor.key(), "job finished");
            self.reporter.report(&ProgressEvent::Finished {
                processed: self.processed,
            });
        }
        StepOutcome {
            done: true,
            processed: self.processed,
            ..Default::default()
        }
    }

    /// Process the next row.
    pub async fn step(&mut self) -> std::result::Result<StepOutcome, StepError> {
        if self.finished || self.limit_reached() {
            return Ok(self.finish());
        }

        if self.pending.is_empty() {
            let want = match self.options.max_rows {
                Some(max) => self.options.batch_size.min(max - self.processed as usize),
                None => self.options.batch_size,
            };
            let batch = match self.cursor.next_batch(want).await {
                Ok(batch) => batch,
                Err(cause) => {
                    let next = self.cursor.position().await.map(|p| p + 1).unwrap_or(0);
                    return Err(self.fail(next, None, cause));
                }
            };
            match (batch.first(), batch.last()) {
                (Some(first), Some(last)) => {
                    self.reporter.report(&ProgressEvent::BatchStarted {
                        first: *first,
                        last: *last,
                    });
                }
                _ => return Ok(self.finish()),
            }
            self.pending.extend(batch);
        }

        let Some(row) = self.pending.front().copied() else {
            return Ok(self.finish());
        };

        let mut outcome = StepOutcome {
            row: Some(row),
            ..Default::default()
        };
        let layers = self.cursor.layers().to_vec();
        for layer in layers {
            match self.cache_layer(row, layer).await {
                Ok(true) => outcome.computed.push(layer),
                Ok(false) => outcome.skipped.push(layer),
                Err(cause) => {
                    self.pending.clear();
                    return Err(self.fail(row, Some(layer), cause));
                }
            }
        }

        if let Err(cause) = self.cursor.commit(row).await {
            self.pending.clear();
            return Err(self.fail(row, None, cause));
        }
        self.pending.pop_front();
        self.processed += 1;
        self.reporter.report(&ProgressEvent::RowCommitted {
            row,
            processed: self.processed,
        });

        outcome.processed = self.processed;
        if self.limit_reached() {
            self.finish();
            outcome.done = true;
        }
        Ok(outcome)
    }

    /// Run steps until done. Stops at the first failure.
    pub async fn run(&mut self) -> std::result::Result<u64, StepError> {
        loop {
            if self.step().await?.done {
                return Ok(self.processed);
            }
        }
    }

    /// Compute and cache one layer unless it is already fresh. Returns
    /// whether anything was computed.
    async fn cache_layer(&self, row: RowPosition, layer: Layer) -> Result<bool> {
        if let Some(entry) = self.cache.get(row, layer).await? {
            if is_fresh(&entry, &self.fingerprint, self.options.ttl, Utc::now()) {
                debug!(row, layer = %layer, "layer fresh, skipping");
                self.reporter
                    .report(&ProgressEvent::LayerSkipped { row, layer });
                return Ok(false);
            }
        }

        let started = Instant::now();
        let doc = self
            .computer
            .compute_layer(row, layer, &self.plan.header_map, &self.plan.selection)
            .await?;
        self.cache
            .put(row, layer, serde_json::to_value(&doc)?, &self.fingerprint)
            .await?;
        self.reporter.report(&ProgressEvent::LayerCached {
            row,
            layer,
            elapsed_ms: started.elapsed().as_millis() as u64,
        });
        Ok(true)
    }

    fn fail(&self, row: RowPosition, layer: Option<Layer>, cause: anyhow::Error) -> StepError {
        let err = StepError { row, layer, cause };
        self.reporter.report(&ProgressEvent::Failed {
            row,
            layer,
            message: format!("{:#}", err.cause),
        });
        err
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{Cell, RowRange};
    use crate::progress::NoProgress;
    use crate::schema::build_header_map;
    use crate::store::RowStore;
    use async_trait::async_trait;
    use serde_json::json;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    fn sheet(data_rows: usize) -> Vec<Vec<Cell>> {
        let mut rows = vec![
            vec![json!("Case_Organization"), Cell::Null, json!("Monitor_Vital_Signs")],
            vec![json!("Case_ID"), json!("Spark_Title"), json!("Initial_Vitals")],
        ];
        rows.extend((0..data_rows).map(|i| {
            vec![
                json!(format!("CASE-{}", i)),
                json!(format!("Title {}", i)),
                json!(r#"{"hr":80}"#),
            ]
        }));
        rows
    }

    fn plan(rows: &[Vec<Cell>]) -> JobPlan {
        JobPlan {
            header_map: build_header_map(&rows[0], &rows[1], Utc::now()).unwrap(),
            selection: vec!["Case_Organization_Case_ID".to_string()],
        }
    }

    fn options(max_rows: Option<usize>) -> JobOptions {
        JobOptions {
            layers: vec![Layer::Basic, Layer::Vitals],
            batch_size: 25,
            max_rows,
            max_value_chars: 1000,
            ttl: Duration::hours(24),
        }
    }

    #[derive(Default)]
    struct Recorder(Mutex<Vec<ProgressEvent>>);

    impl ProgressReporter for Recorder {
        fn report(&self, event: &ProgressEvent) {
            self.0.lock().unwrap().push(event.clone());
        }
    }

    #[tokio::test]
    async fn one_row_per_step_then_done() {
        let rows = sheet(3);
        let stores = Stores::in_memory(rows.clone());
        let recorder = Arc::new(Recorder::default());
        let mut job = EnrichmentJob::new(&stores, plan(&rows), options(None), recorder.clone());

        for expected in 3..=5 {
            let out = job.step().await.unwrap();
            assert_eq!(out.row, Some(expected));
            assert_eq!(out.computed, vec![Layer::Basic, Layer::Vitals]);
            assert!(!out.done);
        }
        let last = job.step().await.unwrap();
        assert!(last.done);
        assert_eq!(last.processed, 3);

        let events = recorder.0.lock().unwrap();
        assert!(matches!(events.last(), Some(ProgressEvent::Finished { processed: 3 })));
        assert!(stores.cache.get(5, Layer::Vitals).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn row_limit_stops_early_and_resumes() {
        let rows = sheet(30);
        let stores = Stores::in_memory(rows.clone());

        let mut first = EnrichmentJob::new(&stores, plan(&rows), options(Some(25)), Arc::new(NoProgress));
        assert_eq!(first.run().await.unwrap(), 25);

        let mut second = EnrichmentJob::new(&stores, plan(&rows), options(Some(25)), Arc::new(NoProgress));
        assert_eq!(second.run().await.unwrap(), 5);

        let mut third = EnrichmentJob::new(&stores, plan(&rows), options(Some(25)), Arc::new(NoProgress));
        assert_eq!(third.run().await.unwrap(), 0);
    }

    /// Row store whose reads of one row fail until switched off.
    struct FlakyRows {
        inner: Arc<dyn RowStore>,
        bad_row: RowPosition,
        failing: AtomicBool,
    }

    #[async_trait]
    impl RowStore for FlakyRows {
        async fn get_rows(&self, range: RowRange) -> Result<Vec<Vec<Cell>>> {
            self.inner.get_rows(range).await
        }
        async fn get_row(&self, pos: RowPosition) -> Result<Vec<Cell>> {
            if pos == self.bad_row && self.failing.load(Ordering::SeqCst) {
                anyhow::bail!("store unreachable");
            }
            self.inner.get_row(pos).await
        }
        async fn set_cell(&self, pos: RowPosition, column: usize, value: Cell) -> Result<()> {
            self.inner.set_cell(pos, column, value).await
        }
        async fn last_row_position(&self) -> Result<RowPosition> {
            self.inner.last_row_position().await
        }
    }

    #[tokio::test]
    async fn failure_leaves_cursor_and_retry_resumes_same_row() {
        let rows = sheet(3);
        let base = Stores::in_memory(rows.clone());
        let flaky = Arc::new(FlakyRows {
            inner: base.rows.clone(),
            bad_row: 4,
            failing: AtomicBool::new(true),
        });
        let stores = Stores {
            rows: flaky.clone(),
            ..base
        };

        let mut job = EnrichmentJob::new(&stores, plan(&rows), options(None), Arc::new(NoProgress));
        assert_eq!(job.step().await.unwrap().row, Some(3));
        let err = job.step().await.unwrap_err();
        assert_eq!(err.row, 4);
        assert_eq!(err.layer, Some(Layer::Basic));
        assert!(err.to_string().contains("store unreachable"));

        let cursor = BatchCursor::new(stores.rows.clone(), stores.props.clone(), &[Layer::Basic, Layer::Vitals]);
        assert_eq!(cursor.position().await.unwrap(), 3);

        flaky.failing.store(false, Ordering::SeqCst);
        let mut retry = EnrichmentJob::new(&stores, plan(&rows), options(None), Arc::new(NoProgress));
        assert_eq!(retry.step().await.unwrap().row, Some(4));
    }

    #[tokio::test]
    async fn fresh_layers_are_skipped_on_revisit() {
        let rows = sheet(1);
        let stores = Stores::in_memory(rows.clone());
        let mut basic_only = EnrichmentJob::new(
            &stores,
            plan(&rows),
            JobOptions {
                layers: vec![Layer::Basic],
                ..options(None)
            },
            Arc::new(NoProgress),
        );
        basic_only.run().await.unwrap();

        let mut both = EnrichmentJob::new(&stores, plan(&rows), options(None), Arc::new(NoProgress));
        let out = both.step().await.unwrap();
        assert_eq!(out.skipped, vec![Layer::Basic]);
        assert_eq!(out.computed, vec![Layer::Vitals]);
    }
}

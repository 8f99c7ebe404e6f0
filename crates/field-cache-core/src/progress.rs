//! Progress events emitted by [`crate::job::EnrichmentJob`].
//!
//! Each batch step reports what it did so a polling UI (or the CLI's
//! stderr reporter) can show per-row, per-layer progress. Reporters must
//! not fail the job; they swallow their own I/O errors.

use std::fmt;

use serde::Serialize;

use crate::models::{Layer, RowPosition};

/// A single progress event.
#[derive(Clone, Debug, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ProgressEvent {
    /// A batch was planned.
    BatchStarted {
        first: RowPosition,
        last: RowPosition,
    },
    /// One layer of one row was computed and cached.
    LayerCached {
        row: RowPosition,
        layer: Layer,
        elapsed_ms: u64,
    },
    /// The layer was already fresh for this row.
    LayerSkipped { row: RowPosition, layer: Layer },
    /// All requested layers are cached and the cursor advanced.
    RowCommitted { row: RowPosition, processed: u64 },
    /// A step failed; the cursor was left where it was.
    Failed {
        row: RowPosition,
        layer: Option<Layer>,
        message: String,
    },
    /// No rows left, or the row limit was reached.
    Finished { processed: u64 },
}

impl fmt::Display for ProgressEvent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProgressEvent::BatchStarted { first, last } => {
                write!(f, "batch  rows {}..={}", first, last)
            }
            ProgressEvent::LayerCached {
                row,
                layer,
                elapsed_ms,
            } => write!(f, "row {}  {}  cached in {} ms", row, layer, elapsed_ms),
            ProgressEvent::LayerSkipped { row, layer } => {
                write!(f, "row {}  {}  fresh, skipped", row, layer)
            }
            ProgressEvent::RowCommitted { row, processed } => {
                write!(f, "row {}  committed  ({} this run)", row, processed)
            }
            ProgressEvent::Failed {
                row,
                layer: Some(layer),
                message,
            } => write!(f, "row {}  {}  FAILED: {}", row, layer, message),
            ProgressEvent::Failed {
                row,
                layer: None,
                message,
            } => write!(f, "row {}  FAILED: {}", row, message),
            ProgressEvent::Finished { processed } => {
                write!(f, "done  {} rows processed", processed)
            }
        }
    }
}

/// Receives progress events from the batch pipeline.
pub trait ProgressReporter: Send + Sync {
    fn report(&self, event: &ProgressEvent);
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl ProgressReporter for NoProgress {
    fn report(&self, _event: &ProgressEvent) {}
}

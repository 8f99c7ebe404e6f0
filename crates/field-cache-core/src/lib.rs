//! # Field Cache Core
//!
//! Runtime-agnostic engine for Field Cache: data models, the typed field
//! registry, storage traits with in-memory implementations, and the
//! components that turn a two-tier-header sheet into per-layer cached
//! enrichment documents.
//!
//! | Module | Component |
//! |--------|-----------|
//! | [`schema`] | Schema Resolver (semantic name → column index) |
//! | [`store`] | Row store, property store, and layer cache traits |
//! | [`selection`] | Field Selection Store and the static recommendation heuristic |
//! | [`cursor`] | Batch Cursor |
//! | [`enrich`] | Layer definitions and the Enrichment Computer |
//! | [`merge`] | Merge Engine |
//! | [`job`] | Step-wise `EnrichmentJob` state machine |
//!
//! This crate contains no tokio, sqlx, or filesystem I/O.

pub mod cursor;
pub mod enrich;
pub mod fields;
pub mod job;
pub mod merge;
pub mod models;
pub mod progress;
pub mod schema;
pub mod selection;
pub mod store;

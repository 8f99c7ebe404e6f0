//! # Field Cache
//!
//! An incremental, multi-layer field cache and enrichment engine for
//! wide spreadsheet-style datasets.
//!
//! Each data row is enriched layer by layer (basic, vitals, clinical,
//! demographics, etc.). Every layer document is cached independently with
//! its own timestamp and selection fingerprint, so expensive per-row work
//! is done once and resumed across invocations via a persistent batch
//! cursor. A merge step reassembles the layers into one holistic document
//! per row.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────┐   ┌──────────────┐   ┌──────────────┐
//! │ Sheet rows  │──▶│ Enrichment   │──▶│ Layer cache  │
//! │ (2 headers) │   │ job + cursor │   │ (row, layer) │
//! └─────────────┘   └──────────────┘   └──────┬───────┘
//!                                             │
//!                      ┌──────────────────────┤
//!                      ▼                      ▼
//!                 ┌──────────┐          ┌──────────┐
//!                 │  merge   │          │  export  │
//!                 │ (fcache) │          │ (JSONL)  │
//!                 └──────────┘          └──────────┘
//! ```
//!
//! The engine itself lives in `field-cache-core`; this crate supplies the
//! SQLite stores, configuration, the recommendation provider, and the CLI.
//!
//! ## Quick Start
//!
//! ```bash
//! fcache init                       # create database
//! fcache import sheet.json          # load a sheet snapshot
//! fcache headers refresh            # build the header map
//! fcache cache next --rows 25       # enrich the next 25 rows
//! fcache status
//! fcache merge 3
//! ```
//!
//! ## Modules
//!
//! | Module | Purpose |
//! |--------|---------|
//! | [`config`] | TOML configuration parsing |
//! | [`db`] | Database connection |
//! | [`migrate`] | Schema migrations |
//! | [`sqlite_store`] | SQLite row, property, and layer-cache stores |
//! | [`import`] | Sheet snapshot import |
//! | [`recommend`] | Field recommendations with timeout and fallback |
//! | [`service`] | The owning enrichment service |
//! | [`progress`] | Stderr progress reporters |
//! | [`status`] | Cache status view |
//! | [`export`] | Holistic document export |

pub mod config;
pub mod db;
pub mod export;
pub mod import;
pub mod migrate;
pub mod progress;
pub mod recommend;
pub mod service;
pub mod sqlite_store;
pub mod status;

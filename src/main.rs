//! # Field Cache CLI (`fcache`)
//!
//! The `fcache` binary drives the enrichment engine: it loads sheet
//! snapshots, maintains the header map and field selection, runs resumable
//! batches over the layer cache, and prints merged documents.
//!
//! ## Usage
//!
//! ```bash
//! fcache --config ./config/fcache.toml <command>
//! ```
//!
//! ## Commands
//!
//! | Command | Description |
//! |---------|-------------|
//! | `fcache init` | Create the SQLite database and run schema migrations |
//! | `fcache import <file>` | Load a sheet snapshot into the row store |
//! | `fcache headers refresh\|show` | Rebuild or print the header map |
//! | `fcache fields ...` | Catalog, selection, and recommendations |
//! | `fcache cache next\|layer\|all\|clear` | Run or reset enrichment batches |
//! | `fcache status` | Cursor and per-layer cache progress |
//! | `fcache merge <row>` | Print the holistic document for one row |
//! | `fcache export` | Export holistic documents for every row |
//!
//! ## Examples
//!
//! ```bash
//! # Cache the next 25 rows for every layer
//! fcache cache next --rows 25
//!
//! # Only the vitals and clinical layers, with JSON progress
//! fcache --progress json cache next --layers vitals,clinical
//!
//! # Start a recommendation and wait for it
//! fcache fields recommend --wait
//! ```

mod config;
mod db;
mod export;
mod import;
mod migrate;
mod progress;
mod recommend;
mod service;
mod sqlite_store;
mod status;

use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use field_cache_core::models::Layer;
use field_cache_core::store::ClearScope;

use crate::progress::ProgressMode;
use crate::recommend::{Recommendation, RecommendationSource, SlotState};
use crate::service::EnrichmentService;

/// Field Cache CLI — incremental multi-layer enrichment over wide sheets.
///
/// All commands accept a `--config` flag pointing to a TOML configuration
/// file.
#[derive(Parser)]
#[command(
    name = "fcache",
    about = "Field Cache — incremental multi-layer field cache and enrichment engine",
    version,
    long_about = "Field Cache enriches spreadsheet rows one semantic layer at a time, \
    caches every (row, layer) document independently, resumes batches from a persistent \
    cursor, and merges the layers into one holistic document per row."
)]
struct Cli {
    /// Path to configuration file (TOML).
    #[arg(long, global = true, default_value = "./config/fcache.toml")]
    config: PathBuf,

    /// Progress output on stderr: `human`, `json`, or `off`.
    ///
    /// Defaults to `human` when stderr is a terminal, otherwise `off`.
    #[arg(long, global = true)]
    progress: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

/// Top-level CLI commands.
#[derive(Subcommand)]
enum Commands {
    /// Initialize the database schema. Safe to run repeatedly.
    Init,

    /// Load a sheet snapshot (JSON array of rows, headers first).
    Import {
        /// Path to the snapshot file.
        file: PathBuf,
    },

    /// Header map maintenance.
    Headers {
        #[command(subcommand)]
        action: HeadersAction,
    },

    /// Field catalog, selection, and recommendations.
    Fields {
        #[command(subcommand)]
        action: FieldsAction,
    },

    /// Run or reset enrichment batches.
    Cache {
        #[command(subcommand)]
        action: CacheAction,
    },

    /// Show cursor and per-layer cache progress.
    Status {
        /// Print the status as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Print the merged document for one data row.
    Merge {
        /// 1-based sheet row (data starts at row 3).
        row: i64,
    },

    /// Export merged documents for every data row.
    Export {
        /// Write to this file instead of stdout.
        #[arg(long)]
        output: Option<PathBuf>,

        /// Write one JSON array instead of JSON lines.
        #[arg(long)]
        array: bool,
    },
}

#[derive(Subcommand)]
enum HeadersAction {
    /// Re-read both header rows and store a new header map.
    Refresh,
    /// Print the stored header map.
    Show,
}

#[derive(Subcommand)]
enum FieldsAction {
    /// List every semantic field name in column order.
    Catalog,
    /// Print the effective selection (defaults when none is saved).
    Show,
    /// Save a new selection.
    Select {
        /// Semantic field names from the catalog.
        #[arg(required = true)]
        names: Vec<String>,
    },
    /// Forget the saved selection and fall back to defaults.
    Reset,
    /// Ask the configured provider for a recommended selection.
    Recommend {
        /// Block until the recommendation is ready.
        #[arg(long)]
        wait: bool,
    },
}

#[derive(Subcommand)]
enum CacheAction {
    /// Cache the next batch of rows.
    Next {
        /// Rows to process (defaults to `enrichment.batch_size`).
        #[arg(long)]
        rows: Option<usize>,

        /// Comma-separated layers (defaults to all layers).
        #[arg(long)]
        layers: Option<String>,
    },
    /// Cache one layer over every remaining row.
    Layer {
        /// Layer name, e.g. `vitals`.
        layer: String,
    },
    /// Cache every layer over every remaining row.
    All,
    /// Clear cached entries and reset every cursor.
    Clear {
        /// Only clear this layer's entries (cursors are always reset).
        #[arg(long)]
        layer: Option<String>,
    },
}

fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new("fcache=info,field_cache=info,field_cache_core=info,warn")
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn print_recommendation(rec: &Recommendation) {
    match &rec.source {
        RecommendationSource::Provider { name } => {
            println!("Recommended by {} at {}:", name, rec.generated_at.to_rfc3339())
        }
        RecommendationSource::Fallback { reason } => println!(
            "Fallback recommendation at {} ({}):",
            rec.generated_at.to_rfc3339(),
            reason
        ),
    }
    for field in &rec.fields {
        println!("  {}", field);
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();
    let cli = Cli::parse();
    let progress = ProgressMode::from_flag(cli.progress.as_deref())?;

    let cfg = config::load_config(&cli.config)?;

    match cli.command {
        Commands::Init => {
            migrate::run_migrations(&cfg).await?;
            println!("Database initialized successfully.");
        }
        Commands::Import { file } => {
            let summary = import::run_import(&cfg, &file).await?;
            println!(
                "Imported {} rows ({} data rows, {} stale rows removed).",
                summary.rows, summary.data_rows, summary.removed
            );
            if let Some(first) = summary.invalidated_from {
                println!(
                    "Rows changed from row {}: dropped {} cached entries; reset {} cursors.",
                    first, summary.entries_removed, summary.cursors_reset
                );
            }
        }
        Commands::Headers { action } => {
            let service = EnrichmentService::open(&cfg).await?;
            match action {
                HeadersAction::Refresh => {
                    let map = service.refresh_headers().await?;
                    println!("Header map refreshed: {} fields.", map.len());
                }
                HeadersAction::Show => {
                    let map = service.header_map().await?;
                    println!("{}", serde_json::to_string_pretty(&map)?);
                }
            }
        }
        Commands::Fields { action } => {
            let service = EnrichmentService::open(&cfg).await?;
            match action {
                FieldsAction::Catalog => {
                    for name in service.catalog().await? {
                        println!("{}", name);
                    }
                }
                FieldsAction::Show => {
                    for name in service.effective_selection().await? {
                        println!("{}", name);
                    }
                }
                FieldsAction::Select { names } => {
                    let saved = service.select_fields(&names).await?;
                    println!("Selection saved: {} fields.", saved.len());
                }
                FieldsAction::Reset => {
                    service.reset_selection().await?;
                    println!("Selection cleared; defaults apply.");
                }
                FieldsAction::Recommend { wait } => {
                    let previous = service.stored_recommendation().await?;
                    let slot = service.start_recommendation().await?;
                    if wait {
                        print_recommendation(&slot.wait().await?);
                    } else {
                        match slot.poll() {
                            SlotState::Ready(rec) => print_recommendation(&rec),
                            SlotState::NotReady => {
                                match &previous {
                                    Some(rec) => {
                                        println!("Recommendation pending; previous result:");
                                        print_recommendation(rec);
                                    }
                                    None => println!(
                                        "Recommendation pending; run again or pass --wait."
                                    ),
                                }
                                // Let the task persist its result before exit.
                                slot.wait().await?;
                            }
                        }
                    }
                }
            }
        }
        Commands::Cache { action } => {
            let service = EnrichmentService::open(&cfg).await?;
            let reporter = progress.reporter();
            match action {
                CacheAction::Next { rows, layers } => {
                    let layers = match layers {
                        Some(s) => Layer::parse_list(&s)?,
                        None => Layer::ALL.to_vec(),
                    };
                    let max = rows.unwrap_or(cfg.enrichment.batch_size);
                    let n = service.run(&layers, Some(max), reporter).await?;
                    println!("Processed {} rows.", n);
                }
                CacheAction::Layer { layer } => {
                    let layer: Layer = layer.parse()?;
                    let n = service.run(&[layer], None, reporter).await?;
                    println!("Processed {} rows for layer {}.", n, layer);
                }
                CacheAction::All => {
                    let n = service.run(&Layer::ALL, None, reporter).await?;
                    println!("Processed {} rows.", n);
                }
                CacheAction::Clear { layer } => {
                    let scope = match layer {
                        Some(s) => ClearScope::Layer(s.parse::<Layer>()?),
                        None => ClearScope::All,
                    };
                    let summary = service.clear(scope).await?;
                    println!(
                        "Cleared {} entries; reset {} cursors.",
                        summary.entries_removed, summary.cursors_reset
                    );
                }
            }
        }
        Commands::Status { json } => {
            status::run_status(&cfg, json).await?;
        }
        Commands::Merge { row } => {
            let service = EnrichmentService::open(&cfg).await?;
            let doc = service
                .merge(row)
                .await
                .with_context(|| format!("Failed to merge row {}", row))?;
            println!("{}", serde_json::to_string_pretty(&doc)?);
        }
        Commands::Export { output, array } => {
            export::run_export(&cfg, output.as_deref(), array).await?;
        }
    }

    Ok(())
}

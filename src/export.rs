//! Export holistic documents for downstream discovery.
//!
//! Writes one merged document per data row as JSON lines, or as a single
//! pretty-printed JSON array with `--array`. Each document carries its own
//! `stale` flag and per-layer status so consumers can decide whether to
//! trust it.

use anyhow::Result;
use std::io::Write;
use std::path::Path;

use field_cache_core::models::HolisticDocument;

use crate::config::Config;
use crate::service::EnrichmentService;

/// Serialize documents as JSON lines or a JSON array.
pub fn encode(docs: &[HolisticDocument], array: bool) -> Result<String> {
    if array {
        return Ok(serde_json::to_string_pretty(docs)?);
    }
    let mut out = String::new();
    for doc in docs {
        out.push_str(&serde_json::to_string(doc)?);
        out.push('\n');
    }
    Ok(out)
}

/// Export merged documents.
///
/// If `output` is `Some`, writes to that file path. Otherwise writes
/// to stdout for piping.
pub async fn run_export(config: &Config, output: Option<&Path>, array: bool) -> Result<()> {
    let service = EnrichmentService::open(config).await?;
    let docs = service.merge_all().await?;
    let stale = docs.iter().filter(|d| d.stale).count();
    let encoded = encode(&docs, array)?;

    match output {
        Some(path) => {
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(path, &encoded)?;
            eprintln!(
                "Exported {} documents ({} stale) to {}",
                docs.len(),
                stale,
                path.display()
            );
        }
        None => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(encoded.as_bytes())?;
            if array {
                writeln!(stdout)?;
            }
        }
    }

    Ok(())
}

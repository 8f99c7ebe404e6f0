//! Cache status overview.
//!
//! Summarizes how far enrichment has got: data rows, the header map's
//! refresh time, committed cursors per layer set, and per-layer cached row
//! counts with their oldest and newest `cachedAt`. Used by `fcache status`.

use anyhow::Result;
use chrono::{DateTime, Utc};

use crate::config::Config;
use crate::service::{CacheStatus, EnrichmentService};

fn fmt_ts(ts: Option<DateTime<Utc>>) -> String {
    ts.map(|t| t.format("%Y-%m-%d %H:%M:%S UTC").to_string())
        .unwrap_or_else(|| "-".to_string())
}

/// Render the status as the plain-text table printed by `fcache status`.
pub fn render(config: &Config, status: &CacheStatus) -> String {
    let mut out = String::new();
    out.push_str("Field Cache — Status\n");
    out.push_str("====================\n\n");
    out.push_str(&format!("  Database:    {}\n", config.db.path.display()));
    out.push_str(&format!("  Data rows:   {}\n", status.data_rows));
    out.push_str(&format!(
        "  Headers:     {} fields (refreshed {})\n",
        status.header_fields,
        fmt_ts(status.header_refreshed_at)
    ));
    out.push_str(&format!(
        "  Selection:   {}\n",
        if status.selected_fields == 0 {
            "defaults (not yet resolved)".to_string()
        } else {
            format!("{} fields", status.selected_fields)
        }
    ));
    out.push('\n');

    out.push_str("  Cursors:\n");
    if status.cursors.is_empty() {
        out.push_str("    (none)\n");
    }
    for c in &status.cursors {
        out.push_str(&format!(
            "    {:<40} row {:>6}   {} / {} rows\n",
            c.layers, c.position, c.rows_done, status.data_rows
        ));
    }
    out.push('\n');

    out.push_str(&format!(
        "  {:<14} {:>8} {:>6}   {:<24} {:<24}\n",
        "LAYER", "ROWS", "DONE", "OLDEST", "NEWEST"
    ));
    for l in &status.layers {
        out.push_str(&format!(
            "  {:<14} {:>8} {:>5}%   {:<24} {:<24}\n",
            l.layer.as_str(),
            l.rows,
            l.percent,
            fmt_ts(l.oldest),
            fmt_ts(l.newest)
        ));
    }
    out
}

/// Run the status command.
pub async fn run_status(config: &Config, json: bool) -> Result<()> {
    let service = EnrichmentService::open(config).await?;
    let status = service.status().await?;
    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
    } else {
        print!("{}", render(config, &status));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::{CursorStatus, LayerStats};
    use field_cache_core::models::Layer;

    #[test]
    fn test_render_lists_every_layer_and_cursor() {
        let config: Config = toml::from_str("[db]\npath = \"./data/fcache.sqlite\"\n").unwrap();
        let status = CacheStatus {
            data_rows: 30,
            header_refreshed_at: None,
            header_fields: 0,
            selected_fields: 0,
            cursors: vec![CursorStatus {
                layers: "basic,vitals".to_string(),
                position: 27,
                rows_done: 25,
            }],
            layers: Layer::ALL
                .iter()
                .map(|l| LayerStats {
                    layer: *l,
                    rows: 25,
                    percent: 83,
                    oldest: None,
                    newest: None,
                })
                .collect(),
        };
        let text = render(&config, &status);
        assert!(text.contains("basic,vitals"));
        assert!(text.contains("25 / 30 rows"));
        for layer in Layer::ALL {
            assert!(text.contains(layer.as_str()));
        }
        assert!(text.contains("83%"));
    }
}

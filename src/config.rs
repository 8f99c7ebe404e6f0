//! TOML configuration.
//!
//! ```toml
//! [db]
//! path = "./data/fcache.sqlite"
//!
//! [enrichment]
//! batch_size = 25
//! max_value_chars = 1000
//! ttl_hours = 24
//!
//! [recommend]
//! provider = "openai"
//! model = "gpt-4o-mini"
//! timeout_secs = 20
//! ```
//!
//! Everything except `[db]` has defaults.

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub db: DbConfig,
    #[serde(default)]
    pub sheet: SheetConfig,
    #[serde(default)]
    pub enrichment: EnrichmentConfig,
    #[serde(default)]
    pub recommend: RecommendConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct DbConfig {
    pub path: PathBuf,
}

#[derive(Debug, Deserialize, Clone)]
pub struct SheetConfig {
    #[serde(default = "default_header_rows")]
    pub header_rows: i64,
}

impl Default for SheetConfig {
    fn default() -> Self {
        Self {
            header_rows: default_header_rows(),
        }
    }
}

fn default_header_rows() -> i64 {
    2
}

#[derive(Debug, Deserialize, Clone)]
pub struct EnrichmentConfig {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_value_chars")]
    pub max_value_chars: usize,
    #[serde(default = "default_ttl_hours")]
    pub ttl_hours: i64,
}

impl Default for EnrichmentConfig {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            max_value_chars: default_max_value_chars(),
            ttl_hours: default_ttl_hours(),
        }
    }
}

fn default_batch_size() -> usize {
    25
}
fn default_max_value_chars() -> usize {
    1000
}
fn default_ttl_hours() -> i64 {
    24
}

#[derive(Debug, Deserialize, Clone)]
pub struct RecommendConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    #[serde(default)]
    pub model: Option<String>,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_max_fields")]
    pub max_fields: usize,
}

impl Default for RecommendConfig {
    fn default() -> Self {
        Self {
            provider: default_provider(),
            model: None,
            timeout_secs: default_timeout_secs(),
            max_fields: default_max_fields(),
        }
    }
}

fn default_provider() -> String {
    "disabled".to_string()
}
fn default_timeout_secs() -> u64 {
    20
}
fn default_max_fields() -> usize {
    12
}

impl RecommendConfig {
    pub fn is_enabled(&self) -> bool {
        self.provider != "disabled"
    }
}

impl EnrichmentConfig {
    pub fn ttl(&self) -> chrono::Duration {
        chrono::Duration::hours(self.ttl_hours)
    }
}

pub fn load_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("Failed to read config file: {}", path.display()))?;

    let config: Config = toml::from_str(&content).with_context(|| "Failed to parse config file")?;
    validate(&config)?;
    Ok(config)
}

fn validate(config: &Config) -> Result<()> {
    if config.sheet.header_rows != field_cache_core::models::HEADER_ROWS {
        anyhow::bail!(
            "sheet.header_rows must be {} (tier-1 category + tier-2 field name)",
            field_cache_core::models::HEADER_ROWS
        );
    }

    // Validate enrichment
    if config.enrichment.batch_size == 0 {
        anyhow::bail!("enrichment.batch_size must be >= 1");
    }
    if config.enrichment.max_value_chars < 16 {
        anyhow::bail!("enrichment.max_value_chars must be >= 16");
    }
    if config.enrichment.ttl_hours < 1 {
        anyhow::bail!("enrichment.ttl_hours must be >= 1");
    }

    // Validate recommend
    if config.recommend.timeout_secs == 0 {
        anyhow::bail!("recommend.timeout_secs must be >= 1");
    }
    if config.recommend.max_fields == 0 {
        anyhow::bail!("recommend.max_fields must be >= 1");
    }

    match config.recommend.provider.as_str() {
        "disabled" | "openai" => {}
        other => anyhow::bail!(
            "Unknown recommend provider: '{}'. Must be disabled or openai.",
            other
        ),
    }

    if config.recommend.is_enabled() && config.recommend.model.is_none() {
        anyhow::bail!(
            "recommend.model must be specified when provider is '{}'",
            config.recommend.provider
        );
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(toml_str: &str) -> Result<Config> {
        let config: Config = toml::from_str(toml_str)?;
        validate(&config)?;
        Ok(config)
    }

    #[test]
    fn test_minimal_config_uses_defaults() {
        let config = parse("[db]\npath = \"./data/fcache.sqlite\"\n").unwrap();
        assert_eq!(config.enrichment.batch_size, 25);
        assert_eq!(config.enrichment.max_value_chars, 1000);
        assert_eq!(config.enrichment.ttl(), chrono::Duration::hours(24));
        assert_eq!(config.recommend.provider, "disabled");
        assert_eq!(config.recommend.max_fields, 12);
        assert_eq!(config.sheet.header_rows, 2);
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        let err = parse("[db]\npath = \"x\"\n[enrichment]\nbatch_size = 0\n").unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn test_rejects_unknown_provider() {
        let err = parse("[db]\npath = \"x\"\n[recommend]\nprovider = \"magic\"\n").unwrap_err();
        assert!(err.to_string().contains("Unknown recommend provider"));
    }

    #[test]
    fn test_openai_requires_model() {
        assert!(parse("[db]\npath = \"x\"\n[recommend]\nprovider = \"openai\"\n").is_err());
        assert!(parse(
            "[db]\npath = \"x\"\n[recommend]\nprovider = \"openai\"\nmodel = \"gpt-4o-mini\"\n"
        )
        .is_ok());
    }

    #[test]
    fn test_rejects_wrong_header_rows() {
        assert!(parse("[db]\npath = \"x\"\n[sheet]\nheader_rows = 1\n").is_err());
    }
}

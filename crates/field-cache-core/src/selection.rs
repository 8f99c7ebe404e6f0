//! Field Selection Store and the static recommendation heuristic.
//!
//! The selection is a deduplicated, ordered list of semantic names held in
//! one property slot. An empty slot and an empty saved list mean the same
//! thing: no selection. Both resolve to the pattern-matched defaults.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use tracing::info;

use crate::fields::{matches_fragment, matches_on_boundary};
use crate::store::PropertyStore;

/// Property key holding the JSON-encoded selection.
pub const SELECTION_KEY: &str = "selected_fields";

/// Maximum number of fields the default resolution returns.
pub const MAX_DEFAULT_FIELDS: usize = 27;

/// Canonical field-name fragments in priority order.
pub const DEFAULT_FIELD_PATTERNS: [&str; 27] = [
    "Case_ID",
    "Spark_Title",
    "Pathway_or_Course_Name",
    "Medical_Category",
    "Difficulty_Level",
    "Chief_Diagnosis",
    "Pre_Sim_Overview",
    "Post_Sim_Overview",
    "Clinical_Vignette",
    "Educational_Goal",
    "Environment_Type",
    "Disposition_Plan",
    "Initial_Vitals",
    "Patient_Name",
    "Age",
    "Gender",
    "Presenting_Complaint",
    "Chief_Complaint",
    "Past_Medical_History",
    "Current_Medications",
    "Allergies",
    "Exam_Positive_Findings",
    "Expected_Student_Actions",
    "Key_Learning_Points",
    "Common_Errors_or_Pitfalls",
    "Critical_Decision_Points",
    "Optimal_Management_Steps",
];

/// Match the priority patterns against `catalog`, skipping `exclude`.
///
/// Each pattern contributes the first untaken catalog name containing it,
/// preferring a whole-token match when one exists. Never pads with
/// unmatched names.
fn pattern_matches(catalog: &[String], exclude: &HashSet<&str>, cap: usize) -> Vec<String> {
    let mut taken: HashSet<&str> = HashSet::new();
    let mut out = Vec::new();
    for pattern in DEFAULT_FIELD_PATTERNS {
        if out.len() >= cap {
            break;
        }
        let candidates: Vec<&String> = catalog
            .iter()
            .filter(|name| {
                !taken.contains(name.as_str())
                    && !exclude.contains(name.as_str())
                    && matches_fragment(name, pattern)
            })
            .collect();
        let hit = candidates
            .iter()
            .find(|name| matches_on_boundary(name, pattern))
            .or_else(|| candidates.first())
            .copied();
        if let Some(name) = hit {
            taken.insert(name.as_str());
            out.push(name.clone());
        }
    }
    out
}

/// Default selection for a catalog. Deterministic.
pub fn default_selection(catalog: &[String]) -> Vec<String> {
    pattern_matches(catalog, &HashSet::new(), MAX_DEFAULT_FIELDS)
}

/// Deterministic recommendation used when the external provider is
/// unavailable.
///
/// Prefers pattern matches not already selected, then any pattern match,
/// then the first catalog entries. Non-empty whenever `catalog` is.
pub fn static_recommendations(catalog: &[String], current: &[String], max: usize) -> Vec<String> {
    let max = max.max(1);
    let exclude: HashSet<&str> = current.iter().map(String::as_str).collect();

    let fresh = pattern_matches(catalog, &exclude, max);
    if !fresh.is_empty() {
        return fresh;
    }
    let any = pattern_matches(catalog, &HashSet::new(), max);
    if !any.is_empty() {
        return any;
    }
    catalog.iter().take(max).cloned().collect()
}

/// SHA-256 over the sorted selection; order-insensitive.
pub fn fingerprint(fields: &[String]) -> String {
    let mut sorted: Vec<&str> = fields.iter().map(String::as_str).collect();
    sorted.sort_unstable();
    sorted.dedup();
    let mut hasher = Sha256::new();
    for name in sorted {
        hasher.update(name.as_bytes());
        hasher.update(b"\n");
    }
    format!("{:x}", hasher.finalize())
}

fn dedup_preserving_order(fields: &[String]) -> Vec<String> {
    let mut seen = HashSet::new();
    fields
        .iter()
        .map(|f| f.trim())
        .filter(|f| !f.is_empty() && seen.insert(*f))
        .map(str::to_string)
        .collect()
}

pub struct FieldSelectionStore {
    props: Arc<dyn PropertyStore>,
}

impl FieldSelectionStore {
    pub fn new(props: Arc<dyn PropertyStore>) -> Self {
        Self { props }
    }

    /// The saved selection; empty when nothing (or nothing useful) is saved.
    pub async fn load(&self) -> Result<Vec<String>> {
        match self.props.get(SELECTION_KEY).await? {
            Some(json) => {
                let fields: Vec<String> = serde_json::from_str(&json)
                    .with_context(|| format!("Corrupt selection in '{}'", SELECTION_KEY))?;
                Ok(dedup_preserving_order(&fields))
            }
            None => Ok(Vec::new()),
        }
    }

    pub async fn save(&self, fields: &[String]) -> Result<()> {
        let fields = dedup_preserving_order(fields);
        self.props
            .set(SELECTION_KEY, &serde_json::to_string(&fields)?)
            .await
    }

    pub async fn clear(&self) -> Result<()> {
        self.props.delete(SELECTION_KEY).await
    }

    /// The saved selection, or the defaults for `catalog` (which are then
    /// saved).
    pub async fn resolve_effective(&self, catalog: &[String]) -> Result<Vec<String>> {
        let saved = self.load().await?;
        if !saved.is_empty() {
            return Ok(saved);
        }
        let defaults = default_selection(catalog);
        info!(fields = defaults.len(), "no saved selection, using defaults");
        self.save(&defaults).await?;
        Ok(defaults)
    }
}

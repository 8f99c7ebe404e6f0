//! Layer definitions and the Enrichment Computer.
//!
//! Each [`Layer`] extracts a fixed set of known fields into a document
//! keyed by short, layer-local names. Values are truncated before they are
//! cached: per-field bounds where the layer declares one, otherwise the
//! global `max_value_chars`.
//!
//! Nothing in here aborts a row because of a single cell. Unreadable cells
//! become `null`; a malformed vitals blob is kept raw and flagged.

use std::collections::HashSet;
use std::sync::Arc;

use anyhow::{Context, Result};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::fields::{FieldRef, KnownField};
use crate::models::{cell_text, Cell, HeaderMap, Layer, LayerDocument, RowPosition};
use crate::schema::resolve_with_fallback;
use crate::store::RowStore;

/// How a cell is turned into document values.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldKind {
    Text,
    /// JSON vitals blob; `hr`, `bp.sys`, `bp.dia`, `rr`, `spo2` are lifted
    /// into `initial*` keys.
    Vitals,
}

#[derive(Debug, Clone, Copy)]
pub struct FieldSpec {
    pub key: &'static str,
    pub field: KnownField,
    pub max_chars: Option<usize>,
    pub kind: FieldKind,
}

const fn text(key: &'static str, field: KnownField) -> FieldSpec {
    FieldSpec {
        key,
        field,
        max_chars: None,
        kind: FieldKind::Text,
    }
}

const fn capped(key: &'static str, field: KnownField, max: usize) -> FieldSpec {
    FieldSpec {
        key,
        field,
        max_chars: Some(max),
        kind: FieldKind::Text,
    }
}

#[derive(Debug)]
pub struct LayerDefinition {
    pub layer: Layer,
    pub fields: &'static [FieldSpec],
}

static BASIC: LayerDefinition = LayerDefinition {
    layer: Layer::Basic,
    fields: &[
        text("caseId", KnownField::CaseId),
        text("sparkTitle", KnownField::SparkTitle),
        text("pathway", KnownField::Pathway),
    ],
};

static LEARNING: LayerDefinition = LayerDefinition {
    layer: Layer::Learning,
    fields: &[
        capped("preSimOverview", KnownField::PreSimOverview, 300),
        capped("postSimOverview", KnownField::PostSimOverview, 300),
        text("learningOutcomes", KnownField::LearningObjective),
        text("learningObjectives", KnownField::EducationalGoal),
    ],
};

static METADATA: LayerDefinition = LayerDefinition {
    layer: Layer::Metadata,
    fields: &[
        text("category", KnownField::MedicalCategory),
        text("difficulty", KnownField::DifficultyLevel),
        text("setting", KnownField::EnvironmentType),
        text("chiefComplaint", KnownField::PresentingComplaint),
    ],
};

static DEMOGRAPHICS: LayerDefinition = LayerDefinition {
    layer: Layer::Demographics,
    fields: &[
        text("age", KnownField::Age),
        text("gender", KnownField::Gender),
        text("patientName", KnownField::PatientName),
    ],
};

static VITALS: LayerDefinition = LayerDefinition {
    layer: Layer::Vitals,
    fields: &[FieldSpec {
        key: "initialVitals",
        field: KnownField::InitialVitals,
        max_chars: None,
        kind: FieldKind::Vitals,
    }],
};

static CLINICAL: LayerDefinition = LayerDefinition {
    layer: Layer::Clinical,
    fields: &[
        capped("examFindings", KnownField::ExamPositiveFindings, 200),
        capped("medications", KnownField::CurrentMedications, 150),
        capped("pastMedicalHistory", KnownField::PastMedicalHistory, 200),
        text("allergies", KnownField::Allergies),
    ],
};

static ENVIRONMENT: LayerDefinition = LayerDefinition {
    layer: Layer::Environment,
    fields: &[
        text("environmentType", KnownField::EnvironmentType),
        text("dispositionPlan", KnownField::DispositionPlan),
        capped("context", KnownField::ClinicalVignette, 300),
    ],
};

pub fn layer_definition(layer: Layer) -> &'static LayerDefinition {
    match layer {
        Layer::Basic => &BASIC,
        Layer::Learning => &LEARNING,
        Layer::Metadata => &METADATA,
        Layer::Demographics => &DEMOGRAPHICS,
        Layer::Vitals => &VITALS,
        Layer::Clinical => &CLINICAL,
        Layer::Environment => &ENVIRONMENT,
    }
}

/// Semantic names covered by some layer's fixed field set.
pub fn covered_fields() -> HashSet<&'static str> {
    Layer::ALL
        .iter()
        .flat_map(|l| layer_definition(*l).fields.iter())
        .map(|f| f.field.semantic_name())
        .collect()
}

/// Vitals paths and the document key each one lands in.
const VITALS_PATHS: [(&str, &str); 5] = [
    ("hr", "initialHr"),
    ("bp.sys", "initialBpSys"),
    ("bp.dia", "initialBpDia"),
    ("rr", "initialRr"),
    ("spo2", "initialSpo2"),
];

/// Truncate every string inside `value` to `max` characters.
pub fn truncate_value(value: Value, max: usize) -> Value {
    match value {
        Value::String(s) if s.chars().count() > max => {
            Value::String(s.chars().take(max).collect())
        }
        Value::Array(items) => {
            Value::Array(items.into_iter().map(|v| truncate_value(v, max)).collect())
        }
        Value::Object(map) => Value::Object(
            map.into_iter()
                .map(|(k, v)| (k, truncate_value(v, max)))
                .collect::<Map<_, _>>(),
        ),
        other => other,
    }
}

fn lookup_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    path.split('.').try_fold(value, |v, part| v.get(part))
}

/// Parse a vitals cell. `Err` carries the raw text when it is not JSON.
fn parse_vitals(cell: &Cell) -> std::result::Result<Value, String> {
    match cell {
        Value::Object(_) => Ok(cell.clone()),
        other => {
            let raw = cell_text(other).unwrap_or_default();
            match serde_json::from_str::<Value>(&raw) {
                Ok(v @ Value::Object(_)) => Ok(v),
                _ => Err(raw),
            }
        }
    }
}

fn is_blank(cell: &Cell) -> bool {
    match cell {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

/// Generate a fresh case identifier: `CASE-` + 8 uppercase hex digits.
pub fn generate_case_id() -> String {
    let hex = Uuid::new_v4().simple().to_string();
    format!("CASE-{}", hex[..8].to_uppercase())
}

/// Computes one layer's document for one row.
pub struct EnrichmentComputer {
    rows: Arc<dyn RowStore>,
    max_value_chars: usize,
}

impl EnrichmentComputer {
    pub fn new(rows: Arc<dyn RowStore>, max_value_chars: usize) -> Self {
        Self {
            rows,
            max_value_chars,
        }
    }

    /// Build the document for `(row, layer)`.
    ///
    /// `selection` only matters for the basic layer, which projects selected
    /// fields outside every fixed set into `extras`. Row-store I/O errors
    /// propagate; everything else degrades per field.
    pub async fn compute_layer(
        &self,
        row: RowPosition,
        layer: Layer,
        header_map: &HeaderMap,
        selection: &[String],
    ) -> Result<LayerDocument> {
        let cells = self
            .rows
            .get_row(row)
            .await
            .with_context(|| format!("Failed to read row {}", row))?;
        let cell_at = |idx: usize| cells.get(idx).cloned().unwrap_or(Cell::Null);

        let mut doc = LayerDocument {
            row,
            ..Default::default()
        };

        let case_col = resolve_with_fallback(header_map, &FieldRef::from(KnownField::CaseId));
        if let Some(col) = case_col {
            doc.case_id = cell_text(&cell_at(col)).filter(|s| !s.trim().is_empty());
        }

        for spec in layer_definition(layer).fields {
            let Some(col) = resolve_with_fallback(header_map, &FieldRef::from(spec.field)) else {
                doc.fields.insert(spec.key.to_string(), Value::Null);
                doc.unresolved.push(spec.key.to_string());
                continue;
            };
            let cell = cell_at(col);
            let bound = spec.max_chars.unwrap_or(self.max_value_chars);

            match spec.kind {
                FieldKind::Text => {
                    let value = if is_blank(&cell) { Value::Null } else { cell };
                    doc.fields
                        .insert(spec.key.to_string(), truncate_value(value, bound));
                }
                FieldKind::Vitals => self.extract_vitals(&mut doc, spec, &cell, bound),
            }
        }

        if layer == Layer::Basic {
            self.ensure_case_id(&mut doc, case_col).await?;
            self.project_extras(&mut doc, header_map, selection, &cell_at);
        }

        debug!(
            row,
            layer = %layer,
            fields = doc.fields.len(),
            extras = doc.extras.len(),
            "layer computed"
        );
        Ok(doc)
    }

    fn extract_vitals(&self, doc: &mut LayerDocument, spec: &FieldSpec, cell: &Cell, bound: usize) {
        if is_blank(cell) {
            for (_, key) in VITALS_PATHS {
                doc.fields.insert(key.to_string(), Value::Null);
            }
            return;
        }
        match parse_vitals(cell) {
            Ok(parsed) => {
                for (path, key) in VITALS_PATHS {
                    let v = lookup_path(&parsed, path).cloned().unwrap_or(Value::Null);
                    doc.fields.insert(key.to_string(), truncate_value(v, bound));
                }
            }
            Err(raw) => {
                warn!(row = doc.row, field = spec.key, "vitals blob is not valid JSON, keeping raw");
                doc.fields
                    .insert(spec.key.to_string(), truncate_value(Value::String(raw), bound));
                doc.parse_failures.push(spec.key.to_string());
            }
        }
    }

    /// Generate and write back a case identifier when the cell is empty.
    async fn ensure_case_id(&self, doc: &mut LayerDocument, case_col: Option<usize>) -> Result<()> {
        if doc.case_id.is_some() {
            return Ok(());
        }
        let Some(col) = case_col else {
            return Ok(());
        };
        let id = generate_case_id();
        self.rows
            .set_cell(doc.row, col, Value::String(id.clone()))
            .await
            .with_context(|| format!("Failed to write case id for row {}", doc.row))?;
        info!(row = doc.row, case_id = %id, "generated case id");
        doc.fields.insert("caseId".to_string(), Value::String(id.clone()));
        doc.case_id = Some(id);
        Ok(())
    }

    fn project_extras(
        &self,
        doc: &mut LayerDocument,
        header_map: &HeaderMap,
        selection: &[String],
        cell_at: &dyn Fn(usize) -> Cell,
    ) {
        let covered = covered_fields();
        for name in selection.iter().filter(|n| !covered.contains(n.as_str())) {
            match resolve_with_fallback(header_map, &FieldRef::from(name.as_str())) {
                Some(col) => {
                    let cell = cell_at(col);
                    let value = if is_blank(&cell) { Value::Null } else { cell };
                    doc.extras
                        .insert(name.clone(), truncate_value(value, self.max_value_chars));
                }
                None => {
                    doc.extras.insert(name.clone(), Value::Null);
                    doc.unresolved.push(name.clone());
                }
            }
        }
    }
}

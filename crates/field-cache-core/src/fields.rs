//! Typed registry of known semantic field names.
//!
//! Layer definitions refer to fields through [`KnownField`] so a typo is a
//! compile error rather than a silently unresolved column. Names discovered
//! at runtime that are not in the registry travel as [`FieldRef::Custom`].
//!
//! Each known field also carries the column index it occupied in the legacy
//! fixed sheet layout. That index is only used as a logged fallback when
//! the header map cannot resolve the name (see [`crate::schema`]).

use serde::{Deserialize, Serialize};

macro_rules! known_fields {
    ($( $variant:ident => $name:literal, $legacy:literal; )+) => {
        /// A semantic field the engine knows about at compile time.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum KnownField {
            $( $variant, )+
        }

        impl KnownField {
            pub const ALL: &'static [KnownField] = &[ $( KnownField::$variant, )+ ];

            /// Full semantic name as it appears in the header catalog.
            pub fn semantic_name(&self) -> &'static str {
                match self {
                    $( KnownField::$variant => $name, )+
                }
            }

            /// Column index in the legacy fixed layout.
            pub fn legacy_index(&self) -> usize {
                match self {
                    $( KnownField::$variant => $legacy, )+
                }
            }
        }
    };
}

known_fields! {
    CaseId => "Case_Organization_Case_ID", 0;
    SparkTitle => "Case_Organization_Spark_Title", 1;
    Pathway => "Case_Organization_Pathway_or_Course_Name", 5;
    DifficultyLevel => "Case_Organization_Difficulty_Level", 6;
    PreSimOverview => "Case_Organization_Pre_Sim_Overview", 9;
    PostSimOverview => "Case_Organization_Post_Sim_Overview", 10;
    MedicalCategory => "Case_Organization_Medical_Category", 11;
    EducationalGoal => "Set_the_Stage_Context_Educational_Goal", 34;
    ClinicalVignette => "Set_the_Stage_Context_Clinical_Vignette", 36;
    EnvironmentType => "Set_the_Stage_Context_Environment_Type", 38;
    DispositionPlan => "Situation_and_Environment_Details_Disposition_Plan", 48;
    InitialVitals => "Monitor_Vital_Signs_Initial_Vitals", 55;
    PatientName => "Patient_Demographics_and_Clinical_Data_Patient_Name", 61;
    Age => "Patient_Demographics_and_Clinical_Data_Age", 62;
    Gender => "Patient_Demographics_and_Clinical_Data_Gender", 63;
    PresentingComplaint => "Patient_Demographics_and_Clinical_Data_Presenting_Complaint", 66;
    PastMedicalHistory => "Patient_Demographics_and_Clinical_Data_Past_Medical_History", 67;
    CurrentMedications => "Patient_Demographics_and_Clinical_Data_Current_Medications", 68;
    Allergies => "Patient_Demographics_and_Clinical_Data_Allergies", 69;
    ExamPositiveFindings => "Patient_Demographics_and_Clinical_Data_Exam_Positive_Findings", 73;
    LearningObjective => "CME_and_Educational_Content_CME_Learning_Objective", 191;
}

impl KnownField {
    pub fn from_semantic_name(name: &str) -> Option<Self> {
        Self::ALL
            .iter()
            .copied()
            .find(|f| f.semantic_name() == name)
    }
}

/// A semantic field name, known or discovered at runtime.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum FieldRef {
    Known(KnownField),
    Custom(String),
}

impl FieldRef {
    pub fn as_str(&self) -> &str {
        match self {
            FieldRef::Known(f) => f.semantic_name(),
            FieldRef::Custom(s) => s,
        }
    }

    pub fn legacy_index(&self) -> Option<usize> {
        match self {
            FieldRef::Known(f) => Some(f.legacy_index()),
            FieldRef::Custom(_) => None,
        }
    }
}

impl From<KnownField> for FieldRef {
    fn from(f: KnownField) -> Self {
        FieldRef::Known(f)
    }
}

impl From<&str> for FieldRef {
    fn from(s: &str) -> Self {
        match KnownField::from_semantic_name(s) {
            Some(f) => FieldRef::Known(f),
            None => FieldRef::Custom(s.to_string()),
        }
    }
}

impl From<String> for FieldRef {
    fn from(s: String) -> Self {
        match KnownField::from_semantic_name(&s) {
            Some(f) => FieldRef::Known(f),
            None => FieldRef::Custom(s),
        }
    }
}

impl From<FieldRef> for String {
    fn from(f: FieldRef) -> Self {
        f.as_str().to_string()
    }
}

/// Does `name` contain `fragment` anywhere? Case-sensitive.
///
/// Plain substring so that drifted names like `Initial_VitalsJSON` still
/// match `Initial_Vitals`.
pub fn matches_fragment(name: &str, fragment: &str) -> bool {
    !fragment.is_empty() && name.contains(fragment)
}

/// Does `name` contain `fragment` on `_` token boundaries?
///
/// Used to rank substring matches: `Data_Age` beats `Ages_Seen`.
pub fn matches_on_boundary(name: &str, fragment: &str) -> bool {
    if fragment.is_empty() {
        return false;
    }
    name.match_indices(fragment).any(|(start, _)| {
        let end = start + fragment.len();
        let left_ok = start == 0 || name.as_bytes()[start - 1] == b'_';
        let right_ok = end == name.len() || name.as_bytes()[end] == b'_';
        left_ok && right_ok
    })
}

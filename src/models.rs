use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

// ======================================================================
// JOB
// ======================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobMode {
    Auto,
    Review,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Created,
    Running,
    AwaitingResolution,
    Completed,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub mode: JobMode,
    pub status: JobStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub calculated: usize,
    pub ambiguous: usize,
    pub errors: usize,
}

impl Job {
    pub fn new(mode: JobMode) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            mode,
            status: JobStatus::Created,
            created_at: now,
            updated_at: now,
            total: 0,
            pending: 0,
            processing: 0,
            calculated: 0,
            ambiguous: 0,
            errors: 0,
        }
    }

    /// Aggregate counters, as exposed to the export/HTTP collaborators.
    pub fn counters(&self) -> JobCounters {
        JobCounters {
            total: self.total,
            pending: self.pending,
            processing: self.processing,
            calculated: self.calculated,
            ambiguous: self.ambiguous,
            errors: self.errors,
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct JobCounters {
    pub total: usize,
    pub pending: usize,
    pub processing: usize,
    pub calculated: usize,
    pub ambiguous: usize,
    pub errors: usize,
}

// ======================================================================
// INPUT ROW
// ======================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Scope {
    #[serde(rename = "Scope 1")]
    Scope1,
    #[serde(rename = "Scope 2")]
    Scope2,
    #[serde(rename = "Scope 3")]
    Scope3,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RowStatus {
    Pending,
    Searching,
    LlmDeciding,
    Ambiguous,
    Decomposing,
    Matched,
    Calculated,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ComponentCategory {
    Materials,
    Energy,
    Packaging,
    Transport,
    Processes,
}

/// A human-entered product/activity row awaiting a catalogue match.
///
/// Field names follow the German business vocabulary the upload
/// collaborator hands the core: `bezeichnung`/`referenzeinheit` are
/// required, everything else is optional context used to steer
/// retrieval and the scope-hint query augmentation.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InputRow {
    pub id: Uuid,
    pub job_id: Uuid,
    pub row_index: usize,

    pub bezeichnung: String,
    pub referenzeinheit: String,
    pub produktinformationen: Option<String>,
    pub scope: Option<Scope>,
    pub kategorie: Option<String>,
    pub unterkategorie: Option<String>,
    pub region: Option<String>,
    pub referenzjahr: Option<i32>,

    /// Set by the normaliser (C1); `None` until the row has passed through it.
    #[serde(default)]
    pub bezeichnung_norm: Option<String>,
    #[serde(default)]
    pub produktinfo_norm: Option<String>,
    #[serde(default)]
    pub region_norm: Option<String>,
    #[serde(default)]
    pub unit_norm: Option<String>,

    pub status: RowStatus,
    #[serde(default)]
    pub error_kind: Option<String>,
    #[serde(default)]
    pub error_message: Option<String>,
}

impl InputRow {
    pub fn new(job_id: Uuid, row_index: usize, bezeichnung: String, referenzeinheit: String) -> Self {
        Self {
            id: Uuid::new_v4(),
            job_id,
            row_index,
            bezeichnung,
            referenzeinheit,
            produktinformationen: None,
            scope: None,
            kategorie: None,
            unterkategorie: None,
            region: None,
            referenzjahr: None,
            bezeichnung_norm: None,
            produktinfo_norm: None,
            region_norm: None,
            unit_norm: None,
            status: RowStatus::Pending,
            error_kind: None,
            error_message: None,
        }
    }

    /// Build the minimal synthetic row used to resolve one decomposition
    /// component: inherits region/scope/category from the parent.
    pub fn for_component(parent: &InputRow, name: &str, category: ComponentCategory) -> Self {
        let mut row = InputRow::new(parent.job_id, parent.row_index, name.to_string(), parent.referenzeinheit.clone());
        row.region = parent.region.clone();
        row.scope = parent.scope;
        row.kategorie = Some(format!("{category:?}"));
        row.unterkategorie = parent.unterkategorie.clone();
        row.referenzjahr = parent.referenzjahr;
        row
    }
}

// ======================================================================
// CANDIDATES
// ======================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Candidate {
    pub uuid: String,
    pub activity_name: String,
    pub product_name: String,
    pub geography: String,
    pub unit: String,
    pub rank: usize,
    pub rationale: String,
}

pub type CandidateSet = Vec<Candidate>;

// ======================================================================
// DECOMPOSITION COMPONENTS
// ======================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ComponentSpec {
    pub name: String,
    pub quantity: f64,
    pub category: ComponentCategory,
    pub note: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedComponent {
    pub spec: ComponentSpec,
    pub selected_uuid: String,
    pub biogenic_t: f64,
    pub common_t: f64,
}

// ======================================================================
// ROW RESULT
// ======================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DecisionType {
    Match,
    Ambiguous,
    Decompose,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowResult {
    pub decision_type: DecisionType,
    pub selected_uuid: Option<String>,
    pub candidates_json: Option<String>,
    pub components_json: Option<String>,
    pub biogenic_t: String,
    pub common_t: String,
    pub beschreibung: String,
    pub quelle: String,
    pub detailed_calc: String,
    pub provenance_json: String,
}

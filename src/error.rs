use thiserror::Error;

/// Error kinds surfaced to `InputRow.status = error` (see `error_message`).
///
/// Every variant maps 1:1 to an entry in the error-handling table: the
/// orchestrator never lets one of these cross a row boundary, it only
/// ever sets the owning row's status and moves on to the next row.
#[derive(Debug, Error)]
pub enum LcaError {
    #[error("unknown unit: {0}")]
    UnknownUnit(String),

    #[error("no candidates returned for query")]
    NoCandidates,

    #[error("LLM transport error after {attempts} attempts: {source}")]
    LlmTransport {
        attempts: u32,
        #[source]
        source: anyhow::Error,
    },

    #[error("LLM returned malformed output: {0}")]
    LlmMalformed(String),

    #[error("decomposition invariant violated after {attempts} retries: {reason}")]
    DecompositionInvalid { attempts: u32, reason: String },

    #[error("unit conversion failed: {0}")]
    UnitConversionFailed(String),

    #[error("component {name} failed: {source}")]
    ComponentFailed {
        name: String,
        #[source]
        source: Box<LcaError>,
    },

    #[error("cancelled")]
    Cancelled,

    #[error("row {0} not found")]
    RowNotFound(String),

    #[error("row {0} is not awaiting resolution")]
    NotAmbiguous(String),

    #[error("uuid {0} is not among the saved candidates for this row")]
    UuidNotCandidate(String),

    #[error("store timed out acquiring a writer after {0:?}")]
    StoreBusy(std::time::Duration),

    #[error("catalogue error: {0}")]
    Catalogue(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Csv(#[from] csv::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl LcaError {
    /// The short, stable machine-readable tag stored as `error_message`
    /// when a row terminates in `error` state (e.g. `"UnknownUnit"`).
    pub fn kind_tag(&self) -> &'static str {
        match self {
            LcaError::UnknownUnit(_) => "UnknownUnit",
            LcaError::NoCandidates => "NoCandidates",
            LcaError::LlmTransport { .. } => "LLMTransport",
            LcaError::LlmMalformed(_) => "LLMMalformed",
            LcaError::DecompositionInvalid { .. } => "DecompositionInvalid",
            LcaError::UnitConversionFailed(_) => "UnitConversionFailed",
            LcaError::ComponentFailed { .. } => "ComponentFailed",
            LcaError::Cancelled => "Cancelled",
            LcaError::RowNotFound(_) => "RowNotFound",
            LcaError::NotAmbiguous(_) => "NotAmbiguous",
            LcaError::UuidNotCandidate(_) => "UuidNotCandidate",
            LcaError::StoreBusy(_) => "StoreBusy",
            LcaError::Catalogue(_) => "Catalogue",
            LcaError::Io(_) => "Io",
            LcaError::Csv(_) => "Csv",
            LcaError::Json(_) => "Json",
        }
    }
}

pub type Result<T> = std::result::Result<T, LcaError>;

use std::time::Duration;

use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("migration error: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),

    #[error("record store unavailable: {0}")]
    Unavailable(String),
}

#[derive(Debug, Error)]
pub enum AnalysisError {
    #[error("LLM endpoint is not reachable at {0}")]
    Connection(String),

    #[error("LLM endpoint returned error (status {status}): {body}")]
    Status { status: u16, body: String },

    #[error("HTTP client error: {0}")]
    HttpClient(String),

    #[error("response parsing error: {0}")]
    ResponseParsing(String),

    #[error("prompt rendering error: {0}")]
    Prompt(#[from] serde_json::Error),
}

#[derive(Debug, Error)]
pub enum BlobError {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("invalid object key: {0:?}")]
    InvalidKey(String),

    #[error("object store unavailable: {0}")]
    Unavailable(String),

    #[error("I/O error on {key}: {source}")]
    Io {
        key: String,
        #[source]
        source: std::io::Error,
    },
}

#[derive(Debug, Error)]
pub enum RecommendationError {
    #[error("recommendation generation failed: {0}")]
    Generation(#[from] AnalysisError),

    #[error("recommendation storage failed: {0}")]
    Storage(#[from] BlobError),

    #[error("recommendation step exceeded deadline of {0:?}")]
    Deadline(Duration),
}

/// The step of a per-patient evaluation that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EvalStage {
    Scan,
    AcquireLease,
    FetchRecords,
    LoadCheckpoint,
    Analyze,
    LoadOpenAlert,
    LoadFacility,
    InsertAlert,
    AdvanceCheckpoint,
}

impl std::fmt::Display for EvalStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            EvalStage::Scan => "candidate scan",
            EvalStage::AcquireLease => "lease acquisition",
            EvalStage::FetchRecords => "record fetch",
            EvalStage::LoadCheckpoint => "checkpoint load",
            EvalStage::Analyze => "analysis",
            EvalStage::LoadOpenAlert => "open alert lookup",
            EvalStage::LoadFacility => "facility lookup",
            EvalStage::InsertAlert => "alert insert",
            EvalStage::AdvanceCheckpoint => "checkpoint advance",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum EvalError {
    #[error("{stage} failed: {source}")]
    Store {
        stage: EvalStage,
        #[source]
        source: StoreError,
    },

    #[error("analysis failed: {0}")]
    Analysis(#[from] AnalysisError),

    #[error("{stage} exceeded deadline of {limit:?}")]
    Deadline { stage: EvalStage, limit: Duration },

    #[error("lease lost before {stage}; another evaluation owns this patient")]
    LeaseLost { stage: EvalStage },
}

impl EvalError {
    pub fn stage(&self) -> EvalStage {
        match self {
            EvalError::Store { stage, .. }
            | EvalError::Deadline { stage, .. }
            | EvalError::LeaseLost { stage } => *stage,
            EvalError::Analysis(_) => EvalStage::Analyze,
        }
    }
}

// 🧯 Error taxonomy for the ingestion pipeline
//
// StoreError  = what a backend (sqlite, filesystem, memory) reports
// IngestError = what an upload reports to its caller, always tagged with the stage

use serde::Serialize;
use std::fmt;
use std::time::Duration;
use thiserror::Error;

// ============================================================================
// PIPELINE STAGES
// ============================================================================

/// Step of an upload; used to tag failures, timeouts and cancellations
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "stage")]
pub enum Stage {
    Parse,
    RegistryFetch,
    UploadFile,
    DuplicateCheck,
    RegistryCreate,
    PlanInsert,
    EntryBatch { index: usize, total: usize },
    Hydrate,
    Finalize,
    Sweep,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Stage::Parse => write!(f, "parsing file"),
            Stage::RegistryFetch => write!(f, "fetching site registry"),
            Stage::UploadFile => write!(f, "uploading file"),
            Stage::DuplicateCheck => write!(f, "checking for duplicate uploads"),
            Stage::RegistryCreate => write!(f, "registering new sites"),
            Stage::PlanInsert => write!(f, "creating plan record"),
            Stage::EntryBatch { index, total } => {
                write!(f, "saving entry batch {} of {}", index, total)
            }
            Stage::Hydrate => write!(f, "loading saved plan"),
            Stage::Finalize => write!(f, "finalizing plan"),
            Stage::Sweep => write!(f, "sweeping stale plans"),
        }
    }
}

// ============================================================================
// BACKEND ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("store lock poisoned")]
    Poisoned,

    #[error("background task failed: {0}")]
    Join(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("corrupt record: {0}")]
    Corrupt(String),

    #[error("{0}")]
    Backend(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

// ============================================================================
// UPLOAD ERRORS
// ============================================================================

#[derive(Debug, Error)]
pub enum IngestError {
    /// Blocking validation issues; the full report travels with the result
    #[error("CSV validation failed with {blocking} blocking issue(s)")]
    Validation { blocking: usize },

    #[error("storage error while {stage}: {source}")]
    Storage {
        stage: Stage,
        #[source]
        source: StoreError,
    },

    #[error("persistence error while {stage}: {source}")]
    Persistence {
        stage: Stage,
        #[source]
        source: StoreError,
    },

    #[error("duplicate upload: {0}")]
    DuplicateUpload(String),

    #[error("timed out after {}s while {stage}", .timeout.as_secs())]
    Timeout { stage: Stage, timeout: Duration },

    #[error("upload cancelled while {stage}")]
    Cancelled { stage: Stage },

    #[error("file is {size} bytes, larger than the {limit} byte limit")]
    FileTooLarge { size: usize, limit: usize },

    #[error("unsupported file type: {0}")]
    UnsupportedFile(String),
}

impl IngestError {
    pub fn storage(stage: Stage, source: StoreError) -> Self {
        IngestError::Storage { stage, source }
    }

    pub fn persistence(stage: Stage, source: StoreError) -> Self {
        IngestError::Persistence { stage, source }
    }

    /// Stable machine-readable code (API responses, CLI exit summaries)
    pub fn code(&self) -> &'static str {
        match self {
            IngestError::Validation { .. } => "validation_error",
            IngestError::Storage { .. } => "storage_error",
            IngestError::Persistence { .. } => "persistence_error",
            IngestError::DuplicateUpload(_) => "duplicate_upload",
            IngestError::Timeout { .. } => "timeout",
            IngestError::Cancelled { .. } => "cancelled",
            IngestError::FileTooLarge { .. } => "file_too_large",
            IngestError::UnsupportedFile(_) => "unsupported_file",
        }
    }

    pub fn stage(&self) -> Option<Stage> {
        match self {
            IngestError::Storage { stage, .. }
            | IngestError::Persistence { stage, .. }
            | IngestError::Timeout { stage, .. }
            | IngestError::Cancelled { stage } => Some(*stage),
            _ => None,
        }
    }
}

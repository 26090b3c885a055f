//! Error taxonomy for the pipeline engine.
//!
//! Stage failures are typed so that a task record can report *which*
//! collaborator failed; everything else propagates through `anyhow` with
//! context, matching how the rest of the crate handles fallible calls.

use std::time::Duration;

use thiserror::Error;

/// Failure of a single pipeline stage. Recorded verbatim on the task record
/// and never retried by the orchestrator itself.
#[derive(Debug, Error)]
pub enum StageError {
    #[error("fetch failed: {0}")]
    Fetch(String),

    #[error("transcription failed: {0}")]
    Transcribe(String),

    #[error("translation failed: {0}")]
    Translate(String),

    #[error("encode failed: {0}")]
    Encode(String),

    #[error("malformed segments: {0}")]
    Validation(String),

    /// The accelerator gate could not be acquired within the configured
    /// bound. Fatal to the stage, not to the process.
    #[error("accelerator gate not acquired within {0:?}")]
    GateTimeout(Duration),
}

impl StageError {
    /// Stable error-kind tag stored on the task record and exposed to
    /// status queries.
    pub fn kind(&self) -> &'static str {
        match self {
            StageError::Fetch(_) => "FetchError",
            StageError::Transcribe(_) => "TranscribeError",
            StageError::Translate(_) => "TranslateError",
            StageError::Encode(_) => "EncodeError",
            StageError::Validation(_) => "ValidationError",
            StageError::GateTimeout(_) => "GateTimeout",
        }
    }
}

/// Task store failures visible to callers.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("task {0} not found")]
    NotFound(String),

    /// Update attempted on a task that already reached a terminal stage.
    #[error("task {0} is already terminal")]
    Conflict(String),

    #[error(transparent)]
    Backend(#[from] anyhow::Error),
}

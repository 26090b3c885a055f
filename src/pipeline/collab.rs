//! Collaborator interfaces consumed by the orchestrator.
//!
//! Each external dependency (fetch tool, speech-to-text, translation API,
//! encoder) is a typed trait with structured error mapping, so the
//! orchestrator drives real subprocess/API implementations and tests drive
//! mocks through the same seam. All calls are blocking from the invoking
//! worker's perspective; the orchestrator offloads them accordingly.

use std::path::{Path, PathBuf};

use crate::error::StageError;
use crate::store::schema::{MediaInfo, Segment, SourceRef};

#[derive(Debug, Clone, PartialEq)]
pub struct FetchOutput {
    pub media_path: PathBuf,
    pub info: MediaInfo,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncodeRequest {
    pub task_id: String,
    pub input: PathBuf,
    pub subtitle_track: Option<PathBuf>,
    pub logo: Option<PathBuf>,
    pub video_bitrate: String,
    pub audio_bitrate: String,
    pub max_width: u32,
    /// Source duration in seconds, used for progress reporting.
    pub duration: f64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct EncodeOutput {
    pub output_path: PathBuf,
    pub file_size: u64,
}

pub trait Fetcher: Send + Sync + 'static {
    fn fetch(&self, task_id: &str, source: &SourceRef) -> Result<FetchOutput, StageError>;
}

/// Must only be invoked while holding the accelerator gate; the
/// orchestrator guarantees that.
pub trait Transcriber: Send + Sync + 'static {
    fn transcribe(
        &self,
        task_id: &str,
        media_path: &Path,
        model_hint: &str,
    ) -> Result<Vec<Segment>, StageError>;
}

pub trait Translator: Send + Sync + 'static {
    fn translate(
        &self,
        task_id: &str,
        segments: Vec<Segment>,
        target_language: &str,
    ) -> Result<Vec<Segment>, StageError>;
}

pub trait Encoder: Send + Sync + 'static {
    fn probe_dimensions(&self, input: &Path) -> Result<(u32, u32), StageError>;

    fn encode(&self, request: &EncodeRequest) -> Result<EncodeOutput, StageError>;

    /// True when this encoder shares the process accelerator context and
    /// must run under the gate. Subprocess encoders own their process and
    /// are exempt.
    fn needs_gate(&self) -> bool;
}

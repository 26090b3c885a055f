//! Durable task record schema.
//!
//! Records are bitcode-encoded into redb; the serde derives feed the
//! status/result snapshots and callback payloads.

use bitcode::{Decode, Encode};
use serde::{Deserialize, Serialize};

use crate::error::StageError;

// ────────────────────────────────────────────────────────────────
// Stages
// ────────────────────────────────────────────────────────────────

/// Lifecycle stage of a task. Transitions are strictly forward along the
/// pipeline order; `Failed` and `Cancelled` are reachable from any
/// non-terminal stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "camelCase")]
pub enum TaskStage {
    Queued,
    Fetching,
    Transcribing,
    Translating,
    Encoding,
    Done,
    Failed,
    Cancelled,
}

impl TaskStage {
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStage::Done | TaskStage::Failed | TaskStage::Cancelled)
    }

    /// Position in the pipeline order, used to reject regressions.
    /// Terminal overrides sit past every running stage.
    pub fn rank(self) -> u8 {
        match self {
            TaskStage::Queued => 0,
            TaskStage::Fetching => 1,
            TaskStage::Transcribing => 2,
            TaskStage::Translating => 3,
            TaskStage::Encoding => 4,
            TaskStage::Done | TaskStage::Failed | TaskStage::Cancelled => 5,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStage::Queued => "queued",
            TaskStage::Fetching => "fetching",
            TaskStage::Transcribing => "transcribing",
            TaskStage::Translating => "translating",
            TaskStage::Encoding => "encoding",
            TaskStage::Done => "done",
            TaskStage::Failed => "failed",
            TaskStage::Cancelled => "cancelled",
        }
    }
}

// ────────────────────────────────────────────────────────────────
// Inputs
// ────────────────────────────────────────────────────────────────

/// Where the media comes from: a remote URL handed to the fetch tool, or a
/// file already uploaded through the (out-of-scope) front door.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "camelCase")]
pub enum SourceRef {
    Url(String),
    Upload(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "camelCase", default)]
pub struct TaskOptions {
    pub translate: bool,
    pub target_language: String,
    pub embed_subtitles: bool,
    pub embed_logo: bool,
    pub video_bitrate: String,
    pub audio_bitrate: String,
    pub max_width: u32,
    /// Raw logo image bytes; the front door handles any transfer encoding.
    pub logo: Option<Vec<u8>>,
    pub callback_url: Option<String>,
}

impl Default for TaskOptions {
    fn default() -> Self {
        Self {
            translate: true,
            target_language: "zh".to_string(),
            embed_subtitles: true,
            embed_logo: false,
            video_bitrate: "500k".to_string(),
            audio_bitrate: "64k".to_string(),
            max_width: 720,
            logo: None,
            callback_url: None,
        }
    }
}

// ────────────────────────────────────────────────────────────────
// Stage outputs
// ────────────────────────────────────────────────────────────────

/// One timed unit of transcribed speech, optionally carrying a translation.
/// Timing is set by transcription and never touched afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "camelCase")]
pub struct Segment {
    pub start: f64,
    pub end: f64,
    pub text: String,
    pub language: String,
    pub translation: Option<String>,
}

/// Metadata reported by the fetch tool.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "camelCase")]
pub struct MediaInfo {
    pub title: String,
    pub description: String,
    pub duration: f64,
    pub thumbnail_path: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "camelCase")]
pub struct ErrorDetail {
    pub kind: String,
    pub message: String,
}

impl ErrorDetail {
    pub fn from_anyhow(err: &anyhow::Error) -> Self {
        let kind = err
            .downcast_ref::<StageError>()
            .map(StageError::kind)
            .unwrap_or("InternalError");
        Self {
            kind: kind.to_string(),
            message: format!("{err:#}"),
        }
    }
}

// ────────────────────────────────────────────────────────────────
// Record
// ────────────────────────────────────────────────────────────────

/// Canonical task record. The store owns it; the orchestrator works on a
/// copy and writes back once per stage commit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Encode, Decode)]
#[serde(rename_all = "camelCase")]
pub struct TaskRecord {
    pub id: String,
    pub source: SourceRef,
    pub options: TaskOptions,
    pub stage: TaskStage,
    pub error: Option<ErrorDetail>,

    pub media_path: Option<String>,
    pub media_info: Option<MediaInfo>,
    pub segments: Option<Vec<Segment>>,
    /// Set once the translate stage committed, so redelivery does not
    /// re-translate.
    pub translated: bool,
    pub subtitle_path: Option<String>,
    pub output_path: Option<String>,
    pub file_size: Option<u64>,

    /// Unix milliseconds.
    pub created_at: i64,
    pub updated_at: i64,
}

impl TaskRecord {
    pub fn new(id: String, source: SourceRef, options: TaskOptions) -> Self {
        let now = chrono::Utc::now().timestamp_millis();
        Self {
            id,
            source,
            options,
            stage: TaskStage::Queued,
            error: None,
            media_path: None,
            media_info: None,
            segments: None,
            translated: false,
            subtitle_path: None,
            output_path: None,
            file_size: None,
            created_at: now,
            updated_at: now,
        }
    }
}

/// Rejects segment sequences the layout and encode stages cannot trust:
/// negative spans and non-monotonic start times. The orchestrator does not
/// re-sort collaborator output, it refuses it.
pub fn validate_segments(segments: &[Segment]) -> Result<(), StageError> {
    let mut previous_start = f64::NEG_INFINITY;
    for (index, segment) in segments.iter().enumerate() {
        if segment.start > segment.end {
            return Err(StageError::Validation(format!(
                "segment {index} has start {} after end {}",
                segment.start, segment.end
            )));
        }
        if segment.start < previous_start {
            return Err(StageError::Validation(format!(
                "segment {index} starts at {} before previous segment at {previous_start}",
                segment.start
            )));
        }
        previous_start = segment.start;
    }
    Ok(())
}

//! Whisper CLI backed transcription collaborator.
//!
//! The accelerator-bound inference itself is an external tool; this
//! adapter shells out to a configured whisper command, then parses the
//! JSON transcript it writes next to the media file. The orchestrator
//! holds the accelerator gate for the whole call.

use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::Arc;

use log::info;
use serde::Deserialize;

use crate::config::AppConfig;
use crate::error::StageError;
use crate::store::schema::Segment;

use super::collab::Transcriber;

pub struct WhisperCli {
    config: Arc<AppConfig>,
}

impl WhisperCli {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self { config }
    }
}

#[derive(Debug, Deserialize)]
struct RawTranscript {
    #[serde(default)]
    language: Option<String>,
    #[serde(default)]
    segments: Vec<RawSegment>,
}

#[derive(Debug, Deserialize)]
struct RawSegment {
    start: f64,
    end: f64,
    text: String,
}

impl Transcriber for WhisperCli {
    fn transcribe(
        &self,
        task_id: &str,
        media_path: &Path,
        model_hint: &str,
    ) -> Result<Vec<Segment>, StageError> {
        let command = self.config.transcribe_command.as_deref().ok_or_else(|| {
            StageError::Transcribe("no transcriber configured (TRANSCRIBE_COMMAND)".to_string())
        })?;
        let output_dir = media_path.parent().ok_or_else(|| {
            StageError::Transcribe(format!("media path {media_path:?} has no parent"))
        })?;

        info!("[{task_id}] transcribing {media_path:?} with model {model_hint}");
        let output = Command::new(command)
            .args(["--model", model_hint, "--output_format", "json", "--output_dir"])
            .arg(output_dir)
            .arg(media_path)
            .stdin(Stdio::null())
            .output()
            .map_err(|err| StageError::Transcribe(format!("failed to spawn {command}: {err}")))?;
        if !output.status.success() {
            return Err(StageError::Transcribe(format!(
                "{command} exited with {}: {}",
                output.status.code().unwrap_or(-1),
                String::from_utf8_lossy(&output.stderr)
                    .lines()
                    .last()
                    .unwrap_or("")
            )));
        }

        let stem = media_path
            .file_stem()
            .and_then(|stem| stem.to_str())
            .unwrap_or("video");
        let transcript_path = output_dir.join(format!("{stem}.json"));
        let raw = std::fs::read_to_string(&transcript_path).map_err(|err| {
            StageError::Transcribe(format!("transcript {transcript_path:?} unreadable: {err}"))
        })?;
        let segments = parse_transcript(&raw)?;
        info!("[{task_id}] transcription produced {} segments", segments.len());
        Ok(segments)
    }
}

fn parse_transcript(raw: &str) -> Result<Vec<Segment>, StageError> {
    let transcript: RawTranscript = serde_json::from_str(raw)
        .map_err(|err| StageError::Transcribe(format!("malformed transcript JSON: {err}")))?;
    let language = transcript.language.unwrap_or_else(|| "unknown".to_string());
    Ok(transcript
        .segments
        .into_iter()
        .map(|seg| Segment {
            start: seg.start,
            end: seg.end,
            text: seg.text.trim().to_string(),
            language: language.clone(),
            translation: None,
        })
        .collect())
}

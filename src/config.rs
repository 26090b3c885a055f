//! Environment-driven configuration.
//!
//! Every knob is overridable through the environment (`OUTPUT_DIR`,
//! `FETCH_SLOTS`, `GATE_TIMEOUT_SECS`, ...); `.env` files are honored for
//! local development.

use std::path::PathBuf;

use anyhow::{Context, Result};
use serde::Deserialize;

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Root directory for per-task working directories and the task database.
    pub output_dir: PathBuf,
    /// Path of the redb task database.
    pub db_path: PathBuf,

    /// Concurrent worker slots per lane. Transcribe and encode stay at one
    /// slot; the accelerator gate enforces exclusivity even if these are
    /// misconfigured.
    pub fetch_slots: usize,
    pub translate_slots: usize,
    pub transcribe_slots: usize,
    pub encode_slots: usize,

    /// Bound on waiting for the accelerator gate.
    pub gate_timeout_secs: u64,

    /// Model hint forwarded to the transcription collaborator.
    pub whisper_model: String,
    /// External transcription command (whisper CLI). Unset means the
    /// transcribe stage fails with a configuration error.
    pub transcribe_command: Option<String>,

    pub openai_api_key: Option<String>,
    pub openai_api_base: String,
    pub translate_model: String,
    /// Segments per translation request.
    pub translate_chunk_size: usize,

    /// Timeout for best-effort callback delivery.
    pub callback_timeout_secs: u64,
}

impl Default for AppConfig {
    fn default() -> Self {
        let output_dir = std::env::temp_dir().join("subpress");
        let db_path = output_dir.join("tasks.redb");
        Self {
            output_dir,
            db_path,
            fetch_slots: 3,
            translate_slots: 3,
            transcribe_slots: 1,
            encode_slots: 1,
            gate_timeout_secs: 600,
            whisper_model: "turbo".to_string(),
            transcribe_command: None,
            openai_api_key: None,
            openai_api_base: "https://api.openai.com/v1".to_string(),
            translate_model: "gpt-4.1-mini".to_string(),
            translate_chunk_size: 10,
            callback_timeout_secs: 10,
        }
    }
}

impl AppConfig {
    pub fn load() -> Result<Self> {
        dotenv::dotenv().ok();
        envy::from_env::<AppConfig>().context("failed to parse configuration from environment")
    }

    /// Working directory owned by one task; created by the fetch stage and
    /// handed forward by path.
    pub fn task_dir(&self, task_id: &str) -> PathBuf {
        self.output_dir.join(task_id)
    }
}

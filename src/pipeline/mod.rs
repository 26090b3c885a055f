//! Pipeline orchestrator.
//!
//! Drives one task through fetch → transcribe → translate → encode as a
//! single synchronous call chain inside whichever lane worker dequeued it.
//! Stages are direct calls, never re-enqueued sub-jobs awaited from inside
//! a lane: a blocking wait on a bounded lane can occupy the only worker
//! slot able to service it and self-deadlock.
//!
//! Cancellation is cooperative, checked at stage boundaries; stage entry is
//! idempotent so at-least-once redelivery re-runs safely.

pub mod collab;
pub mod encode;
pub mod fetch;
pub mod transcribe;
pub mod translate;

#[cfg(test)]
pub(crate) mod mock;

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use log::{debug, error, info, warn};
use serde_json::json;
use tokio::task::spawn_blocking;

use crate::config::AppConfig;
use crate::error::{StageError, StoreError};
use crate::gate::AcceleratorGate;
use crate::store::TaskStore;
use crate::store::schema::{ErrorDetail, TaskRecord, TaskStage, validate_segments};
use crate::subtitle::ass::FontSet;
use crate::subtitle::{CueStyle, Orientation};

use collab::{EncodeRequest, Encoder, Fetcher, Transcriber, Translator};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PipelineOutcome {
    Completed,
    /// The task was cancelled at a stage boundary.
    Cancelled,
}

pub struct Orchestrator<F, T, L, E> {
    store: Arc<TaskStore>,
    gate: Arc<AcceleratorGate>,
    config: Arc<AppConfig>,
    fetcher: Arc<F>,
    transcriber: Arc<T>,
    translator: Arc<L>,
    encoder: Arc<E>,
}

impl<F, T, L, E> Orchestrator<F, T, L, E>
where
    F: Fetcher,
    T: Transcriber,
    L: Translator,
    E: Encoder,
{
    pub fn new(
        store: Arc<TaskStore>,
        gate: Arc<AcceleratorGate>,
        config: Arc<AppConfig>,
        fetcher: Arc<F>,
        transcriber: Arc<T>,
        translator: Arc<L>,
        encoder: Arc<E>,
    ) -> Self {
        Self {
            store,
            gate,
            config,
            fetcher,
            transcriber,
            translator,
            encoder,
        }
    }

    /// Executes all remaining stages of a task. Errors mark the task failed
    /// and are not retried here; redelivery (if configured) re-enters
    /// through the same idempotent stage checks.
    pub async fn run(&self, task_id: &str) -> anyhow::Result<()> {
        let record = match self.store.get(task_id) {
            Ok(record) => record,
            Err(StoreError::NotFound(_)) => {
                warn!("[{task_id}] dequeued unknown task, dropping");
                return Ok(());
            }
            Err(err) => return Err(err.into()),
        };
        if record.stage.is_terminal() {
            debug!("[{task_id}] already {}, nothing to do", record.stage.as_str());
            return Ok(());
        }
        info!("[{task_id}] pipeline run starting from {}", record.stage.as_str());

        match self.drive(task_id).await {
            Ok(PipelineOutcome::Completed) => {
                info!("[{task_id}] pipeline finished");
                if let Ok(record) = self.store.get(task_id) {
                    self.deliver_callback(&record).await;
                }
            }
            Ok(PipelineOutcome::Cancelled) => {
                info!("[{task_id}] pipeline halted: task cancelled");
            }
            Err(err) => {
                let detail = ErrorDetail::from_anyhow(&err);
                error!("[{task_id}] pipeline failed: {} ({})", detail.message, detail.kind);
                let stored = detail.clone();
                match self.store.update(task_id, move |record| {
                    record.stage = TaskStage::Failed;
                    record.error = Some(stored);
                }) {
                    Ok(record) => self.deliver_callback(&record).await,
                    // Cancellation raced the failure; the cancel wins.
                    Err(StoreError::Conflict(_)) => {}
                    Err(store_err) => return Err(store_err.into()),
                }
            }
        }
        Ok(())
    }

    async fn drive(&self, id: &str) -> anyhow::Result<PipelineOutcome> {
        // ---- fetch ----------------------------------------------------
        let Some(record) = self.enter_stage(id, TaskStage::Fetching)? else {
            return Ok(PipelineOutcome::Cancelled);
        };
        let record = if record.media_path.is_none() {
            let fetcher = Arc::clone(&self.fetcher);
            let task_id = id.to_string();
            let source = record.source.clone();
            let output = spawn_blocking(move || fetcher.fetch(&task_id, &source))
                .await
                .map_err(|err| StageError::Fetch(format!("fetch worker panicked: {err}")))??;
            let Some(record) = self.commit(id, move |record| {
                record.media_path = Some(output.media_path.to_string_lossy().into_owned());
                record.media_info = Some(output.info);
            })?
            else {
                return Ok(PipelineOutcome::Cancelled);
            };
            record
        } else {
            debug!("[{id}] media already fetched, skipping");
            record
        };

        // ---- transcribe + translate ----------------------------------
        let record = if record.options.embed_subtitles {
            let Some(record) = self.enter_stage(id, TaskStage::Transcribing)? else {
                return Ok(PipelineOutcome::Cancelled);
            };
            let record = if record.segments.is_none() {
                let media_path = record
                    .media_path
                    .clone()
                    .context("fetch stage committed no media path")?;
                let guard = self.gate.acquire(id).await?;
                let transcriber = Arc::clone(&self.transcriber);
                let task_id = id.to_string();
                let model = self.config.whisper_model.clone();
                let segments = spawn_blocking(move || {
                    transcriber.transcribe(&task_id, Path::new(&media_path), &model)
                })
                .await
                .map_err(|err| {
                    StageError::Transcribe(format!("transcribe worker panicked: {err}"))
                })??;
                drop(guard);
                validate_segments(&segments)?;
                let Some(record) = self.commit(id, move |record| {
                    record.segments = Some(segments);
                })?
                else {
                    return Ok(PipelineOutcome::Cancelled);
                };
                record
            } else {
                debug!("[{id}] transcript already present, skipping");
                record
            };

            let same_language = record
                .segments
                .as_ref()
                .and_then(|segments| segments.first())
                .is_some_and(|seg| {
                    seg.language
                        .eq_ignore_ascii_case(&record.options.target_language)
                });
            let has_segments = record.segments.as_ref().is_some_and(|s| !s.is_empty());
            if record.options.translate && has_segments && !record.translated && !same_language {
                let Some(record) = self.enter_stage(id, TaskStage::Translating)? else {
                    return Ok(PipelineOutcome::Cancelled);
                };
                let translator = Arc::clone(&self.translator);
                let task_id = id.to_string();
                let segments = record.segments.clone().unwrap_or_default();
                let target = record.options.target_language.clone();
                let translated = spawn_blocking(move || {
                    translator.translate(&task_id, segments, &target)
                })
                .await
                .map_err(|err| {
                    StageError::Translate(format!("translate worker panicked: {err}"))
                })??;
                let Some(record) = self.commit(id, move |record| {
                    record.segments = Some(translated);
                    record.translated = true;
                })?
                else {
                    return Ok(PipelineOutcome::Cancelled);
                };
                record
            } else {
                if !same_language || !record.options.translate {
                    debug!("[{id}] translation skipped");
                } else {
                    info!("[{id}] source already speaks the target language");
                }
                record
            }
        } else {
            info!("[{id}] subtitles disabled, skipping transcription");
            record
        };

        // ---- encode ---------------------------------------------------
        let Some(record) = self.enter_stage(id, TaskStage::Encoding)? else {
            return Ok(PipelineOutcome::Cancelled);
        };
        if record.output_path.is_none() {
            let media_path = record
                .media_path
                .clone()
                .context("fetch stage committed no media path")?;

            let subtitle_track = if record.options.embed_subtitles
                && record.segments.as_ref().is_some_and(|s| !s.is_empty())
            {
                let track = self.prepare_subtitle_track(id, &record, &media_path).await?;
                let stored = track.to_string_lossy().into_owned();
                if self
                    .commit(id, move |record| record.subtitle_path = Some(stored))?
                    .is_none()
                {
                    return Ok(PipelineOutcome::Cancelled);
                }
                Some(track)
            } else {
                None
            };

            let request = EncodeRequest {
                task_id: id.to_string(),
                input: PathBuf::from(&media_path),
                subtitle_track,
                logo: self.prepare_logo(id, &record)?,
                video_bitrate: record.options.video_bitrate.clone(),
                audio_bitrate: record.options.audio_bitrate.clone(),
                max_width: record.options.max_width,
                duration: record.media_info.as_ref().map(|info| info.duration).unwrap_or(0.0),
            };
            let encoder = Arc::clone(&self.encoder);
            let output = if encoder.needs_gate() {
                let _guard = self.gate.acquire(id).await?;
                spawn_blocking(move || encoder.encode(&request))
                    .await
                    .map_err(|err| StageError::Encode(format!("encode worker panicked: {err}")))??
            } else {
                spawn_blocking(move || encoder.encode(&request))
                    .await
                    .map_err(|err| StageError::Encode(format!("encode worker panicked: {err}")))??
            };
            if self
                .commit(id, move |record| {
                    record.output_path = Some(output.output_path.to_string_lossy().into_owned());
                    record.file_size = Some(output.file_size);
                })?
                .is_none()
            {
                return Ok(PipelineOutcome::Cancelled);
            }
        } else {
            debug!("[{id}] output already encoded, skipping");
        }

        // ---- done -----------------------------------------------------
        match self.store.advance(id, TaskStage::Done, |_| {}) {
            Ok(_) => Ok(PipelineOutcome::Completed),
            Err(StoreError::Conflict(_)) => Ok(PipelineOutcome::Cancelled),
            Err(err) => Err(err.into()),
        }
    }

    // ────────────────────────────────────────────────────────────────
    // Stage bookkeeping
    // ────────────────────────────────────────────────────────────────

    /// Commits entry into a stage, honoring a concurrent cancellation.
    /// `None` means the pipeline must halt without failing the task.
    fn enter_stage(&self, id: &str, stage: TaskStage) -> anyhow::Result<Option<TaskRecord>> {
        let record = self.store.get(id)?;
        if record.stage == TaskStage::Cancelled {
            return Ok(None);
        }
        if record.stage.is_terminal() {
            debug!("[{id}] reached {} concurrently", record.stage.as_str());
            return Ok(None);
        }
        if record.stage == stage || record.stage.rank() > stage.rank() {
            // Redelivery re-enters the stage it crashed in; a recovered
            // task passes through the stages it already completed, and the
            // committed-output checks keep the pass-through idempotent.
            return Ok(Some(record));
        }
        match self.store.advance(id, stage, |_| {}) {
            Ok(record) => Ok(Some(record)),
            Err(StoreError::Conflict(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    /// Stage-output commit; `None` when a cancellation won the race.
    fn commit(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut TaskRecord),
    ) -> anyhow::Result<Option<TaskRecord>> {
        match self.store.update(id, mutate) {
            Ok(record) => Ok(Some(record)),
            Err(StoreError::Conflict(_)) => Ok(None),
            Err(err) => Err(err.into()),
        }
    }

    // ────────────────────────────────────────────────────────────────
    // Encode-stage inputs
    // ────────────────────────────────────────────────────────────────

    /// Lays the segments out as a styled cue track sized for the probed
    /// video orientation, and writes it into the task directory.
    async fn prepare_subtitle_track(
        &self,
        id: &str,
        record: &TaskRecord,
        media_path: &str,
    ) -> anyhow::Result<PathBuf> {
        if let Some(existing) = &record.subtitle_path {
            let path = PathBuf::from(existing);
            if path.is_file() {
                debug!("[{id}] reusing subtitle track {path:?}");
                return Ok(path);
            }
        }

        let encoder = Arc::clone(&self.encoder);
        let probe_input = media_path.to_string();
        let (width, height) =
            spawn_blocking(move || encoder.probe_dimensions(Path::new(&probe_input)))
                .await
                .map_err(|err| StageError::Encode(format!("probe worker panicked: {err}")))??;

        let orientation = Orientation::from_dimensions(width, height);
        let style = CueStyle::for_orientation(orientation, width, height);
        let segments = record.segments.as_deref().unwrap_or_default();
        let bilingual = segments
            .iter()
            .any(|seg| seg.translation.as_deref().is_some_and(|t| !t.is_empty()));
        let cues = crate::subtitle::layout(segments, &style, bilingual);
        let track = crate::subtitle::ass::render_track(
            &cues,
            &style,
            &FontSet::for_platform(),
            width,
            height,
        );

        let task_dir = self.config.task_dir(id);
        std::fs::create_dir_all(&task_dir)
            .with_context(|| format!("failed to create task directory {task_dir:?}"))?;
        let path = task_dir.join("subtitles.ass");
        std::fs::write(&path, track)
            .with_context(|| format!("failed to write subtitle track {path:?}"))?;
        info!("[{id}] subtitle track written: {} cues, {orientation:?}", cues.len());
        Ok(path)
    }

    /// Materializes the task's logo bytes next to the media file.
    fn prepare_logo(&self, id: &str, record: &TaskRecord) -> anyhow::Result<Option<PathBuf>> {
        if !record.options.embed_logo {
            return Ok(None);
        }
        let Some(bytes) = &record.options.logo else {
            warn!("[{id}] logo embedding requested without logo bytes");
            return Ok(None);
        };
        let task_dir = self.config.task_dir(id);
        std::fs::create_dir_all(&task_dir)
            .with_context(|| format!("failed to create task directory {task_dir:?}"))?;
        let path = task_dir.join("logo.png");
        if !path.is_file() {
            std::fs::write(&path, bytes)
                .with_context(|| format!("failed to write logo {path:?}"))?;
        }
        Ok(Some(path))
    }

    // ────────────────────────────────────────────────────────────────
    // Callback delivery
    // ────────────────────────────────────────────────────────────────

    /// Best-effort terminal notification; never retried.
    async fn deliver_callback(&self, record: &TaskRecord) {
        let Some(url) = record.options.callback_url.clone() else {
            return;
        };
        let id = record.id.clone();
        let payload = json!({
            "taskId": record.id,
            "stage": record.stage.as_str(),
            "error": record.error,
            "outputPath": record.output_path,
            "subtitlePath": record.subtitle_path,
            "fileSize": record.file_size,
            "mediaInfo": record.media_info,
        });
        let wait = Duration::from_secs(self.config.callback_timeout_secs);

        let delivery = spawn_blocking(move || {
            let client = reqwest::blocking::Client::builder().timeout(wait).build()?;
            let response = client.post(&url).json(&payload).send()?;
            Ok::<_, anyhow::Error>(response.status())
        })
        .await;

        match delivery {
            Ok(Ok(status)) if status.is_success() => info!("[{id}] callback delivered"),
            Ok(Ok(status)) => warn!("[{id}] callback rejected with {status}"),
            Ok(Err(err)) => warn!("[{id}] callback failed: {err:#}"),
            Err(err) => warn!("[{id}] callback worker panicked: {err}"),
        }
    }
}

//! In-memory collaborators for pipeline and queue tests.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::error::StageError;
use crate::store::schema::{MediaInfo, Segment, SourceRef};

use super::collab::{EncodeOutput, EncodeRequest, Encoder, FetchOutput, Fetcher, Transcriber, Translator};

/// Shared exclusivity probe. Collaborators enter on call and exit on
/// return; a second concurrent entrant sets the sticky overlap flag.
pub struct GateWindow {
    active: AtomicUsize,
    overlap: AtomicBool,
}

impl GateWindow {
    pub fn shared() -> Arc<Self> {
        Arc::new(Self {
            active: AtomicUsize::new(0),
            overlap: AtomicBool::new(false),
        })
    }

    fn enter(&self) {
        if self.active.fetch_add(1, Ordering::SeqCst) > 0 {
            self.overlap.store(true, Ordering::SeqCst);
        }
    }

    fn exit(&self) {
        self.active.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn overlapped(&self) -> bool {
        self.overlap.load(Ordering::SeqCst)
    }
}

type Hook = Box<dyn FnOnce() + Send>;

// ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockFetcher {
    calls: AtomicUsize,
    fail: bool,
    hook: Mutex<Option<Hook>>,
}

impl MockFetcher {
    pub fn failing() -> Self {
        Self {
            fail: true,
            ..Self::default()
        }
    }

    /// Runs once, inside the next fetch call. Lets tests cancel or mutate
    /// the task while the stage is mid-flight.
    pub fn set_hook(&self, hook: impl FnOnce() + Send + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Fetcher for MockFetcher {
    fn fetch(&self, task_id: &str, _source: &SourceRef) -> Result<FetchOutput, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(hook) = self.hook.lock().unwrap().take() {
            hook();
        }
        if self.fail {
            return Err(StageError::Fetch("source unreachable".to_string()));
        }
        Ok(FetchOutput {
            media_path: PathBuf::from(format!("/tmp/{task_id}/video.mp4")),
            info: MediaInfo {
                title: "mock clip".to_string(),
                duration: 10.0,
                ..MediaInfo::default()
            },
        })
    }
}

// ────────────────────────────────────────────────────────────────

pub struct MockTranscriber {
    calls: AtomicUsize,
    segments: Vec<Segment>,
    window: Option<Arc<GateWindow>>,
    busy: Duration,
}

impl Default for MockTranscriber {
    fn default() -> Self {
        Self::speaking("en")
    }
}

impl MockTranscriber {
    pub fn speaking(language: &str) -> Self {
        Self::with_segments(vec![
            Segment {
                start: 0.0,
                end: 2.0,
                text: "hello there".to_string(),
                language: language.to_string(),
                translation: None,
            },
            Segment {
                start: 2.0,
                end: 4.5,
                text: "and goodbye".to_string(),
                language: language.to_string(),
                translation: None,
            },
        ])
    }

    pub fn with_segments(segments: Vec<Segment>) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            segments,
            window: None,
            busy: Duration::ZERO,
        }
    }

    pub fn with_window(window: Arc<GateWindow>) -> Self {
        Self {
            window: Some(window),
            busy: Duration::from_millis(25),
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Transcriber for MockTranscriber {
    fn transcribe(
        &self,
        _task_id: &str,
        _media_path: &Path,
        _model_hint: &str,
    ) -> Result<Vec<Segment>, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(window) = &self.window {
            window.enter();
            std::thread::sleep(self.busy);
            window.exit();
        }
        Ok(self.segments.clone())
    }
}

// ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockTranslator {
    calls: AtomicUsize,
}

impl MockTranslator {
    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Translator for MockTranslator {
    fn translate(
        &self,
        _task_id: &str,
        mut segments: Vec<Segment>,
        target_language: &str,
    ) -> Result<Vec<Segment>, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        for segment in &mut segments {
            segment.translation = Some(format!("[{target_language}] {}", segment.text));
        }
        Ok(segments)
    }
}

// ────────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct MockEncoder {
    calls: AtomicUsize,
    gated: bool,
}

impl MockEncoder {
    pub fn gated() -> Self {
        Self {
            gated: true,
            ..Self::default()
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

impl Encoder for MockEncoder {
    fn probe_dimensions(&self, _input: &Path) -> Result<(u32, u32), StageError> {
        Ok((1280, 720))
    }

    fn encode(&self, request: &EncodeRequest) -> Result<EncodeOutput, StageError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(EncodeOutput {
            output_path: PathBuf::from(format!("/tmp/{}/output.mp4", request.task_id)),
            file_size: 1234,
        })
    }

    fn needs_gate(&self) -> bool {
        self.gated
    }
}

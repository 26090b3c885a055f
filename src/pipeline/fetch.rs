//! yt-dlp backed fetch collaborator.
//!
//! Downloads the source media into the task's working directory, walking a
//! ladder of format selectors from most to least specific, and parses the
//! tool's JSON metadata line. Uploaded files short-circuit to their
//! existing path.

use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::Arc;

use log::{info, warn};

use crate::config::AppConfig;
use crate::error::StageError;
use crate::store::schema::{MediaInfo, SourceRef};

use super::collab::{FetchOutput, Fetcher};

const VIDEO_EXTENSIONS: &[&str] = &["mp4", "mkv", "webm", "mov"];
const THUMBNAIL_EXTENSIONS: &[&str] = &["jpg", "png", "webp"];

/// Format selectors tried in order; `None` lets the tool pick.
const FORMAT_LADDER: &[Option<&str>] = &[
    Some("bestvideo[height<=1080][ext=mp4]+bestaudio[ext=m4a]/bestvideo[height<=1080]+bestaudio/best[height<=1080]"),
    Some("bestvideo+bestaudio/best"),
    Some("best"),
    None,
];

pub struct YtDlpFetcher {
    config: Arc<AppConfig>,
}

impl YtDlpFetcher {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self { config }
    }

    fn download(&self, task_id: &str, url: &str) -> Result<FetchOutput, StageError> {
        let task_dir = self.config.task_dir(task_id);
        std::fs::create_dir_all(&task_dir)
            .map_err(|err| StageError::Fetch(format!("failed to create {task_dir:?}: {err}")))?;
        let output_template = task_dir.join("video.%(ext)s");

        let mut last_error = String::new();
        for format in FORMAT_LADDER {
            clear_partial_downloads(&task_dir);
            info!(
                "[{task_id}] fetching {url} with format {}",
                format.unwrap_or("auto")
            );

            let mut cmd = Command::new("yt-dlp");
            cmd.args([
                "--output",
                &output_template.to_string_lossy(),
                "--write-thumbnail",
                "--convert-thumbnails",
                "jpg",
                "--merge-output-format",
                "mp4",
                "--no-playlist",
                "--no-check-formats",
                "--extractor-retries",
                "3",
                "--print-json",
            ]);
            if let Some(format) = format {
                cmd.args(["--format", format]);
            }
            cmd.arg(url);

            let output = match cmd.stdin(Stdio::null()).output() {
                Ok(output) => output,
                Err(err) => {
                    return Err(StageError::Fetch(format!("failed to spawn yt-dlp: {err}")));
                }
            };

            if output.status.success() {
                let info = parse_metadata(&String::from_utf8_lossy(&output.stdout));
                let media_path = find_media_file(&task_dir).ok_or_else(|| {
                    StageError::Fetch("download finished but no video file found".to_string())
                })?;
                let info = MediaInfo {
                    thumbnail_path: find_thumbnail(&task_dir)
                        .map(|p| p.to_string_lossy().into_owned()),
                    ..info
                };
                info!("[{task_id}] fetched {media_path:?}");
                return Ok(FetchOutput { media_path, info });
            }

            last_error = String::from_utf8_lossy(&output.stderr)
                .lines()
                .last()
                .unwrap_or("")
                .to_string();
            warn!(
                "[{task_id}] format {} failed: {last_error}",
                format.unwrap_or("auto")
            );
        }

        Err(StageError::Fetch(format!(
            "all format selectors failed: {last_error}"
        )))
    }
}

impl Fetcher for YtDlpFetcher {
    fn fetch(&self, task_id: &str, source: &SourceRef) -> Result<FetchOutput, StageError> {
        match source {
            SourceRef::Url(url) => self.download(task_id, url),
            SourceRef::Upload(path) => {
                let path = PathBuf::from(path);
                if !path.is_file() {
                    return Err(StageError::Fetch(format!(
                        "uploaded file {path:?} does not exist"
                    )));
                }
                info!("[{task_id}] using uploaded file {path:?}");
                Ok(FetchOutput {
                    media_path: path,
                    info: MediaInfo::default(),
                })
            }
        }
    }
}

/// Metadata arrives as the last JSON line on stdout; anything unparseable
/// degrades to empty metadata rather than failing the fetch.
fn parse_metadata(stdout: &str) -> MediaInfo {
    let value: serde_json::Value = match stdout
        .lines()
        .rev()
        .find(|line| line.trim_start().starts_with('{'))
        .and_then(|line| serde_json::from_str(line).ok())
    {
        Some(value) => value,
        None => return MediaInfo::default(),
    };
    MediaInfo {
        title: value["title"].as_str().unwrap_or_default().to_string(),
        description: value["description"].as_str().unwrap_or_default().to_string(),
        duration: value["duration"].as_f64().unwrap_or(0.0),
        thumbnail_path: None,
    }
}

fn find_media_file(task_dir: &Path) -> Option<PathBuf> {
    // The merged output lands at video.<ext> for known extensions; fall
    // back to any file the tool produced with a video extension.
    for ext in VIDEO_EXTENSIONS {
        let candidate = task_dir.join(format!("video.{ext}"));
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    find_by_extension(task_dir, VIDEO_EXTENSIONS)
}

fn find_thumbnail(task_dir: &Path) -> Option<PathBuf> {
    find_by_extension(task_dir, THUMBNAIL_EXTENSIONS)
}

fn find_by_extension(dir: &Path, extensions: &[&str]) -> Option<PathBuf> {
    let mut entries: Vec<PathBuf> = std::fs::read_dir(dir)
        .ok()?
        .filter_map(|entry| entry.ok())
        .map(|entry| entry.path())
        .filter(|path| {
            path.extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| extensions.contains(&ext.to_ascii_lowercase().as_str()))
        })
        .collect();
    entries.sort();
    entries.into_iter().next()
}

fn clear_partial_downloads(task_dir: &Path) {
    let Ok(entries) = std::fs::read_dir(task_dir) else {
        return;
    };
    for entry in entries.filter_map(|entry| entry.ok()) {
        let _ = std::fs::remove_file(entry.path());
    }
}

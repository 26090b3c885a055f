//! ffmpeg backed encode collaborator.
//!
//! Probes dimensions with ffprobe, picks the best available encoder,
//! assembles the filter graph (logo overlay, subtitle burn-in, downscale)
//! and runs ffmpeg as a child process while tailing its progress stream.
//! The child owns its own accelerator context, so this encoder is exempt
//! from the process-wide gate.

use std::io::{BufRead, BufReader};
use std::path::Path;
use std::process::{Command, Stdio};
use std::sync::{Arc, LazyLock, OnceLock};

use log::{debug, info};
use regex::Regex;

use crate::config::AppConfig;
use crate::error::StageError;

use super::collab::{EncodeOutput, EncodeRequest, Encoder};

static REGEX_OUT_TIME_US: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"out_time_us=(\d+)").unwrap());

/// Lines of stderr kept for error reporting.
const STDERR_TAIL_LINES: usize = 40;

pub struct FfmpegEncoder {
    config: Arc<AppConfig>,
    encoder: OnceLock<String>,
}

impl FfmpegEncoder {
    pub fn new(config: Arc<AppConfig>) -> Self {
        Self {
            config,
            encoder: OnceLock::new(),
        }
    }

    /// Best available H.264 encoder, probed once: videotoolbox on Apple
    /// Silicon, nvenc when both ffmpeg and the driver report an NVIDIA GPU,
    /// otherwise software x264.
    fn video_encoder(&self) -> &str {
        self.encoder.get_or_init(detect_encoder)
    }
}

impl Encoder for FfmpegEncoder {
    fn probe_dimensions(&self, input: &Path) -> Result<(u32, u32), StageError> {
        probe_dimensions(input)
    }

    fn encode(&self, request: &EncodeRequest) -> Result<EncodeOutput, StageError> {
        let task_id = &request.task_id;
        let task_dir = self.config.task_dir(task_id);
        std::fs::create_dir_all(&task_dir)
            .map_err(|err| StageError::Encode(format!("failed to create {task_dir:?}: {err}")))?;
        let output_path = task_dir.join("output.mp4");

        let encoder = self.video_encoder();
        info!("[{task_id}] encoding with {encoder}");

        let (logo_width, _) = match request.logo {
            Some(_) => {
                let (width, height) = probe_dimensions(&request.input)?;
                // Logo spans a quarter of the longer axis.
                (Some(width.max(height) / 4), height)
            }
            None => (None, 0),
        };

        let graph = build_filter_graph(
            request.subtitle_track.as_deref(),
            logo_width,
            request.max_width,
        );

        let mut cmd = Command::new("ffmpeg");
        cmd.args(["-y", "-hide_banner", "-nostats", "-loglevel", "error"]);
        cmd.args(["-progress", "pipe:2"]);
        cmd.args(["-i", &request.input.to_string_lossy()]);
        if let Some(logo) = &request.logo {
            cmd.args(["-i", &logo.to_string_lossy()]);
        }
        match &graph {
            FilterGraph::Simple(filter) => {
                cmd.args(["-vf", filter]);
            }
            FilterGraph::Complex(filter) => {
                cmd.args(["-filter_complex", filter]);
            }
        }
        cmd.args([
            "-c:v",
            encoder,
            "-b:v",
            &request.video_bitrate,
            "-c:a",
            "aac",
            "-b:a",
            &request.audio_bitrate,
            "-movflags",
            "+faststart",
        ]);
        match encoder {
            "libx264" => {
                cmd.args(["-preset", "medium", "-crf", "23"]);
            }
            "h264_nvenc" => {
                cmd.args(["-preset", "p4", "-rc", "vbr"]);
            }
            _ => {}
        }
        cmd.arg(&output_path);

        let mut child = cmd
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|err| StageError::Encode(format!("failed to spawn ffmpeg: {err}")))?;

        let tail = match child.stderr.take() {
            Some(stderr) => monitor_progress(stderr, request.duration, task_id),
            None => Vec::new(),
        };

        let status = child
            .wait()
            .map_err(|err| StageError::Encode(format!("ffmpeg did not run: {err}")))?;
        if !status.success() {
            return Err(StageError::Encode(format!(
                "ffmpeg exited with {}: {}",
                status.code().unwrap_or(-1),
                tail.join(" | ")
            )));
        }

        let file_size = std::fs::metadata(&output_path)
            .map_err(|err| StageError::Encode(format!("output file missing: {err}")))?
            .len();
        info!("[{task_id}] encoded {output_path:?} ({file_size} bytes)");
        Ok(EncodeOutput {
            output_path,
            file_size,
        })
    }

    fn needs_gate(&self) -> bool {
        false
    }
}

// ────────────────────────────────────────────────────────────────
// Filter graph
// ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FilterGraph {
    /// Plain `-vf` chain.
    Simple(String),
    /// Multi-input `-filter_complex` graph.
    Complex(String),
}

/// Assembles the video filter chain: optional logo overlay (input 1 scaled
/// to `logo_width`, 90% alpha, top-right), optional subtitle burn-in, and
/// a downscale that never upsizes.
pub fn build_filter_graph(
    subtitle_track: Option<&Path>,
    logo_width: Option<u32>,
    max_width: u32,
) -> FilterGraph {
    let scale = format!("scale='min({max_width},iw)':-2");
    let subtitle = subtitle_track.map(|path| format!("ass='{}'", escape_filter_path(path)));

    match (logo_width, subtitle) {
        (None, None) => FilterGraph::Simple(scale),
        (None, Some(subtitle)) => FilterGraph::Simple(format!("{subtitle},{scale}")),
        (Some(width), subtitle) => {
            let mut graph = format!(
                "[1]format=rgba,colorchannelmixer=aa=0.9,scale={width}:-1[logo];\
                 [0][logo]overlay=W-w-15:15[v1]"
            );
            let mut label = "[v1]";
            if let Some(subtitle) = subtitle {
                graph.push_str(&format!(";{label}{subtitle}[v2]"));
                label = "[v2]";
            }
            graph.push_str(&format!(";{label}{scale}"));
            FilterGraph::Complex(graph)
        }
    }
}

/// ffmpeg filter arguments treat `'` and `:` specially inside quoted paths.
fn escape_filter_path(path: &Path) -> String {
    path.to_string_lossy()
        .replace('\'', r"'\''")
        .replace(':', r"\:")
}

// ────────────────────────────────────────────────────────────────
// Probing & progress
// ────────────────────────────────────────────────────────────────

pub fn probe_dimensions(input: &Path) -> Result<(u32, u32), StageError> {
    let output = Command::new("ffprobe")
        .args([
            "-v",
            "error",
            "-select_streams",
            "v:0",
            "-show_entries",
            "stream=width,height",
            "-of",
            "csv=p=0",
        ])
        .arg(input)
        .output()
        .map_err(|err| StageError::Encode(format!("failed to spawn ffprobe: {err}")))?;
    if !output.status.success() {
        return Err(StageError::Encode(format!(
            "ffprobe failed: {}",
            String::from_utf8_lossy(&output.stderr).trim()
        )));
    }
    parse_dimensions(&String::from_utf8_lossy(&output.stdout)).ok_or_else(|| {
        StageError::Encode(format!("ffprobe returned no dimensions for {input:?}"))
    })
}

fn parse_dimensions(stdout: &str) -> Option<(u32, u32)> {
    let mut parts = stdout.trim().split(',');
    let width = parts.next()?.trim().parse().ok()?;
    let height = parts.next()?.trim().parse().ok()?;
    Some((width, height))
}

/// Reads the child's stderr to completion, logging coarse progress and
/// keeping a tail of non-progress lines for error reporting.
fn monitor_progress(
    stderr: std::process::ChildStderr,
    total_duration: f64,
    task_id: &str,
) -> Vec<String> {
    let mut tail = Vec::new();
    let mut last_decile = 0u32;

    for line in BufReader::new(stderr).lines().map_while(Result::ok) {
        if let Some(caps) = REGEX_OUT_TIME_US.captures(&line) {
            if total_duration > 0.0
                && let Ok(microseconds) = caps[1].parse::<f64>()
            {
                let percent = (microseconds / 1_000_000.0 / total_duration) * 100.0;
                let decile = (percent / 10.0) as u32;
                if decile > last_decile {
                    last_decile = decile;
                    debug!("[{task_id}] encode progress {:.0}%", percent.min(100.0));
                }
            }
        } else if !line.contains('=') {
            if tail.len() >= STDERR_TAIL_LINES {
                tail.remove(0);
            }
            tail.push(line);
        }
    }
    tail
}

fn detect_encoder() -> String {
    if std::env::consts::OS == "macos" && std::env::consts::ARCH == "aarch64" {
        return "h264_videotoolbox".to_string();
    }
    let nvenc_listed = Command::new("ffmpeg")
        .args(["-hide_banner", "-encoders"])
        .output()
        .map(|out| String::from_utf8_lossy(&out.stdout).contains("h264_nvenc"))
        .unwrap_or(false);
    if nvenc_listed {
        let driver_ok = Command::new("nvidia-smi")
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .status()
            .map(|status| status.success())
            .unwrap_or(false);
        if driver_ok {
            return "h264_nvenc".to_string();
        }
    }
    "libx264".to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn bare_downscale_uses_simple_chain() {
        let graph = build_filter_graph(None, None, 720);
        assert_eq!(
            graph,
            FilterGraph::Simple("scale='min(720,iw)':-2".to_string())
        );
    }

    #[test]
    fn subtitle_only_prepends_burn_in() {
        let track = PathBuf::from("/tmp/t/subtitles.ass");
        let graph = build_filter_graph(Some(&track), None, 720);
        assert_eq!(
            graph,
            FilterGraph::Simple(
                "ass='/tmp/t/subtitles.ass',scale='min(720,iw)':-2".to_string()
            )
        );
    }

    #[test]
    fn logo_and_subtitle_build_complex_graph() {
        let track = PathBuf::from("/tmp/t/subtitles.ass");
        let graph = build_filter_graph(Some(&track), Some(320), 720);
        let FilterGraph::Complex(graph) = graph else {
            panic!("expected complex graph");
        };
        assert!(graph.starts_with("[1]format=rgba,colorchannelmixer=aa=0.9,scale=320:-1[logo]"));
        assert!(graph.contains("[0][logo]overlay=W-w-15:15[v1]"));
        assert!(graph.contains("[v1]ass='/tmp/t/subtitles.ass'[v2]"));
        assert!(graph.ends_with("[v2]scale='min(720,iw)':-2"));
    }

    #[test]
    fn filter_path_escaping_handles_quotes_and_colons() {
        let path = PathBuf::from("/tmp/it's:here.ass");
        assert_eq!(escape_filter_path(&path), r"/tmp/it'\''s\:here.ass");
    }

    #[test]
    fn dimension_parsing() {
        assert_eq!(parse_dimensions("1280,720\n"), Some((1280, 720)));
        assert_eq!(parse_dimensions("1080,1920"), Some((1080, 1920)));
        assert_eq!(parse_dimensions(""), None);
        assert_eq!(parse_dimensions("garbage"), None);
    }
}

use std::process::{Command, Stdio};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result, bail};
use env_logger::{Builder, Env};
use log::{info, warn};
use tokio::runtime::Builder as RuntimeBuilder;

use subpress::config::AppConfig;
use subpress::gate::AcceleratorGate;
use subpress::pipeline::Orchestrator;
use subpress::pipeline::encode::FfmpegEncoder;
use subpress::pipeline::fetch::YtDlpFetcher;
use subpress::pipeline::transcribe::WhisperCli;
use subpress::pipeline::translate::ChatTranslator;
use subpress::queue;
use subpress::store::TaskStore;

fn main() -> Result<()> {
    Builder::from_env(Env::default().default_filter_or("info")).init();

    let config = Arc::new(AppConfig::load()?);
    std::fs::create_dir_all(&config.output_dir)
        .with_context(|| format!("failed to create output dir {:?}", config.output_dir))?;
    check_external_tools(&config)?;

    let store = Arc::new(TaskStore::open(&config.db_path)?);
    let gate = Arc::new(AcceleratorGate::new(Duration::from_secs(
        config.gate_timeout_secs,
    )));

    let runtime = RuntimeBuilder::new_multi_thread()
        .thread_name("pipeline-worker")
        .enable_all()
        .build()
        .context("failed to build tokio runtime")?;

    runtime.block_on(async {
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&store),
            Arc::clone(&gate),
            Arc::clone(&config),
            Arc::new(YtDlpFetcher::new(Arc::clone(&config))),
            Arc::new(WhisperCli::new(Arc::clone(&config))),
            Arc::new(ChatTranslator::new(Arc::clone(&config))?),
            Arc::new(FfmpegEncoder::new(Arc::clone(&config))),
        ));
        let router = queue::start(orchestrator, &config);

        let resumed = queue::recover(&store, &router)?;
        if resumed > 0 {
            info!("resumed {resumed} interrupted task(s)");
        }
        info!(
            "pipeline engine up; lane slots: fetch={} transcribe={} translate={} encode={}",
            config.fetch_slots, config.transcribe_slots, config.translate_slots, config.encode_slots
        );

        tokio::signal::ctrl_c()
            .await
            .context("failed to listen for shutdown signal")?;
        info!("shutdown signal received, draining");
        Ok::<_, anyhow::Error>(())
    })
}

/// The fetch and encode stages shell out; verify the tools exist before
/// accepting any work.
fn check_external_tools(config: &AppConfig) -> Result<()> {
    for tool in ["ffmpeg", "ffprobe"] {
        if !tool_responds(tool) {
            bail!("{tool} is not installed or not on PATH");
        }
    }
    if !tool_responds("yt-dlp") {
        warn!("yt-dlp not found; only uploaded files can be processed");
    }
    if config.transcribe_command.is_none() {
        warn!("TRANSCRIBE_COMMAND unset; subtitle tasks will fail at transcription");
    }
    Ok(())
}

fn tool_responds(tool: &str) -> bool {
    Command::new(tool)
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .map(|status| status.success())
        .unwrap_or(false)
}

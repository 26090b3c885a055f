//! Four-lane task router.
//!
//! Each stage family gets its own lane with an independent slot count, so a
//! pile-up of slow fetches never starves translation and vice versa. Lanes
//! only bound concurrency; accelerator exclusivity is the gate's job, which
//! holds even if the transcribe lane is misconfigured with extra slots.
//!
//! Delivery is at-least-once: the durable store is the source of truth, and
//! startup recovery re-enqueues every non-terminal task into the lane of
//! the stage it last recorded. Idempotent stage entry in the orchestrator
//! makes the redelivery harmless.

use std::sync::Arc;

use anyhow::Context;
use log::{debug, error, info};
use tokio::sync::Semaphore;
use tokio::sync::mpsc::{self, UnboundedSender};

use crate::config::AppConfig;
use crate::pipeline::Orchestrator;
use crate::pipeline::collab::{Encoder, Fetcher, Transcriber, Translator};
use crate::store::TaskStore;
use crate::store::schema::TaskStage;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lane {
    Fetch,
    Transcribe,
    Translate,
    Encode,
}

impl Lane {
    /// Lane responsible for resuming a task in the given stage. Terminal
    /// stages have nothing left to run.
    pub fn for_stage(stage: TaskStage) -> Option<Lane> {
        match stage {
            TaskStage::Queued | TaskStage::Fetching => Some(Lane::Fetch),
            TaskStage::Transcribing => Some(Lane::Transcribe),
            TaskStage::Translating => Some(Lane::Translate),
            TaskStage::Encoding => Some(Lane::Encode),
            TaskStage::Done | TaskStage::Failed | TaskStage::Cancelled => None,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Lane::Fetch => "fetch",
            Lane::Transcribe => "transcribe",
            Lane::Translate => "translate",
            Lane::Encode => "encode",
        }
    }
}

/// Cheap handle for enqueuing task ids into the lane dispatchers.
#[derive(Clone)]
pub struct QueueRouter {
    fetch: UnboundedSender<String>,
    transcribe: UnboundedSender<String>,
    translate: UnboundedSender<String>,
    encode: UnboundedSender<String>,
}

impl QueueRouter {
    pub fn enqueue(&self, lane: Lane, task_id: String) -> anyhow::Result<()> {
        debug!("[{task_id}] enqueued into {} lane", lane.name());
        let sender = match lane {
            Lane::Fetch => &self.fetch,
            Lane::Transcribe => &self.transcribe,
            Lane::Translate => &self.translate,
            Lane::Encode => &self.encode,
        };
        sender
            .send(task_id)
            .with_context(|| format!("{} lane dispatcher is gone", lane.name()))
    }
}

/// Spawns the four lane dispatchers onto the current runtime.
pub fn start<F, T, L, E>(
    orchestrator: Arc<Orchestrator<F, T, L, E>>,
    config: &AppConfig,
) -> QueueRouter
where
    F: Fetcher,
    T: Transcriber,
    L: Translator,
    E: Encoder,
{
    QueueRouter {
        fetch: spawn_lane(Lane::Fetch, config.fetch_slots, Arc::clone(&orchestrator)),
        transcribe: spawn_lane(
            Lane::Transcribe,
            config.transcribe_slots,
            Arc::clone(&orchestrator),
        ),
        translate: spawn_lane(
            Lane::Translate,
            config.translate_slots,
            Arc::clone(&orchestrator),
        ),
        encode: spawn_lane(Lane::Encode, config.encode_slots, orchestrator),
    }
}

/// Re-enqueues every non-terminal task into the lane of its recorded stage.
/// Returns the number of resumed tasks.
pub fn recover(store: &TaskStore, router: &QueueRouter) -> anyhow::Result<usize> {
    let mut resumed = 0;
    for record in store.non_terminal()? {
        let Some(lane) = Lane::for_stage(record.stage) else {
            continue;
        };
        info!(
            "[{}] recovering {} task into {} lane",
            record.id,
            record.stage.as_str(),
            lane.name()
        );
        router.enqueue(lane, record.id)?;
        resumed += 1;
    }
    Ok(resumed)
}

fn spawn_lane<F, T, L, E>(
    lane: Lane,
    slots: usize,
    orchestrator: Arc<Orchestrator<F, T, L, E>>,
) -> UnboundedSender<String>
where
    F: Fetcher,
    T: Transcriber,
    L: Translator,
    E: Encoder,
{
    let (sender, mut receiver) = mpsc::unbounded_channel::<String>();
    let slots = Arc::new(Semaphore::new(slots.max(1)));
    tokio::spawn(async move {
        while let Some(task_id) = receiver.recv().await {
            let Ok(permit) = Arc::clone(&slots).acquire_owned().await else {
                break;
            };
            let orchestrator = Arc::clone(&orchestrator);
            tokio::spawn(async move {
                if let Err(err) = orchestrator.run(&task_id).await {
                    error!("[{task_id}] {} lane worker error: {err:#}", lane.name());
                }
                drop(permit);
            });
        }
        debug!("{} lane dispatcher stopped", lane.name());
    });
    sender
}

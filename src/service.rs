//! Exposed task surface.
//!
//! `MediaService` is the seam an embedding server or CLI talks to: submit,
//! status, result, cancel. It owns only the store handle and the lane
//! router; pipeline execution happens in the lane workers.

use std::sync::Arc;

use log::info;
use serde::Serialize;

use crate::error::StoreError;
use crate::queue::{Lane, QueueRouter};
use crate::store::TaskStore;
use crate::store::schema::{ErrorDetail, MediaInfo, SourceRef, TaskOptions, TaskRecord};

#[derive(Clone)]
pub struct MediaService {
    store: Arc<TaskStore>,
    router: QueueRouter,
}

/// Client-facing view of a task's progress.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSnapshot {
    pub id: String,
    pub stage: &'static str,
    pub error: Option<ErrorDetail>,
    pub created_at: i64,
    pub updated_at: i64,
}

/// Deliverables of a finished task.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskOutputs {
    pub id: String,
    pub output_path: String,
    pub subtitle_path: Option<String>,
    pub file_size: Option<u64>,
    pub media_info: Option<MediaInfo>,
}

impl TaskSnapshot {
    fn of(record: &TaskRecord) -> Self {
        Self {
            id: record.id.clone(),
            stage: record.stage.as_str(),
            error: record.error.clone(),
            created_at: record.created_at,
            updated_at: record.updated_at,
        }
    }
}

impl MediaService {
    pub fn new(store: Arc<TaskStore>, router: QueueRouter) -> Self {
        Self { store, router }
    }

    /// Creates a durable task record and enqueues it into the fetch lane.
    pub fn submit(&self, source: SourceRef, options: TaskOptions) -> anyhow::Result<TaskSnapshot> {
        let record = self.store.create(source, options)?;
        info!("[{}] task submitted", record.id);
        self.router.enqueue(Lane::Fetch, record.id.clone())?;
        Ok(TaskSnapshot::of(&record))
    }

    pub fn status(&self, task_id: &str) -> Result<TaskSnapshot, StoreError> {
        Ok(TaskSnapshot::of(&self.store.get(task_id)?))
    }

    /// Deliverables of a `Done` task; anything else is a conflict.
    pub fn result(&self, task_id: &str) -> Result<TaskOutputs, StoreError> {
        let record = self.store.get(task_id)?;
        let done = record.stage == crate::store::schema::TaskStage::Done;
        let Some(output_path) = record.output_path.clone().filter(|_| done) else {
            return Err(StoreError::Conflict(format!(
                "task {task_id} is {}, not done",
                record.stage.as_str()
            )));
        };
        Ok(TaskOutputs {
            id: record.id,
            output_path,
            subtitle_path: record.subtitle_path,
            file_size: record.file_size,
            media_info: record.media_info,
        })
    }

    /// Marks the task cancelled. A running stage finishes its current
    /// external call; the pipeline stops at the next boundary.
    pub fn cancel(&self, task_id: &str) -> Result<TaskSnapshot, StoreError> {
        let record = self.store.cancel(task_id)?;
        info!("[{task_id}] cancel acknowledged");
        Ok(TaskSnapshot::of(&record))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    use crate::config::AppConfig;
    use crate::gate::AcceleratorGate;
    use crate::pipeline::Orchestrator;
    use crate::pipeline::mock::{MockEncoder, MockFetcher, MockTranscriber, MockTranslator};
    use crate::store::schema::TaskStage;

    fn service(dir: &tempfile::TempDir) -> (MediaService, Arc<TaskStore>) {
        let config = Arc::new(AppConfig {
            output_dir: dir.path().join("out"),
            db_path: dir.path().join("tasks.redb"),
            ..AppConfig::default()
        });
        let store = Arc::new(TaskStore::open(&config.db_path).unwrap());
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&store),
            Arc::new(AcceleratorGate::new(Duration::from_secs(30))),
            Arc::clone(&config),
            Arc::new(MockFetcher::default()),
            Arc::new(MockTranscriber::default()),
            Arc::new(MockTranslator::default()),
            Arc::new(MockEncoder::default()),
        ));
        let router = crate::queue::start(orchestrator, &config);
        (MediaService::new(Arc::clone(&store), router), store)
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn submit_runs_the_task_and_result_returns_outputs() {
        let dir = tempfile::tempdir().unwrap();
        let (service, store) = service(&dir);

        let snapshot = service
            .submit(
                SourceRef::Url("https://example.com/clip".into()),
                TaskOptions::default(),
            )
            .unwrap();
        assert_eq!(snapshot.stage, "queued");

        for _ in 0..500 {
            if store.get(&snapshot.id).unwrap().stage.is_terminal() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }

        let status = service.status(&snapshot.id).unwrap();
        assert_eq!(status.stage, "done");
        let outputs = service.result(&snapshot.id).unwrap();
        assert!(outputs.output_path.ends_with("output.mp4"));
        assert_eq!(outputs.file_size, Some(1234));
    }

    #[tokio::test]
    async fn result_on_unfinished_task_is_a_conflict() {
        let dir = tempfile::tempdir().unwrap();
        let (service, store) = service(&dir);
        let record = store
            .create(
                SourceRef::Url("https://example.com/clip".into()),
                TaskOptions::default(),
            )
            .unwrap();

        let err = service.result(&record.id).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[tokio::test]
    async fn cancel_acknowledges_and_sticks() {
        let dir = tempfile::tempdir().unwrap();
        let (service, store) = service(&dir);
        let record = store
            .create(
                SourceRef::Url("https://example.com/clip".into()),
                TaskOptions::default(),
            )
            .unwrap();

        let snapshot = service.cancel(&record.id).unwrap();
        assert_eq!(snapshot.stage, "cancelled");
        assert_eq!(store.get(&record.id).unwrap().stage, TaskStage::Cancelled);
        // Cancelling twice conflicts.
        assert!(matches!(
            service.cancel(&record.id),
            Err(StoreError::Conflict(_))
        ));
    }

    #[tokio::test]
    async fn status_of_unknown_task_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let (service, _store) = service(&dir);
        assert!(matches!(
            service.status("missing"),
            Err(StoreError::NotFound(_))
        ));
    }
}

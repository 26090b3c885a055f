//! Durable task store backed by redb.
//!
//! One table, keyed by task id, bitcode-encoded records. Every mutation is
//! an atomic read-modify-write inside a single write transaction, so a
//! cancellation request racing a stage commit can never produce a lost
//! update or a half-written record.

pub mod schema;

use std::path::Path;

use anyhow::{Context, Result, anyhow};
use log::debug;
use redb::{Database, ReadableTable, TableDefinition};
use uuid::Uuid;

use crate::error::StoreError;
use schema::{SourceRef, TaskOptions, TaskRecord, TaskStage};

const TASK_TABLE: TableDefinition<&str, &[u8]> = TableDefinition::new("tasks");

pub struct TaskStore {
    db: Database,
}

impl TaskStore {
    /// Opens (or creates) the database and makes sure the task table exists.
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("failed to create database directory {parent:?}"))?;
        }
        let db = Database::create(path)
            .with_context(|| format!("failed to open task database at {path:?}"))?;
        let txn = db.begin_write().context("failed to begin init transaction")?;
        {
            let _ = txn
                .open_table(TASK_TABLE)
                .context("failed to open task table")?;
        }
        txn.commit().context("failed to commit init transaction")?;
        Ok(Self { db })
    }

    // ────────────────────────────────────────────────────────────────
    // CRUD
    // ────────────────────────────────────────────────────────────────

    pub fn create(&self, source: SourceRef, options: TaskOptions) -> Result<TaskRecord> {
        let record = TaskRecord::new(Uuid::new_v4().to_string(), source, options);
        let txn = self.db.begin_write()?;
        {
            let mut table = txn.open_table(TASK_TABLE)?;
            let bytes = bitcode::encode(&record);
            table.insert(record.id.as_str(), bytes.as_slice())?;
        }
        txn.commit()?;
        debug!("[{}] task record created", record.id);
        Ok(record)
    }

    pub fn get(&self, id: &str) -> Result<TaskRecord, StoreError> {
        let txn = self
            .db
            .begin_read()
            .context("failed to begin read transaction")?;
        let table = txn
            .open_table(TASK_TABLE)
            .context("failed to open task table")?;
        let guard = table
            .get(id)
            .context("failed to read task record")?
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        let record = bitcode::decode::<TaskRecord>(guard.value())
            .map_err(|err| StoreError::Backend(anyhow!("corrupt task record {id}: {err}")))?;
        Ok(record)
    }

    /// Atomic read-modify-write. Refuses to touch a record that already
    /// reached a terminal stage; `cancel` is the only terminal override.
    pub fn update(
        &self,
        id: &str,
        mutate: impl FnOnce(&mut TaskRecord),
    ) -> Result<TaskRecord, StoreError> {
        self.modify(id, |record| {
            if record.stage.is_terminal() {
                return Err(StoreError::Conflict(id.to_string()));
            }
            mutate(record);
            Ok(())
        })
    }

    /// Stage-commit helper enforcing the monotonic-transition invariant: a
    /// task never re-enters an earlier pipeline stage.
    pub fn advance(
        &self,
        id: &str,
        to: TaskStage,
        mutate: impl FnOnce(&mut TaskRecord),
    ) -> Result<TaskRecord, StoreError> {
        self.modify(id, |record| {
            if record.stage.is_terminal() {
                return Err(StoreError::Conflict(id.to_string()));
            }
            if !to.is_terminal() && to.rank() < record.stage.rank() {
                return Err(StoreError::Backend(anyhow!(
                    "refusing stage regression {:?} -> {to:?} for task {id}",
                    record.stage
                )));
            }
            record.stage = to;
            mutate(record);
            Ok(())
        })
    }

    /// Cancellation is honored from any non-terminal stage; the orchestrator
    /// observes it at its next stage boundary.
    pub fn cancel(&self, id: &str) -> Result<TaskRecord, StoreError> {
        self.modify(id, |record| {
            if record.stage.is_terminal() {
                return Err(StoreError::Conflict(id.to_string()));
            }
            record.stage = TaskStage::Cancelled;
            Ok(())
        })
    }

    pub fn list(&self, stage: Option<TaskStage>) -> Result<Vec<TaskRecord>> {
        let mut records = self.scan(|record| stage.is_none_or(|s| record.stage == s))?;
        records.sort_by_key(|record| record.created_at);
        Ok(records)
    }

    /// Recovery scan: every task that has not reached a terminal stage and
    /// therefore needs redelivery after a restart.
    pub fn non_terminal(&self) -> Result<Vec<TaskRecord>> {
        let mut records = self.scan(|record| !record.stage.is_terminal())?;
        records.sort_by_key(|record| record.created_at);
        Ok(records)
    }

    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        let txn = self
            .db
            .begin_write()
            .context("failed to begin write transaction")?;
        let removed = {
            let mut table = txn
                .open_table(TASK_TABLE)
                .context("failed to open task table")?;
            table
                .remove(id)
                .context("failed to remove task record")?
                .is_some()
        };
        txn.commit().context("failed to commit delete")?;
        if removed {
            Ok(())
        } else {
            Err(StoreError::NotFound(id.to_string()))
        }
    }

    // ────────────────────────────────────────────────────────────────
    // Internals
    // ────────────────────────────────────────────────────────────────

    fn modify(
        &self,
        id: &str,
        apply: impl FnOnce(&mut TaskRecord) -> Result<(), StoreError>,
    ) -> Result<TaskRecord, StoreError> {
        let txn = self
            .db
            .begin_write()
            .context("failed to begin write transaction")?;
        let record = {
            let mut table = txn
                .open_table(TASK_TABLE)
                .context("failed to open task table")?;
            let mut record = {
                let guard = table
                    .get(id)
                    .context("failed to read task record")?
                    .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
                bitcode::decode::<TaskRecord>(guard.value())
                    .map_err(|err| StoreError::Backend(anyhow!("corrupt task record {id}: {err}")))?
            };
            apply(&mut record)?;
            record.updated_at = chrono::Utc::now().timestamp_millis();
            let bytes = bitcode::encode(&record);
            table.insert(id, bytes.as_slice())?;
            record
        };
        txn.commit().context("failed to commit task update")?;
        Ok(record)
    }

    fn scan(&self, keep: impl Fn(&TaskRecord) -> bool) -> Result<Vec<TaskRecord>> {
        let txn = self
            .db
            .begin_read()
            .context("failed to begin read transaction")?;
        let table = txn
            .open_table(TASK_TABLE)
            .context("failed to open task table")?;
        let mut records = Vec::new();
        for entry in table.iter()? {
            let (_, value) = entry?;
            let record: TaskRecord = bitcode::decode(value.value())
                .map_err(|err| anyhow!("corrupt task record in scan: {err}"))?;
            if keep(&record) {
                records.push(record);
            }
        }
        Ok(records)
    }
}

impl From<redb::StorageError> for StoreError {
    fn from(err: redb::StorageError) -> Self {
        StoreError::Backend(anyhow::Error::new(err))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_store() -> (tempfile::TempDir, TaskStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = TaskStore::open(&dir.path().join("tasks.redb")).unwrap();
        (dir, store)
    }

    fn new_task(store: &TaskStore) -> TaskRecord {
        store
            .create(
                SourceRef::Url("https://example.com/clip".to_string()),
                TaskOptions::default(),
            )
            .unwrap()
    }

    #[test]
    fn create_then_get_roundtrips() {
        let (_dir, store) = open_store();
        let record = new_task(&store);
        let loaded = store.get(&record.id).unwrap();
        assert_eq!(loaded, record);
        assert_eq!(loaded.stage, TaskStage::Queued);
    }

    #[test]
    fn get_missing_reports_not_found() {
        let (_dir, store) = open_store();
        assert!(matches!(store.get("nope"), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn update_applies_mutator_and_advances_updated_at() {
        let (_dir, store) = open_store();
        let record = new_task(&store);
        let before = record.updated_at;
        std::thread::sleep(std::time::Duration::from_millis(5));
        let updated = store
            .update(&record.id, |r| r.media_path = Some("/tmp/v.mp4".to_string()))
            .unwrap();
        assert_eq!(updated.media_path.as_deref(), Some("/tmp/v.mp4"));
        assert!(updated.updated_at > before);
    }

    #[test]
    fn update_on_terminal_task_is_a_conflict() {
        let (_dir, store) = open_store();
        let record = new_task(&store);
        store
            .advance(&record.id, TaskStage::Done, |_| {})
            .unwrap();
        let err = store.update(&record.id, |r| r.file_size = Some(1)).unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
        // The mutator must not have been applied.
        assert_eq!(store.get(&record.id).unwrap().file_size, None);
    }

    #[test]
    fn advance_refuses_stage_regression() {
        let (_dir, store) = open_store();
        let record = new_task(&store);
        store
            .advance(&record.id, TaskStage::Translating, |_| {})
            .unwrap();
        let err = store
            .advance(&record.id, TaskStage::Fetching, |_| {})
            .unwrap_err();
        assert!(matches!(err, StoreError::Backend(_)));
        assert_eq!(store.get(&record.id).unwrap().stage, TaskStage::Translating);
    }

    #[test]
    fn cancel_overrides_any_running_stage() {
        let (_dir, store) = open_store();
        let record = new_task(&store);
        store
            .advance(&record.id, TaskStage::Transcribing, |_| {})
            .unwrap();
        let cancelled = store.cancel(&record.id).unwrap();
        assert_eq!(cancelled.stage, TaskStage::Cancelled);
        // Terminal now: a racing stage commit reports a conflict.
        let err = store
            .advance(&record.id, TaskStage::Translating, |_| {})
            .unwrap_err();
        assert!(matches!(err, StoreError::Conflict(_)));
    }

    #[test]
    fn cancel_on_terminal_task_is_a_conflict() {
        let (_dir, store) = open_store();
        let record = new_task(&store);
        store.advance(&record.id, TaskStage::Failed, |_| {}).unwrap();
        assert!(matches!(store.cancel(&record.id), Err(StoreError::Conflict(_))));
    }

    #[test]
    fn non_terminal_scan_skips_finished_tasks() {
        let (_dir, store) = open_store();
        let running = new_task(&store);
        let finished = new_task(&store);
        store
            .advance(&finished.id, TaskStage::Done, |_| {})
            .unwrap();
        let pending = store.non_terminal().unwrap();
        assert_eq!(pending.len(), 1);
        assert_eq!(pending[0].id, running.id);
    }

    #[test]
    fn delete_removes_record() {
        let (_dir, store) = open_store();
        let record = new_task(&store);
        store.delete(&record.id).unwrap();
        assert!(matches!(store.get(&record.id), Err(StoreError::NotFound(_))));
        assert!(matches!(store.delete(&record.id), Err(StoreError::NotFound(_))));
    }

    #[test]
    fn records_survive_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tasks.redb");
        let id = {
            let store = TaskStore::open(&path).unwrap();
            let record = store
                .create(
                    SourceRef::Upload("/data/in.mp4".to_string()),
                    TaskOptions::default(),
                )
                .unwrap();
            store
                .advance(&record.id, TaskStage::Fetching, |r| {
                    r.media_path = Some("/data/in.mp4".to_string())
                })
                .unwrap();
            record.id
        };
        let store = TaskStore::open(&path).unwrap();
        let loaded = store.get(&id).unwrap();
        assert_eq!(loaded.stage, TaskStage::Fetching);
        assert_eq!(loaded.media_path.as_deref(), Some("/data/in.mp4"));
    }
}

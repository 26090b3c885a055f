//! Media pipeline engine: fetch, transcribe, translate, subtitle, encode.
//!
//! Tasks are durable records in an embedded redb database, routed through
//! four concurrency lanes and driven by one orchestrator per run. A single
//! process-wide gate serializes every accelerator-bound call.

pub mod config;
pub mod error;
pub mod gate;
pub mod pipeline;
pub mod queue;
pub mod service;
pub mod store;
pub mod subtitle;

pub use config::AppConfig;
pub use error::{StageError, StoreError};
pub use gate::AcceleratorGate;
pub use pipeline::Orchestrator;
pub use queue::{Lane, QueueRouter};
pub use service::{MediaService, TaskOutputs, TaskSnapshot};
pub use store::TaskStore;
pub use store::schema::{SourceRef, TaskOptions, TaskRecord, TaskStage};

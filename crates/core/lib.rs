//! # tq-core - Core types and runtime for the tq job queue
//!
//! This crate provides the core abstractions for the tq job queue system:
//! - `Backend` trait for storage implementations, plus `MemoryBackend`
//! - `JobRecord`, `JobId`, `JobState` and the settlement types
//! - `Registry` and `Queue` for defining and feeding queues
//! - `RetryPolicy` for deciding between retry and failure
//! - `WorkerPool` for processing jobs and recurring scheduled tasks
//! - Error types

mod backend;
mod config;
mod error;
mod job;
mod memory;
mod pool;
mod queue;
mod reaper;
mod registry;
mod retry;
mod scheduler;
pub mod time;
mod worker;

// Re-export main types
pub use backend::{Backend, DynBackend, SharedBackend};
pub use config::{validate_namespace, WorkerConfig, WorkerConfigBuilder};
pub use error::{Result, TqError};
pub use job::{
    EnqueueOptions, JobId, JobRecord, JobState, QueueStats, Settlement, TriggerRecord,
};
pub use memory::MemoryBackend;
pub use pool::{generate_worker_id, WorkerPool, WorkerPoolBuilder};
pub use queue::{JobContext, JobError, JobResult, Queue, QueueOptions};
pub use reaper::{Reaper, SweepReport};
pub use registry::Registry;
pub use retry::RetryPolicy;
pub use scheduler::{parse_schedule, trigger_key, TaskContext};

pub use tokio_util::sync::CancellationToken;

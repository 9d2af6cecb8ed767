//! `jobline-executor`: asynchronous job executor for a workflow engine.
//!
//! Jobs are persisted units of deferred work (timers, asynchronous
//! continuations). Each node runs one [`JobExecutor`](jobs::JobExecutor):
//! it claims due jobs with optimistic locking, executes them on a bounded
//! worker pool and turns failures into retries or incidents.

pub mod config;
pub mod jobs;

pub use config::{ConfigError, ExecutorConfig};
pub use jobs::{
    HandlerOutcome, HandlerRegistry, InMemoryJobStore, JobExecutor, JobFailure, JobHandler,
    JobManagement, JobStore, JobStoreError, NewJob, PoolSizing, PostgresJobStore,
};

//! Job executor: acquisition, dispatch and execution of persisted jobs.
//!
//! ## Design
//!
//! - Jobs live in a shared [`JobStore`]; nodes coordinate only through
//!   version-checked writes on it
//! - One acquisition thread per node claims due jobs in batches
//! - A bounded [`Dispatcher`] runs claimed jobs and rejects when full
//! - Failures are retried per [`RetryStrategy`] and end in an [`Incident`]
//! - Expired locks make stalled or abandoned jobs claimable again
//!
//! ## Components
//!
//! - `Job` / `NewJob`: the persisted unit of work
//! - `JobStore`: in-memory and Postgres persistence
//! - `JobHandler`: the boundary to whatever actually does the work
//! - `AcquisitionCycle`, `Dispatcher`, `JobRunner`: the execution pipeline
//! - `JobExecutor`: lifecycle of one node
//! - `JobManagement`: operator actions

pub mod acquisition;
pub mod dispatcher;
pub mod executor;
pub mod failure;
pub mod handler;
pub mod management;
pub mod metrics;
pub mod postgres;
pub mod retry;
pub mod runner;
pub mod store;
pub mod types;

pub use acquisition::{AcquisitionCycle, AcquisitionSignal, IdleBackoff, TickReport};
pub use dispatcher::{Dispatcher, DrainReport, ExecuteJob, PoolSizing, Submission};
pub use executor::{ExecutorError, ExecutorState, JobExecutor, ShutdownReport};
pub use failure::{FailureDecision, FailureOutcome, FailurePolicy};
pub use handler::{FnHandler, HandlerOutcome, HandlerRegistry, JobContext, JobFailure, JobHandler};
pub use management::JobManagement;
pub use metrics::{ExecutorMetrics, MetricsSnapshot, PoolGauges};
pub use postgres::PostgresJobStore;
pub use retry::{FlatRetry, RetryCycle, RetryCycleError, RetryPlan, RetryStrategy, RETRY_CYCLE_KEY};
pub use runner::{JobRunner, RunOutcome};
pub use store::{FailureUpdate, InMemoryJobStore, JobStore, JobStoreError};
pub use types::{Incident, Job, JobLock, JobStats, NewJob};

//! Executes one claimed job.
//!
//! The runner re-checks its claim right before invoking the handler: a job
//! can sit in the dispatcher queue long enough for its lock to lapse, and a
//! job whose lock lapsed may already belong to another node. Such a job is
//! skipped without touching the store.
//!
//! Success deletes the job. A business failure goes through the
//! [`FailurePolicy`] in a separate write. An infrastructure failure leaves the
//! job locked; lock expiry returns it to the pool without consuming a retry.

use std::any::Any;
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

use tracing::{debug, error, warn};

use jobline_core::{IncidentId, JobId, LockOwner, SharedClock};

use super::failure::{FailureOutcome, FailurePolicy};
use super::handler::{HandlerOutcome, HandlerRegistry, JobContext, JobFailure, JobHandler};
use super::metrics::ExecutorMetrics;
use super::store::{JobStore, JobStoreError};
use super::types::Job;

/// What happened to a job handed to [`JobRunner::run`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RunOutcome {
    Completed,
    Retried,
    IncidentCreated(IncidentId),
    /// The claim expired or moved to another owner before execution.
    LockLost,
    /// The job no longer exists.
    Missing,
    /// The outcome could not be recorded; the job stays locked.
    InfrastructureFailure,
    /// The job was changed by someone else while it ran; the result was
    /// discarded.
    ConcurrentModification,
}

/// Runs jobs claimed by one lock owner.
pub struct JobRunner<S: JobStore> {
    store: Arc<S>,
    registry: Arc<HandlerRegistry>,
    policy: FailurePolicy,
    owner: LockOwner,
    clock: SharedClock,
    metrics: Arc<ExecutorMetrics>,
}

impl<S: JobStore> core::fmt::Debug for JobRunner<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobRunner")
            .field("owner", &self.owner)
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl<S: JobStore> JobRunner<S> {
    pub fn new(
        store: Arc<S>,
        registry: Arc<HandlerRegistry>,
        policy: FailurePolicy,
        owner: LockOwner,
        clock: SharedClock,
        metrics: Arc<ExecutorMetrics>,
    ) -> Self {
        Self {
            store,
            registry,
            policy,
            owner,
            clock,
            metrics,
        }
    }

    pub fn owner(&self) -> &LockOwner {
        &self.owner
    }

    pub fn run(&self, job_id: JobId) -> RunOutcome {
        let job = match self.store.get(job_id) {
            Ok(Some(job)) => job,
            Ok(None) => {
                debug!(job_id = %job_id, "job removed before execution");
                return RunOutcome::Missing;
            }
            Err(err) => {
                error!(job_id = %job_id, error = %err, "failed to load job; leaving it locked");
                self.metrics.record_infrastructure_failure();
                return RunOutcome::InfrastructureFailure;
            }
        };

        let started_at = self.clock.now();
        if !job.is_locked_by(&self.owner, started_at) {
            warn!(
                job_id = %job_id,
                lock_owner = %self.owner,
                current_owner = ?job.lock_owner().map(LockOwner::as_str),
                "lock lost before execution; skipping job"
            );
            self.metrics.record_lock_lost();
            return RunOutcome::LockLost;
        }

        let handler = self.registry.get(&job.handler_type);
        let outcome = match &handler {
            Some(handler) => invoke(handler.as_ref(), &job, started_at),
            None => HandlerOutcome::BusinessFailure(JobFailure::new(format!(
                "no handler registered for type '{}'",
                job.handler_type
            ))),
        };

        match outcome {
            HandlerOutcome::Success => self.complete(&job),
            HandlerOutcome::BusinessFailure(failure) => {
                self.fail(&job, handler.as_deref(), &failure)
            }
            HandlerOutcome::InfrastructureFailure(failure) => {
                error!(
                    job_id = %job.id,
                    handler_type = %job.handler_type,
                    error = %failure,
                    "infrastructure failure; job stays locked until lock expiry"
                );
                self.metrics.record_infrastructure_failure();
                RunOutcome::InfrastructureFailure
            }
        }
    }

    fn complete(&self, job: &Job) -> RunOutcome {
        match self.store.complete(job.id, job.version) {
            Ok(()) => {
                debug!(job_id = %job.id, handler_type = %job.handler_type, "job completed");
                self.metrics.record_completed();
                RunOutcome::Completed
            }
            Err(err @ (JobStoreError::Conflict { .. } | JobStoreError::NotFound(_))) => {
                warn!(job_id = %job.id, error = %err, "job modified during execution; completion discarded");
                RunOutcome::ConcurrentModification
            }
            Err(err) => {
                error!(job_id = %job.id, error = %err, "failed to record completion; job stays locked until lock expiry");
                self.metrics.record_infrastructure_failure();
                RunOutcome::InfrastructureFailure
            }
        }
    }

    fn fail(&self, job: &Job, handler: Option<&dyn JobHandler>, failure: &JobFailure) -> RunOutcome {
        self.metrics.record_failed();

        let strategy = self
            .policy
            .resolve_strategy(job, handler.and_then(|h| h.retry_strategy(job)));
        let outcome = self.policy.apply(
            self.store.as_ref(),
            job,
            failure,
            strategy.as_ref(),
            &self.owner,
            self.clock.now(),
        );

        match outcome {
            FailureOutcome::Retried { .. } => {
                self.metrics.record_retried();
                RunOutcome::Retried
            }
            FailureOutcome::IncidentCreated(incident_id) => {
                self.metrics.record_incident();
                RunOutcome::IncidentCreated(incident_id)
            }
            FailureOutcome::Superseded => RunOutcome::ConcurrentModification,
            FailureOutcome::Abandoned => {
                self.metrics.record_infrastructure_failure();
                RunOutcome::InfrastructureFailure
            }
        }
    }
}

/// Invoke the handler; a panic counts as a business failure.
fn invoke(handler: &dyn JobHandler, job: &Job, started_at: chrono::DateTime<chrono::Utc>) -> HandlerOutcome {
    let ctx = JobContext::new(job, started_at);
    panic::catch_unwind(AssertUnwindSafe(|| handler.execute(&ctx))).unwrap_or_else(|payload| {
        HandlerOutcome::BusinessFailure(JobFailure::new(format!(
            "handler panicked: {}",
            panic_message(payload.as_ref())
        )))
    })
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(message) = payload.downcast_ref::<&'static str>() {
        message
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message
    } else {
        "non-string panic payload"
    }
}

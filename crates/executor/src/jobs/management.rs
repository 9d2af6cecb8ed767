//! Operator surface: retries, suspension, manual execution, incidents.

use std::sync::Arc;

use chrono::Duration;
use tracing::info;

use jobline_core::{JobId, LockOwner, SharedClock};

use super::failure::FailurePolicy;
use super::handler::HandlerRegistry;
use super::metrics::ExecutorMetrics;
use super::runner::{JobRunner, RunOutcome};
use super::store::{JobStore, JobStoreError};
use super::types::{Incident, Job, JobStats};

/// Administrative operations on stored jobs.
pub struct JobManagement<S: JobStore> {
    store: Arc<S>,
    runner: JobRunner<S>,
    lock_span: Duration,
    clock: SharedClock,
}

impl<S: JobStore> core::fmt::Debug for JobManagement<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobManagement")
            .field("runner", &self.runner)
            .field("lock_span", &self.lock_span)
            .finish_non_exhaustive()
    }
}

impl<S: JobStore> JobManagement<S> {
    pub fn new(
        store: Arc<S>,
        registry: Arc<HandlerRegistry>,
        policy: FailurePolicy,
        owner: LockOwner,
        lock_span: Duration,
        clock: SharedClock,
        metrics: Arc<ExecutorMetrics>,
    ) -> Self {
        let runner = JobRunner::new(store.clone(), registry, policy, owner, clock.clone(), metrics);
        Self {
            store,
            runner,
            lock_span,
            clock,
        }
    }

    pub fn job(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        self.store.get(job_id)?.ok_or(JobStoreError::NotFound(job_id))
    }

    /// Give a job a new retry budget. Resolves its incident, if any, and
    /// makes it acquirable again.
    pub fn set_job_retries(&self, job_id: JobId, retries: u32) -> Result<Job, JobStoreError> {
        if retries == 0 {
            return Err(JobStoreError::invalid_state(
                job_id,
                "retries must be positive; suspend the job to stop it",
            ));
        }
        let job = self.store.set_retries(job_id, retries)?;
        info!(job_id = %job_id, retries, "job retries set");
        Ok(job)
    }

    /// Suspended jobs are never acquired.
    pub fn suspend_job(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let job = self.store.set_suspended(job_id, true)?;
        info!(job_id = %job_id, "job suspended");
        Ok(job)
    }

    pub fn activate_job(&self, job_id: JobId) -> Result<Job, JobStoreError> {
        let job = self.store.set_suspended(job_id, false)?;
        info!(job_id = %job_id, "job activated");
        Ok(job)
    }

    /// Run a job now on the calling thread, bypassing due date and
    /// dispatcher. The job is claimed like any other, so a job locked by a
    /// node is refused, as is an exclusive job whose execution context is
    /// busy with another exclusive job.
    pub fn execute_job(&self, job_id: JobId) -> Result<RunOutcome, JobStoreError> {
        let job = self.job(job_id)?;
        let now = self.clock.now();

        if job.suspended {
            return Err(JobStoreError::invalid_state(job_id, "job is suspended"));
        }
        if job.retries_left == 0 {
            return Err(JobStoreError::invalid_state(
                job_id,
                "job has no retries left; set retries first",
            ));
        }
        if let Some(lock) = job.lock.as_ref().filter(|lock| lock.is_fresh(now)) {
            return Err(JobStoreError::invalid_state(
                job_id,
                format!("job is locked by {}", lock.owner),
            ));
        }
        if let Some(context) = job.execution_context_id.as_ref().filter(|_| job.exclusive) {
            if self.store.context_locked(context, job_id, now)? {
                return Err(JobStoreError::invalid_state(
                    job_id,
                    format!("execution context {context} is running another exclusive job"),
                ));
            }
        }

        self.store
            .try_lock(job_id, job.version, self.runner.owner(), now + self.lock_span)?;
        info!(job_id = %job_id, lock_owner = %self.runner.owner(), "executing job manually");
        Ok(self.runner.run(job_id))
    }

    pub fn delete_job(&self, job_id: JobId) -> Result<(), JobStoreError> {
        self.store.delete(job_id)?;
        info!(job_id = %job_id, "job deleted");
        Ok(())
    }

    /// Open incidents, oldest first.
    pub fn incidents(&self, limit: usize) -> Result<Vec<Incident>, JobStoreError> {
        self.store.list_incidents(limit)
    }

    pub fn stats(&self) -> Result<JobStats, JobStoreError> {
        self.store.stats(self.clock.now())
    }
}

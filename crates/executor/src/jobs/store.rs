//! Job storage boundary and the in-memory reference store.
//!
//! ## Locking protocol
//!
//! The store is the only shared mutable resource between nodes, so it is also
//! the only coordination primitive. Every row carries a `version`; every
//! write names the version it read (`expected_version`) and bumps it on
//! success. Two nodes racing for the same row both read version `n`; exactly
//! one write lands, the other gets [`JobStoreError::Conflict`] and drops the
//! job without side effects.
//!
//! No in-memory mutex is relied on for mutual exclusion across nodes. The
//! in-memory store's `RwLock` only makes each individual write atomic, the way
//! a row-level conditional `UPDATE` is atomic in a database.

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use chrono::{DateTime, Utc};

use jobline_core::{ExecutionContextId, ExpectedVersion, IncidentId, JobId, LockOwner};

use super::types::{Incident, Job, JobLock, JobStats};

/// Job store operation error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum JobStoreError {
    #[error("job not found: {0}")]
    NotFound(JobId),
    /// The optimistic version check failed: another writer got there first.
    #[error("optimistic lock conflict on job {job_id}: {reason}")]
    Conflict { job_id: JobId, reason: String },
    #[error("job already exists: {0}")]
    AlreadyExists(JobId),
    #[error("invalid job state for {job_id}: {reason}")]
    InvalidState { job_id: JobId, reason: String },
    #[error("storage error: {0}")]
    Storage(String),
}

impl JobStoreError {
    pub fn conflict(job_id: JobId, reason: impl Into<String>) -> Self {
        Self::Conflict {
            job_id,
            reason: reason.into(),
        }
    }

    pub fn invalid_state(job_id: JobId, reason: impl Into<String>) -> Self {
        Self::InvalidState {
            job_id,
            reason: reason.into(),
        }
    }

    /// Lost an optimistic-lock race. Expected under contention, not an error.
    pub fn is_contention(&self) -> bool {
        matches!(self, JobStoreError::Conflict { .. })
    }

    /// The store itself is failing (unreachable, poisoned, corrupt rows).
    pub fn is_infrastructure(&self) -> bool {
        matches!(self, JobStoreError::Storage(_))
    }
}

/// Outcome of a failed execution, ready to be persisted.
///
/// Written by the failure policy; the store applies it atomically: the job row
/// update and, when `incident` is set, the incident insert.
#[derive(Debug, Clone, PartialEq)]
pub struct FailureUpdate {
    pub job_id: JobId,
    pub expected_version: u64,
    pub retries_left: u32,
    pub due_date: DateTime<Utc>,
    pub message: String,
    pub detail: Option<String>,
    /// Present exactly when `retries_left == 0`.
    pub incident: Option<Incident>,
}

/// Transactional job table.
///
/// All mutations are conditional on the caller's `expected_version` unless
/// they are operator overrides (`set_retries`, `set_suspended`, `delete`).
pub trait JobStore: Send + Sync {
    /// Persist a new job.
    fn insert(&self, job: Job) -> Result<Job, JobStoreError>;

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError>;

    /// Due jobs that can be claimed at `now`, highest priority first, then
    /// oldest due date.
    ///
    /// Exclusive jobs whose execution context already has a freshly locked
    /// exclusive job are left out.
    fn find_acquirable(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError>;

    /// Whether an exclusive job of `context` other than `except` holds a
    /// fresh lock at `now`.
    fn context_locked(
        &self,
        context: &ExecutionContextId,
        except: JobId,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError>;

    /// Claim a job for `owner` until `expires_at`.
    fn try_lock(
        &self,
        job_id: JobId,
        expected_version: u64,
        owner: &LockOwner,
        expires_at: DateTime<Utc>,
    ) -> Result<Job, JobStoreError>;

    /// Give a claim back without executing the job.
    fn release_lock(
        &self,
        job_id: JobId,
        expected_version: u64,
        owner: &LockOwner,
    ) -> Result<Job, JobStoreError>;

    /// Delete a successfully executed job.
    fn complete(&self, job_id: JobId, expected_version: u64) -> Result<(), JobStoreError>;

    /// Persist a failure: reschedule, or exhaust and raise an incident.
    fn record_failure(&self, update: FailureUpdate) -> Result<Job, JobStoreError>;

    /// Operator override of the retry budget. Resolves the job's open
    /// incidents when `retries > 0`.
    fn set_retries(&self, job_id: JobId, retries: u32) -> Result<Job, JobStoreError>;

    fn set_suspended(&self, job_id: JobId, suspended: bool) -> Result<Job, JobStoreError>;

    /// Remove a job and its incidents.
    fn delete(&self, job_id: JobId) -> Result<(), JobStoreError>;

    /// Open incidents, oldest first.
    fn list_incidents(&self, limit: usize) -> Result<Vec<Incident>, JobStoreError>;

    fn stats(&self, now: DateTime<Utc>) -> Result<JobStats, JobStoreError>;
}

impl<S> JobStore for Arc<S>
where
    S: JobStore + ?Sized,
{
    fn insert(&self, job: Job) -> Result<Job, JobStoreError> {
        (**self).insert(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        (**self).get(job_id)
    }

    fn find_acquirable(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        (**self).find_acquirable(now, limit)
    }

    fn context_locked(
        &self,
        context: &ExecutionContextId,
        except: JobId,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        (**self).context_locked(context, except, now)
    }

    fn try_lock(
        &self,
        job_id: JobId,
        expected_version: u64,
        owner: &LockOwner,
        expires_at: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        (**self).try_lock(job_id, expected_version, owner, expires_at)
    }

    fn release_lock(
        &self,
        job_id: JobId,
        expected_version: u64,
        owner: &LockOwner,
    ) -> Result<Job, JobStoreError> {
        (**self).release_lock(job_id, expected_version, owner)
    }

    fn complete(&self, job_id: JobId, expected_version: u64) -> Result<(), JobStoreError> {
        (**self).complete(job_id, expected_version)
    }

    fn record_failure(&self, update: FailureUpdate) -> Result<Job, JobStoreError> {
        (**self).record_failure(update)
    }

    fn set_retries(&self, job_id: JobId, retries: u32) -> Result<Job, JobStoreError> {
        (**self).set_retries(job_id, retries)
    }

    fn set_suspended(&self, job_id: JobId, suspended: bool) -> Result<Job, JobStoreError> {
        (**self).set_suspended(job_id, suspended)
    }

    fn delete(&self, job_id: JobId) -> Result<(), JobStoreError> {
        (**self).delete(job_id)
    }

    fn list_incidents(&self, limit: usize) -> Result<Vec<Incident>, JobStoreError> {
        (**self).list_incidents(limit)
    }

    fn stats(&self, now: DateTime<Utc>) -> Result<JobStats, JobStoreError> {
        (**self).stats(now)
    }
}

/// Order acquisition candidates: priority desc, due date asc, id for stability.
pub(crate) fn acquisition_order(a: &Job, b: &Job) -> core::cmp::Ordering {
    b.priority
        .cmp(&a.priority)
        .then(a.due_date.cmp(&b.due_date))
        .then(a.id.cmp(&b.id))
}

#[derive(Debug, Default)]
struct Tables {
    jobs: HashMap<JobId, Job>,
    incidents: HashMap<IncidentId, Incident>,
}

/// In-memory job store.
///
/// Intended for tests/dev and single-process deployments. Multiple executors
/// sharing one `Arc<InMemoryJobStore>` behave like multiple nodes sharing a
/// database table.
#[derive(Debug, Default)]
pub struct InMemoryJobStore {
    tables: RwLock<Tables>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arc() -> Arc<Self> {
        Arc::new(Self::new())
    }

    pub fn len(&self) -> usize {
        self.tables.read().map(|t| t.jobs.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, JobStoreError> {
        self.tables
            .read()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>, JobStoreError> {
        self.tables
            .write()
            .map_err(|_| JobStoreError::Storage("lock poisoned".to_string()))
    }
}

/// Look up a job for a conditional write.
fn checked<'a>(
    jobs: &'a mut HashMap<JobId, Job>,
    job_id: JobId,
    expected: ExpectedVersion,
) -> Result<&'a mut Job, JobStoreError> {
    let job = jobs.get_mut(&job_id).ok_or(JobStoreError::NotFound(job_id))?;
    expected
        .check(job.version)
        .map_err(|e| JobStoreError::conflict(job_id, e.to_string()))?;
    Ok(job)
}

impl JobStore for InMemoryJobStore {
    fn insert(&self, job: Job) -> Result<Job, JobStoreError> {
        let mut tables = self.write()?;
        if tables.jobs.contains_key(&job.id) {
            return Err(JobStoreError::AlreadyExists(job.id));
        }
        tables.jobs.insert(job.id, job.clone());
        Ok(job)
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        Ok(self.read()?.jobs.get(&job_id).cloned())
    }

    fn find_acquirable(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let tables = self.read()?;

        let busy_contexts: HashSet<&ExecutionContextId> = tables
            .jobs
            .values()
            .filter(|j| j.exclusive && j.is_locked(now))
            .filter_map(|j| j.execution_context_id.as_ref())
            .collect();

        let mut candidates: Vec<&Job> = tables
            .jobs
            .values()
            .filter(|j| j.is_acquirable(now))
            .filter(|j| {
                !j.exclusive
                    || j
                        .execution_context_id
                        .as_ref()
                        .is_none_or(|ctx| !busy_contexts.contains(ctx))
            })
            .collect();

        candidates.sort_by(|a, b| acquisition_order(a, b));
        candidates.truncate(limit);
        Ok(candidates.into_iter().cloned().collect())
    }

    fn context_locked(
        &self,
        context: &ExecutionContextId,
        except: JobId,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        Ok(self.read()?.jobs.values().any(|j| {
            j.id != except
                && j.exclusive
                && j.execution_context_id.as_ref() == Some(context)
                && j.is_locked(now)
        }))
    }

    fn try_lock(
        &self,
        job_id: JobId,
        expected_version: u64,
        owner: &LockOwner,
        expires_at: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let mut tables = self.write()?;
        let job = checked(&mut tables.jobs, job_id, ExpectedVersion::Exact(expected_version))?;

        job.lock = Some(JobLock::new(owner.clone(), expires_at));
        job.version += 1;
        Ok(job.clone())
    }

    fn release_lock(
        &self,
        job_id: JobId,
        expected_version: u64,
        owner: &LockOwner,
    ) -> Result<Job, JobStoreError> {
        let mut tables = self.write()?;
        let job = checked(&mut tables.jobs, job_id, ExpectedVersion::Exact(expected_version))?;

        if job.lock_owner() != Some(owner) {
            return Err(JobStoreError::conflict(job_id, "lock is held by another owner"));
        }
        job.lock = None;
        job.version += 1;
        Ok(job.clone())
    }

    fn complete(&self, job_id: JobId, expected_version: u64) -> Result<(), JobStoreError> {
        let mut tables = self.write()?;
        checked(&mut tables.jobs, job_id, ExpectedVersion::Exact(expected_version))?;

        tables.jobs.remove(&job_id);
        Ok(())
    }

    fn record_failure(&self, update: FailureUpdate) -> Result<Job, JobStoreError> {
        if (update.retries_left == 0) != update.incident.is_some() {
            return Err(JobStoreError::invalid_state(
                update.job_id,
                "an incident must accompany exactly the exhausting failure",
            ));
        }

        let mut tables = self.write()?;
        let job = checked(
            &mut tables.jobs,
            update.job_id,
            ExpectedVersion::Exact(update.expected_version),
        )?;

        job.retries_left = update.retries_left;
        job.due_date = update.due_date;
        job.last_failure_message = Some(update.message);
        job.last_failure_detail = update.detail;
        job.failure_count = job.failure_count.saturating_add(1);
        job.lock = None;
        job.version += 1;
        let updated = job.clone();

        if let Some(incident) = update.incident {
            tables.incidents.insert(incident.id, incident);
        }
        Ok(updated)
    }

    fn set_retries(&self, job_id: JobId, retries: u32) -> Result<Job, JobStoreError> {
        let mut tables = self.write()?;
        let job = checked(&mut tables.jobs, job_id, ExpectedVersion::Any)?;

        job.retries_left = retries;
        job.version += 1;
        let updated = job.clone();

        if retries > 0 {
            tables.incidents.retain(|_, incident| incident.job_id != job_id);
        }
        Ok(updated)
    }

    fn set_suspended(&self, job_id: JobId, suspended: bool) -> Result<Job, JobStoreError> {
        let mut tables = self.write()?;
        let job = checked(&mut tables.jobs, job_id, ExpectedVersion::Any)?;

        job.suspended = suspended;
        job.version += 1;
        Ok(job.clone())
    }

    fn delete(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let mut tables = self.write()?;
        tables
            .jobs
            .remove(&job_id)
            .ok_or(JobStoreError::NotFound(job_id))?;
        tables.incidents.retain(|_, incident| incident.job_id != job_id);
        Ok(())
    }

    fn list_incidents(&self, limit: usize) -> Result<Vec<Incident>, JobStoreError> {
        let tables = self.read()?;
        let mut incidents: Vec<Incident> = tables.incidents.values().cloned().collect();
        incidents.sort_by(|a, b| a.created_at.cmp(&b.created_at).then(a.id.cmp(&b.id)));
        incidents.truncate(limit);
        Ok(incidents)
    }

    fn stats(&self, now: DateTime<Utc>) -> Result<JobStats, JobStoreError> {
        let tables = self.read()?;
        let mut stats = JobStats {
            open_incidents: tables.incidents.len(),
            ..JobStats::default()
        };

        for job in tables.jobs.values() {
            if job.retries_left == 0 {
                stats.exhausted += 1;
            } else if job.suspended {
                stats.suspended += 1;
            } else if job.is_locked(now) {
                stats.locked += 1;
            } else if job.due_date > now {
                stats.scheduled += 1;
            } else {
                stats.acquirable += 1;
            }
        }
        Ok(stats)
    }
}

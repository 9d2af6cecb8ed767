//! Core job types.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

use jobline_core::{ExecutionContextId, IncidentId, JobId, LockOwner};

use super::retry::RetryCycle;

/// Claim held by one node on a job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobLock {
    pub owner: LockOwner,
    pub expires_at: DateTime<Utc>,
}

impl JobLock {
    pub fn new(owner: LockOwner, expires_at: DateTime<Utc>) -> Self {
        Self { owner, expires_at }
    }

    /// A lock is fresh while its expiration lies strictly in the future.
    pub fn is_fresh(&self, now: DateTime<Utc>) -> bool {
        self.expires_at > now
    }
}

/// A persisted unit of deferred work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    /// Routes the job to a registered handler.
    pub handler_type: String,
    /// Opaque handler parameters.
    pub handler_configuration: JsonValue,
    /// Eligible for acquisition once `due_date <= now`.
    pub due_date: DateTime<Utc>,
    /// Higher runs first within a batch.
    pub priority: i64,
    pub exclusive: bool,
    pub execution_context_id: Option<ExecutionContextId>,
    pub lock: Option<JobLock>,
    /// Remaining retry budget; `0` means exhausted (incident state).
    pub retries_left: u32,
    pub failure_count: u32,
    /// Suspended jobs are never acquired.
    pub suspended: bool,
    pub last_failure_message: Option<String>,
    pub last_failure_detail: Option<String>,
    pub created_at: DateTime<Utc>,
    /// Optimistic-lock counter, bumped on every write.
    pub version: u64,
}

impl Job {
    /// Whether an acquisition cycle may claim this job at `now`.
    pub fn is_acquirable(&self, now: DateTime<Utc>) -> bool {
        !self.suspended
            && self.retries_left > 0
            && self.due_date <= now
            && self.lock.as_ref().is_none_or(|lock| !lock.is_fresh(now))
    }

    /// Whether `owner` holds a fresh lock on this job.
    pub fn is_locked_by(&self, owner: &LockOwner, now: DateTime<Utc>) -> bool {
        self.lock
            .as_ref()
            .is_some_and(|lock| &lock.owner == owner && lock.is_fresh(now))
    }

    /// Whether any node holds a fresh lock on this job.
    pub fn is_locked(&self, now: DateTime<Utc>) -> bool {
        self.lock.as_ref().is_some_and(|lock| lock.is_fresh(now))
    }

    pub fn lock_owner(&self) -> Option<&LockOwner> {
        self.lock.as_ref().map(|lock| &lock.owner)
    }

    pub fn has_incident(&self) -> bool {
        self.retries_left == 0
    }
}

/// Builder for a job that has not been persisted yet.
///
/// The interpreter creates these when it defers work (timers, asynchronous
/// continuations, batch steps).
#[derive(Debug, Clone)]
pub struct NewJob {
    id: Option<JobId>,
    handler_type: String,
    handler_configuration: JsonValue,
    due_date: Option<DateTime<Utc>>,
    due_in: Option<Duration>,
    priority: i64,
    exclusive: bool,
    execution_context_id: Option<ExecutionContextId>,
    retries: Option<u32>,
}

impl NewJob {
    pub fn new(handler_type: impl Into<String>) -> Self {
        Self {
            id: None,
            handler_type: handler_type.into(),
            handler_configuration: JsonValue::Null,
            due_date: None,
            due_in: None,
            priority: 0,
            exclusive: false,
            execution_context_id: None,
            retries: None,
        }
    }

    /// Use a fixed id (tests, idempotent re-creation).
    pub fn with_id(mut self, id: JobId) -> Self {
        self.id = Some(id);
        self
    }

    pub fn with_configuration(mut self, configuration: JsonValue) -> Self {
        self.handler_configuration = configuration;
        self
    }

    /// Due at an absolute instant.
    pub fn due_at(mut self, at: DateTime<Utc>) -> Self {
        self.due_date = Some(at);
        self.due_in = None;
        self
    }

    /// Due after a delay from creation time.
    pub fn due_in(mut self, delay: Duration) -> Self {
        self.due_in = Some(delay);
        self.due_date = None;
        self
    }

    pub fn with_priority(mut self, priority: i64) -> Self {
        self.priority = priority;
        self
    }

    /// Attach the job to an execution context without exclusivity.
    pub fn in_context(mut self, context: ExecutionContextId) -> Self {
        self.execution_context_id = Some(context);
        self
    }

    /// Attach the job to an execution context and serialize it against the
    /// context's other exclusive jobs.
    pub fn exclusive_in(mut self, context: ExecutionContextId) -> Self {
        self.execution_context_id = Some(context);
        self.exclusive = true;
        self
    }

    /// Explicit retry budget, overriding cycle- and config-derived defaults.
    pub fn with_retries(mut self, retries: u32) -> Self {
        self.retries = Some(retries);
        self
    }

    /// Materialize the job.
    ///
    /// Initial retries: explicit value, else the length of a `retryCycle`
    /// found in the configuration, else `default_retries`.
    pub fn build(self, now: DateTime<Utc>, default_retries: u32) -> Job {
        let retries_left = self.retries.unwrap_or_else(|| {
            RetryCycle::from_configuration(&self.handler_configuration)
                .and_then(Result::ok)
                .map(|cycle| cycle.retries())
                .unwrap_or(default_retries)
        });

        let due_date = match (self.due_date, self.due_in) {
            (Some(at), _) => at,
            (None, Some(delay)) => now + delay,
            (None, None) => now,
        };

        Job {
            id: self.id.unwrap_or_default(),
            handler_type: self.handler_type,
            handler_configuration: self.handler_configuration,
            due_date,
            priority: self.priority,
            exclusive: self.exclusive,
            execution_context_id: self.execution_context_id,
            lock: None,
            retries_left,
            failure_count: 0,
            suspended: false,
            last_failure_message: None,
            last_failure_detail: None,
            created_at: now,
            version: 1,
        }
    }
}

/// Durable, operator-visible marker for a job whose retries are exhausted.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Incident {
    pub id: IncidentId,
    pub job_id: JobId,
    pub execution_context_id: Option<ExecutionContextId>,
    pub handler_type: String,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Incident {
    pub fn for_job(job: &Job, message: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            id: IncidentId::new(),
            job_id: job.id,
            execution_context_id: job.execution_context_id.clone(),
            handler_type: job.handler_type.clone(),
            message: message.into(),
            created_at: now,
        }
    }
}

/// Point-in-time job counts for monitoring.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct JobStats {
    /// Due, unlocked (or stale-locked), not suspended, retries left.
    pub acquirable: usize,
    /// Freshly locked by some node.
    pub locked: usize,
    /// Due in the future.
    pub scheduled: usize,
    pub suspended: usize,
    /// Retries exhausted.
    pub exhausted: usize,
    pub open_incidents: usize,
}

//! Failure & retry policy.
//!
//! Decides what a business failure does to a job and persists that decision
//! in its own write, separate from whatever the handler committed before it
//! failed.
//!
//! ## Decision
//!
//! - Consume `plan.decrement` retries (at least one).
//! - Retries left: reschedule at `now + plan.delay`, clear the lock, record
//!   the failure message/detail.
//! - No retries left: keep the job (unacquirable), still advance its due date
//!   and raise an [`Incident`].
//!
//! Due dates saturate at the latest representable instant.
//!
//! ## Fail-safe persistence
//!
//! Recording a failure never propagates an error. A version conflict re-reads
//! the job once and retries while this node still owns it; anything else is
//! logged and the job is left locked, so lock expiry brings it back.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, error, warn};

use jobline_core::{IncidentId, LockOwner};

use super::handler::JobFailure;
use super::retry::{FlatRetry, RetryCycle, RetryStrategy};
use super::store::{FailureUpdate, JobStore};
use super::types::{Incident, Job};

/// What a failure does to the job.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureDecision {
    Retry {
        retries_left: u32,
        due_date: DateTime<Utc>,
    },
    Incident {
        message: String,
        due_date: DateTime<Utc>,
    },
}

/// What actually got persisted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    Retried {
        retries_left: u32,
        due_date: DateTime<Utc>,
    },
    IncidentCreated(IncidentId),
    /// Someone else changed or removed the job first; nothing was written.
    Superseded,
    /// The failure could not be written; the job stays locked until expiry.
    Abandoned,
}

/// Engine-wide failure policy.
#[derive(Debug, Clone)]
pub struct FailurePolicy {
    default_strategy: Arc<dyn RetryStrategy>,
}

impl FailurePolicy {
    pub fn new(default_strategy: Arc<dyn RetryStrategy>) -> Self {
        Self { default_strategy }
    }

    pub fn flat(interval: chrono::Duration) -> Self {
        Self::new(Arc::new(FlatRetry::new(interval)))
    }

    /// Pick the strategy for `job`: handler override, then the job's
    /// `retryCycle`, then the engine default.
    pub fn resolve_strategy(
        &self,
        job: &Job,
        handler_override: Option<Arc<dyn RetryStrategy>>,
    ) -> Arc<dyn RetryStrategy> {
        if let Some(strategy) = handler_override {
            return strategy;
        }
        match RetryCycle::from_configuration(&job.handler_configuration) {
            Some(Ok(cycle)) => Arc::new(cycle),
            Some(Err(err)) => {
                warn!(job_id = %job.id, error = %err, "ignoring unparsable retry cycle");
                self.default_strategy.clone()
            }
            None => self.default_strategy.clone(),
        }
    }

    pub fn decide(
        &self,
        job: &Job,
        failure: &JobFailure,
        strategy: &dyn RetryStrategy,
        now: DateTime<Utc>,
    ) -> FailureDecision {
        let plan = strategy.plan(job);
        let retries_left = job.retries_left.saturating_sub(plan.decrement.max(1));
        let due_date = due_after(now, plan.delay);

        if retries_left > 0 {
            FailureDecision::Retry {
                retries_left,
                due_date,
            }
        } else {
            FailureDecision::Incident {
                message: failure.message.clone(),
                due_date,
            }
        }
    }

    /// Decide and persist. Never fails; see the module docs.
    pub fn apply<S>(
        &self,
        store: &S,
        job: &Job,
        failure: &JobFailure,
        strategy: &dyn RetryStrategy,
        owner: &LockOwner,
        now: DateTime<Utc>,
    ) -> FailureOutcome
    where
        S: JobStore + ?Sized,
    {
        let mut current = job.clone();

        for attempt in 0..2 {
            let decision = self.decide(&current, failure, strategy, now);
            let update = failure_update(&current, failure, &decision, now);
            let incident_id = update.incident.as_ref().map(|i| i.id);

            match store.record_failure(update) {
                Ok(_) => {
                    return match (decision, incident_id) {
                        (FailureDecision::Retry { retries_left, due_date }, _) => {
                            warn!(
                                job_id = %job.id,
                                retries_left,
                                due_date = %due_date,
                                error = %failure.message,
                                "job failed; retry scheduled"
                            );
                            FailureOutcome::Retried {
                                retries_left,
                                due_date,
                            }
                        }
                        (FailureDecision::Incident { .. }, Some(id)) => {
                            warn!(
                                job_id = %job.id,
                                incident_id = %id,
                                error = %failure.message,
                                "job retries exhausted; incident created"
                            );
                            FailureOutcome::IncidentCreated(id)
                        }
                        (FailureDecision::Incident { .. }, None) => FailureOutcome::Abandoned,
                    };
                }
                Err(err) if err.is_contention() && attempt == 0 => match store.get(job.id) {
                    Ok(Some(fresh)) if fresh.is_locked_by(owner, now) => {
                        debug!(job_id = %job.id, "job changed while failing; re-applying failure");
                        current = fresh;
                    }
                    Ok(_) => {
                        debug!(job_id = %job.id, "job taken over or removed; failure not recorded");
                        return FailureOutcome::Superseded;
                    }
                    Err(reload_err) => {
                        error!(job_id = %job.id, error = %reload_err, "failed to reload job after conflict; leaving it locked");
                        return FailureOutcome::Abandoned;
                    }
                },
                Err(err) if err.is_contention() => {
                    debug!(job_id = %job.id, error = %err, "repeated conflict while recording failure");
                    return FailureOutcome::Superseded;
                }
                Err(err) => {
                    error!(
                        job_id = %job.id,
                        error = %err,
                        failure = %failure.message,
                        "failed to record job failure; leaving it locked until lock expiry"
                    );
                    return FailureOutcome::Abandoned;
                }
            }
        }

        FailureOutcome::Abandoned
    }
}

fn due_after(now: DateTime<Utc>, delay: chrono::Duration) -> DateTime<Utc> {
    now.checked_add_signed(delay.max(chrono::Duration::zero()))
        .unwrap_or(DateTime::<Utc>::MAX_UTC)
}

fn failure_update(
    job: &Job,
    failure: &JobFailure,
    decision: &FailureDecision,
    now: DateTime<Utc>,
) -> FailureUpdate {
    let (retries_left, due_date, incident) = match decision {
        FailureDecision::Retry {
            retries_left,
            due_date,
        } => (*retries_left, *due_date, None),
        FailureDecision::Incident { message, due_date } => (
            0,
            *due_date,
            Some(Incident::for_job(job, message.clone(), now)),
        ),
    };

    FailureUpdate {
        job_id: job.id,
        expected_version: job.version,
        retries_left,
        due_date,
        message: failure.message.clone(),
        detail: failure.detail.clone(),
        incident,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use proptest::prelude::*;

    use crate::jobs::retry::RetryPlan;
    use crate::jobs::store::{InMemoryJobStore, JobStoreError};
    use crate::jobs::types::NewJob;

    #[derive(Debug)]
    struct Aggressive;

    impl RetryStrategy for Aggressive {
        fn plan(&self, _job: &Job) -> RetryPlan {
            RetryPlan {
                decrement: 2,
                delay: Duration::seconds(1),
            }
        }
    }

    fn node() -> LockOwner {
        LockOwner::new("node-a").unwrap()
    }

    fn locked_job(store: &InMemoryJobStore, job: NewJob, now: DateTime<Utc>) -> Job {
        let job = store.insert(job.build(now, 3)).unwrap();
        store
            .try_lock(job.id, job.version, &node(), now + Duration::minutes(5))
            .unwrap()
    }

    #[test]
    fn retry_reschedules_and_unlocks() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = locked_job(&store, NewJob::new("x"), now);
        let policy = FailurePolicy::flat(Duration::minutes(5));
        let strategy = policy.resolve_strategy(&job, None);

        let outcome = policy.apply(&store, &job, &JobFailure::new("boom"), &*strategy, &node(), now);

        assert_eq!(
            outcome,
            FailureOutcome::Retried {
                retries_left: 2,
                due_date: now + Duration::minutes(5)
            }
        );
        let stored = store.get(job.id).unwrap().unwrap();
        assert!(stored.lock.is_none());
        assert_eq!(stored.last_failure_message.as_deref(), Some("boom"));
        assert!(!stored.is_acquirable(now));
        assert!(stored.is_acquirable(now + Duration::minutes(5)));
    }

    #[test]
    fn last_retry_raises_incident() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = locked_job(&store, NewJob::new("x").with_retries(1), now);
        let policy = FailurePolicy::flat(Duration::zero());

        let outcome = policy.apply(
            &store,
            &job,
            &JobFailure::new("boom"),
            &FlatRetry::immediate(),
            &node(),
            now,
        );

        let FailureOutcome::IncidentCreated(incident_id) = outcome else {
            panic!("expected incident, got {outcome:?}");
        };
        let incidents = store.list_incidents(10).unwrap();
        assert_eq!(incidents.len(), 1);
        assert_eq!(incidents[0].id, incident_id);
        assert_eq!(incidents[0].job_id, job.id);
        assert_eq!(store.get(job.id).unwrap().unwrap().retries_left, 0);
    }

    #[test]
    fn incident_still_advances_due_date() {
        let now = Utc::now();
        let job = NewJob::new("x").with_retries(1).build(now, 3);
        let policy = FailurePolicy::flat(Duration::minutes(1));

        let decision = policy.decide(&job, &JobFailure::new("boom"), &FlatRetry::new(Duration::minutes(1)), now);
        assert_eq!(
            decision,
            FailureDecision::Incident {
                message: "boom".into(),
                due_date: now + Duration::minutes(1)
            }
        );
    }

    #[test]
    fn huge_retry_cycle_saturates_due_date() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = locked_job(
            &store,
            NewJob::new("x")
                .with_configuration(serde_json::json!({"retryCycle": "R3/P100000000D"}))
                .with_retries(3),
            now,
        );
        let policy = FailurePolicy::flat(Duration::zero());
        let strategy = policy.resolve_strategy(&job, None);

        let outcome = policy.apply(&store, &job, &JobFailure::new("boom"), &*strategy, &node(), now);

        assert_eq!(
            outcome,
            FailureOutcome::Retried {
                retries_left: 2,
                due_date: DateTime::<Utc>::MAX_UTC
            }
        );
        let stored = store.get(job.id).unwrap().unwrap();
        assert_eq!(stored.retries_left, 2);
        assert!(stored.lock.is_none());
    }

    #[test]
    fn negative_delay_never_schedules_in_the_past() {
        #[derive(Debug)]
        struct Backwards;
        impl RetryStrategy for Backwards {
            fn plan(&self, _job: &Job) -> RetryPlan {
                RetryPlan { decrement: 1, delay: Duration::minutes(-5) }
            }
        }

        let now = Utc::now();
        let job = NewJob::new("x").build(now, 3);
        let decision = FailurePolicy::flat(Duration::zero()).decide(&job, &JobFailure::new("boom"), &Backwards, now);
        assert_eq!(decision, FailureDecision::Retry { retries_left: 2, due_date: now });
    }

    #[test]
    fn custom_decrement_is_honoured() {
        let now = Utc::now();
        let job = NewJob::new("x").with_retries(3).build(now, 3);
        let policy = FailurePolicy::flat(Duration::zero());

        let decision = policy.decide(&job, &JobFailure::new("boom"), &Aggressive, now);
        assert_eq!(
            decision,
            FailureDecision::Retry {
                retries_left: 1,
                due_date: now + Duration::seconds(1)
            }
        );
    }

    #[test]
    fn handler_override_beats_retry_cycle() {
        let now = Utc::now();
        let job = NewJob::new("x")
            .with_configuration(serde_json::json!({"retryCycle": "R5/PT1H"}))
            .build(now, 3);
        let policy = FailurePolicy::flat(Duration::zero());

        let from_cycle = policy.resolve_strategy(&job, None);
        assert_eq!(from_cycle.plan(&job).delay, Duration::hours(1));

        let overridden = policy.resolve_strategy(&job, Some(Arc::new(Aggressive)));
        assert_eq!(overridden.plan(&job).delay, Duration::seconds(1));
    }

    #[test]
    fn broken_retry_cycle_uses_default() {
        let now = Utc::now();
        let job = NewJob::new("x")
            .with_configuration(serde_json::json!({"retryCycle": "R?/PT1H"}))
            .build(now, 3);
        let policy = FailurePolicy::flat(Duration::minutes(2));

        assert_eq!(policy.resolve_strategy(&job, None).plan(&job).delay, Duration::minutes(2));
    }

    #[test]
    fn conflict_with_new_owner_is_superseded() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let stale = locked_job(&store, NewJob::new("x"), now);

        // Lock expired and another node reclaimed the job.
        let later = now + Duration::minutes(6);
        let other = LockOwner::new("node-b").unwrap();
        store
            .try_lock(stale.id, stale.version, &other, later + Duration::minutes(5))
            .unwrap();

        let policy = FailurePolicy::flat(Duration::zero());
        let outcome = policy.apply(
            &store,
            &stale,
            &JobFailure::new("boom"),
            &FlatRetry::immediate(),
            &node(),
            later,
        );

        assert_eq!(outcome, FailureOutcome::Superseded);
        let stored = store.get(stale.id).unwrap().unwrap();
        assert_eq!(stored.retries_left, 3);
        assert_eq!(stored.lock_owner(), Some(&other));
    }

    #[test]
    fn conflict_while_still_owner_is_reapplied() {
        let store = InMemoryJobStore::new();
        let now = Utc::now();
        let job = locked_job(&store, NewJob::new("x"), now);
        // Renew our own lock behind the runner's back (version bump).
        store
            .try_lock(job.id, job.version, &node(), now + Duration::minutes(10))
            .unwrap();

        let policy = FailurePolicy::flat(Duration::zero());
        let outcome = policy.apply(
            &store,
            &job,
            &JobFailure::new("boom"),
            &FlatRetry::immediate(),
            &node(),
            now,
        );

        assert!(matches!(outcome, FailureOutcome::Retried { retries_left: 2, .. }));
    }

    #[derive(Debug)]
    struct BrokenStore;

    impl JobStore for BrokenStore {
        fn insert(&self, _job: Job) -> Result<Job, JobStoreError> {
            Err(JobStoreError::Storage("down".into()))
        }
        fn get(&self, _id: jobline_core::JobId) -> Result<Option<Job>, JobStoreError> {
            Err(JobStoreError::Storage("down".into()))
        }
        fn find_acquirable(&self, _now: DateTime<Utc>, _limit: usize) -> Result<Vec<Job>, JobStoreError> {
            Err(JobStoreError::Storage("down".into()))
        }
        fn context_locked(
            &self,
            _c: &jobline_core::ExecutionContextId,
            _e: jobline_core::JobId,
            _n: DateTime<Utc>,
        ) -> Result<bool, JobStoreError> {
            Err(JobStoreError::Storage("down".into()))
        }
        fn try_lock(
            &self,
            _id: jobline_core::JobId,
            _v: u64,
            _o: &LockOwner,
            _e: DateTime<Utc>,
        ) -> Result<Job, JobStoreError> {
            Err(JobStoreError::Storage("down".into()))
        }
        fn release_lock(&self, _id: jobline_core::JobId, _v: u64, _o: &LockOwner) -> Result<Job, JobStoreError> {
            Err(JobStoreError::Storage("down".into()))
        }
        fn complete(&self, _id: jobline_core::JobId, _v: u64) -> Result<(), JobStoreError> {
            Err(JobStoreError::Storage("down".into()))
        }
        fn record_failure(&self, _u: FailureUpdate) -> Result<Job, JobStoreError> {
            Err(JobStoreError::Storage("down".into()))
        }
        fn set_retries(&self, _id: jobline_core::JobId, _r: u32) -> Result<Job, JobStoreError> {
            Err(JobStoreError::Storage("down".into()))
        }
        fn set_suspended(&self, _id: jobline_core::JobId, _s: bool) -> Result<Job, JobStoreError> {
            Err(JobStoreError::Storage("down".into()))
        }
        fn delete(&self, _id: jobline_core::JobId) -> Result<(), JobStoreError> {
            Err(JobStoreError::Storage("down".into()))
        }
        fn list_incidents(&self, _limit: usize) -> Result<Vec<Incident>, JobStoreError> {
            Err(JobStoreError::Storage("down".into()))
        }
        fn stats(&self, _now: DateTime<Utc>) -> Result<crate::jobs::types::JobStats, JobStoreError> {
            Err(JobStoreError::Storage("down".into()))
        }
    }

    #[test]
    fn storage_failure_is_swallowed() {
        let now = Utc::now();
        let job = NewJob::new("x").build(now, 3);
        let policy = FailurePolicy::flat(Duration::zero());

        let outcome = policy.apply(
            &BrokenStore,
            &job,
            &JobFailure::new("boom"),
            &FlatRetry::immediate(),
            &node(),
            now,
        );
        assert_eq!(outcome, FailureOutcome::Abandoned);
    }

    proptest! {
        #[test]
        fn retries_never_increase(start in 1u32..50, decrement in 0u32..10, failures in 1usize..60) {
            #[derive(Debug)]
            struct Fixed(u32);
            impl RetryStrategy for Fixed {
                fn plan(&self, _job: &Job) -> RetryPlan {
                    RetryPlan { decrement: self.0, delay: Duration::zero() }
                }
            }

            let now = Utc::now();
            let policy = FailurePolicy::flat(Duration::zero());
            let mut job = NewJob::new("x").with_retries(start).build(now, 3);
            let mut exhausted = false;

            for _ in 0..failures {
                if exhausted {
                    break;
                }
                let before = job.retries_left;
                match policy.decide(&job, &JobFailure::new("boom"), &Fixed(decrement), now) {
                    FailureDecision::Retry { retries_left, .. } => {
                        prop_assert!(retries_left < before);
                        job.retries_left = retries_left;
                        job.failure_count += 1;
                    }
                    FailureDecision::Incident { .. } => exhausted = true,
                }
            }
            prop_assert!(exhausted || job.retries_left > 0);
        }
    }
}

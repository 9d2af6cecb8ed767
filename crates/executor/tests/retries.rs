mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::thread;
use std::time::Duration;

use jobline_core::{Clock, ManualClock};
use jobline_executor::jobs::{InMemoryJobStore, JobExecutor, JobStore, NewJob, PoolSizing};
use jobline_executor::{HandlerOutcome, HandlerRegistry};

use common::wait_until;

struct Flaky {
    attempts: Arc<AtomicUsize>,
    healthy: Arc<AtomicBool>,
}

fn flaky_registry() -> (HandlerRegistry, Flaky) {
    let attempts = Arc::new(AtomicUsize::new(0));
    let healthy = Arc::new(AtomicBool::new(false));
    let mut registry = HandlerRegistry::new();
    {
        let attempts = attempts.clone();
        let healthy = healthy.clone();
        registry.register_fn("flaky", move |_| {
            attempts.fetch_add(1, Ordering::SeqCst);
            if healthy.load(Ordering::SeqCst) {
                HandlerOutcome::Success
            } else {
                HandlerOutcome::business("downstream refused")
            }
        });
    }
    (registry, Flaky { attempts, healthy })
}

fn failures(store: &InMemoryJobStore, job: &jobline_executor::jobs::Job) -> u32 {
    store
        .get(job.id)
        .unwrap()
        .map(|job| job.failure_count)
        .unwrap_or_default()
}

#[test]
fn failing_job_is_retried_then_raises_incident_and_recovers_after_operator_fix() {
    let store = InMemoryJobStore::arc();
    let clock = ManualClock::starting_now();
    let (registry, flaky) = flaky_registry();
    let config = common::config("node-a", PoolSizing::new(1, 1, 1))
        .with_default_retries(3)
        .with_default_retry_interval(Duration::from_secs(300));
    let executor = JobExecutor::new(store.clone(), registry, config, clock.shared());
    executor.start().unwrap();

    let job = executor.schedule(NewJob::new("flaky")).unwrap();
    assert!(wait_until(|| failures(&store, &job) == 1));

    let rescheduled = store.get(job.id).unwrap().unwrap();
    assert_eq!(rescheduled.retries_left, 2);
    assert_eq!(rescheduled.due_date, clock.now() + chrono::Duration::minutes(5));
    assert!(rescheduled.lock.is_none());
    assert_eq!(rescheduled.last_failure_message.as_deref(), Some("downstream refused"));

    // Not due yet: nothing runs while the clock stands still.
    thread::sleep(Duration::from_millis(60));
    assert_eq!(flaky.attempts.load(Ordering::SeqCst), 1);

    for expected in [2, 3] {
        clock.advance(chrono::Duration::minutes(5));
        executor.job_added();
        assert!(wait_until(|| failures(&store, &job) == expected));
    }

    let exhausted = store.get(job.id).unwrap().unwrap();
    assert_eq!(exhausted.retries_left, 0);
    assert!(exhausted.has_incident());

    let management = executor.management();
    let incidents = management.incidents(10).unwrap();
    assert_eq!(incidents.len(), 1);
    assert_eq!(incidents[0].job_id, job.id);
    assert_eq!(incidents[0].handler_type, "flaky");
    assert_eq!(incidents[0].message, "downstream refused");

    // Exhausted jobs are never acquired, however late it gets.
    clock.advance(chrono::Duration::days(1));
    executor.job_added();
    thread::sleep(Duration::from_millis(60));
    assert_eq!(flaky.attempts.load(Ordering::SeqCst), 3);
    assert!(store.find_acquirable(clock.now(), 10).unwrap().is_empty());

    flaky.healthy.store(true, Ordering::SeqCst);
    management.set_job_retries(job.id, 1).unwrap();
    assert!(management.incidents(10).unwrap().is_empty());
    executor.job_added();

    assert!(wait_until(|| store.get(job.id).unwrap().is_none()));
    assert_eq!(flaky.attempts.load(Ordering::SeqCst), 4);

    let metrics = executor.metrics();
    assert_eq!(metrics.jobs_failed, 3);
    assert_eq!(metrics.jobs_retried, 2);
    assert_eq!(metrics.incidents_created, 1);
    assert_eq!(metrics.jobs_completed, 1);

    assert!(executor.shutdown(Duration::from_secs(1)).drained());
}

#[test]
fn retry_cycle_in_job_configuration_overrides_default_budget() {
    let store = InMemoryJobStore::arc();
    let clock = ManualClock::starting_now();
    let (registry, flaky) = flaky_registry();
    let executor = JobExecutor::new(
        store.clone(),
        registry,
        common::config("node-a", PoolSizing::new(1, 1, 1)),
        clock.shared(),
    );
    executor.start().unwrap();

    let job = executor
        .schedule(
            NewJob::new("flaky")
                .with_configuration(serde_json::json!({ "retryCycle": "R2/PT30S" }))
                .with_retries(2),
        )
        .unwrap();

    assert!(wait_until(|| failures(&store, &job) == 1));
    let rescheduled = store.get(job.id).unwrap().unwrap();
    assert_eq!(rescheduled.retries_left, 1);
    assert_eq!(rescheduled.due_date, clock.now() + chrono::Duration::seconds(30));

    clock.advance(chrono::Duration::seconds(30));
    executor.job_added();
    assert!(wait_until(|| failures(&store, &job) == 2));
    assert_eq!(store.get(job.id).unwrap().unwrap().retries_left, 0);
    assert_eq!(flaky.attempts.load(Ordering::SeqCst), 2);

    executor.shutdown(Duration::from_secs(1));
}

/// Executor with a flaky handler and `retryCycle` in every job's configuration.
fn cycled_node(
    store: &Arc<InMemoryJobStore>,
    clock: &ManualClock,
) -> (JobExecutor<InMemoryJobStore>, Flaky) {
    let (registry, flaky) = flaky_registry();
    let executor = JobExecutor::new(
        store.clone(),
        registry,
        common::config("node-a", PoolSizing::new(1, 1, 1)),
        clock.shared(),
    );
    executor.start().unwrap();
    (executor, flaky)
}

/// Wait for failure number `failure`, then move the clock to the job's new
/// due date. Returns the scheduled wait in minutes.
fn wait_out_failure(
    executor: &JobExecutor<InMemoryJobStore>,
    store: &InMemoryJobStore,
    clock: &ManualClock,
    job: &jobline_executor::jobs::Job,
    failure: u32,
) -> i64 {
    assert!(wait_until(|| failures(store, job) == failure));
    let current = store.get(job.id).unwrap().unwrap();
    let wait = current.due_date - clock.now();
    clock.advance(wait);
    executor.job_added();
    wait.num_minutes()
}

#[test]
fn interval_list_grants_one_retry_per_interval() {
    let store = InMemoryJobStore::arc();
    let clock = ManualClock::starting_now();
    let (executor, flaky) = cycled_node(&store, &clock);

    let job = executor
        .schedule(
            NewJob::new("flaky")
                .with_configuration(serde_json::json!({ "retryCycle": "PT3M, PT10M,PT8M" })),
        )
        .unwrap();
    assert_eq!(job.retries_left, 4);

    let mut waits = Vec::new();
    for failure in 1..=4 {
        waits.push(wait_out_failure(&executor, &store, &clock, &job, failure));
        assert_eq!(store.get(job.id).unwrap().unwrap().retries_left, 4 - failure);
    }

    // The final failure still moves the due date by the last interval.
    assert_eq!(waits, vec![3, 10, 8, 8]);
    assert!(store.get(job.id).unwrap().unwrap().has_incident());
    thread::sleep(Duration::from_millis(60));
    assert_eq!(flaky.attempts.load(Ordering::SeqCst), 4);

    executor.shutdown(Duration::from_secs(1));
}

#[test]
fn raised_retries_repeat_the_first_interval_before_walking_the_list() {
    let store = InMemoryJobStore::arc();
    let clock = ManualClock::starting_now();
    let (executor, _flaky) = cycled_node(&store, &clock);

    let job = executor
        .schedule(
            NewJob::new("flaky")
                .with_configuration(serde_json::json!({ "retryCycle": "PT3M, PT10M,PT8M" })),
        )
        .unwrap();

    assert!(wait_until(|| failures(&store, &job) == 1));
    let first = store.get(job.id).unwrap().unwrap();
    assert_eq!(first.retries_left, 3);
    assert_eq!(first.due_date, clock.now() + chrono::Duration::minutes(3));

    executor.management().set_job_retries(job.id, 5).unwrap();
    clock.advance(chrono::Duration::minutes(3));
    executor.job_added();

    let mut waits = Vec::new();
    for failure in 2..=6 {
        waits.push(wait_out_failure(&executor, &store, &clock, &job, failure));
        assert_eq!(store.get(job.id).unwrap().unwrap().retries_left, 6 - failure);
    }
    assert_eq!(waits, vec![3, 3, 10, 8, 8]);
    assert_eq!(executor.management().incidents(10).unwrap().len(), 1);

    executor.shutdown(Duration::from_secs(1));
}

#[test]
fn huge_retry_interval_reschedules_instead_of_stalling_the_job() {
    let store = InMemoryJobStore::arc();
    let clock = ManualClock::starting_now();
    let (executor, flaky) = cycled_node(&store, &clock);

    let job = executor
        .schedule(
            NewJob::new("flaky")
                .with_configuration(serde_json::json!({ "retryCycle": "R3/P100000000D" })),
        )
        .unwrap();
    assert_eq!(job.retries_left, 3);

    assert!(wait_until(|| failures(&store, &job) == 1));
    let rescheduled = store.get(job.id).unwrap().unwrap();
    assert_eq!(rescheduled.retries_left, 2);
    assert!(rescheduled.lock.is_none());
    assert_eq!(rescheduled.due_date, chrono::DateTime::<chrono::Utc>::MAX_UTC);
    assert_eq!(executor.metrics().jobs_retried, 1);

    // Far in the future, but not lost: lock expiry never brings it back early.
    clock.advance(chrono::Duration::days(1));
    executor.job_added();
    thread::sleep(Duration::from_millis(60));
    assert_eq!(flaky.attempts.load(Ordering::SeqCst), 1);

    assert!(executor.shutdown(Duration::from_secs(1)).drained());
}

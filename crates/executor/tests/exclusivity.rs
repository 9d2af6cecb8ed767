mod common;

use std::collections::HashMap;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use jobline_core::{ExecutionContextId, ManualClock};
use jobline_executor::jobs::{InMemoryJobStore, NewJob, PoolSizing};
use jobline_executor::{HandlerOutcome, HandlerRegistry};

use common::{ConcurrencyTracker, wait_until};

#[test]
fn exclusive_jobs_of_one_context_never_overlap() {
    let store = InMemoryJobStore::arc();
    let clock = ManualClock::starting_now();
    let trackers: Arc<HashMap<String, ConcurrencyTracker>> = Arc::new(
        ["order-1", "order-2"]
            .into_iter()
            .map(|ctx| (ctx.to_string(), ConcurrencyTracker::default()))
            .collect(),
    );

    let mut registry = HandlerRegistry::new();
    {
        let trackers = trackers.clone();
        registry.register_fn("step", move |ctx| {
            let context = ctx
                .job()
                .execution_context_id
                .as_ref()
                .map(|id| id.as_str().to_string())
                .unwrap_or_default();
            let tracker = &trackers[&context];
            tracker.enter();
            thread::sleep(Duration::from_millis(10));
            tracker.exit();
            HandlerOutcome::Success
        });
    }

    let executor = common::node("node-a", store.clone(), registry, &clock, PoolSizing::new(4, 4, 4));
    executor.start().unwrap();

    for ctx in ["order-1", "order-2"] {
        let ctx = ExecutionContextId::new(ctx).unwrap();
        for _ in 0..5 {
            executor
                .schedule(NewJob::new("step").exclusive_in(ctx.clone()))
                .unwrap();
        }
    }

    assert!(wait_until(|| store.is_empty()));
    for (ctx, tracker) in trackers.iter() {
        assert_eq!(tracker.peak(), 1, "context {ctx} ran jobs concurrently");
    }
    assert_eq!(executor.metrics().jobs_completed, 10);
    executor.shutdown(Duration::from_secs(1));
}

#[test]
fn non_exclusive_jobs_of_one_context_may_run_together() {
    let store = InMemoryJobStore::arc();
    let clock = ManualClock::starting_now();
    let tracker = ConcurrencyTracker::default();
    let gate = common::Gate::default();

    let mut registry = HandlerRegistry::new();
    {
        let tracker = tracker.clone();
        let gate = gate.clone();
        registry.register_fn("step", move |_| {
            tracker.enter();
            gate.wait();
            tracker.exit();
            HandlerOutcome::Success
        });
    }

    let executor = common::node("node-a", store.clone(), registry, &clock, PoolSizing::new(3, 3, 0));
    executor.start().unwrap();

    let ctx = ExecutionContextId::new("order-1").unwrap();
    for _ in 0..3 {
        executor.schedule(NewJob::new("step").in_context(ctx.clone())).unwrap();
    }

    assert!(wait_until(|| tracker.peak() == 3));
    gate.open();
    assert!(wait_until(|| store.is_empty()));
    executor.shutdown(Duration::from_secs(1));
}

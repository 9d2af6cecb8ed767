#![allow(dead_code)]

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::{Duration, Instant};

use jobline_core::{LockOwner, ManualClock};
use jobline_executor::jobs::{InMemoryJobStore, JobExecutor, PoolSizing};
use jobline_executor::{ExecutorConfig, HandlerRegistry};

/// Poll `condition` until it holds or five seconds pass.
pub fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if condition() {
            return true;
        }
        thread::sleep(Duration::from_millis(5));
    }
    condition()
}

pub fn owner(name: &str) -> LockOwner {
    LockOwner::new(name).unwrap()
}

/// Fast-ticking configuration for tests.
pub fn config(node: &str, pool: PoolSizing) -> ExecutorConfig {
    ExecutorConfig::default()
        .with_lock_owner(owner(node))
        .with_pool(pool)
        .with_max_jobs_per_acquisition(5)
        .with_wait(Duration::from_millis(10), Duration::from_millis(50))
        .with_backoff_on_rejection(Duration::from_millis(10))
}

pub fn node(
    name: &str,
    store: Arc<InMemoryJobStore>,
    registry: HandlerRegistry,
    clock: &ManualClock,
    pool: PoolSizing,
) -> JobExecutor<InMemoryJobStore> {
    JobExecutor::new(store, registry, config(name, pool), clock.shared())
}

/// A latch handlers block on until the test opens it.
#[derive(Clone, Default)]
pub struct Gate {
    state: Arc<(Mutex<bool>, Condvar)>,
}

impl Gate {
    pub fn wait(&self) {
        let (open, cvar) = &*self.state;
        let mut open = open.lock().unwrap();
        while !*open {
            open = cvar.wait(open).unwrap();
        }
    }

    pub fn open(&self) {
        let (open, cvar) = &*self.state;
        *open.lock().unwrap() = true;
        cvar.notify_all();
    }
}

/// Tracks how many callers are inside a section at once.
#[derive(Clone, Default)]
pub struct ConcurrencyTracker {
    current: Arc<AtomicUsize>,
    peak: Arc<AtomicUsize>,
}

impl ConcurrencyTracker {
    pub fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    pub fn exit(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }

    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }
}

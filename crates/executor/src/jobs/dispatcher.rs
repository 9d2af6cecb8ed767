//! Bounded worker pool that executes acquired jobs.
//!
//! ## Admission
//!
//! `submit` never blocks and never queues beyond `queue_size`:
//!
//! 1. in-flight (queued + running) below `workers + queue_size`: accept;
//! 2. otherwise, fewer than `max_pool_size` workers: start a burst worker
//!    and accept;
//! 3. otherwise: reject.
//!
//! At most `max_pool_size + queue_size` jobs are ever held. A rejection is a
//! backpressure signal for the acquisition cycle, which releases the claim so
//! the job can be picked up again later.
//!
//! ## Workers
//!
//! `core_pool_size` workers are started up front and live until shutdown.
//! Burst workers above the core size exit after `keep_alive` without work.
//! A panicking job is contained; the worker keeps serving.

use std::collections::VecDeque;
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use tracing::{debug, error, info, warn};

use jobline_core::JobId;

use super::metrics::PoolGauges;
use crate::config::ConfigError;

/// Callback that runs one job on a worker thread.
pub type ExecuteJob = Arc<dyn Fn(JobId) + Send + Sync>;

/// Pool and queue dimensions.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PoolSizing {
    pub core_pool_size: usize,
    pub max_pool_size: usize,
    pub queue_size: usize,
    pub keep_alive: Duration,
}

impl PoolSizing {
    pub fn new(core_pool_size: usize, max_pool_size: usize, queue_size: usize) -> Self {
        Self {
            core_pool_size,
            max_pool_size,
            queue_size,
            keep_alive: Duration::from_secs(10),
        }
    }

    pub fn with_keep_alive(mut self, keep_alive: Duration) -> Self {
        self.keep_alive = keep_alive;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_pool_size == 0 {
            return Err(ConfigError::constraint("max_pool_size must be at least 1"));
        }
        if self.core_pool_size > self.max_pool_size {
            return Err(ConfigError::constraint(format!(
                "core_pool_size ({}) must not exceed max_pool_size ({})",
                self.core_pool_size, self.max_pool_size
            )));
        }
        Ok(())
    }

    /// Most jobs the pool holds at once (running + queued).
    pub fn capacity(&self) -> usize {
        self.max_pool_size + self.queue_size
    }
}

/// Result of handing a job to the dispatcher.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    Accepted,
    Rejected,
}

impl Submission {
    pub fn is_accepted(self) -> bool {
        matches!(self, Submission::Accepted)
    }
}

/// Result of a graceful shutdown.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DrainReport {
    /// Jobs still queued at the deadline; they were never started.
    pub discarded_queued: usize,
    /// Jobs still running at the deadline; their outcome is unknown.
    pub still_running: usize,
}

impl DrainReport {
    /// Everything finished within the timeout.
    pub fn drained(&self) -> bool {
        self.abandoned() == 0
    }

    /// Jobs whose outcome is unknown; they stay locked until lock expiry.
    pub fn abandoned(&self) -> usize {
        self.discarded_queued + self.still_running
    }
}

#[derive(Debug)]
struct PoolState {
    sizing: PoolSizing,
    queue: VecDeque<JobId>,
    workers: usize,
    active: usize,
    accepting: bool,
    spawned_total: usize,
}

impl PoolState {
    fn in_flight(&self) -> usize {
        self.queue.len() + self.active
    }
}

struct Shared {
    name: String,
    state: Mutex<PoolState>,
    work_available: Condvar,
    progress: Condvar,
    execute: ExecuteJob,
}

impl Shared {
    // Bookkeeping must survive a poisoned lock: jobs run outside it and
    // panics are caught, so the state itself is always consistent.
    fn lock(&self) -> MutexGuard<'_, PoolState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Fixed-size worker pool with a bounded queue.
pub struct Dispatcher {
    shared: Arc<Shared>,
}

impl core::fmt::Debug for Dispatcher {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let state = self.shared.lock();
        f.debug_struct("Dispatcher")
            .field("name", &self.shared.name)
            .field("sizing", &state.sizing)
            .field("workers", &state.workers)
            .field("active", &state.active)
            .field("queued", &state.queue.len())
            .finish()
    }
}

impl Dispatcher {
    /// Start the pool with `core_pool_size` workers.
    pub fn start(
        name: impl Into<String>,
        sizing: PoolSizing,
        execute: ExecuteJob,
    ) -> std::io::Result<Self> {
        let shared = Arc::new(Shared {
            name: name.into(),
            state: Mutex::new(PoolState {
                sizing,
                queue: VecDeque::with_capacity(sizing.queue_size),
                workers: 0,
                active: 0,
                accepting: true,
                spawned_total: 0,
            }),
            work_available: Condvar::new(),
            progress: Condvar::new(),
            execute,
        });

        {
            let mut state = shared.lock();
            for _ in 0..sizing.core_pool_size {
                if let Err(err) = spawn_worker(&shared, &mut state) {
                    state.accepting = false;
                    drop(state);
                    shared.work_available.notify_all();
                    return Err(err);
                }
            }
        }

        debug!(dispatcher = %shared.name, ?sizing, "dispatcher started");
        Ok(Self { shared })
    }

    /// Hand a job to the pool. Never blocks.
    pub fn submit(&self, job_id: JobId) -> Submission {
        let mut state = self.shared.lock();
        if !state.accepting {
            return Submission::Rejected;
        }

        if state.in_flight() < state.workers + state.sizing.queue_size {
            // With no core workers the queue needs at least one worker to drain it.
            if state.workers == 0 {
                if let Err(err) = spawn_worker(&self.shared, &mut state) {
                    error!(dispatcher = %self.shared.name, error = %err, "failed to start worker");
                    return Submission::Rejected;
                }
            }
            state.queue.push_back(job_id);
            drop(state);
            self.shared.work_available.notify_one();
            return Submission::Accepted;
        }

        if state.workers < state.sizing.max_pool_size {
            match spawn_worker(&self.shared, &mut state) {
                Ok(()) => {
                    state.queue.push_back(job_id);
                    drop(state);
                    self.shared.work_available.notify_one();
                    return Submission::Accepted;
                }
                Err(err) => {
                    error!(dispatcher = %self.shared.name, error = %err, "failed to start burst worker");
                }
            }
        }

        Submission::Rejected
    }

    /// How many more jobs would be accepted right now.
    pub fn remaining_capacity(&self) -> usize {
        let state = self.shared.lock();
        if !state.accepting {
            return 0;
        }
        state.sizing.capacity().saturating_sub(state.in_flight())
    }

    pub fn is_accepting(&self) -> bool {
        self.shared.lock().accepting
    }

    pub fn gauges(&self) -> PoolGauges {
        let state = self.shared.lock();
        PoolGauges {
            active_workers: state.active,
            pool_size: state.workers,
            queue_depth: state.queue.len(),
        }
    }

    pub fn active_count(&self) -> usize {
        self.shared.lock().active
    }

    pub fn queue_depth(&self) -> usize {
        self.shared.lock().queue.len()
    }

    pub fn pool_size(&self) -> usize {
        self.shared.lock().workers
    }

    pub fn sizing(&self) -> PoolSizing {
        self.shared.lock().sizing
    }

    /// Resize the pool. Extra workers retire once idle; missing core workers
    /// are started immediately.
    pub fn reconfigure(&self, sizing: PoolSizing) -> Result<(), ConfigError> {
        sizing.validate()?;

        let mut state = self.shared.lock();
        state.sizing = sizing;
        if state.accepting {
            while state.workers < sizing.core_pool_size {
                if let Err(err) = spawn_worker(&self.shared, &mut state) {
                    error!(dispatcher = %self.shared.name, error = %err, "failed to start core worker");
                    break;
                }
            }
        }
        drop(state);

        // Wake idle workers so they re-evaluate their keep-alive.
        self.shared.work_available.notify_all();
        info!(dispatcher = %self.shared.name, ?sizing, "dispatcher reconfigured");
        Ok(())
    }

    /// Stop accepting, let queued and running jobs finish until `timeout`,
    /// then give up on whatever is left.
    ///
    /// Workers stuck in a job are detached, not killed: there is no
    /// mid-execution cancellation.
    pub fn shutdown(&self, timeout: Duration) -> DrainReport {
        let deadline = Instant::now() + timeout;

        let mut state = self.shared.lock();
        state.accepting = false;
        self.shared.work_available.notify_all();

        while state.in_flight() > 0 || state.workers > 0 {
            let now = Instant::now();
            if now >= deadline {
                break;
            }
            let (guard, _) = self
                .shared
                .progress
                .wait_timeout(state, deadline - now)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
        }

        let report = DrainReport {
            discarded_queued: state.queue.len(),
            still_running: state.active,
        };
        state.queue.clear();
        drop(state);
        self.shared.work_available.notify_all();

        if report.drained() {
            info!(dispatcher = %self.shared.name, "dispatcher drained");
        } else {
            warn!(
                dispatcher = %self.shared.name,
                discarded_queued = report.discarded_queued,
                still_running = report.still_running,
                "dispatcher shutdown timed out; abandoned jobs stay locked until lock expiry"
            );
        }
        report
    }
}

impl Drop for Dispatcher {
    fn drop(&mut self) {
        let mut state = self.shared.lock();
        if state.accepting {
            state.accepting = false;
            drop(state);
            self.shared.work_available.notify_all();
        }
    }
}

fn spawn_worker(shared: &Arc<Shared>, state: &mut PoolState) -> std::io::Result<()> {
    state.spawned_total += 1;
    let thread_name = format!("{}-worker-{}", shared.name, state.spawned_total);
    let worker_shared = Arc::clone(shared);

    thread::Builder::new()
        .name(thread_name)
        .spawn(move || worker_loop(worker_shared))?;

    state.workers += 1;
    Ok(())
}

fn worker_loop(shared: Arc<Shared>) {
    let mut state = shared.lock();

    loop {
        if state.workers > state.sizing.max_pool_size {
            break;
        }

        if let Some(job_id) = state.queue.pop_front() {
            state.active += 1;
            drop(state);

            let execute = &shared.execute;
            if panic::catch_unwind(AssertUnwindSafe(|| execute(job_id))).is_err() {
                error!(dispatcher = %shared.name, job_id = %job_id, "job execution panicked");
            }

            state = shared.lock();
            state.active -= 1;
            shared.progress.notify_all();
            continue;
        }

        if !state.accepting {
            break;
        }

        if state.workers > state.sizing.core_pool_size {
            let keep_alive = state.sizing.keep_alive;
            let (guard, timeout) = shared
                .work_available
                .wait_timeout(state, keep_alive)
                .unwrap_or_else(|e| e.into_inner());
            state = guard;
            if timeout.timed_out()
                && state.queue.is_empty()
                && state.workers > state.sizing.core_pool_size
            {
                break;
            }
        } else {
            state = shared
                .work_available
                .wait(state)
                .unwrap_or_else(|e| e.into_inner());
        }
    }

    state.workers -= 1;
    drop(state);
    shared.progress.notify_all();
}

//! Acquisition cycle: find due jobs, claim them, hand them to the dispatcher.
//!
//! One dedicated thread runs the cycle. Each tick:
//!
//! 1. reads up to `next_batch` acquirable jobs (priority desc, due date asc);
//! 2. drops every exclusive job whose execution context already has an
//!    exclusive job in this batch;
//! 3. claims each remaining job with a version-checked lock write; a lost
//!    race is skipped quietly;
//! 4. submits each claimed job. On the first rejection the claim is released
//!    and the rest of the batch is left for a later tick.
//!
//! The wait before the next tick comes from [`IdleBackoff`]. A full batch
//! accepted without rejection ticks again immediately. A wake cuts the wait
//! short, except after a rejection: the rejection backoff is always waited
//! out. Pending wakes are coalesced into one.

use std::collections::HashSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{Receiver, RecvTimeoutError, TryRecvError};
use std::time::{Duration, Instant};

use tracing::{debug, error, info};

use jobline_core::{ExecutionContextId, LockOwner, SharedClock};

use super::dispatcher::{Dispatcher, Submission};
use super::metrics::ExecutorMetrics;
use super::store::JobStore;
use super::types::Job;
use crate::config::ExecutorConfig;

/// Messages for the acquisition thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AcquisitionSignal {
    /// New work may be due; tick now instead of finishing the wait.
    Wake,
    Shutdown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Streak {
    None,
    Empty,
    Rejected,
    StoreError,
}

/// Wait-time state machine between acquisition ticks.
///
/// Consecutive empty ticks (or store errors) grow the wait from `floor` by
/// `factor` up to `ceiling`. Consecutive rejections do the same starting from
/// the rejection floor. Any tick that dispatches work resets it to `floor`.
#[derive(Debug, Clone, PartialEq)]
pub struct IdleBackoff {
    floor: Duration,
    ceiling: Duration,
    factor: f64,
    rejection_floor: Duration,
    current: Duration,
    streak: Streak,
}

impl IdleBackoff {
    pub fn new(floor: Duration, ceiling: Duration, factor: f64) -> Self {
        let ceiling = ceiling.max(floor);
        Self {
            floor,
            ceiling,
            factor: if factor.is_finite() { factor.max(1.0) } else { 1.0 },
            rejection_floor: floor,
            current: floor,
            streak: Streak::None,
        }
    }

    pub fn with_rejection_floor(mut self, rejection_floor: Duration) -> Self {
        self.rejection_floor = rejection_floor.min(self.ceiling);
        self
    }

    pub fn from_config(config: &ExecutorConfig) -> Self {
        Self::new(config.wait_time, config.max_wait, config.wait_increase_factor)
            .with_rejection_floor(config.backoff_on_rejection)
    }

    pub fn current(&self) -> Duration {
        self.current
    }

    pub fn floor(&self) -> Duration {
        self.floor
    }

    pub fn ceiling(&self) -> Duration {
        self.ceiling
    }

    /// A tick found nothing to do.
    pub fn on_empty(&mut self) -> Duration {
        self.escalate(Streak::Empty, self.floor)
    }

    /// A tick dispatched work.
    pub fn on_jobs(&mut self) -> Duration {
        self.streak = Streak::None;
        self.current = self.floor;
        self.current
    }

    /// The dispatcher rejected a claimed job.
    pub fn on_rejection(&mut self) -> Duration {
        self.escalate(Streak::Rejected, self.rejection_floor)
    }

    /// The store could not be queried.
    pub fn on_store_error(&mut self) -> Duration {
        self.escalate(Streak::StoreError, self.floor)
    }

    fn escalate(&mut self, streak: Streak, start: Duration) -> Duration {
        self.current = if self.streak == streak {
            grow(self.current, self.factor).min(self.ceiling)
        } else {
            start
        };
        self.streak = streak;
        self.current
    }
}

fn grow(current: Duration, factor: f64) -> Duration {
    Duration::try_from_secs_f64(current.as_secs_f64() * factor).unwrap_or(Duration::MAX)
}

/// What one tick did.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Candidates returned by the store.
    pub found: usize,
    /// Claims this node won.
    pub acquired: usize,
    /// Claims lost to another writer.
    pub contended: usize,
    /// Exclusive jobs held back because their context was already in the batch.
    pub deferred: usize,
    pub dispatched: usize,
    pub rejected: usize,
    pub store_errors: usize,
    pub next_wait: Duration,
}

/// The acquisition loop of one node.
pub struct AcquisitionCycle<S: JobStore> {
    store: Arc<S>,
    dispatcher: Arc<Dispatcher>,
    owner: LockOwner,
    clock: SharedClock,
    metrics: Arc<ExecutorMetrics>,
    max_jobs: usize,
    lock_span: chrono::Duration,
    backoff: IdleBackoff,
    saturated: bool,
    wake_pending: Arc<AtomicBool>,
}

impl<S: JobStore> core::fmt::Debug for AcquisitionCycle<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("AcquisitionCycle")
            .field("owner", &self.owner)
            .field("max_jobs", &self.max_jobs)
            .field("saturated", &self.saturated)
            .field("backoff", &self.backoff)
            .finish_non_exhaustive()
    }
}

impl<S: JobStore> AcquisitionCycle<S> {
    pub fn new(
        store: Arc<S>,
        dispatcher: Arc<Dispatcher>,
        clock: SharedClock,
        metrics: Arc<ExecutorMetrics>,
        config: &ExecutorConfig,
    ) -> Self {
        let max_jobs = config.max_jobs_per_acquisition.max(1);
        Self {
            store,
            dispatcher,
            owner: config.lock_owner.clone(),
            clock,
            metrics,
            max_jobs,
            lock_span: config.lock_span(),
            backoff: IdleBackoff::from_config(config),
            saturated: false,
            wake_pending: Arc::new(AtomicBool::new(false)),
        }
    }

    /// Flag shared with senders of [`AcquisitionSignal::Wake`]. A sender that
    /// finds it already set skips the send; the cycle clears it on wake-up.
    pub fn wake_hint(&self) -> Arc<AtomicBool> {
        self.wake_pending.clone()
    }

    /// Batch size for the next tick: the configured maximum, or what the
    /// dispatcher can still take (at least one) after a rejection.
    pub fn next_batch(&self) -> usize {
        if self.saturated {
            self.dispatcher.remaining_capacity().clamp(1, self.max_jobs)
        } else {
            self.max_jobs
        }
    }

    pub fn backoff(&self) -> &IdleBackoff {
        &self.backoff
    }

    pub fn tick(&mut self) -> TickReport {
        self.metrics.record_tick();
        let now = self.clock.now();
        let limit = self.next_batch();

        let candidates = match self.store.find_acquirable(now, limit) {
            Ok(candidates) => candidates,
            Err(err) => {
                self.metrics.record_acquisition_error();
                let next_wait = self.backoff.on_store_error();
                error!(
                    lock_owner = %self.owner,
                    error = %err,
                    retry_in_ms = next_wait.as_millis() as u64,
                    "failed to query acquirable jobs"
                );
                return TickReport {
                    store_errors: 1,
                    next_wait,
                    ..TickReport::default()
                };
            }
        };

        let mut report = TickReport {
            found: candidates.len(),
            ..TickReport::default()
        };
        let expires_at = now + self.lock_span;
        let mut batch_contexts: HashSet<ExecutionContextId> = HashSet::new();

        for job in candidates {
            if let Some(context) = exclusive_context(&job) {
                if !batch_contexts.insert(context.clone()) {
                    report.deferred += 1;
                    continue;
                }
            }

            let claimed = match self.store.try_lock(job.id, job.version, &self.owner, expires_at) {
                Ok(claimed) => claimed,
                Err(err) if err.is_contention() => {
                    debug!(job_id = %job.id, lock_owner = %self.owner, "job claimed by another node");
                    report.contended += 1;
                    continue;
                }
                Err(err) => {
                    error!(job_id = %job.id, lock_owner = %self.owner, error = %err, "failed to claim job");
                    self.metrics.record_acquisition_error();
                    report.store_errors += 1;
                    continue;
                }
            };
            report.acquired += 1;

            match self.dispatcher.submit(claimed.id) {
                Submission::Accepted => report.dispatched += 1,
                Submission::Rejected => {
                    report.rejected += 1;
                    self.release(&claimed);
                    break;
                }
            }
        }

        self.metrics.add_acquired(report.acquired as u64);
        self.metrics.add_contended(report.contended as u64);
        self.metrics.add_rejected(report.rejected as u64);

        self.saturated = report.rejected > 0;
        report.next_wait = if report.rejected > 0 {
            let wait = self.backoff.on_rejection();
            debug!(
                lock_owner = %self.owner,
                remaining_capacity = self.dispatcher.remaining_capacity(),
                wait_ms = wait.as_millis() as u64,
                "dispatcher saturated; backing off"
            );
            wait
        } else if report.dispatched > 0 {
            let wait = self.backoff.on_jobs();
            if report.found >= limit {
                Duration::ZERO
            } else {
                wait
            }
        } else {
            let wait = self.backoff.on_empty();
            debug!(
                lock_owner = %self.owner,
                found = report.found,
                contended = report.contended,
                wait_ms = wait.as_millis() as u64,
                "no jobs acquired"
            );
            wait
        };

        report
    }

    /// Tick until told to stop. Runs on the acquisition thread.
    pub fn run(mut self, signals: Receiver<AcquisitionSignal>) {
        info!(lock_owner = %self.owner, "acquisition cycle started");

        loop {
            let report = self.tick();
            if !self.wait(&signals, report.next_wait) {
                break;
            }
        }

        info!(lock_owner = %self.owner, "acquisition cycle stopped");
    }

    /// Wait until the next tick is due. Returns `false` once told to stop.
    fn wait(&self, signals: &Receiver<AcquisitionSignal>, wait: Duration) -> bool {
        let deadline = Instant::now() + wait;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            match signals.recv_timeout(remaining) {
                Ok(AcquisitionSignal::Wake) => {
                    self.wake_pending.store(false, Ordering::Release);
                    if !drain_wakes(signals) {
                        return false;
                    }
                    if self.saturated {
                        debug!(lock_owner = %self.owner, "wake ignored while dispatcher is saturated");
                        continue;
                    }
                    debug!(lock_owner = %self.owner, "acquisition woken early");
                    return true;
                }
                Err(RecvTimeoutError::Timeout) => return true,
                Ok(AcquisitionSignal::Shutdown) | Err(RecvTimeoutError::Disconnected) => return false,
            }
        }
    }

    /// Give a rejected claim back so any node can pick it up next tick.
    fn release(&self, claimed: &Job) {
        match self.store.release_lock(claimed.id, claimed.version, &self.owner) {
            Ok(_) => {}
            Err(err) if err.is_contention() => {
                debug!(job_id = %claimed.id, error = %err, "rejected job changed before release");
            }
            Err(err) => {
                error!(
                    job_id = %claimed.id,
                    error = %err,
                    "failed to release rejected job; it stays locked until lock expiry"
                );
            }
        }
    }
}

/// Swallow queued wakes. Returns `false` if a shutdown was queued behind them.
fn drain_wakes(signals: &Receiver<AcquisitionSignal>) -> bool {
    loop {
        match signals.try_recv() {
            Ok(AcquisitionSignal::Wake) => {}
            Err(TryRecvError::Empty) => return true,
            Ok(AcquisitionSignal::Shutdown) | Err(TryRecvError::Disconnected) => return false,
        }
    }
}

fn exclusive_context(job: &Job) -> Option<&ExecutionContextId> {
    if job.exclusive {
        job.execution_context_id.as_ref()
    } else {
        None
    }
}

//! Executor counters for operational monitoring.

use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic counters shared by the acquisition thread and workers.
#[derive(Debug, Default)]
pub struct ExecutorMetrics {
    acquisition_ticks: AtomicU64,
    jobs_acquired: AtomicU64,
    claims_contended: AtomicU64,
    jobs_rejected: AtomicU64,
    jobs_completed: AtomicU64,
    jobs_failed: AtomicU64,
    jobs_retried: AtomicU64,
    incidents_created: AtomicU64,
    infrastructure_failures: AtomicU64,
    locks_lost: AtomicU64,
    acquisition_errors: AtomicU64,
}

macro_rules! counter {
    ($($incr:ident, $add:ident => $field:ident;)*) => {
        $(
            pub fn $incr(&self) {
                self.$field.fetch_add(1, Ordering::Relaxed);
            }

            pub fn $add(&self, n: u64) {
                self.$field.fetch_add(n, Ordering::Relaxed);
            }
        )*
    };
}

impl ExecutorMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    counter! {
        record_tick, add_ticks => acquisition_ticks;
        record_acquired, add_acquired => jobs_acquired;
        record_contended, add_contended => claims_contended;
        record_rejected, add_rejected => jobs_rejected;
        record_completed, add_completed => jobs_completed;
        record_failed, add_failed => jobs_failed;
        record_retried, add_retried => jobs_retried;
        record_incident, add_incidents => incidents_created;
        record_infrastructure_failure, add_infrastructure_failures => infrastructure_failures;
        record_lock_lost, add_locks_lost => locks_lost;
        record_acquisition_error, add_acquisition_errors => acquisition_errors;
    }

    /// Counter values; pool gauges are filled in by the caller.
    pub fn snapshot(&self, pool: PoolGauges) -> MetricsSnapshot {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        MetricsSnapshot {
            active_workers: pool.active_workers,
            pool_size: pool.pool_size,
            queue_depth: pool.queue_depth,
            acquisition_ticks: load(&self.acquisition_ticks),
            jobs_acquired: load(&self.jobs_acquired),
            claims_contended: load(&self.claims_contended),
            jobs_rejected: load(&self.jobs_rejected),
            jobs_completed: load(&self.jobs_completed),
            jobs_failed: load(&self.jobs_failed),
            jobs_retried: load(&self.jobs_retried),
            incidents_created: load(&self.incidents_created),
            infrastructure_failures: load(&self.infrastructure_failures),
            locks_lost: load(&self.locks_lost),
            acquisition_errors: load(&self.acquisition_errors),
        }
    }
}

/// Live dispatcher gauges.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PoolGauges {
    pub active_workers: usize,
    pub pool_size: usize,
    pub queue_depth: usize,
}

/// Read-only view exposed to the management surface.
#[derive(Debug, Clone, Default, PartialEq, Eq, serde::Serialize)]
pub struct MetricsSnapshot {
    pub active_workers: usize,
    pub pool_size: usize,
    pub queue_depth: usize,
    pub acquisition_ticks: u64,
    pub jobs_acquired: u64,
    pub claims_contended: u64,
    pub jobs_rejected: u64,
    pub jobs_completed: u64,
    /// Business failures (retried or exhausted).
    pub jobs_failed: u64,
    pub jobs_retried: u64,
    pub incidents_created: u64,
    pub infrastructure_failures: u64,
    pub locks_lost: u64,
    pub acquisition_errors: u64,
}

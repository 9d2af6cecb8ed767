//! Lifecycle controller: owns the acquisition thread and the dispatcher.
//!
//! States: `Stopped → Starting → Running → Stopping → Stopped`. `start` on a
//! running executor is a no-op and a stopped executor can be started again.
//!
//! Shutdown stops the acquisition thread first, so nothing new is claimed,
//! then drains the dispatcher within whatever is left of the timeout. Jobs
//! that do not finish in time keep their locks; lock expiry hands them to
//! another node or to this one after a restart.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Mutex, MutexGuard, RwLock};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use serde::Serialize;
use tracing::{debug, error, info, warn};

use jobline_core::{LockOwner, SharedClock};

use super::acquisition::{AcquisitionCycle, AcquisitionSignal};
use super::dispatcher::{Dispatcher, DrainReport, ExecuteJob, PoolSizing};
use super::failure::FailurePolicy;
use super::handler::HandlerRegistry;
use super::management::JobManagement;
use super::metrics::{ExecutorMetrics, MetricsSnapshot, PoolGauges};
use super::runner::JobRunner;
use super::store::{JobStore, JobStoreError};
use super::types::{Job, NewJob};
use crate::config::{ConfigError, ExecutorConfig};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ExecutorState {
    Stopped,
    Starting,
    Running,
    Stopping,
}

#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("failed to spawn {thread} thread: {source}")]
    Spawn {
        thread: &'static str,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Store(#[from] JobStoreError),
}

/// Result of [`JobExecutor::shutdown`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct ShutdownReport {
    /// `false` when the executor was not running.
    pub was_running: bool,
    pub drain: DrainReport,
    pub elapsed: Duration,
}

impl ShutdownReport {
    pub fn drained(&self) -> bool {
        self.drain.drained()
    }

    /// Jobs whose outcome is unknown.
    pub fn abandoned(&self) -> usize {
        self.drain.abandoned()
    }
}

struct Running {
    signals: Sender<AcquisitionSignal>,
    wake_pending: Arc<AtomicBool>,
    acquisition: JoinHandle<()>,
    dispatcher: Arc<Dispatcher>,
}

/// The job executor of one node.
pub struct JobExecutor<S: JobStore + 'static> {
    store: Arc<S>,
    registry: Arc<HandlerRegistry>,
    config: RwLock<ExecutorConfig>,
    clock: SharedClock,
    metrics: Arc<ExecutorMetrics>,
    state: Mutex<ExecutorState>,
    running: Mutex<Option<Running>>,
}

impl<S: JobStore + 'static> core::fmt::Debug for JobExecutor<S> {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.debug_struct("JobExecutor")
            .field("state", &self.state())
            .field("registry", &self.registry)
            .finish_non_exhaustive()
    }
}

impl<S: JobStore + 'static> JobExecutor<S> {
    pub fn new(
        store: Arc<S>,
        registry: HandlerRegistry,
        config: ExecutorConfig,
        clock: SharedClock,
    ) -> Self {
        Self {
            store,
            registry: Arc::new(registry),
            config: RwLock::new(config),
            clock,
            metrics: Arc::new(ExecutorMetrics::new()),
            state: Mutex::new(ExecutorState::Stopped),
            running: Mutex::new(None),
        }
    }

    pub fn state(&self) -> ExecutorState {
        *self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn is_running(&self) -> bool {
        self.state() == ExecutorState::Running
    }

    pub fn config(&self) -> ExecutorConfig {
        self.config.read().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn lock_owner(&self) -> LockOwner {
        self.config().lock_owner
    }

    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Start acquiring and executing jobs. Idempotent.
    pub fn start(&self) -> Result<(), ExecutorError> {
        let mut running = self.lock_running();
        if running.is_some() {
            debug!("job executor already running");
            return Ok(());
        }

        let config = self.config();
        config.validate()?;

        self.set_state(ExecutorState::Starting);
        match self.spawn(&config) {
            Ok(started) => {
                *running = Some(started);
                self.set_state(ExecutorState::Running);
                info!(
                    lock_owner = %config.lock_owner,
                    core_pool_size = config.pool.core_pool_size,
                    max_pool_size = config.pool.max_pool_size,
                    queue_size = config.pool.queue_size,
                    "job executor started"
                );
                Ok(())
            }
            Err(err) => {
                self.set_state(ExecutorState::Stopped);
                error!(error = %err, "job executor failed to start");
                Err(err)
            }
        }
    }

    fn spawn(&self, config: &ExecutorConfig) -> Result<Running, ExecutorError> {
        let runner = Arc::new(JobRunner::new(
            self.store.clone(),
            self.registry.clone(),
            FailurePolicy::flat(config.retry_interval_span()),
            config.lock_owner.clone(),
            self.clock.clone(),
            self.metrics.clone(),
        ));
        let execute: ExecuteJob = Arc::new(move |job_id| {
            runner.run(job_id);
        });

        let dispatcher = Dispatcher::start("jobline", config.pool, execute).map_err(|source| {
            ExecutorError::Spawn {
                thread: "worker",
                source,
            }
        })?;
        let dispatcher = Arc::new(dispatcher);

        let (signals, signal_rx) = mpsc::channel();
        let cycle = AcquisitionCycle::new(
            self.store.clone(),
            dispatcher.clone(),
            self.clock.clone(),
            self.metrics.clone(),
            config,
        );
        let wake_pending = cycle.wake_hint();

        let acquisition = thread::Builder::new()
            .name("jobline-acquisition".to_string())
            .spawn(move || cycle.run(signal_rx));
        let acquisition = match acquisition {
            Ok(handle) => handle,
            Err(source) => {
                dispatcher.shutdown(Duration::ZERO);
                return Err(ExecutorError::Spawn {
                    thread: "acquisition",
                    source,
                });
            }
        };

        Ok(Running {
            signals,
            wake_pending,
            acquisition,
            dispatcher,
        })
    }

    /// Stop acquiring, drain running and queued jobs for up to `timeout`.
    pub fn shutdown(&self, timeout: Duration) -> ShutdownReport {
        let started = Instant::now();
        let mut running = self.lock_running();
        let Some(current) = running.take() else {
            debug!("job executor not running");
            return ShutdownReport::default();
        };

        self.set_state(ExecutorState::Stopping);
        info!(timeout_ms = timeout.as_millis() as u64, "stopping job executor");

        // The thread may already be gone; the join below still applies.
        let _ = current.signals.send(AcquisitionSignal::Shutdown);
        if current.acquisition.join().is_err() {
            error!("acquisition thread panicked");
        }

        let drain = current
            .dispatcher
            .shutdown(timeout.saturating_sub(started.elapsed()));
        self.set_state(ExecutorState::Stopped);

        let report = ShutdownReport {
            was_running: true,
            drain,
            elapsed: started.elapsed(),
        };
        if report.drained() {
            info!(elapsed_ms = report.elapsed.as_millis() as u64, "job executor stopped");
        } else {
            warn!(
                abandoned = report.abandoned(),
                elapsed_ms = report.elapsed.as_millis() as u64,
                "job executor stopped with jobs in an unknown state"
            );
        }
        report
    }

    /// Hint that a job became due; the acquisition thread ticks right away
    /// unless it is backing off from a saturated dispatcher.
    pub fn job_added(&self) {
        if let Some(current) = self.lock_running().as_ref() {
            if !current.wake_pending.swap(true, Ordering::AcqRel) {
                let _ = current.signals.send(AcquisitionSignal::Wake);
            }
        }
    }

    /// Persist a new job and wake the acquisition thread.
    pub fn schedule(&self, job: NewJob) -> Result<Job, ExecutorError> {
        let default_retries = self.config().default_retries;
        let job = self.store.insert(job.build(self.clock.now(), default_retries))?;
        debug!(job_id = %job.id, handler_type = %job.handler_type, due_date = %job.due_date, "job scheduled");
        self.job_added();
        Ok(job)
    }

    /// Resize the worker pool; applies immediately when running.
    pub fn reconfigure(&self, pool: PoolSizing) -> Result<(), ExecutorError> {
        pool.validate()?;
        {
            let mut config = self.config.write().unwrap_or_else(|e| e.into_inner());
            config.pool = pool;
        }
        if let Some(current) = self.lock_running().as_ref() {
            current.dispatcher.reconfigure(pool)?;
        }
        Ok(())
    }

    pub fn metrics(&self) -> MetricsSnapshot {
        let gauges = self
            .lock_running()
            .as_ref()
            .map(|current| current.dispatcher.gauges())
            .unwrap_or_else(PoolGauges::default);
        self.metrics.snapshot(gauges)
    }

    /// Operator surface over the same store and handlers.
    pub fn management(&self) -> JobManagement<S> {
        let config = self.config();
        let owner = LockOwner::new(format!("{}-management", config.lock_owner))
            .unwrap_or_else(|_| LockOwner::generate());
        JobManagement::new(
            self.store.clone(),
            self.registry.clone(),
            FailurePolicy::flat(config.retry_interval_span()),
            owner,
            config.lock_span(),
            self.clock.clone(),
            self.metrics.clone(),
        )
    }

    fn set_state(&self, state: ExecutorState) {
        *self.state.lock().unwrap_or_else(|e| e.into_inner()) = state;
    }

    fn lock_running(&self) -> MutexGuard<'_, Option<Running>> {
        self.running.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl<S: JobStore + 'static> Drop for JobExecutor<S> {
    fn drop(&mut self) {
        if let Some(current) = self.lock_running().take() {
            let _ = current.signals.send(AcquisitionSignal::Shutdown);
            if current.acquisition.join().is_err() {
                error!("acquisition thread panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use jobline_core::SystemClock;

    use crate::jobs::handler::HandlerOutcome;
    use crate::jobs::store::InMemoryJobStore;

    fn wait_until(mut condition: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(5);
        while Instant::now() < deadline {
            if condition() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        condition()
    }

    fn config() -> ExecutorConfig {
        ExecutorConfig::default()
            .with_pool(PoolSizing::new(2, 2, 2))
            .with_wait(Duration::from_millis(20), Duration::from_millis(100))
    }

    fn executor(registry: HandlerRegistry) -> JobExecutor<InMemoryJobStore> {
        JobExecutor::new(InMemoryJobStore::arc(), registry, config(), SystemClock::shared())
    }

    #[test]
    fn lifecycle_transitions() {
        let executor = executor(HandlerRegistry::new());
        assert_eq!(executor.state(), ExecutorState::Stopped);

        executor.start().unwrap();
        assert_eq!(executor.state(), ExecutorState::Running);
        executor.start().unwrap();
        assert_eq!(executor.state(), ExecutorState::Running);

        let report = executor.shutdown(Duration::from_secs(5));
        assert!(report.was_running);
        assert!(report.drained());
        assert_eq!(executor.state(), ExecutorState::Stopped);

        let report = executor.shutdown(Duration::from_secs(5));
        assert!(!report.was_running);
    }

    #[test]
    fn restart_after_stop_runs_new_jobs() {
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = runs.clone();
        let mut registry = HandlerRegistry::new();
        registry.register_fn("count", move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
            HandlerOutcome::Success
        });
        let executor = executor(registry);

        executor.start().unwrap();
        executor.schedule(NewJob::new("count")).unwrap();
        assert!(wait_until(|| runs.load(Ordering::SeqCst) == 1));
        executor.shutdown(Duration::from_secs(5));

        executor.start().unwrap();
        executor.schedule(NewJob::new("count")).unwrap();
        assert!(wait_until(|| runs.load(Ordering::SeqCst) == 2));
        executor.shutdown(Duration::from_secs(5));

        assert!(executor.store().is_empty());
        assert_eq!(executor.metrics().jobs_completed, 2);
    }

    #[test]
    fn invalid_configuration_refuses_to_start() {
        let executor = JobExecutor::new(
            InMemoryJobStore::arc(),
            HandlerRegistry::new(),
            config().with_max_jobs_per_acquisition(0),
            SystemClock::shared(),
        );

        assert!(matches!(executor.start(), Err(ExecutorError::Config(_))));
        assert_eq!(executor.state(), ExecutorState::Stopped);
    }

    #[test]
    fn reconfigure_applies_to_running_pool() {
        let executor = executor(HandlerRegistry::new());
        executor.start().unwrap();

        executor.reconfigure(PoolSizing::new(4, 6, 1)).unwrap();
        assert_eq!(executor.metrics().pool_size, 4);
        assert_eq!(executor.config().pool.max_pool_size, 6);

        assert!(executor.reconfigure(PoolSizing::new(5, 1, 1)).is_err());
        executor.shutdown(Duration::from_secs(5));
        assert_eq!(executor.metrics().pool_size, 0);
    }
}

//! Executor configuration.
//!
//! Every option has a default; `from_env` overrides them from `JOBLINE_*`
//! environment variables. Durations are given in milliseconds.

use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use jobline_core::LockOwner;

use crate::jobs::dispatcher::PoolSizing;

pub const CORE_POOL_SIZE_ENV: &str = "JOBLINE_CORE_POOL_SIZE";
pub const MAX_POOL_SIZE_ENV: &str = "JOBLINE_MAX_POOL_SIZE";
pub const QUEUE_SIZE_ENV: &str = "JOBLINE_QUEUE_SIZE";
pub const KEEP_ALIVE_ENV: &str = "JOBLINE_KEEP_ALIVE_MS";
pub const MAX_JOBS_PER_ACQUISITION_ENV: &str = "JOBLINE_MAX_JOBS_PER_ACQUISITION";
pub const LOCK_DURATION_ENV: &str = "JOBLINE_LOCK_DURATION_MS";
pub const WAIT_TIME_ENV: &str = "JOBLINE_WAIT_TIME_MS";
pub const MAX_WAIT_ENV: &str = "JOBLINE_MAX_WAIT_MS";
pub const WAIT_INCREASE_FACTOR_ENV: &str = "JOBLINE_WAIT_INCREASE_FACTOR";
pub const BACKOFF_ON_REJECTION_ENV: &str = "JOBLINE_BACKOFF_ON_REJECTION_MS";
pub const DEFAULT_RETRIES_ENV: &str = "JOBLINE_DEFAULT_RETRIES";
pub const DEFAULT_RETRY_INTERVAL_ENV: &str = "JOBLINE_DEFAULT_RETRY_INTERVAL_MS";
pub const LOCK_OWNER_ENV: &str = "JOBLINE_LOCK_OWNER";
pub const SHUTDOWN_TIMEOUT_ENV: &str = "JOBLINE_SHUTDOWN_TIMEOUT_MS";

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("invalid value for {key}: {value:?}")]
    Invalid { key: String, value: String },

    #[error("invalid configuration: {0}")]
    Constraint(String),
}

impl ConfigError {
    pub fn invalid(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Invalid {
            key: key.into(),
            value: value.into(),
        }
    }

    pub fn constraint(msg: impl Into<String>) -> Self {
        Self::Constraint(msg.into())
    }
}

/// Job executor configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct ExecutorConfig {
    /// Dispatcher worker counts and queue depth.
    pub pool: PoolSizing,
    /// Upper bound on jobs claimed per acquisition tick.
    pub max_jobs_per_acquisition: usize,
    /// How long a claim stays valid.
    pub lock_duration: Duration,
    /// Idle wait floor.
    pub wait_time: Duration,
    /// Idle wait ceiling.
    pub max_wait: Duration,
    pub wait_increase_factor: f64,
    /// Wait floor after the dispatcher rejected a job.
    pub backoff_on_rejection: Duration,
    /// Retry budget for jobs without an explicit budget or retry cycle.
    pub default_retries: u32,
    /// Delay before a failed job becomes due again, absent a retry cycle.
    pub default_retry_interval: Duration,
    /// Identity written into job locks by this node.
    pub lock_owner: LockOwner,
    /// Drain timeout used by the node binary.
    pub shutdown_timeout: Duration,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            pool: PoolSizing::new(3, 10, 3),
            max_jobs_per_acquisition: 3,
            lock_duration: Duration::from_secs(5 * 60),
            wait_time: Duration::from_secs(5),
            max_wait: Duration::from_secs(60),
            wait_increase_factor: 2.0,
            backoff_on_rejection: Duration::from_millis(500),
            default_retries: 3,
            default_retry_interval: Duration::ZERO,
            lock_owner: LockOwner::generate(),
            shutdown_timeout: Duration::from_secs(30),
        }
    }
}

impl ExecutorConfig {
    /// Defaults overridden by `JOBLINE_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Like [`from_env`](Self::from_env) with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::default();

        if let Some(v) = parse(&lookup, CORE_POOL_SIZE_ENV)? {
            config.pool.core_pool_size = v;
        }
        if let Some(v) = parse(&lookup, MAX_POOL_SIZE_ENV)? {
            config.pool.max_pool_size = v;
        }
        if let Some(v) = parse(&lookup, QUEUE_SIZE_ENV)? {
            config.pool.queue_size = v;
        }
        if let Some(v) = parse_millis(&lookup, KEEP_ALIVE_ENV)? {
            config.pool.keep_alive = v;
        }
        if let Some(v) = parse(&lookup, MAX_JOBS_PER_ACQUISITION_ENV)? {
            config.max_jobs_per_acquisition = v;
        }
        if let Some(v) = parse_millis(&lookup, LOCK_DURATION_ENV)? {
            config.lock_duration = v;
        }
        if let Some(v) = parse_millis(&lookup, WAIT_TIME_ENV)? {
            config.wait_time = v;
        }
        if let Some(v) = parse_millis(&lookup, MAX_WAIT_ENV)? {
            config.max_wait = v;
        }
        if let Some(v) = parse(&lookup, WAIT_INCREASE_FACTOR_ENV)? {
            config.wait_increase_factor = v;
        }
        if let Some(v) = parse_millis(&lookup, BACKOFF_ON_REJECTION_ENV)? {
            config.backoff_on_rejection = v;
        }
        if let Some(v) = parse(&lookup, DEFAULT_RETRIES_ENV)? {
            config.default_retries = v;
        }
        if let Some(v) = parse_millis(&lookup, DEFAULT_RETRY_INTERVAL_ENV)? {
            config.default_retry_interval = v;
        }
        if let Some(raw) = lookup(LOCK_OWNER_ENV) {
            config.lock_owner =
                LockOwner::new(raw.clone()).map_err(|_| ConfigError::invalid(LOCK_OWNER_ENV, raw))?;
        }
        if let Some(v) = parse_millis(&lookup, SHUTDOWN_TIMEOUT_ENV)? {
            config.shutdown_timeout = v;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn with_pool(mut self, pool: PoolSizing) -> Self {
        self.pool = pool;
        self
    }

    pub fn with_max_jobs_per_acquisition(mut self, max_jobs: usize) -> Self {
        self.max_jobs_per_acquisition = max_jobs;
        self
    }

    pub fn with_lock_duration(mut self, lock_duration: Duration) -> Self {
        self.lock_duration = lock_duration;
        self
    }

    /// Idle backoff floor and ceiling.
    pub fn with_wait(mut self, wait_time: Duration, max_wait: Duration) -> Self {
        self.wait_time = wait_time;
        self.max_wait = max_wait;
        self
    }

    pub fn with_wait_increase_factor(mut self, factor: f64) -> Self {
        self.wait_increase_factor = factor;
        self
    }

    pub fn with_backoff_on_rejection(mut self, backoff: Duration) -> Self {
        self.backoff_on_rejection = backoff;
        self
    }

    pub fn with_default_retries(mut self, retries: u32) -> Self {
        self.default_retries = retries;
        self
    }

    pub fn with_default_retry_interval(mut self, interval: Duration) -> Self {
        self.default_retry_interval = interval;
        self
    }

    pub fn with_lock_owner(mut self, owner: LockOwner) -> Self {
        self.lock_owner = owner;
        self
    }

    pub fn with_shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.shutdown_timeout = timeout;
        self
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.pool.validate()?;

        if self.max_jobs_per_acquisition == 0 {
            return Err(ConfigError::constraint(
                "max_jobs_per_acquisition must be at least 1",
            ));
        }
        if self.lock_duration.is_zero() || chrono::Duration::from_std(self.lock_duration).is_err() {
            return Err(ConfigError::constraint(
                "lock_duration must be positive and representable",
            ));
        }
        if chrono::Duration::from_std(self.default_retry_interval).is_err() {
            return Err(ConfigError::constraint(
                "default_retry_interval is out of range",
            ));
        }
        if self.wait_time > self.max_wait {
            return Err(ConfigError::constraint(format!(
                "wait_time ({:?}) must not exceed max_wait ({:?})",
                self.wait_time, self.max_wait
            )));
        }
        if !self.wait_increase_factor.is_finite() || self.wait_increase_factor < 1.0 {
            return Err(ConfigError::constraint(
                "wait_increase_factor must be a finite number >= 1",
            ));
        }
        Ok(())
    }

    /// Claim validity as a calendar span.
    pub fn lock_span(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.lock_duration).unwrap_or_else(|_| chrono::Duration::weeks(52))
    }

    /// Default retry delay as a calendar span.
    pub fn retry_interval_span(&self) -> chrono::Duration {
        chrono::Duration::from_std(self.default_retry_interval).unwrap_or_else(|_| chrono::Duration::zero())
    }
}

fn parse<T, F>(lookup: &F, key: &str) -> Result<Option<T>, ConfigError>
where
    T: FromStr,
    F: Fn(&str) -> Option<String>,
{
    match lookup(key) {
        None => Ok(None),
        Some(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::invalid(key, raw)),
    }
}

fn parse_millis<F>(lookup: &F, key: &str) -> Result<Option<Duration>, ConfigError>
where
    F: Fn(&str) -> Option<String>,
{
    Ok(parse::<u64, F>(lookup, key)?.map(Duration::from_millis))
}

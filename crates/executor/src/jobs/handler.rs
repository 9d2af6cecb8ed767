//! Boundary to the interpreter: handlers that actually perform a job's work.
//!
//! The scheduler treats a job's payload as opaque. It resolves a handler by
//! `handler_type`, hands it a [`JobContext`] and interprets the
//! [`HandlerOutcome`]:
//!
//! - `Success`: the job record is deleted.
//! - `BusinessFailure`: the work ran and failed; the failure policy decides
//!   between retry and incident.
//! - `InfrastructureFailure`: the outcome could not be recorded; the job
//!   stays locked until its lock expires and does not consume a retry.

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde_json::Value as JsonValue;

use jobline_core::JobId;

use super::retry::RetryStrategy;
use super::types::Job;

/// Failure reported by a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JobFailure {
    pub message: String,
    pub detail: Option<String>,
}

impl JobFailure {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            detail: None,
        }
    }

    pub fn with_detail(mut self, detail: impl Into<String>) -> Self {
        self.detail = Some(detail.into());
        self
    }
}

impl core::fmt::Display for JobFailure {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.message)
    }
}

impl<E: std::error::Error> From<E> for JobFailure {
    fn from(err: E) -> Self {
        let mut detail = Vec::new();
        let mut source = err.source();
        while let Some(cause) = source {
            detail.push(cause.to_string());
            source = cause.source();
        }
        Self {
            message: err.to_string(),
            detail: (!detail.is_empty()).then(|| detail.join("\ncaused by: ")),
        }
    }
}

/// Result of running a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HandlerOutcome {
    Success,
    BusinessFailure(JobFailure),
    InfrastructureFailure(JobFailure),
}

impl HandlerOutcome {
    pub fn business(message: impl Into<String>) -> Self {
        Self::BusinessFailure(JobFailure::new(message))
    }

    pub fn infrastructure(message: impl Into<String>) -> Self {
        Self::InfrastructureFailure(JobFailure::new(message))
    }
}

/// Read-only view handed to a handler.
#[derive(Debug, Clone, Copy)]
pub struct JobContext<'a> {
    job: &'a Job,
    started_at: DateTime<Utc>,
}

impl<'a> JobContext<'a> {
    pub fn new(job: &'a Job, started_at: DateTime<Utc>) -> Self {
        Self { job, started_at }
    }

    pub fn job(&self) -> &'a Job {
        self.job
    }

    pub fn job_id(&self) -> JobId {
        self.job.id
    }

    pub fn configuration(&self) -> &'a JsonValue {
        &self.job.handler_configuration
    }

    /// Failures recorded before this attempt.
    pub fn previous_failures(&self) -> u32 {
        self.job.failure_count
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }
}

/// Executes jobs of one `handler_type`.
pub trait JobHandler: Send + Sync {
    fn handler_type(&self) -> &str;

    fn execute(&self, ctx: &JobContext<'_>) -> HandlerOutcome;

    /// Custom retry policy for `job`; `None` falls back to the job's
    /// `retryCycle` configuration, then to the engine default.
    fn retry_strategy(&self, _job: &Job) -> Option<Arc<dyn RetryStrategy>> {
        None
    }
}

/// Closure-backed handler.
pub struct FnHandler<F> {
    handler_type: String,
    f: F,
}

impl<F> FnHandler<F>
where
    F: Fn(&JobContext<'_>) -> HandlerOutcome + Send + Sync,
{
    pub fn new(handler_type: impl Into<String>, f: F) -> Self {
        Self {
            handler_type: handler_type.into(),
            f,
        }
    }
}

impl<F> JobHandler for FnHandler<F>
where
    F: Fn(&JobContext<'_>) -> HandlerOutcome + Send + Sync,
{
    fn handler_type(&self) -> &str {
        &self.handler_type
    }

    fn execute(&self, ctx: &JobContext<'_>) -> HandlerOutcome {
        (self.f)(ctx)
    }
}

/// Handlers keyed by `handler_type`.
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<String, Arc<dyn JobHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler; a later registration for the same type replaces
    /// the earlier one.
    pub fn register<H>(&mut self, handler: H) -> &mut Self
    where
        H: JobHandler + 'static,
    {
        self.handlers
            .insert(handler.handler_type().to_string(), Arc::new(handler));
        self
    }

    /// Register a closure as the handler for `handler_type`.
    pub fn register_fn<F>(&mut self, handler_type: impl Into<String>, f: F) -> &mut Self
    where
        F: Fn(&JobContext<'_>) -> HandlerOutcome + Send + Sync + 'static,
    {
        self.register(FnHandler::new(handler_type, f))
    }

    pub fn get(&self, handler_type: &str) -> Option<Arc<dyn JobHandler>> {
        self.handlers.get(handler_type).cloned()
    }

    pub fn handler_types(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl core::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let mut types: Vec<_> = self.handler_types().collect();
        types.sort_unstable();
        f.debug_struct("HandlerRegistry")
            .field("handler_types", &types)
            .finish()
    }
}

//! Retry strategies and retry-cycle parsing.
//!
//! A failed job either consumes part of its retry budget and is rescheduled,
//! or exhausts it and raises an incident (see [`super::failure`]). How far the
//! budget moves and how long the job waits is decided by a [`RetryStrategy`]:
//!
//! - [`FlatRetry`]: the engine default, one retry per failure at a fixed
//!   interval.
//! - [`RetryCycle`]: handler policy data carried in the job's configuration
//!   under `"retryCycle"`, either an ISO-8601 repeating interval (`R3/PT10M`,
//!   three executions in total) or a comma-separated list of durations
//!   (`PT1M,PT5M,PT10M`, one execution plus one retry per interval).
//!
//! Handlers can supply any other strategy through
//! [`JobHandler::retry_strategy`](super::handler::JobHandler::retry_strategy).

use chrono::Duration;
use serde_json::Value as JsonValue;
use thiserror::Error;

use super::types::Job;

/// Configuration key holding a job's retry cycle.
pub const RETRY_CYCLE_KEY: &str = "retryCycle";

/// How one failure affects a job's retry budget.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPlan {
    /// Retries consumed by this failure (at least 1 is applied).
    pub decrement: u32,
    /// Delay before the job becomes due again.
    pub delay: Duration,
}

/// Pluggable retry policy.
pub trait RetryStrategy: Send + Sync + core::fmt::Debug {
    /// Plan the retry for `job`, which has just failed.
    ///
    /// `job.failure_count` does not yet include the current failure.
    fn plan(&self, job: &Job) -> RetryPlan;
}

/// Fixed interval, one retry per failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlatRetry {
    pub interval: Duration,
}

impl FlatRetry {
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    pub fn immediate() -> Self {
        Self::new(Duration::zero())
    }
}

impl RetryStrategy for FlatRetry {
    fn plan(&self, _job: &Job) -> RetryPlan {
        RetryPlan {
            decrement: 1,
            delay: self.interval,
        }
    }
}

/// Retry-cycle parse failure.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RetryCycleError {
    #[error("retry cycle is empty")]
    Empty,
    #[error("retry cycle must be a string, got {0}")]
    NotAString(String),
    #[error("invalid repetition count in '{0}'")]
    InvalidRepetitions(String),
    #[error("invalid duration '{0}'")]
    InvalidDuration(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum CycleShape {
    Repeating { repetitions: u32, interval: Duration },
    Sequence(Vec<Duration>),
}

/// Handler-defined retry schedule.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryCycle {
    shape: CycleShape,
}

impl RetryCycle {
    /// `n` retries spaced `interval` apart.
    pub fn repeating(repetitions: u32, interval: Duration) -> Self {
        Self {
            shape: CycleShape::Repeating {
                repetitions,
                interval,
            },
        }
    }

    /// One retry per interval; the k-th failure waits the k-th interval.
    ///
    /// Intervals are picked by the retries left after a failure, so a job
    /// whose retries were raised by an operator repeats the first interval
    /// until it is back within the list.
    pub fn sequence(intervals: Vec<Duration>) -> Result<Self, RetryCycleError> {
        if intervals.is_empty() {
            return Err(RetryCycleError::Empty);
        }
        Ok(Self {
            shape: CycleShape::Sequence(intervals),
        })
    }

    /// Parse `R<n>/<duration>` or `<duration>[,<duration>...]`.
    pub fn parse(input: &str) -> Result<Self, RetryCycleError> {
        let input = input.trim();
        if input.is_empty() {
            return Err(RetryCycleError::Empty);
        }

        if let Some(rest) = input.strip_prefix('R') {
            let (count, duration) = rest
                .split_once('/')
                .ok_or_else(|| RetryCycleError::InvalidRepetitions(input.to_string()))?;
            let repetitions: u32 = count
                .trim()
                .parse()
                .map_err(|_| RetryCycleError::InvalidRepetitions(input.to_string()))?;
            let interval = parse_iso_duration(duration.trim())?;
            return Ok(Self::repeating(repetitions, interval));
        }

        let intervals = input
            .split(',')
            .map(|part| parse_iso_duration(part.trim()))
            .collect::<Result<Vec<_>, _>>()?;
        Self::sequence(intervals)
    }

    /// Read the cycle from a handler configuration, if one is present.
    pub fn from_configuration(configuration: &JsonValue) -> Option<Result<Self, RetryCycleError>> {
        let value = configuration.get(RETRY_CYCLE_KEY)?;
        Some(match value {
            JsonValue::String(s) => Self::parse(s),
            other => Err(RetryCycleError::NotAString(other.to_string())),
        })
    }

    /// Initial retry budget described by the cycle.
    pub fn retries(&self) -> u32 {
        match &self.shape {
            CycleShape::Repeating { repetitions, .. } => *repetitions,
            CycleShape::Sequence(intervals) => u32::try_from(intervals.len())
                .unwrap_or(u32::MAX)
                .saturating_add(1),
        }
    }

    /// Wait applied by a failure that leaves `remaining` retries.
    ///
    /// For a list of `n` intervals this is interval `n - remaining`, clamped
    /// to the list: budgets above `n` use the first interval and the final
    /// failure uses the last.
    pub fn interval_for_remaining(&self, remaining: u32) -> Duration {
        match &self.shape {
            CycleShape::Repeating { interval, .. } => *interval,
            CycleShape::Sequence(intervals) => {
                let remaining = usize::try_from(remaining).unwrap_or(usize::MAX);
                let idx = intervals
                    .len()
                    .saturating_sub(remaining)
                    .min(intervals.len() - 1);
                intervals[idx]
            }
        }
    }
}

impl RetryStrategy for RetryCycle {
    fn plan(&self, job: &Job) -> RetryPlan {
        RetryPlan {
            decrement: 1,
            delay: self.interval_for_remaining(job.retries_left.saturating_sub(1)),
        }
    }
}

/// Parse the `P[nD][T[nH][nM][n[.n]S]]` subset of ISO-8601 durations.
pub fn parse_iso_duration(input: &str) -> Result<Duration, RetryCycleError> {
    let invalid = || RetryCycleError::InvalidDuration(input.to_string());

    let body = input
        .strip_prefix('P')
        .or_else(|| input.strip_prefix('p'))
        .ok_or_else(invalid)?;
    if body.is_empty() {
        return Err(invalid());
    }

    let (date_part, time_part) = match body.split_once(['T', 't']) {
        Some((date, time)) => {
            if time.is_empty() {
                return Err(invalid());
            }
            (date, Some(time))
        }
        None => (body, None),
    };

    let mut total_ms: i64 = 0;
    let mut seen_component = false;

    for (value, unit) in components(date_part).ok_or_else(invalid)? {
        let days: i64 = value.parse().map_err(|_| invalid())?;
        let factor = match unit {
            'D' | 'd' => 86_400_000,
            'W' | 'w' => 7 * 86_400_000,
            _ => return Err(invalid()),
        };
        total_ms = days
            .checked_mul(factor)
            .and_then(|ms| total_ms.checked_add(ms))
            .ok_or_else(invalid)?;
        seen_component = true;
    }

    if let Some(time) = time_part {
        for (value, unit) in components(time).ok_or_else(invalid)? {
            let ms = match unit {
                'H' | 'h' => value.parse::<i64>().ok().and_then(|h| h.checked_mul(3_600_000)),
                'M' | 'm' => value.parse::<i64>().ok().and_then(|m| m.checked_mul(60_000)),
                'S' | 's' => value
                    .parse::<f64>()
                    .ok()
                    .filter(|s| s.is_finite() && *s >= 0.0)
                    .map(|s| (s * 1000.0).round() as i64),
                _ => None,
            }
            .ok_or_else(invalid)?;
            total_ms = total_ms.checked_add(ms).ok_or_else(invalid)?;
            seen_component = true;
        }
    }

    if !seen_component {
        return Err(invalid());
    }
    Duration::try_milliseconds(total_ms).ok_or_else(invalid)
}

/// Split `10H5M` into `[("10", 'H'), ("5", 'M')]`.
fn components(part: &str) -> Option<Vec<(&str, char)>> {
    let mut out = Vec::new();
    let mut start = 0;
    for (idx, ch) in part.char_indices() {
        if ch.is_ascii_alphabetic() {
            let value = &part[start..idx];
            if value.is_empty() || value.starts_with('-') {
                return None;
            }
            out.push((value, ch));
            start = idx + ch.len_utf8();
        }
    }
    if start != part.len() {
        return None;
    }
    Some(out)
}

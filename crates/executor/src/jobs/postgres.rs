//! Postgres-backed job store.
//!
//! ## Conditional writes
//!
//! Every versioned write is a single `UPDATE ... WHERE id = $1 AND version = $2`
//! (or `DELETE`). Postgres row locking makes that statement atomic, so of two
//! nodes racing on the same row exactly one sees a row come back. A write that
//! touches no row is classified by a follow-up existence check:
//!
//! | Row exists | Error |
//! |------------|-------|
//! | yes | `Conflict` (version moved, or the lock belongs to someone else) |
//! | no | `NotFound` |
//!
//! A failure and its incident are written in one transaction.
//!
//! ## Error mapping
//!
//! | SQLx error | Code | JobStoreError |
//! |------------|------|---------------|
//! | Database (unique violation) | `23505` | `AlreadyExists` on insert, `Storage` elsewhere |
//! | Database (other) | any | `Storage` |
//! | PoolClosed, IO, other | N/A | `Storage` |
//!
//! ## Runtime bridge
//!
//! [`JobStore`] is synchronous; sqlx is async. The store captures a tokio
//! [`Handle`] at construction and blocks on it. Call it from plain threads
//! (executor workers, the acquisition thread) or `spawn_blocking`, never from
//! inside an async task.

use std::future::Future;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};
use tokio::runtime::Handle;
use tracing::instrument;

use jobline_core::{ExecutionContextId, IncidentId, JobId, LockOwner};

use super::store::{FailureUpdate, JobStore, JobStoreError};
use super::types::{Incident, Job, JobLock, JobStats};

const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS jobline_jobs (
        id UUID PRIMARY KEY,
        handler_type TEXT NOT NULL,
        handler_configuration JSONB NOT NULL,
        due_date TIMESTAMPTZ NOT NULL,
        priority BIGINT NOT NULL DEFAULT 0,
        exclusive BOOLEAN NOT NULL DEFAULT FALSE,
        execution_context_id TEXT NULL,
        lock_owner TEXT NULL,
        lock_expires_at TIMESTAMPTZ NULL,
        retries_left INTEGER NOT NULL CHECK (retries_left >= 0),
        failure_count INTEGER NOT NULL DEFAULT 0,
        suspended BOOLEAN NOT NULL DEFAULT FALSE,
        last_failure_message TEXT NULL,
        last_failure_detail TEXT NULL,
        created_at TIMESTAMPTZ NOT NULL,
        version BIGINT NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS jobline_jobs_acquisition_idx
        ON jobline_jobs (priority DESC, due_date ASC)
        WHERE suspended = FALSE AND retries_left > 0
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS jobline_jobs_context_idx
        ON jobline_jobs (execution_context_id)
        WHERE exclusive = TRUE
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS jobline_incidents (
        id UUID PRIMARY KEY,
        job_id UUID NOT NULL REFERENCES jobline_jobs (id) ON DELETE CASCADE,
        execution_context_id TEXT NULL,
        handler_type TEXT NOT NULL,
        message TEXT NOT NULL,
        created_at TIMESTAMPTZ NOT NULL
    )
    "#,
];

const JOB_COLUMNS: &str = "id, handler_type, handler_configuration, due_date, priority, exclusive, \
     execution_context_id, lock_owner, lock_expires_at, retries_left, failure_count, suspended, \
     last_failure_message, last_failure_detail, created_at, version";

/// Job store backed by PostgreSQL.
///
/// Shareable across threads; all connections come from the SQLx pool.
#[derive(Debug, Clone)]
pub struct PostgresJobStore {
    pool: Arc<PgPool>,
    runtime: Handle,
}

impl PostgresJobStore {
    pub fn new(pool: PgPool, runtime: Handle) -> Self {
        Self {
            pool: Arc::new(pool),
            runtime,
        }
    }

    /// Create the job and incident tables if they do not exist.
    #[instrument(skip(self), err)]
    pub async fn ensure_schema(&self) -> Result<(), JobStoreError> {
        for statement in SCHEMA {
            sqlx::query(statement)
                .execute(&*self.pool)
                .await
                .map_err(|e| map_sqlx_error("ensure_schema", e))?;
        }
        Ok(())
    }

    fn block_on<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    #[instrument(skip(self, job), fields(job_id = %job.id), err)]
    async fn insert_job(&self, job: Job) -> Result<Job, JobStoreError> {
        let (lock_owner, lock_expires_at) = lock_columns(&job);
        sqlx::query(&format!(
            "INSERT INTO jobline_jobs ({JOB_COLUMNS}) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15, $16)"
        ))
        .bind(job.id.as_uuid())
        .bind(&job.handler_type)
        .bind(&job.handler_configuration)
        .bind(job.due_date)
        .bind(job.priority)
        .bind(job.exclusive)
        .bind(job.execution_context_id.as_ref().map(ExecutionContextId::as_str))
        .bind(lock_owner)
        .bind(lock_expires_at)
        .bind(column::<i32, _>("retries_left", job.retries_left)?)
        .bind(column::<i32, _>("failure_count", job.failure_count)?)
        .bind(job.suspended)
        .bind(job.last_failure_message.as_deref())
        .bind(job.last_failure_detail.as_deref())
        .bind(job.created_at)
        .bind(column::<i64, _>("version", job.version)?)
        .execute(&*self.pool)
        .await
        .map_err(|e| {
            if is_unique_violation(&e) {
                JobStoreError::AlreadyExists(job.id)
            } else {
                map_sqlx_error("insert_job", e)
            }
        })?;

        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn load_job(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobline_jobs WHERE id = $1"))
            .bind(job_id.as_uuid())
            .fetch_optional(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("load_job", e))?;

        row.as_ref().map(job_from_row).transpose()
    }

    #[instrument(skip(self), err)]
    async fn acquirable_jobs(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        let rows = sqlx::query(&format!(
            r#"
            SELECT {JOB_COLUMNS}
            FROM jobline_jobs j
            WHERE j.suspended = FALSE
                AND j.retries_left > 0
                AND j.due_date <= $1
                AND (j.lock_expires_at IS NULL OR j.lock_expires_at <= $1)
                AND (
                    j.exclusive = FALSE
                    OR j.execution_context_id IS NULL
                    OR NOT EXISTS (
                        SELECT 1 FROM jobline_jobs o
                        WHERE o.exclusive = TRUE
                            AND o.execution_context_id = j.execution_context_id
                            AND o.lock_expires_at > $1
                    )
                )
            ORDER BY j.priority DESC, j.due_date ASC, j.id ASC
            LIMIT $2
            "#
        ))
        .bind(now)
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("acquirable_jobs", e))?;

        rows.iter().map(job_from_row).collect()
    }

    #[instrument(skip(self), fields(execution_context_id = %context), err)]
    async fn exclusive_lock_held(
        &self,
        context: &ExecutionContextId,
        except: JobId,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        sqlx::query_scalar::<_, bool>(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM jobline_jobs
                WHERE exclusive = TRUE
                    AND execution_context_id = $1
                    AND id <> $2
                    AND lock_expires_at > $3
            )
            "#,
        )
        .bind(context.as_str())
        .bind(except.as_uuid())
        .bind(now)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("exclusive_lock_held", e))
    }

    #[instrument(skip(self, owner), fields(job_id = %job_id, lock_owner = %owner), err)]
    async fn lock_job(
        &self,
        job_id: JobId,
        expected_version: u64,
        owner: &LockOwner,
        expires_at: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        let row = sqlx::query(&format!(
            "UPDATE jobline_jobs \
             SET lock_owner = $3, lock_expires_at = $4, version = version + 1 \
             WHERE id = $1 AND version = $2 \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(job_id.as_uuid())
        .bind(column::<i64, _>("version", expected_version)?)
        .bind(owner.as_str())
        .bind(expires_at)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("lock_job", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(self.missed_write(job_id, "version changed before lock").await),
        }
    }

    #[instrument(skip(self, owner), fields(job_id = %job_id, lock_owner = %owner), err)]
    async fn unlock_job(
        &self,
        job_id: JobId,
        expected_version: u64,
        owner: &LockOwner,
    ) -> Result<Job, JobStoreError> {
        let row = sqlx::query(&format!(
            "UPDATE jobline_jobs \
             SET lock_owner = NULL, lock_expires_at = NULL, version = version + 1 \
             WHERE id = $1 AND version = $2 AND lock_owner = $3 \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(job_id.as_uuid())
        .bind(column::<i64, _>("version", expected_version)?)
        .bind(owner.as_str())
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("unlock_job", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(self.missed_write(job_id, "version or lock owner changed").await),
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn complete_job(&self, job_id: JobId, expected_version: u64) -> Result<(), JobStoreError> {
        let result = sqlx::query("DELETE FROM jobline_jobs WHERE id = $1 AND version = $2")
            .bind(job_id.as_uuid())
            .bind(column::<i64, _>("version", expected_version)?)
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("complete_job", e))?;

        if result.rows_affected() == 0 {
            return Err(self.missed_write(job_id, "version changed during execution").await);
        }
        Ok(())
    }

    #[instrument(
        skip(self, update),
        fields(job_id = %update.job_id, retries_left = update.retries_left),
        err
    )]
    async fn fail_job(&self, update: FailureUpdate) -> Result<Job, JobStoreError> {
        if (update.retries_left == 0) != update.incident.is_some() {
            return Err(JobStoreError::invalid_state(
                update.job_id,
                "an incident must accompany exactly the exhausting failure",
            ));
        }

        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(&format!(
            "UPDATE jobline_jobs \
             SET retries_left = $3, due_date = $4, last_failure_message = $5, \
                 last_failure_detail = $6, failure_count = failure_count + 1, \
                 lock_owner = NULL, lock_expires_at = NULL, version = version + 1 \
             WHERE id = $1 AND version = $2 \
             RETURNING {JOB_COLUMNS}"
        ))
        .bind(update.job_id.as_uuid())
        .bind(column::<i64, _>("version", update.expected_version)?)
        .bind(column::<i32, _>("retries_left", update.retries_left)?)
        .bind(update.due_date)
        .bind(&update.message)
        .bind(update.detail.as_deref())
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("fail_job", e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(self.missed_write(update.job_id, "version changed before failure").await);
        };
        let job = job_from_row(&row)?;

        if let Some(incident) = &update.incident {
            sqlx::query(
                r#"
                INSERT INTO jobline_incidents (
                    id, job_id, execution_context_id, handler_type, message, created_at
                )
                VALUES ($1, $2, $3, $4, $5, $6)
                "#,
            )
            .bind(incident.id.as_uuid())
            .bind(incident.job_id.as_uuid())
            .bind(incident.execution_context_id.as_ref().map(ExecutionContextId::as_str))
            .bind(&incident.handler_type)
            .bind(&incident.message)
            .bind(incident.created_at)
            .execute(&mut *tx)
            .await
            .map_err(|e| map_sqlx_error("insert_incident", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn update_retries(&self, job_id: JobId, retries: u32) -> Result<Job, JobStoreError> {
        let mut tx = self
            .pool
            .begin()
            .await
            .map_err(|e| map_sqlx_error("begin_transaction", e))?;

        let row = sqlx::query(&format!(
            "UPDATE jobline_jobs SET retries_left = $2, version = version + 1 \
             WHERE id = $1 RETURNING {JOB_COLUMNS}"
        ))
        .bind(job_id.as_uuid())
        .bind(column::<i32, _>("retries_left", retries)?)
        .fetch_optional(&mut *tx)
        .await
        .map_err(|e| map_sqlx_error("update_retries", e))?;

        let Some(row) = row else {
            tx.rollback()
                .await
                .map_err(|e| map_sqlx_error("rollback", e))?;
            return Err(JobStoreError::NotFound(job_id));
        };
        let job = job_from_row(&row)?;

        if retries > 0 {
            sqlx::query("DELETE FROM jobline_incidents WHERE job_id = $1")
                .bind(job_id.as_uuid())
                .execute(&mut *tx)
                .await
                .map_err(|e| map_sqlx_error("resolve_incidents", e))?;
        }

        tx.commit()
            .await
            .map_err(|e| map_sqlx_error("commit_transaction", e))?;
        Ok(job)
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn update_suspended(&self, job_id: JobId, suspended: bool) -> Result<Job, JobStoreError> {
        let row = sqlx::query(&format!(
            "UPDATE jobline_jobs SET suspended = $2, version = version + 1 \
             WHERE id = $1 RETURNING {JOB_COLUMNS}"
        ))
        .bind(job_id.as_uuid())
        .bind(suspended)
        .fetch_optional(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("update_suspended", e))?;

        match row {
            Some(row) => job_from_row(&row),
            None => Err(JobStoreError::NotFound(job_id)),
        }
    }

    #[instrument(skip(self), fields(job_id = %job_id), err)]
    async fn delete_job(&self, job_id: JobId) -> Result<(), JobStoreError> {
        let result = sqlx::query("DELETE FROM jobline_jobs WHERE id = $1")
            .bind(job_id.as_uuid())
            .execute(&*self.pool)
            .await
            .map_err(|e| map_sqlx_error("delete_job", e))?;

        if result.rows_affected() == 0 {
            return Err(JobStoreError::NotFound(job_id));
        }
        Ok(())
    }

    #[instrument(skip(self), err)]
    async fn load_incidents(&self, limit: usize) -> Result<Vec<Incident>, JobStoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, job_id, execution_context_id, handler_type, message, created_at
            FROM jobline_incidents
            ORDER BY created_at ASC, id ASC
            LIMIT $1
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("load_incidents", e))?;

        rows.iter().map(incident_from_row).collect()
    }

    #[instrument(skip(self), err)]
    async fn job_stats(&self, now: DateTime<Utc>) -> Result<JobStats, JobStoreError> {
        let row = sqlx::query(
            r#"
            SELECT
                COUNT(*) FILTER (WHERE retries_left = 0) AS exhausted,
                COUNT(*) FILTER (WHERE retries_left > 0 AND suspended) AS suspended,
                COUNT(*) FILTER (
                    WHERE retries_left > 0 AND NOT suspended AND lock_expires_at > $1
                ) AS locked,
                COUNT(*) FILTER (
                    WHERE retries_left > 0 AND NOT suspended
                        AND (lock_expires_at IS NULL OR lock_expires_at <= $1)
                        AND due_date > $1
                ) AS scheduled,
                COUNT(*) FILTER (
                    WHERE retries_left > 0 AND NOT suspended
                        AND (lock_expires_at IS NULL OR lock_expires_at <= $1)
                        AND due_date <= $1
                ) AS acquirable,
                (SELECT COUNT(*) FROM jobline_incidents) AS open_incidents
            FROM jobline_jobs
            "#,
        )
        .bind(now)
        .fetch_one(&*self.pool)
        .await
        .map_err(|e| map_sqlx_error("job_stats", e))?;

        let count = |column: &str| -> Result<usize, JobStoreError> {
            row.try_get::<i64, _>(column)
                .map(|n| usize::try_from(n).unwrap_or(0))
                .map_err(|e| JobStoreError::Storage(format!("failed to read {column}: {e}")))
        };

        Ok(JobStats {
            acquirable: count("acquirable")?,
            locked: count("locked")?,
            scheduled: count("scheduled")?,
            suspended: count("suspended")?,
            exhausted: count("exhausted")?,
            open_incidents: count("open_incidents")?,
        })
    }

    /// Classify a conditional write that matched no row.
    async fn missed_write(&self, job_id: JobId, reason: &str) -> JobStoreError {
        let exists = sqlx::query("SELECT EXISTS (SELECT 1 FROM jobline_jobs WHERE id = $1) AS present")
            .bind(job_id.as_uuid())
            .fetch_one(&*self.pool)
            .await
            .and_then(|row| row.try_get::<bool, _>("present"));

        match exists {
            Ok(true) => JobStoreError::conflict(job_id, reason),
            Ok(false) => JobStoreError::NotFound(job_id),
            Err(e) => map_sqlx_error("missed_write", e),
        }
    }
}

impl JobStore for PostgresJobStore {
    fn insert(&self, job: Job) -> Result<Job, JobStoreError> {
        self.block_on(self.insert_job(job))
    }

    fn get(&self, job_id: JobId) -> Result<Option<Job>, JobStoreError> {
        self.block_on(self.load_job(job_id))
    }

    fn find_acquirable(&self, now: DateTime<Utc>, limit: usize) -> Result<Vec<Job>, JobStoreError> {
        self.block_on(self.acquirable_jobs(now, limit))
    }

    fn context_locked(
        &self,
        context: &ExecutionContextId,
        except: JobId,
        now: DateTime<Utc>,
    ) -> Result<bool, JobStoreError> {
        self.block_on(self.exclusive_lock_held(context, except, now))
    }

    fn try_lock(
        &self,
        job_id: JobId,
        expected_version: u64,
        owner: &LockOwner,
        expires_at: DateTime<Utc>,
    ) -> Result<Job, JobStoreError> {
        self.block_on(self.lock_job(job_id, expected_version, owner, expires_at))
    }

    fn release_lock(
        &self,
        job_id: JobId,
        expected_version: u64,
        owner: &LockOwner,
    ) -> Result<Job, JobStoreError> {
        self.block_on(self.unlock_job(job_id, expected_version, owner))
    }

    fn complete(&self, job_id: JobId, expected_version: u64) -> Result<(), JobStoreError> {
        self.block_on(self.complete_job(job_id, expected_version))
    }

    fn record_failure(&self, update: FailureUpdate) -> Result<Job, JobStoreError> {
        self.block_on(self.fail_job(update))
    }

    fn set_retries(&self, job_id: JobId, retries: u32) -> Result<Job, JobStoreError> {
        self.block_on(self.update_retries(job_id, retries))
    }

    fn set_suspended(&self, job_id: JobId, suspended: bool) -> Result<Job, JobStoreError> {
        self.block_on(self.update_suspended(job_id, suspended))
    }

    fn delete(&self, job_id: JobId) -> Result<(), JobStoreError> {
        self.block_on(self.delete_job(job_id))
    }

    fn list_incidents(&self, limit: usize) -> Result<Vec<Incident>, JobStoreError> {
        self.block_on(self.load_incidents(limit))
    }

    fn stats(&self, now: DateTime<Utc>) -> Result<JobStats, JobStoreError> {
        self.block_on(self.job_stats(now))
    }
}

fn lock_columns(job: &Job) -> (Option<&str>, Option<DateTime<Utc>>) {
    match &job.lock {
        Some(lock) => (Some(lock.owner.as_str()), Some(lock.expires_at)),
        None => (None, None),
    }
}

// SQLx row types

#[derive(Debug)]
struct JobRow {
    id: uuid::Uuid,
    handler_type: String,
    handler_configuration: serde_json::Value,
    due_date: DateTime<Utc>,
    priority: i64,
    exclusive: bool,
    execution_context_id: Option<String>,
    lock_owner: Option<String>,
    lock_expires_at: Option<DateTime<Utc>>,
    retries_left: i32,
    failure_count: i32,
    suspended: bool,
    last_failure_message: Option<String>,
    last_failure_detail: Option<String>,
    created_at: DateTime<Utc>,
    version: i64,
}

impl<'r> sqlx::FromRow<'r, PgRow> for JobRow {
    fn from_row(row: &'r PgRow) -> Result<Self, sqlx::Error> {
        Ok(JobRow {
            id: row.try_get("id")?,
            handler_type: row.try_get("handler_type")?,
            handler_configuration: row.try_get("handler_configuration")?,
            due_date: row.try_get("due_date")?,
            priority: row.try_get("priority")?,
            exclusive: row.try_get("exclusive")?,
            execution_context_id: row.try_get("execution_context_id")?,
            lock_owner: row.try_get("lock_owner")?,
            lock_expires_at: row.try_get("lock_expires_at")?,
            retries_left: row.try_get("retries_left")?,
            failure_count: row.try_get("failure_count")?,
            suspended: row.try_get("suspended")?,
            last_failure_message: row.try_get("last_failure_message")?,
            last_failure_detail: row.try_get("last_failure_detail")?,
            created_at: row.try_get("created_at")?,
            version: row.try_get("version")?,
        })
    }
}

impl TryFrom<JobRow> for Job {
    type Error = JobStoreError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        let id = JobId::from_uuid(row.id);
        let corrupt = |column: &str| JobStoreError::Storage(format!("job {id}: invalid {column}"));

        let execution_context_id = row
            .execution_context_id
            .map(ExecutionContextId::new)
            .transpose()
            .map_err(|_| corrupt("execution_context_id"))?;
        let lock = match (row.lock_owner, row.lock_expires_at) {
            (Some(owner), Some(expires_at)) => Some(JobLock::new(
                LockOwner::new(owner).map_err(|_| corrupt("lock_owner"))?,
                expires_at,
            )),
            _ => None,
        };

        Ok(Job {
            id,
            handler_type: row.handler_type,
            handler_configuration: row.handler_configuration,
            due_date: row.due_date,
            priority: row.priority,
            exclusive: row.exclusive,
            execution_context_id,
            lock,
            retries_left: u32::try_from(row.retries_left).map_err(|_| corrupt("retries_left"))?,
            failure_count: u32::try_from(row.failure_count).map_err(|_| corrupt("failure_count"))?,
            suspended: row.suspended,
            last_failure_message: row.last_failure_message,
            last_failure_detail: row.last_failure_detail,
            created_at: row.created_at,
            version: u64::try_from(row.version).map_err(|_| corrupt("version"))?,
        })
    }
}

fn job_from_row(row: &PgRow) -> Result<Job, JobStoreError> {
    use sqlx::FromRow;
    let job_row = JobRow::from_row(row)
        .map_err(|e| JobStoreError::Storage(format!("failed to deserialize job row: {e}")))?;
    Job::try_from(job_row)
}

fn incident_from_row(row: &PgRow) -> Result<Incident, JobStoreError> {
    let read = |e: sqlx::Error| JobStoreError::Storage(format!("failed to deserialize incident row: {e}"));
    let execution_context_id: Option<String> = row.try_get("execution_context_id").map_err(read)?;

    Ok(Incident {
        id: IncidentId::from_uuid(row.try_get("id").map_err(read)?),
        job_id: JobId::from_uuid(row.try_get("job_id").map_err(read)?),
        execution_context_id: execution_context_id
            .map(ExecutionContextId::new)
            .transpose()
            .map_err(|e| JobStoreError::Storage(format!("invalid incident context: {e}")))?,
        handler_type: row.try_get("handler_type").map_err(read)?,
        message: row.try_get("message").map_err(read)?,
        created_at: row.try_get("created_at").map_err(read)?,
    })
}

/// Map SQLx errors to JobStoreError.
/// Convert a value for a signed database column, refusing values that do not fit.
fn column<T, V>(name: &str, value: V) -> Result<T, JobStoreError>
where
    T: TryFrom<V>,
    V: Copy + core::fmt::Display,
{
    T::try_from(value)
        .map_err(|_| JobStoreError::Storage(format!("{name} value {value} does not fit its column")))
}

fn map_sqlx_error(operation: &str, err: sqlx::Error) -> JobStoreError {
    match err {
        sqlx::Error::Database(db_err) => {
            let code = db_err.code().map(|c| c.to_string()).unwrap_or_default();
            JobStoreError::Storage(format!(
                "database error in {operation} ({code}): {}",
                db_err.message()
            ))
        }
        sqlx::Error::PoolClosed => {
            JobStoreError::Storage(format!("connection pool closed in {operation}"))
        }
        _ => JobStoreError::Storage(format!("sqlx error in {operation}: {err}")),
    }
}

/// Check if an error is a unique constraint violation.
fn is_unique_violation(err: &sqlx::Error) -> bool {
    if let sqlx::Error::Database(db_err) = err {
        if let Some(code) = db_err.code() {
            return code.as_ref() == "23505";
        }
    }
    false
}

use std::sync::Arc;

use anyhow::Context;
use serde_json::json;
use sqlx::PgPool;
use tokio::runtime::Handle;

use jobline_core::SystemClock;
use jobline_executor::jobs::JobContext;
use jobline_executor::{
    ExecutorConfig, HandlerOutcome, HandlerRegistry, InMemoryJobStore, JobExecutor, JobStore,
    NewJob, PostgresJobStore,
};

/// Number of `log` jobs to schedule at startup (smoke testing a node).
const SEED_JOBS_ENV: &str = "JOBLINE_SEED_JOBS";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    jobline_observability::init();

    let config = ExecutorConfig::from_env().context("invalid executor configuration")?;
    let registry = builtin_handlers();

    match std::env::var("DATABASE_URL") {
        Ok(database_url) => {
            let pool = PgPool::connect(&database_url)
                .await
                .context("failed to connect to Postgres")?;
            let store = PostgresJobStore::new(pool, Handle::current());
            store
                .ensure_schema()
                .await
                .context("failed to create job tables")?;
            run(Arc::new(store), registry, config).await
        }
        Err(_) => {
            tracing::warn!("DATABASE_URL not set; using in-memory job store, jobs are lost on exit");
            run(InMemoryJobStore::arc(), registry, config).await
        }
    }
}

async fn run<S>(store: Arc<S>, registry: HandlerRegistry, config: ExecutorConfig) -> anyhow::Result<()>
where
    S: JobStore + 'static,
{
    let shutdown_timeout = config.shutdown_timeout;
    let executor = Arc::new(JobExecutor::new(store, registry, config, SystemClock::shared()));
    executor.start()?;

    let seed = std::env::var(SEED_JOBS_ENV)
        .ok()
        .map(|raw| raw.parse::<usize>().with_context(|| format!("invalid {SEED_JOBS_ENV}: {raw:?}")))
        .transpose()?
        .unwrap_or(0);
    if seed > 0 {
        let seeding = executor.clone();
        tokio::task::spawn_blocking(move || -> anyhow::Result<()> {
            for n in 0..seed {
                seeding.schedule(NewJob::new("log").with_configuration(json!({ "seq": n })))?;
            }
            Ok(())
        })
        .await
        .context("seeding task failed")??;
        tracing::info!(jobs = seed, "seed jobs scheduled");
    }

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for ctrl-c")?;
    tracing::info!("shutdown requested");

    let report = tokio::task::spawn_blocking(move || executor.shutdown(shutdown_timeout))
        .await
        .context("shutdown task failed")?;

    tracing::info!(
        drained = report.drained(),
        abandoned = report.abandoned(),
        elapsed_ms = report.elapsed.as_millis() as u64,
        "node stopped"
    );
    Ok(())
}

fn builtin_handlers() -> HandlerRegistry {
    let mut registry = HandlerRegistry::new();
    registry
        .register_fn("noop", |_| HandlerOutcome::Success)
        .register_fn("log", |ctx: &JobContext<'_>| {
            tracing::info!(
                job_id = %ctx.job_id(),
                configuration = %ctx.configuration(),
                previous_failures = ctx.previous_failures(),
                "log job executed"
            );
            HandlerOutcome::Success
        });
    registry
}

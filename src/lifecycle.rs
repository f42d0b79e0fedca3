use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use sqlx::PgPool;
use tracing::{debug, error, info, warn};

use crate::config::HandlerConfig;
use crate::error::{JobError, QueueError};
use crate::repository::{lock_pending, move_to_dead, update_result};
use crate::scheduler::FutureJobs;
use crate::types::Job;

/// Everything a handler needs to know about the job it was invoked for.
/// Deliberately does not expose the underlying transaction: the handler's
/// contract is "return success or an error", and side effects outside the
/// job's own status update are the handler's responsibility to make
/// idempotent (see the commit-after-success note in the design).
pub struct JobContext<'a> {
    pub job: &'a Job,
}

impl JobContext<'_> {
    pub fn id(&self) -> i64 {
        self.job.id
    }

    pub fn queue(&self) -> &str {
        &self.job.queue
    }

    pub fn payload(&self) -> &serde_json::Value {
        &self.job.payload
    }

    pub fn retries(&self) -> i32 {
        self.job.retries
    }
}

/// Implemented once per queue by the embedder. Kept as a trait object
/// (`Arc<dyn Handler>`) by the worker pool rather than a bare function
/// pointer so stateful handlers (holding a DB pool, an HTTP client, etc.)
/// are as easy to register as stateless ones.
#[async_trait::async_trait]
pub trait Handler: Send + Sync {
    async fn call(&self, ctx: &JobContext<'_>) -> Result<(), JobError>;
}

/// Locks a job, runs its handler (with an optional per-job timeout and
/// deadline check), and applies the resulting state-machine transition, all
/// inside one transaction. Returns without error if another worker already
/// claimed the job (benign race).
pub async fn handle(
    pool: &PgPool,
    id: i64,
    queue: &str,
    handler: &dyn Handler,
    config: &HandlerConfig,
    future_jobs: &Arc<FutureJobs>,
    backoff_base: Duration,
    backoff_cap: Duration,
) -> Result<(), QueueError> {
    let mut tx = pool.begin().await?;

    let Some(job) = lock_pending(&mut tx, id).await? else {
        tx.rollback().await?;
        return Ok(());
    };

    if let Some(deadline) = job.deadline {
        if deadline < Utc::now() {
            warn!(job = id, %queue, "job deadline exceeded before pickup");
            move_to_dead(&mut tx, &job, &JobError::DeadlineExceeded.message()).await?;
            tx.commit().await?;
            return Ok(());
        }
    }

    let ctx = JobContext { job: &job };
    let outcome = run_with_timeout(handler, &ctx, config.job_timeout).await;

    let result = match outcome {
        Ok(()) => {
            info!(job = id, %queue, "job completed");
            Ok(())
        }
        Err(e) => {
            debug!(job = id, %queue, error = %e, "job failed");
            Err(e.message())
        }
    };

    let retries = job.retries;
    let rescheduled =
        update_result(&mut tx, &job, result, crate::types::backoff(retries, backoff_base, backoff_cap))
            .await?;

    tx.commit().await?;

    if let Some(run_after) = rescheduled {
        future_jobs.insert(id, run_after).await;
    }

    Ok(())
}

async fn run_with_timeout(
    handler: &dyn Handler,
    ctx: &JobContext<'_>,
    timeout: Option<Duration>,
) -> Result<(), JobError> {
    match timeout {
        Some(d) => match tokio::time::timeout(d, handler.call(ctx)).await {
            Ok(res) => res,
            Err(_) => {
                error!(job = ctx.id(), "handler exceeded its {:?} timeout", d);
                Err(JobError::Timeout(d))
            }
        },
        None => handler.call(ctx).await,
    }
}

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use sqlx::{Executor, Postgres, Transaction};

use crate::error::QueueError;
use crate::metrics_consts::{JOBS_DEAD_LETTERED, JOBS_ENQUEUED, JOBS_RETRIED, JOB_UPDATE_ATTEMPT};
use crate::types::{DeadJob, Job, JobInit};

/// Deterministic identity of a job for duplicate suppression: a job is a
/// duplicate of another live (non-`processed`) job iff they share a queue
/// and payload.
pub fn fingerprint(queue: &str, payload: &serde_json::Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(queue.as_bytes());
    hasher.update(b"\0");
    hasher.update(payload.to_string().as_bytes());
    hex::encode(hasher.finalize())
}

/// Insert a new job row, committing the caller's transaction is the
/// caller's responsibility. Surfaces a unique-constraint hit on
/// `fingerprint` as `QueueError::DuplicateJob`.
pub async fn insert(
    tx: &mut Transaction<'_, Postgres>,
    init: &JobInit,
) -> Result<i64, QueueError> {
    if init.queue.trim().is_empty() {
        return Err(QueueError::NoQueueSpecified);
    }

    let fp = fingerprint(&init.queue, &init.payload);
    let run_after = init.run_after.unwrap_or_else(Utc::now);

    let result = sqlx::query_scalar!(
        r#"
INSERT INTO jobs (queue, fingerprint, payload, status, retries, max_retries, run_after, deadline)
VALUES ($1, $2, $3, 'new', 0, $4, $5, $6)
RETURNING id
"#,
        init.queue,
        fp,
        init.payload,
        init.max_retries,
        run_after,
        init.deadline,
    )
    .fetch_one(&mut **tx)
    .await;

    match result {
        Ok(id) => {
            metrics::counter!(JOBS_ENQUEUED, "queue" => init.queue.clone()).increment(1);
            Ok(id)
        }
        Err(sqlx::Error::Database(db_err)) if db_err.is_unique_violation() => {
            Err(QueueError::DuplicateJob(fp))
        }
        Err(e) => Err(e.into()),
    }
}

/// Find one eligible job id without holding a transaction open. Used by the
/// worker pool's backlog drain loop; returns `None` when the queue is empty.
pub async fn pick_pending_id<'c, E>(executor: E, queue: &str) -> Result<Option<i64>, QueueError>
where
    E: Executor<'c, Database = Postgres>,
{
    let id = sqlx::query_scalar!(
        r#"
SELECT id FROM jobs
WHERE queue = $1 AND status <> 'processed' AND run_after <= now()
ORDER BY run_after
LIMIT 1
FOR UPDATE SKIP LOCKED
"#,
        queue,
    )
    .fetch_optional(executor)
    .await?;

    Ok(id)
}

/// Lock a specific job row for the duration of handler execution. Returns
/// `None` if another worker already claimed it (benign race, per §7).
pub async fn lock_pending(
    tx: &mut Transaction<'_, Postgres>,
    id: i64,
) -> Result<Option<Job>, QueueError> {
    let job = sqlx::query_as!(
        Job,
        r#"
SELECT id, queue, fingerprint, payload, status, retries, max_retries,
       run_after, ran_at, created_at, deadline, error
FROM jobs
WHERE id = $1 AND status <> 'processed' AND run_after <= now()
FOR UPDATE SKIP LOCKED
"#,
        id,
    )
    .fetch_optional(&mut **tx)
    .await?;

    Ok(job)
}

/// Up to 100 not-yet-due rows for a queue, oldest due time first. Used to
/// seed the in-memory future-job scheduler on startup.
pub async fn list_future<'c, E>(
    executor: E,
    queue: &str,
) -> Result<Vec<(i64, DateTime<Utc>)>, QueueError>
where
    E: Executor<'c, Database = Postgres>,
{
    let rows = sqlx::query!(
        r#"
SELECT id, run_after FROM jobs
WHERE queue = $1 AND status <> 'processed' AND run_after > now()
ORDER BY run_after
LIMIT 100
"#,
        queue,
    )
    .fetch_all(executor)
    .await?;

    Ok(rows.into_iter().map(|r| (r.id, r.run_after)).collect())
}

/// Applies the §4.B update state machine for a job that just finished
/// executing (successfully or not). On terminal retry exhaustion, migrates
/// the row into `dead_jobs` within the same transaction.
///
/// Returns `Some(run_after)` when the job was rescheduled for a future
/// retry (the caller should register it with the future-job scheduler),
/// or `None` otherwise.
pub async fn update_result(
    tx: &mut Transaction<'_, Postgres>,
    job: &Job,
    outcome: Result<(), String>,
    backoff: std::time::Duration,
) -> Result<Option<DateTime<Utc>>, QueueError> {
    metrics::counter!(JOB_UPDATE_ATTEMPT, "queue" => job.queue.clone()).increment(1);

    match outcome {
        Ok(()) => {
            let res = sqlx::query!(
                r#"UPDATE jobs SET status = 'processed', ran_at = now(), error = NULL WHERE id = $1"#,
                job.id,
            )
            .execute(&mut **tx)
            .await?;
            throw_if_no_rows(res.rows_affected(), job.id)?;
            Ok(None)
        }
        Err(message) => {
            if job.retries >= job.max_retries {
                move_to_dead(tx, job, &message).await?;
                Ok(None)
            } else {
                let run_after = Utc::now()
                    + chrono::Duration::from_std(backoff).unwrap_or(chrono::Duration::seconds(1));
                let res = sqlx::query!(
                    r#"
UPDATE jobs SET status = 'failed', ran_at = now(), error = $2,
                retries = retries + 1, run_after = $3
WHERE id = $1
"#,
                    job.id,
                    message,
                    run_after,
                )
                .execute(&mut **tx)
                .await?;
                throw_if_no_rows(res.rows_affected(), job.id)?;
                metrics::counter!(JOBS_RETRIED, "queue" => job.queue.clone()).increment(1);
                Ok(Some(run_after))
            }
        }
    }
}

/// Move a row out of `jobs` and into `dead_jobs`, transactionally. Called
/// both from `update_result` (retries exhausted) and from the lifecycle
/// controller directly (deadline already elapsed at pickup).
pub async fn move_to_dead(
    tx: &mut Transaction<'_, Postgres>,
    job: &Job,
    error: &str,
) -> Result<(), QueueError> {
    sqlx::query!(
        r#"
INSERT INTO dead_jobs (id, queue, fingerprint, payload, retries, max_retries, deadline, error, created_at)
VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
"#,
        job.id,
        job.queue,
        job.fingerprint,
        job.payload,
        job.retries,
        job.max_retries,
        job.deadline,
        error,
        job.created_at,
    )
    .execute(&mut **tx)
    .await?;

    sqlx::query!("DELETE FROM jobs WHERE id = $1", job.id)
        .execute(&mut **tx)
        .await?;

    metrics::counter!(JOBS_DEAD_LETTERED, "queue" => job.queue.clone()).increment(1);

    Ok(())
}

pub async fn get_dead_job<'c, E>(executor: E, id: i64) -> Result<Option<DeadJob>, QueueError>
where
    E: Executor<'c, Database = Postgres>,
{
    let row = sqlx::query_as!(
        DeadJob,
        r#"SELECT id, queue, fingerprint, payload, retries, max_retries, deadline, error, created_at FROM dead_jobs WHERE id = $1"#,
        id,
    )
    .fetch_optional(executor)
    .await?;

    Ok(row)
}

fn throw_if_no_rows(rows_affected: u64, job: i64) -> Result<(), QueueError> {
    if rows_affected == 0 {
        Err(QueueError::InvalidLock { job })
    } else {
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use serde_json::json;

    #[test]
    fn fingerprint_is_stable_and_distinguishes_payloads() {
        let a = fingerprint("testing", &json!({"n": 1}));
        let b = fingerprint("testing", &json!({"n": 1}));
        let c = fingerprint("testing", &json!({"n": 2}));
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn fingerprint_distinguishes_queues() {
        let a = fingerprint("a", &json!({"n": 1}));
        let b = fingerprint("b", &json!({"n": 1}));
        assert_ne!(a, b);
    }
}

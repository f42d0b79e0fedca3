use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::json;
use sqlx::PgPool;

use queuectl_core::test_support::{handle, insert, get_dead_job, FutureJobs};
use queuectl_core::{HandlerConfig, Handler, JobContext, JobError, JobInit};

struct CountingHandler {
    calls: AtomicUsize,
    fail_until: usize,
}

impl CountingHandler {
    fn new(fail_until: usize) -> Self {
        Self {
            calls: AtomicUsize::new(0),
            fail_until,
        }
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait::async_trait]
impl Handler for CountingHandler {
    async fn call(&self, _ctx: &JobContext<'_>) -> Result<(), JobError> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if n <= self.fail_until {
            Err(JobError::Handler("simulated failure".to_string()))
        } else {
            Ok(())
        }
    }
}

struct SleepyHandler {
    delay: Duration,
}

#[async_trait::async_trait]
impl Handler for SleepyHandler {
    async fn call(&self, _ctx: &JobContext<'_>) -> Result<(), JobError> {
        tokio::time::sleep(self.delay).await;
        Ok(())
    }
}

async fn enqueue(pool: &PgPool, init: JobInit) -> i64 {
    let mut tx = pool.begin().await.unwrap();
    let id = insert(&mut tx, &init).await.unwrap();
    tx.commit().await.unwrap();
    id
}

#[sqlx::test(migrations = "./migrations")]
async fn handler_success_marks_job_processed(pool: PgPool) {
    let init = JobInit::new("testing", json!({"message": "hello"}));
    let id = enqueue(&pool, init).await;

    let handler = CountingHandler::new(0);
    let future_jobs = FutureJobs::new();
    let config = HandlerConfig::new(1);

    handle(
        &pool,
        id,
        "testing",
        &handler,
        &config,
        &future_jobs,
        Duration::from_secs(1),
        Duration::from_secs(60),
    )
    .await
    .unwrap();

    let row: (String,) = sqlx::query_as("SELECT status FROM jobs WHERE id = $1")
        .bind(id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(row.0, "processed");
    assert_eq!(handler.calls(), 1);
}

#[sqlx::test(migrations = "./migrations")]
async fn exhausted_retries_move_job_to_dead_letter(pool: PgPool) {
    let mut init = JobInit::new("testing", json!({"n": 1}));
    init.max_retries = 2;
    let id = enqueue(&pool, init).await;

    // Handler always fails; 3 invocations total (1 + max_retries) exhausts retries.
    let handler = CountingHandler::new(usize::MAX);
    let future_jobs = FutureJobs::new();
    let config = HandlerConfig::new(1);

    for _ in 0..3 {
        handle(
            &pool,
            id,
            "testing",
            &handler,
            &config,
            &future_jobs,
            Duration::from_millis(1),
            Duration::from_secs(1),
        )
        .await
        .unwrap();

        // force the row to be immediately eligible again for the test,
        // bypassing the real backoff delay.
        sqlx::query("UPDATE jobs SET run_after = now() WHERE id = $1")
            .bind(id)
            .execute(&pool)
            .await
            .unwrap();
    }

    assert_eq!(handler.calls(), 3);

    let remaining: i64 = sqlx::query_scalar("SELECT count(*) FROM jobs WHERE id = $1")
        .bind(id)
        .fetch_one(&pool)
        .await
        .unwrap();
    assert_eq!(remaining, 0);

    let dead = get_dead_job(&pool, id).await.unwrap();
    assert!(dead.is_some());
    assert_eq!(dead.unwrap().retries, 2);
}

#[sqlx::test(migrations = "./migrations")]
async fn past_deadline_is_dead_lettered_without_invoking_handler(pool: PgPool) {
    let mut init = JobInit::new("testing", json!({}));
    init.deadline = Some(Utc::now() - chrono::Duration::seconds(5));
    let id = enqueue(&pool, init).await;

    let handler = CountingHandler::new(0);
    let future_jobs = FutureJobs::new();
    let config = HandlerConfig::new(1);

    handle(
        &pool,
        id,
        "testing",
        &handler,
        &config,
        &future_jobs,
        Duration::from_secs(1),
        Duration::from_secs(60),
    )
    .await
    .unwrap();

    assert_eq!(handler.calls(), 0);
    let dead = get_dead_job(&pool, id).await.unwrap();
    assert!(dead.is_some());
}

#[sqlx::test(migrations = "./migrations")]
async fn handler_timeout_is_recorded_as_a_failed_attempt(pool: PgPool) {
    let init = JobInit::new("testing", json!({}));
    let id = enqueue(&pool, init).await;

    let handler = SleepyHandler {
        delay: Duration::from_millis(50),
    };
    let future_jobs = FutureJobs::new();
    let config = HandlerConfig::new(1).with_job_timeout(Duration::from_millis(1));

    handle(
        &pool,
        id,
        "testing",
        &handler,
        &config,
        &future_jobs,
        Duration::from_millis(1),
        Duration::from_secs(1),
    )
    .await
    .unwrap();

    let row: (String, i32, Option<String>) =
        sqlx::query_as("SELECT status, retries, error FROM jobs WHERE id = $1")
            .bind(id)
            .fetch_one(&pool)
            .await
            .unwrap();
    assert_eq!(row.0, "failed");
    assert_eq!(row.1, 1);
    assert!(row.2.unwrap().contains("timeout"));
}

#[sqlx::test(migrations = "./migrations")]
async fn duplicate_fingerprint_among_live_jobs_is_rejected(pool: PgPool) {
    let init = JobInit::new("testing", json!({"message": "hello"}));
    let _id = enqueue(&pool, init.clone()).await;

    let mut tx = pool.begin().await.unwrap();
    let result = insert(&mut tx, &init).await;
    assert!(matches!(result, Err(queuectl_core::QueueError::DuplicateJob(_))));
}

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::{mpsc, watch};
use tracing::{error, warn};

use crate::config::HandlerConfig;
use crate::error::QueueError;
use crate::lifecycle::{handle, Handler};
use crate::metrics_consts::{BACKLOG_DRAIN_DURATION, JOBS_PICKED_UP};
use crate::notify::run_listener;
use crate::repository::pick_pending_id;
use crate::scheduler::{self, FutureJobs};

const ANNOUNCEMENT_CHANNEL_DEPTH_PER_WORKER: usize = 16;

/// Fans a queue's backlog and live announcements into `handler.concurrency`
/// worker tasks, each of which runs jobs through the lifecycle controller
/// one at a time. Returns once `shutdown` fires and every spawned task has
/// drained.
pub async fn start(
    pool: PgPool,
    queue: String,
    handler: Arc<dyn Handler>,
    config: HandlerConfig,
    future_jobs: Arc<FutureJobs>,
    job_check_interval: Duration,
    future_job_window: Duration,
    backoff_base: Duration,
    backoff_cap: Duration,
    shutdown: watch::Receiver<bool>,
    idle_in_transaction_timeout_ms: u64,
) -> Result<(), QueueError> {
    let channel_capacity = config.concurrency * ANNOUNCEMENT_CHANNEL_DEPTH_PER_WORKER;
    let (tx, rx) = mpsc::channel::<String>(channel_capacity.max(16));
    let rx = Arc::new(tokio::sync::Mutex::new(rx));

    let listener_task = tokio::spawn(run_listener(
        pool.clone(),
        queue.clone(),
        tx.clone(),
        shutdown.clone(),
        idle_in_transaction_timeout_ms,
    ));

    let backlog_task = tokio::spawn(drain_backlog_loop(pool.clone(), queue.clone(), tx.clone()));

    let scheduler_task = tokio::spawn(scheduler::run(
        pool.clone(),
        queue.clone(),
        future_jobs.clone(),
        job_check_interval,
        future_job_window,
        shutdown.clone(),
    ));

    let mut worker_tasks = Vec::with_capacity(config.concurrency);
    for worker_id in 0..config.concurrency {
        worker_tasks.push(tokio::spawn(worker_loop(
            pool.clone(),
            queue.clone(),
            handler.clone(),
            config.clone(),
            future_jobs.clone(),
            backoff_base,
            backoff_cap,
            rx.clone(),
            shutdown.clone(),
            worker_id,
        )));
    }

    for task in worker_tasks {
        let _ = task.await;
    }
    let _ = listener_task.await;
    let _ = backlog_task.await;
    let _ = scheduler_task.await;

    Ok(())
}

async fn worker_loop(
    pool: PgPool,
    queue: String,
    handler: Arc<dyn Handler>,
    config: HandlerConfig,
    future_jobs: Arc<FutureJobs>,
    backoff_base: Duration,
    backoff_cap: Duration,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<String>>>,
    mut shutdown: watch::Receiver<bool>,
    worker_id: usize,
) {
    loop {
        let id_str = {
            let mut guard = rx.lock().await;
            tokio::select! {
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        return;
                    }
                    continue;
                }
                next = guard.recv() => next,
            }
        };

        let Some(id_str) = id_str else {
            return;
        };

        let Ok(id) = id_str.parse::<i64>() else {
            continue;
        };

        metrics::counter!(JOBS_PICKED_UP, "queue" => queue.clone()).increment(1);

        if let Err(e) = handle(
            &pool,
            id,
            &queue,
            handler.as_ref(),
            &config,
            &future_jobs,
            backoff_base,
            backoff_cap,
        )
        .await
        {
            error!(worker = worker_id, job = id, %queue, error = %e, "job handling failed");
        }
    }
}

/// One-shot drain of whatever is already eligible in `queue` at startup.
/// Returns as soon as the backlog is exhausted; all dispatch after that
/// point comes from `run_listener`'s `LISTEN`/`NOTIFY` channel instead.
async fn drain_backlog_loop(pool: PgPool, queue: String, tx: mpsc::Sender<String>) {
    let started = std::time::Instant::now();
    loop {
        match pick_pending_id(&pool, &queue).await {
            Ok(Some(id)) => {
                if tx.send(id.to_string()).await.is_err() {
                    break;
                }
            }
            Ok(None) => break,
            Err(e) => {
                warn!(%queue, error = %e, "backlog poll failed");
                break;
            }
        }
    }
    metrics::histogram!(BACKLOG_DRAIN_DURATION, "queue" => queue)
        .record(started.elapsed().as_secs_f64() * 1000.0);
}

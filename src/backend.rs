use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;
use tokio::sync::{watch, RwLock};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::config::{Config, HandlerConfig};
use crate::error::QueueError;
use crate::lifecycle::Handler;
use crate::notify::{announce, SHUTDOWN_SENTINEL};
use crate::scheduler::FutureJobs;
use crate::types::JobInit;

/// Heuristic carried over from the original backend's
/// `shutdownAnnouncementAllowance`: a brief pause between broadcasting the
/// shutdown sentinel and cancelling worker contexts, so listeners have a
/// chance to observe it before their connection is torn down.
const SHUTDOWN_ANNOUNCEMENT_ALLOWANCE: Duration = Duration::from_millis(100);

struct Inner {
    handlers: HashMap<String, HandlerConfig>,
    future_jobs: HashMap<String, Arc<FutureJobs>>,
    cancel_funcs: Vec<JoinHandle<()>>,
}

/// Assembles the connection pool, job repository, notification bus, future
/// job scheduler, cron scheduler, and worker pool into the single
/// programmatic surface described in §6: `enqueue`, `start`, `start_cron`,
/// `shutdown`.
pub struct Backend {
    pool: PgPool,
    config: Config,
    inner: RwLock<Inner>,
    shutdown_tx: watch::Sender<bool>,
}

impl Backend {
    /// Connects the pool and runs pending migrations. `migrations` should
    /// point at a directory readable by `sqlx::migrate!`'s embedding macro
    /// in the caller's own crate; this core treats schema setup as opaque
    /// (see SPEC_FULL.md §1) and only requires the pool to already be
    /// ready for use.
    pub async fn new(config: Config) -> Result<Self, QueueError> {
        let pool = config.pool.connect().await?;
        let (shutdown_tx, _) = watch::channel(false);

        Ok(Self {
            pool,
            config,
            inner: RwLock::new(Inner {
                handlers: HashMap::new(),
                future_jobs: HashMap::new(),
                cancel_funcs: Vec::new(),
            }),
            shutdown_tx,
        })
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Writes the job row and, for jobs due now, announces it immediately.
    /// Jobs due in the future are registered with that queue's scheduler
    /// instead (created lazily if no worker has started on it yet).
    pub async fn enqueue(&self, init: JobInit) -> Result<i64, QueueError> {
        if init.queue.trim().is_empty() {
            return Err(QueueError::NoQueueSpecified);
        }

        let due_now = init.run_after.map(|t| t <= chrono::Utc::now()).unwrap_or(true);

        let mut tx = self.pool.begin().await?;
        let id = crate::repository::insert(&mut tx, &init).await?;
        tx.commit().await?;

        if due_now {
            announce(&self.pool, &init.queue, &id.to_string()).await?;
        } else {
            let run_after = init.run_after.expect("due_now is false only when run_after is set");
            let future_jobs = self.future_jobs_for(&init.queue).await;
            future_jobs.insert(id, run_after).await;
        }

        Ok(id)
    }

    async fn future_jobs_for(&self, queue: &str) -> Arc<FutureJobs> {
        if let Some(existing) = self.inner.read().await.future_jobs.get(queue) {
            return existing.clone();
        }
        let mut inner = self.inner.write().await;
        inner
            .future_jobs
            .entry(queue.to_string())
            .or_insert_with(FutureJobs::new)
            .clone()
    }

    /// Registers `handler` for `queue` and starts its worker pool. Calling
    /// this twice for the same queue replaces the registered config but
    /// spawns an additional (redundant) pool; callers should start each
    /// queue once.
    pub async fn start(
        &self,
        queue: impl Into<String>,
        handler: Arc<dyn Handler>,
        config: HandlerConfig,
    ) -> Result<(), QueueError> {
        let queue = queue.into();
        let future_jobs = self.future_jobs_for(&queue).await;

        let handle = tokio::spawn({
            let pool = self.pool.clone();
            let queue = queue.clone();
            let config = config.clone();
            let shutdown = self.shutdown_tx.subscribe();
            let job_check_interval = self.config.job_check_interval();
            let future_job_window = self.config.future_job_window();
            let backoff_base = self.config.backoff_base();
            let backoff_cap = self.config.backoff_cap();
            let idle_in_transaction_timeout_ms = self.config.pool.idle_in_transaction_timeout_ms;
            async move {
                if let Err(e) = crate::worker::start(
                    pool,
                    queue.clone(),
                    handler,
                    config,
                    future_jobs,
                    job_check_interval,
                    future_job_window,
                    backoff_base,
                    backoff_cap,
                    shutdown,
                    idle_in_transaction_timeout_ms,
                )
                .await
                {
                    warn!(%queue, error = %e, "worker pool for queue exited with error");
                }
            }
        });

        let mut inner = self.inner.write().await;
        inner.handlers.insert(queue, config);
        inner.cancel_funcs.push(handle);
        Ok(())
    }

    /// Derives a synthetic queue from `expr`, registers `handler` on it via
    /// [`Backend::start`], and spawns the cron driver that enqueues onto it
    /// at every fire.
    pub async fn start_cron(
        &self,
        expr: impl Into<String>,
        handler: Arc<dyn Handler>,
        config: HandlerConfig,
    ) -> Result<(), QueueError> {
        let expr = expr.into();
        let queue = crate::cron::derive_queue_name(&expr);
        self.start(queue, handler, config).await?;

        let handle = tokio::spawn({
            let pool = self.pool.clone();
            let shutdown = self.shutdown_tx.subscribe();
            let expr = expr.clone();
            async move {
                if let Err(e) = crate::cron::run(pool, expr.clone(), shutdown).await {
                    warn!(cron = %expr, error = %e, "cron driver exited with error");
                }
            }
        });

        self.inner.write().await.cancel_funcs.push(handle);
        Ok(())
    }

    /// Broadcasts the shutdown sentinel to every registered queue, waits
    /// the announcement allowance, then cancels every background task and
    /// closes the pool. Idempotent: a second call is a (harmless) no-op
    /// because the watch channel only transitions once.
    pub async fn shutdown(&self) {
        let queues: Vec<String> = {
            let inner = self.inner.read().await;
            inner.handlers.keys().cloned().collect()
        };

        for queue in &queues {
            if let Err(e) = announce(&self.pool, queue, SHUTDOWN_SENTINEL).await {
                warn!(%queue, error = %e, "failed to announce shutdown sentinel");
            }
        }

        tokio::time::sleep(SHUTDOWN_ANNOUNCEMENT_ALLOWANCE).await;
        let _ = self.shutdown_tx.send(true);

        let handles = {
            let mut inner = self.inner.write().await;
            std::mem::take(&mut inner.cancel_funcs)
        };
        for handle in handles {
            let _ = handle.await;
        }

        info!("backend shutdown complete");
        self.pool.close().await;
    }
}

use std::time::Duration;

use envconfig::Envconfig;
use serde::{Deserialize, Serialize};
use sqlx::{pool::PoolOptions, postgres::PgConnectOptions, Executor, PgPool};

use crate::error::QueueError;

/// Pool configuration, passable across API boundaries the way the rest of
/// the queue's config structs are.
#[derive(Debug, Envconfig, Serialize, Deserialize, Clone)]
pub struct PoolConfig {
    #[envconfig(from = "DATABASE_URL")]
    pub db_url: String,
    #[envconfig(from = "POOL_MAX_CONNS", default = "10")]
    pub max_connections: u32,
    #[envconfig(from = "POOL_MIN_CONNS", default = "1")]
    pub min_connections: u32,
    #[envconfig(from = "POOL_ACQUIRE_TIMEOUT_SECONDS", default = "30")]
    pub acquire_timeout_seconds: u64,
    #[envconfig(from = "POOL_MAX_CONN_LIFETIME_SECONDS", default = "300")]
    pub max_lifetime_seconds: u64,
    #[envconfig(from = "POOL_MAX_CONN_IDLE_SECONDS", default = "60")]
    pub idle_timeout_seconds: u64,
    /// ms; 0 disables the timeout. Must exceed the slowest handler or jobs
    /// will be retried spuriously (see §5 of the design notes).
    #[envconfig(from = "POOL_IDLE_IN_TRANSACTION_TIMEOUT_MS", default = "60000")]
    pub idle_in_transaction_timeout_ms: u64,
}

impl PoolConfig {
    pub async fn connect(&self) -> Result<PgPool, QueueError> {
        if self.db_url.trim().is_empty() {
            return Err(QueueError::BadConnectionString);
        }

        let idle_in_tx_ms = self.idle_in_transaction_timeout_ms;
        let connect_options: PgConnectOptions = self
            .db_url
            .parse()
            .map_err(|_| QueueError::BadConnectionString)?;

        let pool = PoolOptions::new()
            .max_connections(self.max_connections)
            .min_connections(self.min_connections)
            .max_lifetime(Duration::from_secs(self.max_lifetime_seconds))
            .idle_timeout(Duration::from_secs(self.idle_timeout_seconds))
            .acquire_timeout(Duration::from_secs(self.acquire_timeout_seconds))
            .after_connect(move |conn, _meta| {
                Box::pin(async move {
                    conn.execute(
                        format!("SET idle_in_transaction_session_timeout = {idle_in_tx_ms}")
                            .as_str(),
                    )
                    .await?;
                    Ok(())
                })
            })
            .connect_with(connect_options)
            .await?;

        Ok(pool)
    }
}

/// Top-level engine configuration (§6 Configuration).
#[derive(Debug, Envconfig, Serialize, Deserialize, Clone)]
pub struct Config {
    #[envconfig(nested = true)]
    pub pool: PoolConfig,
    #[envconfig(from = "JOB_CHECK_INTERVAL_SECONDS", default = "5")]
    pub job_check_interval_seconds: u64,
    #[envconfig(from = "FUTURE_JOB_WINDOW_SECONDS", default = "30")]
    pub future_job_window_seconds: u64,
    #[envconfig(from = "BACKOFF_BASE_SECONDS", default = "1")]
    pub backoff_base_seconds: u64,
    #[envconfig(from = "BACKOFF_CAP_SECONDS", default = "300")]
    pub backoff_cap_seconds: u64,
    #[envconfig(from = "RUST_LOG", default = "info")]
    pub log_level: String,
}

impl Config {
    pub fn job_check_interval(&self) -> Duration {
        Duration::from_secs(self.job_check_interval_seconds)
    }

    pub fn future_job_window(&self) -> Duration {
        Duration::from_secs(self.future_job_window_seconds)
    }

    pub fn backoff_base(&self) -> Duration {
        Duration::from_secs(self.backoff_base_seconds)
    }

    pub fn backoff_cap(&self) -> Duration {
        Duration::from_secs(self.backoff_cap_seconds)
    }
}

/// Per-queue handler configuration, supplied by the caller of `start`.
#[derive(Debug, Clone, Default)]
pub struct HandlerConfig {
    pub concurrency: usize,
    pub job_timeout: Option<Duration>,
    pub deadline: Option<Duration>,
}

impl HandlerConfig {
    pub fn new(concurrency: usize) -> Self {
        Self {
            concurrency: concurrency.max(1),
            job_timeout: None,
            deadline: None,
        }
    }

    pub fn with_job_timeout(mut self, timeout: Duration) -> Self {
        self.job_timeout = Some(timeout);
        self
    }

    pub fn with_deadline(mut self, deadline: Duration) -> Self {
        self.deadline = Some(deadline);
        self
    }
}

use thiserror::Error;

/// Errors about the queue infrastructure itself: bad configuration,
/// connection failures, and constraint violations surfaced from Postgres.
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("connection string was empty or invalid")]
    BadConnectionString,
    #[error("no queue specified for job")]
    NoQueueSpecified,
    #[error("no handler registered for queue '{0}'")]
    NoHandlerForQueue(String),
    #[error("a job with this fingerprint is already pending or failed: {0}")]
    DuplicateJob(String),
    #[error("cron expression '{0}' could not be parsed: {1}")]
    BadCron(String, #[source] cron::error::Error),
    #[error("job {job} update rejected: no matching row (lock lost or job completed)")]
    InvalidLock { job: i64 },
    #[error("database query failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("database migration failed: {0}")]
    Migration(#[from] sqlx::migrate::MigrateError),
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Errors surfaced from a single handler invocation, distinguished from
/// `QueueError` because they drive the per-job retry/dead-letter state
/// machine rather than the engine's control flow.
#[derive(Error, Debug)]
pub enum JobError {
    #[error("{0}")]
    Handler(String),
    #[error("handler exceeded its {0:?} timeout")]
    Timeout(std::time::Duration),
    #[error("job deadline exceeded")]
    DeadlineExceeded,
    #[error("worker shutting down")]
    Canceled,
}

impl JobError {
    /// The string persisted into `jobs.error` / `dead_jobs.error`.
    pub fn message(&self) -> String {
        self.to_string()
    }
}

pub const JOBS_ENQUEUED: &str = "queuectl_jobs_enqueued";
pub const JOBS_DUPLICATE: &str = "queuectl_jobs_duplicate";
pub const JOBS_PICKED_UP: &str = "queuectl_jobs_picked_up";
pub const JOB_UPDATE_ATTEMPT: &str = "queuectl_job_update_attempt";
pub const JOBS_RETRIED: &str = "queuectl_jobs_retried";
pub const JOBS_DEAD_LETTERED: &str = "queuectl_jobs_dead_lettered";
pub const LISTENER_RECONNECTS: &str = "queuectl_listener_reconnects";
pub const BACKLOG_DRAIN_DURATION: &str = "queuectl_backlog_drain_duration_ms";

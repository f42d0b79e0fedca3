use chrono::{DateTime, Utc};
use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::str::FromStr;
use std::time::Duration;

#[derive(Debug, Clone, Copy, Deserialize, Serialize, PartialEq, Eq, sqlx::Type)]
#[serde(rename_all = "lowercase")]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum JobState {
    New,
    Processed,
    Failed,
}

impl FromStr for JobState {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "new" => Ok(JobState::New),
            "processed" => Ok(JobState::Processed),
            "failed" => Ok(JobState::Failed),
            _ => Err(()),
        }
    }
}

/// The data needed to enqueue a job.
#[derive(Debug, Deserialize, Serialize, Clone)]
pub struct JobInit {
    pub queue: String,
    pub payload: Value,
    pub max_retries: i32,
    pub run_after: Option<DateTime<Utc>>,
    pub deadline: Option<DateTime<Utc>>,
}

impl JobInit {
    pub fn new(queue: impl Into<String>, payload: Value) -> Self {
        Self {
            queue: queue.into(),
            payload,
            max_retries: 3,
            run_after: None,
            deadline: None,
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, sqlx::FromRow)]
pub struct Job {
    pub id: i64,
    pub queue: String,
    pub fingerprint: String,
    pub payload: Value,
    pub status: String,
    pub retries: i32,
    pub max_retries: i32,
    pub run_after: DateTime<Utc>,
    pub ran_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub deadline: Option<DateTime<Utc>>,
    pub error: Option<String>,
}

impl Job {
    pub fn state(&self) -> JobState {
        JobState::from_str(&self.status).unwrap_or(JobState::New)
    }
}

#[derive(Debug, Clone, Deserialize, Serialize, sqlx::FromRow)]
pub struct DeadJob {
    pub id: i64,
    pub queue: String,
    pub fingerprint: String,
    pub payload: Value,
    pub retries: i32,
    pub max_retries: i32,
    pub deadline: Option<DateTime<Utc>>,
    pub error: String,
    pub created_at: DateTime<Utc>,
}

/// Outcome of a single handler invocation, as reported back to the lifecycle
/// controller for the job-update state machine in §4.B.
#[derive(Debug)]
pub enum JobOutcome {
    Success,
    Failure(String),
}

/// Exponential backoff with jitter: `min(cap, base * 2^retries) + uniform(0, base)`.
/// Floors at 1 second regardless of `retries`.
pub fn backoff(retries: i32, base: Duration, cap: Duration) -> Duration {
    let exp = base.saturating_mul(1u32.checked_shl(retries.max(0) as u32).unwrap_or(u32::MAX));
    let capped = std::cmp::min(exp, cap);
    let jitter_ms = if base.as_millis() == 0 {
        0
    } else {
        rand::thread_rng().gen_range(0..=base.as_millis() as u64)
    };
    let floor = Duration::from_secs(1);
    std::cmp::max(capped + Duration::from_millis(jitter_ms), floor)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn backoff_is_monotonic_until_capped() {
        let base = Duration::from_secs(1);
        let cap = Duration::from_secs(60);
        let mut last = Duration::ZERO;
        for retries in 0..10 {
            let d = backoff(retries, base, cap);
            assert!(d >= last || d >= cap, "backoff should not shrink before the cap");
            last = std::cmp::max(last, d.saturating_sub(base));
        }
    }

    #[test]
    fn backoff_never_below_one_second() {
        let d = backoff(0, Duration::from_millis(0), Duration::from_secs(5));
        assert!(d >= Duration::from_secs(1));
    }

    #[test]
    fn job_state_roundtrips_through_str() {
        assert_eq!(JobState::from_str("new"), Ok(JobState::New));
        assert_eq!(JobState::from_str("processed"), Ok(JobState::Processed));
        assert_eq!(JobState::from_str("failed"), Ok(JobState::Failed));
        assert!(JobState::from_str("bogus").is_err());
    }
}

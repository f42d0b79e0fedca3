use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::PgPool;
use tokio::sync::RwLock;
use tracing::{debug, warn};

use crate::error::QueueError;
use crate::notify::announce;
use crate::repository::list_future;

/// In-memory index of jobs whose `run_after` is in the future, bounded to
/// the ones due soon enough to matter. Mutated by the lifecycle controller
/// (on retry) and by `Enqueue` (future job), and drained by its own tick
/// loop.
#[derive(Default)]
pub struct FutureJobs {
    inner: RwLock<HashMap<i64, DateTime<Utc>>>,
}

impl FutureJobs {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub async fn insert(&self, id: i64, run_after: DateTime<Utc>) {
        self.inner.write().await.insert(id, run_after);
    }

    async fn take_due_within(&self, window: Duration) -> Vec<(i64, DateTime<Utc>)> {
        let cutoff = Utc::now()
            + chrono::Duration::from_std(window).unwrap_or(chrono::Duration::seconds(30));
        let mut map = self.inner.write().await;
        let due: Vec<i64> = map
            .iter()
            .filter(|(_, run_after)| **run_after <= cutoff)
            .map(|(id, _)| *id)
            .collect();
        due.into_iter()
            .filter_map(|id| map.remove(&id).map(|run_after| (id, run_after)))
            .collect()
    }
}

/// Seeds the scheduler from persisted state, then runs the tick loop: every
/// `interval`, promote anything within `window` of its due time to a
/// one-shot timer that announces it at the precise moment.
pub async fn run(
    pool: PgPool,
    queue: String,
    future_jobs: Arc<FutureJobs>,
    interval: Duration,
    window: Duration,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<(), QueueError> {
    for (id, run_after) in list_future(&pool, &queue).await? {
        future_jobs.insert(id, run_after).await;
    }

    let mut ticker = tokio::time::interval(interval);
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            _ = ticker.tick() => {
                for (id, run_after) in future_jobs.take_due_within(window).await {
                    spawn_one_shot(pool.clone(), queue.clone(), id, run_after);
                }
            }
        }
    }
}

fn spawn_one_shot(pool: PgPool, queue: String, id: i64, run_after: DateTime<Utc>) {
    tokio::spawn(async move {
        let now = Utc::now();
        if run_after > now {
            let delay = (run_after - now).to_std().unwrap_or(Duration::ZERO);
            tokio::time::sleep(delay).await;
        }
        debug!(%queue, job = id, "dispatching future job");
        if let Err(e) = announce(&pool, &queue, &id.to_string()).await {
            warn!(%queue, job = id, error = %e, "failed to announce future job");
        }
    });
}

#[cfg(test)]
mod test {
    use super::*;

    #[tokio::test]
    async fn take_due_within_only_removes_due_entries() {
        let jobs = FutureJobs::default();
        let now = Utc::now();
        jobs.insert(1, now + chrono::Duration::seconds(5)).await;
        jobs.insert(2, now + chrono::Duration::seconds(500)).await;

        let due = jobs.take_due_within(Duration::from_secs(30)).await;
        assert_eq!(due.len(), 1);
        assert_eq!(due[0].0, 1);

        let remaining = jobs.inner.read().await;
        assert!(remaining.contains_key(&2));
        assert!(!remaining.contains_key(&1));
    }
}

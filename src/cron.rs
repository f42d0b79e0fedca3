use std::str::FromStr;
use std::time::Duration;

use chrono::Utc;
use cron::Schedule;
use serde_json::json;
use sqlx::PgPool;
use tracing::{error, info};

use crate::error::QueueError;
use crate::types::JobInit;

/// Derives a stable synthetic queue name from a cron expression. The
/// original backend this was distilled from derives it from a
/// human-readable description of the schedule; since cron-expression
/// parsing is treated as an opaque dependency here, we derive it from the
/// expression string itself instead (see DESIGN.md).
pub fn derive_queue_name(expr: &str) -> String {
    let mut name = String::with_capacity(expr.len() + 5);
    name.push_str("cron_");
    for c in expr.chars() {
        if c.is_ascii_alphanumeric() {
            name.push(c.to_ascii_lowercase());
        } else if !name.ends_with('_') {
            name.push('_');
        }
    }
    name.trim_end_matches('_').to_string()
}

/// Periodically enqueues a marker job onto the derived synthetic queue at
/// every cron fire, until told to stop. The caller is responsible for
/// starting a worker on the same queue to actually run the handler.
pub async fn run(
    pool: PgPool,
    expr: String,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
) -> Result<(), QueueError> {
    let schedule = Schedule::from_str(&expr)
        .map_err(|e| QueueError::BadCron(expr.clone(), e))?;
    let queue = derive_queue_name(&expr);

    loop {
        let next = schedule.upcoming(Utc).next();
        let Some(next_fire) = next else {
            error!(%expr, "cron schedule has no further fire times");
            return Ok(());
        };

        let delay = (next_fire - Utc::now()).to_std().unwrap_or(Duration::ZERO);

        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return Ok(());
                }
            }
            _ = tokio::time::sleep(delay) => {
                info!(%queue, fire_time = %next_fire, "cron fired");
                let init = JobInit::new(queue.clone(), json!({"cron": expr, "fired_at": next_fire}));
                let mut tx = pool.begin().await?;
                let id = crate::repository::insert(&mut tx, &init).await;
                match id {
                    Ok(id) => {
                        tx.commit().await?;
                        if let Err(e) = crate::notify::announce(&pool, &queue, &id.to_string()).await {
                            error!(%queue, error = %e, "failed to announce cron-enqueued job");
                        }
                    }
                    Err(QueueError::DuplicateJob(_)) => {
                        // A previous firing hasn't been processed yet; skip this tick.
                        tx.rollback().await?;
                    }
                    Err(e) => return Err(e),
                }
            }
        }
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn derive_queue_name_normalizes_expression() {
        assert_eq!(derive_queue_name("* * * * * *"), "cron");
        assert_eq!(derive_queue_name("0 0 * * *"), "cron_0_0");
    }

    #[test]
    fn derive_queue_name_lowercases_and_strips_runs() {
        assert_eq!(derive_queue_name("0/5  *  *  *  *"), "cron_0_5");
    }
}

use std::time::Duration;

use sqlx::postgres::PgListener;
use sqlx::{Executor, PgPool};
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, error, info, warn};

use crate::error::QueueError;
use crate::metrics_consts::{BACKLOG_DRAIN_DURATION, LISTENER_RECONNECTS};
use crate::repository::pick_pending_id;

/// Reserved announcement payload that tells a listener loop to shut down.
pub const SHUTDOWN_SENTINEL: &str = "-1";

const RECONNECT_BACKOFF: Duration = Duration::from_millis(500);
const NOTIFICATION_POLL_TIMEOUT: Duration = Duration::from_secs(30);

/// Publish a job id on a queue's notification channel. The caller is
/// expected to have already committed the row this id refers to in a
/// separate transaction, so that no listener ever observes an announcement
/// for a row that isn't visible yet.
pub async fn announce(pool: &PgPool, queue: &str, payload: &str) -> Result<(), QueueError> {
    let mut tx = pool.begin().await?;
    // queue names are not user payload in the sense of injection risk (they
    // come from handler registration, not request bodies), but NOTIFY's
    // channel identifier can't be bound as a parameter, so we quote it.
    let stmt = format!("NOTIFY \"{queue}\", '{payload}'");
    tx.execute(stmt.as_str()).await?;
    tx.commit().await?;
    Ok(())
}

/// Runs a `LISTEN <queue>` loop, forwarding each notification payload (job
/// id, or [`SHUTDOWN_SENTINEL`]) to `tx`. Reconnects with backoff on any
/// non-cancellation error, re-`LISTEN`ing and re-draining the backlog via
/// `pick_pending_id` before resuming — this is the fix for the open listener
/// reconnection item noted in the design.
///
/// The listener's dedicated connection disables
/// `idle_in_transaction_session_timeout` for as long as it holds the
/// `LISTEN`: it never opens a transaction but must be allowed to sit idle
/// indefinitely between notifications, which the pool's `after_connect` hook
/// (tuned for worker connections, see `config.rs`) would otherwise cut short.
/// `idle_in_transaction_timeout_ms` is that hook's configured value, restored
/// before the connection is released back to the pool on graceful shutdown.
pub async fn run_listener(
    pool: PgPool,
    queue: String,
    tx: mpsc::Sender<String>,
    mut shutdown: tokio::sync::watch::Receiver<bool>,
    idle_in_transaction_timeout_ms: u64,
) {
    loop {
        if *shutdown.borrow() {
            return;
        }

        let mut listener = match PgListener::connect_with(&pool).await {
            Ok(l) => l,
            Err(e) => {
                warn!(%queue, error = %e, "failed to open listener connection, retrying");
                metrics::counter!(LISTENER_RECONNECTS, "queue" => queue.clone()).increment(1);
                tokio::time::sleep(RECONNECT_BACKOFF).await;
                continue;
            }
        };

        if let Err(e) = listener
            .execute("SET idle_in_transaction_session_timeout = 0")
            .await
        {
            warn!(%queue, error = %e, "failed to disable idle-in-transaction timeout on listener connection");
            metrics::counter!(LISTENER_RECONNECTS, "queue" => queue.clone()).increment(1);
            tokio::time::sleep(RECONNECT_BACKOFF).await;
            continue;
        }

        if let Err(e) = listener.listen(&queue).await {
            warn!(%queue, error = %e, "LISTEN failed, retrying");
            metrics::counter!(LISTENER_RECONNECTS, "queue" => queue.clone()).increment(1);
            tokio::time::sleep(RECONNECT_BACKOFF).await;
            continue;
        }

        info!(%queue, "listening for job announcements");

        // Drain anything that became eligible while we were disconnected.
        if let Err(e) = drain_backlog(&pool, &queue, &tx).await {
            error!(%queue, error = %e, "failed to drain backlog after (re)connect");
        }

        let shutdown_observed = run_until_error(&mut listener, &queue, &tx, &mut shutdown).await;

        if shutdown_observed {
            release(&mut listener, &queue, idle_in_transaction_timeout_ms).await;
            return;
        }

        metrics::counter!(LISTENER_RECONNECTS, "queue" => queue.clone()).increment(1);
        tokio::time::sleep(RECONNECT_BACKOFF).await;
    }
}

/// Unwinds a listener connection before it's dropped: `UNLISTEN`s the
/// channel and restores the pool's configured idle-in-transaction timeout,
/// so the connection would be safe to hand back to a pool if one were
/// reused here rather than closed.
async fn release(listener: &mut PgListener, queue: &str, idle_in_transaction_timeout_ms: u64) {
    if let Err(e) = listener.unlisten(queue).await {
        warn!(%queue, error = %e, "UNLISTEN failed while releasing listener connection");
    }
    if let Err(e) = listener
        .execute(
            format!(
                "SET idle_in_transaction_session_timeout = {idle_in_transaction_timeout_ms}"
            )
            .as_str(),
        )
        .await
    {
        warn!(%queue, error = %e, "failed to restore idle-in-transaction timeout on listener connection");
    }
}

/// Returns `true` once the caller should stop entirely (shutdown observed).
async fn run_until_error(
    listener: &mut PgListener,
    queue: &str,
    tx: &mpsc::Sender<String>,
    shutdown: &mut tokio::sync::watch::Receiver<bool>,
) -> bool {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return true;
                }
            }
            recv = timeout(NOTIFICATION_POLL_TIMEOUT, listener.recv()) => {
                match recv {
                    Ok(Ok(notification)) => {
                        let payload = notification.payload().to_string();
                        if payload == SHUTDOWN_SENTINEL {
                            debug!(%queue, "observed shutdown sentinel");
                            return true;
                        }
                        if tx.send(payload).await.is_err() {
                            return true;
                        }
                    }
                    Ok(Err(e)) => {
                        warn!(%queue, error = %e, "listener error, reconnecting");
                        return false;
                    }
                    Err(_) => {
                        // Idle timeout; loop back around to re-check shutdown.
                        continue;
                    }
                }
            }
        }
    }
}

async fn drain_backlog(
    pool: &PgPool,
    queue: &str,
    tx: &mpsc::Sender<String>,
) -> Result<(), QueueError> {
    let started = std::time::Instant::now();
    let result = drain_backlog_once(pool, queue, tx).await;
    metrics::histogram!(BACKLOG_DRAIN_DURATION, "queue" => queue.to_string())
        .record(started.elapsed().as_secs_f64() * 1000.0);
    result
}

async fn drain_backlog_once(
    pool: &PgPool,
    queue: &str,
    tx: &mpsc::Sender<String>,
) -> Result<(), QueueError> {
    loop {
        match pick_pending_id(pool, queue).await? {
            Some(id) => {
                if tx.send(id.to_string()).await.is_err() {
                    return Ok(());
                }
            }
            None => return Ok(()),
        }
    }
}

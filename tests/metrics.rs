use metrics_exporter_prometheus::PrometheusBuilder;
use serde_json::json;
use sqlx::PgPool;

use queuectl_core::test_support::{insert, metrics_consts};
use queuectl_core::JobInit;

/// Installs the Prometheus recorder, exercises a code path that records a
/// metric, and checks the exported text names the metric the crate declares
/// for it. This is the only test in the binary that installs a global
/// recorder, since `metrics` only allows one per process.
#[sqlx::test(migrations = "./migrations")]
async fn enqueue_exports_a_prometheus_counter(pool: PgPool) {
    let handle = PrometheusBuilder::new()
        .install_recorder()
        .expect("install prometheus recorder");

    let init = JobInit::new("metrics-test", json!({"n": 1}));
    let mut tx = pool.begin().await.unwrap();
    insert(&mut tx, &init).await.unwrap();
    tx.commit().await.unwrap();

    let rendered = handle.render();
    assert!(
        rendered.contains(metrics_consts::JOBS_ENQUEUED),
        "expected {} in exported metrics, got:\n{rendered}",
        metrics_consts::JOBS_ENQUEUED
    );
}

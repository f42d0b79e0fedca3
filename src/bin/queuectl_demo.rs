use std::sync::Arc;

use envconfig::Envconfig;
use eyre::Result;
use futures::future::{select, Either};
use serde_json::json;

use queuectl_core::{Config, Handler, HandlerConfig, JobContext, JobError, JobInit};

struct Echo;

#[async_trait::async_trait]
impl Handler for Echo {
    async fn call(&self, ctx: &JobContext<'_>) -> Result<(), JobError> {
        tracing::info!(job = ctx.id(), payload = %ctx.payload(), "echo handler invoked");
        Ok(())
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();

    let config = Config::init_from_env()?;
    let backend = queuectl_core::Backend::new(config).await?;

    sqlx::migrate!("./migrations").run(backend.pool()).await?;

    backend
        .start("demo", Arc::new(Echo), HandlerConfig::new(4))
        .await?;

    backend
        .enqueue(JobInit::new("demo", json!({"message": "hello"})))
        .await?;

    let shutdown = Box::pin(tokio::signal::ctrl_c());
    let idle = Box::pin(tokio::time::sleep(std::time::Duration::from_secs(3600)));

    match select(shutdown, idle).await {
        Either::Left((_, _)) => tracing::info!("received ctrl-c, shutting down"),
        Either::Right((_, _)) => tracing::info!("idle window elapsed, shutting down"),
    }

    backend.shutdown().await;
    Ok(())
}

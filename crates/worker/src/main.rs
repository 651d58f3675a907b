mod app;

use std::sync::Arc;

use anyhow::Context;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use batchflow_events::{BusEvent, InMemoryEventBus};
use batchflow_infra::batch_store::{BatchStore, InMemoryBatchStore, PostgresBatchStore};
use batchflow_infra::config::WorkerConfig;
use batchflow_infra::event_bus::SharedPublisher;

use crate::app::Worker;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    if let Err(e) = dotenvy::dotenv() {
        if !e.not_found() {
            eprintln!("failed to load .env: {e}");
        }
    }
    batchflow_observability::init();

    let config = WorkerConfig::from_env();
    info!(
        worker_id = %config.coordinator.worker_id,
        heartbeat_interval = ?config.heartbeat_interval,
        poll_interval = ?config.coordinator.polling_interval,
        pool = config.coordinator.worker_pool_size,
        lease = ?config.coordinator.lease_duration,
        "starting worker"
    );

    let store = build_store(&config).await?;
    let bus = build_bus(&config)?;
    let shutdown = CancellationToken::new();

    // No activity processor ships with this binary; batches are left for
    // workers that have one.
    let worker = Worker::start(&config, store, bus, None, &shutdown);
    info!(processing_batches = worker.is_processing_batches(), "worker started");

    tokio::signal::ctrl_c()
        .await
        .context("failed to listen for shutdown signal")?;
    info!(status = ?worker.health().status, "shutdown requested");
    shutdown.cancel();

    worker.join().await?;
    Ok(())
}

async fn build_store(config: &WorkerConfig) -> anyhow::Result<Arc<dyn BatchStore>> {
    let Some(url) = config.database_url.as_deref() else {
        warn!("DATABASE_URL not set; batches are kept in memory and lost on exit");
        return Ok(InMemoryBatchStore::arc());
    };
    let pool = sqlx::PgPool::connect(url)
        .await
        .context("failed to connect to Postgres")?;
    let store = PostgresBatchStore::new(pool);
    store.ensure_schema().await.context("failed to create batch tables")?;
    info!("using Postgres batch store");
    Ok(Arc::new(store))
}

#[cfg(feature = "redis")]
fn build_bus(config: &WorkerConfig) -> anyhow::Result<SharedPublisher> {
    use batchflow_infra::event_bus::RedisPubSubEventBus;

    if let Some(url) = config.redis_url.as_deref() {
        let bus = RedisPubSubEventBus::new(url, "batchflow.events").context("failed to create Redis event bus")?;
        info!("publishing worker events to Redis");
        return Ok(Arc::new(bus));
    }
    Ok(local_bus())
}

#[cfg(not(feature = "redis"))]
fn build_bus(config: &WorkerConfig) -> anyhow::Result<SharedPublisher> {
    if config.redis_url.is_some() {
        warn!("REDIS_URL is set but the redis feature is disabled; events stay in-process");
    }
    Ok(local_bus())
}

/// In-process bus with no subscribers: alerts are still logged by the dispatcher.
fn local_bus() -> SharedPublisher {
    Arc::new(InMemoryEventBus::<BusEvent>::new())
}

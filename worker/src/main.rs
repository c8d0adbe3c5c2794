// Worker binary entry point

use anyhow::Result;
use common::bootstrap;
use common::cache::Cache;
use common::notify::RedisEventPublisher;
use common::storage::KeyValueStore;
use common::telemetry;
use common::worker::{CacheRefreshHandler, Worker};
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = bootstrap::init_runtime("worker")?;

    info!("Starting job worker");

    let redis_store = bootstrap::init_redis_store(&settings).await?;
    let publisher = Arc::new(RedisEventPublisher::new(redis_store.pool().clone()));
    let store: Arc<dyn KeyValueStore> = Arc::new(redis_store);

    let queue = bootstrap::init_queue(&settings, Arc::clone(&store));
    let lock = bootstrap::init_lock(&settings, Arc::clone(&store));
    let cache = Arc::new(Cache::new(Arc::clone(&store), &settings.cache));
    let registry = bootstrap::init_breaker_registry(&settings);

    let worker = Arc::new(
        Worker::new(
            queue,
            lock,
            Arc::new(CacheRefreshHandler::new(cache)),
            &settings.worker,
        )
        .with_policy(bootstrap::init_policy(&settings, &registry))
        .with_publisher(publisher),
    );

    info!(worker_id = %worker.id(), "Worker created, starting job processing");

    let worker_handle = {
        let worker = Arc::clone(&worker);
        tokio::spawn(async move {
            if let Err(e) = worker.start().await {
                error!(error = %e, "Worker error");
            }
        })
    };

    info!("Worker is running. Press Ctrl+C to shutdown gracefully");

    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received, initiating graceful shutdown"),
        Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
    }

    worker.shutdown();

    info!("Waiting for worker to complete in-flight jobs");
    if let Err(e) = worker_handle.await {
        error!(error = %e, "Worker task panicked");
    }

    telemetry::shutdown_tracer();
    info!("Worker shutdown complete");
    Ok(())
}

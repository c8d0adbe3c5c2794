// Scheduler binary entry point

use anyhow::Result;
use common::bootstrap;
use common::scheduler::{EnqueueTask, PeriodicTask, Scheduler, SchedulerEngine};
use common::storage::KeyValueStore;
use common::telemetry;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

#[tokio::main]
async fn main() -> Result<()> {
    let settings = bootstrap::init_runtime("scheduler")?;

    info!("Starting job scheduler");

    let store: Arc<dyn KeyValueStore> = Arc::new(bootstrap::init_redis_store(&settings).await?);
    let queue = bootstrap::init_queue(&settings, Arc::clone(&store));
    let lock = bootstrap::init_lock(&settings, Arc::clone(&store));

    let prewarm = EnqueueTask::prewarm(
        queue,
        settings.scheduler.prewarm_keys.clone(),
        Some(settings.cache.default_ttl_seconds),
    );
    let task = PeriodicTask::new(
        "external:prewarm",
        Duration::from_secs(settings.scheduler.prewarm_interval_seconds),
        Arc::new(prewarm),
    )
    .with_initial_delay(Duration::from_secs(
        settings.scheduler.prewarm_initial_delay_seconds,
    ))
    .with_lock_ttl(Duration::from_secs(settings.scheduler.prewarm_lock_ttl_seconds))
    .with_lock_wait(settings.lock.wait());

    let scheduler = Arc::new(SchedulerEngine::new(lock).with_task(task));
    info!("Scheduler engine created");

    {
        let scheduler = Arc::clone(&scheduler);
        tokio::spawn(async move {
            match tokio::signal::ctrl_c().await {
                Ok(()) => info!("Received Ctrl+C signal, initiating graceful shutdown"),
                Err(e) => error!(error = %e, "Failed to listen for shutdown signal"),
            }
            if let Err(e) = scheduler.stop().await {
                error!(error = %e, "Error during scheduler shutdown");
            }
        });
    }

    if let Err(e) = scheduler.start().await {
        error!(error = %e, "Scheduler error");
        return Err(e);
    }

    telemetry::shutdown_tracer();
    info!("Scheduler stopped");
    Ok(())
}

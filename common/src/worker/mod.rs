// Worker pool that pulls jobs from the queue and runs them under a partition lock

pub mod handlers;

pub use handlers::{CacheRefreshHandler, CacheRefreshPayload};

use crate::clock::{Clock, SystemClock};
use crate::config::WorkerConfig;
use crate::errors::{LockError, QueueError, WorkerError};
use crate::lock::{DistributedLock, LockToken};
use crate::models::Job;
use crate::notify::{publish_event, EventPublisher, JobEvent, LogEventPublisher};
use crate::queue::JobQueue;
use crate::resilience::{ResilienceError, ResiliencePolicy};
use crate::telemetry::{self, AlertNotifier, LogAlertNotifier};
use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio::time::Instant;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Business logic for one kind of job
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> anyhow::Result<()>;
}

/// What happened to a delivered job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobOutcome {
    Succeeded,
    /// Failed, a backoff retry is scheduled
    Retrying,
    /// Retries exhausted, moved to the dead letter queue
    Dead,
    /// Given back without consuming a retry
    Requeued,
    /// Lease lost mid-run, the result was discarded
    LeaseLost,
}

pub struct Worker {
    id: String,
    queue: Arc<JobQueue>,
    lock: Arc<dyn DistributedLock>,
    handler: Arc<dyn JobHandler>,
    policy: ResiliencePolicy,
    publisher: Arc<dyn EventPublisher>,
    alerts: Arc<dyn AlertNotifier>,
    clock: Arc<dyn Clock>,
    concurrency: u32,
    poll_interval: Duration,
    requeue_delay: Duration,
    event_channel: String,
    shutdown_flag: Arc<AtomicBool>,
    shutdown_notify: Arc<Notify>,
}

impl Worker {
    pub fn new(
        queue: Arc<JobQueue>,
        lock: Arc<dyn DistributedLock>,
        handler: Arc<dyn JobHandler>,
        config: &WorkerConfig,
    ) -> Self {
        let id = config
            .worker_id
            .clone()
            .unwrap_or_else(|| format!("worker-{}", Uuid::new_v4()));

        Self {
            id,
            policy: ResiliencePolicy::builder(queue.name()).build(),
            queue,
            lock,
            handler,
            publisher: Arc::new(LogEventPublisher),
            alerts: Arc::new(LogAlertNotifier),
            clock: Arc::new(SystemClock),
            concurrency: config.concurrency.max(1),
            poll_interval: Duration::from_millis(config.poll_interval_ms.max(1)),
            requeue_delay: Duration::from_millis(config.requeue_delay_ms),
            event_channel: config.event_channel.clone(),
            shutdown_flag: Arc::new(AtomicBool::new(false)),
            shutdown_notify: Arc::new(Notify::new()),
        }
    }

    /// Wrap every handler call in `policy`
    pub fn with_policy(mut self, policy: ResiliencePolicy) -> Self {
        self.policy = policy;
        self
    }

    pub fn with_publisher(mut self, publisher: Arc<dyn EventPublisher>) -> Self {
        self.publisher = publisher;
        self
    }

    pub fn with_alerts(mut self, alerts: Arc<dyn AlertNotifier>) -> Self {
        self.alerts = alerts;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Run `concurrency` polling loops until `shutdown` is called
    #[instrument(skip(self), fields(worker_id = %self.id, queue = %self.queue.name()))]
    pub async fn start(self: Arc<Self>) -> Result<(), WorkerError> {
        info!(concurrency = self.concurrency, "Starting worker");

        let mut loops = Vec::with_capacity(self.concurrency as usize);
        for slot in 0..self.concurrency {
            let worker = Arc::clone(&self);
            loops.push(tokio::spawn(async move { worker.poll_loop(slot).await }));
        }

        for handle in loops {
            if let Err(e) = handle.await {
                error!(error = %e, "Worker loop panicked");
            }
        }

        info!("Worker stopped");
        Ok(())
    }

    /// Request graceful shutdown; in-flight jobs finish first
    pub fn shutdown(&self) {
        info!(worker_id = %self.id, "Requesting worker shutdown");
        self.shutdown_flag.store(true, Ordering::SeqCst);
        self.shutdown_notify.notify_waiters();
    }

    async fn poll_loop(&self, slot: u32) {
        debug!(slot, "Worker loop started");
        while !self.shutdown_flag.load(Ordering::SeqCst) {
            let idle = match self.run_once().await {
                Ok(Some(_)) => false,
                Ok(None) => true,
                Err(e) => {
                    error!(slot, error = %e, "Failed to process job");
                    true
                }
            };

            if idle {
                tokio::select! {
                    _ = tokio::time::sleep(self.poll_interval) => {}
                    _ = self.shutdown_notify.notified() => {}
                }
            }
        }
        debug!(slot, "Worker loop stopped");
    }

    /// Claim and process at most one job
    pub async fn run_once(&self) -> Result<Option<JobOutcome>, WorkerError> {
        let claim = self.queue.claim(&self.id).await?;
        for job in &claim.exhausted {
            let error = job
                .last_error
                .clone()
                .unwrap_or_else(|| "lease expired".to_string());
            self.report_dead(job, &error, job.retry_count).await;
        }

        match claim.job {
            Some(job) => self.process(job).await.map(Some),
            None if !claim.exhausted.is_empty() => Ok(Some(JobOutcome::Dead)),
            None => Ok(None),
        }
    }

    #[instrument(skip(self, job), fields(
        worker_id = %self.id,
        job_id = %job.id,
        partition_key = %job.partition_key,
        delivery = job.deliveries
    ))]
    async fn process(&self, job: Job) -> Result<JobOutcome, WorkerError> {
        let lock_key = format!("partition:{}", job.partition_key);
        let lease = self.queue.visibility_timeout();

        let token = match self.lock.acquire(&lock_key, lease).await {
            Ok(token) => token,
            Err(LockError::Unavailable(_)) => {
                debug!("Partition busy, requeueing job");
                self.queue
                    .requeue(job.id, &self.id, self.requeue_delay)
                    .await?;
                return Ok(JobOutcome::Requeued);
            }
            Err(e) => return Err(e.into()),
        };

        let (lost_tx, mut lost_rx) = watch::channel(false);
        let keeper = tokio::spawn(keep_lease(
            Arc::clone(&self.queue),
            Arc::clone(&self.lock),
            job.id,
            self.id.clone(),
            token.clone(),
            lease,
            lost_tx,
        ));

        let started = Instant::now();
        let execution = self.policy.execute(|| self.handler.handle(&job));
        let result = tokio::select! {
            result = execution => Some(result),
            _ = lease_lost(&mut lost_rx) => None,
        };
        keeper.abort();
        telemetry::record_job_duration(self.queue.name(), started.elapsed().as_secs_f64());

        let outcome = match result {
            Some(result) => self.settle(&job, result).await,
            None => {
                warn!("Lease lost during execution, result discarded");
                Ok(JobOutcome::LeaseLost)
            }
        };

        if let Err(e) = self.lock.release(&lock_key, &token.token).await {
            warn!(lock_key = %lock_key, error = %e, "Failed to release partition lock");
        }
        outcome
    }

    /// Record the handler result on the queue and announce it
    async fn settle(
        &self,
        job: &Job,
        result: Result<(), ResilienceError<anyhow::Error>>,
    ) -> Result<JobOutcome, WorkerError> {
        let now = self.clock.now();

        let error = match result {
            Ok(()) => {
                return match self.queue.ack(job.id, &self.id).await {
                    Ok(()) => {
                        info!("Job succeeded");
                        self.announce(JobEvent::succeeded(job, now)).await;
                        Ok(JobOutcome::Succeeded)
                    }
                    Err(e) => self.lease_gone_or(e),
                };
            }
            Err(e @ ResilienceError::CircuitOpen { .. }) => {
                // Downstream is known to be unavailable; do not spend a retry
                info!(error = %e, "Circuit open, requeueing job");
                return match self.queue.requeue(job.id, &self.id, self.requeue_delay).await {
                    Ok(()) => Ok(JobOutcome::Requeued),
                    Err(e) => self.lease_gone_or(e),
                };
            }
            Err(e) => e.to_string(),
        };

        match self.queue.fail(job.id, &self.id, &error).await {
            Ok(()) => {
                self.announce(JobEvent::failed(job, &error, now)).await;
                Ok(JobOutcome::Retrying)
            }
            Err(QueueError::JobExhausted { attempts, .. }) => {
                error!(attempts, error = %error, "Job exhausted its retries");
                self.report_dead(job, &error, attempts).await;
                Ok(JobOutcome::Dead)
            }
            Err(e) => self.lease_gone_or(e),
        }
    }

    /// Alert on a dead-lettered job and announce it
    async fn report_dead(&self, job: &Job, error: &str, attempts: u32) {
        if let Err(e) = self.alerts.send_alert(&job.id, self.queue.name(), attempts).await {
            warn!(job_id = %job.id, error = %e, "Failed to send exhausted job alert");
        }
        self.announce(JobEvent::dead(job, error, self.clock.now())).await;
    }

    fn lease_gone_or(&self, err: QueueError) -> Result<JobOutcome, WorkerError> {
        match err {
            QueueError::NotLeaseHolder { .. } | QueueError::InvalidState { .. } => {
                warn!(error = %err, "Lease taken over before the result was recorded");
                Ok(JobOutcome::LeaseLost)
            }
            other => Err(other.into()),
        }
    }

    async fn announce(&self, event: JobEvent) {
        if let Err(e) = publish_event(self.publisher.as_ref(), &self.event_channel, &event).await {
            warn!(event = %event.event, error = %e, "Failed to publish job event");
        }
    }
}

/// Renew the partition lock and the job lease every third of the lease.
/// Flags `lost` and stops at the first failed renewal.
async fn keep_lease(
    queue: Arc<JobQueue>,
    lock: Arc<dyn DistributedLock>,
    job_id: Uuid,
    worker_id: String,
    token: LockToken,
    lease: Duration,
    lost: watch::Sender<bool>,
) {
    let period = (lease / 3).max(Duration::from_millis(10));
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);

    loop {
        ticker.tick().await;

        if let Err(e) = lock.renew(&token.key, &token.token, lease).await {
            warn!(job_id = %job_id, error = %e, "Failed to renew partition lock");
            let _ = lost.send(true);
            return;
        }
        if let Err(e) = queue.extend_lease(job_id, &worker_id, lease).await {
            warn!(job_id = %job_id, error = %e, "Failed to extend job lease");
            let _ = lost.send(true);
            return;
        }
        debug!(job_id = %job_id, "Lease renewed");
    }
}

/// Resolves once the keeper reports a lost lease
async fn lease_lost(lost: &mut watch::Receiver<bool>) {
    if lost.wait_for(|lost| *lost).await.is_err() {
        // Keeper gone without reporting a loss
        std::future::pending::<()>().await;
    }
}

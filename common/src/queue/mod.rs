// At-least-once job queue over the backing store
//
// Each job is a versioned record; a sorted "ready" set orders members by the
// instant they next become claimable. Claiming is a compare-and-set on the job
// record, so concurrent workers can never both win the same delivery.

pub mod dlq;

pub use dlq::{DeadLetterQueue, DlqStats};

use crate::clock::{deadline, Clock, SystemClock};
use crate::config::QueueConfig;
use crate::errors::QueueError;
use crate::models::{Job, JobStatus};
use crate::retry::{ExponentialBackoff, RetryStrategy};
use crate::storage::{encode, KeyValueStore};
use crate::telemetry;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, info, instrument, warn};
use uuid::Uuid;

/// Attempts at a leased update before giving up with `Conflict`
const MAX_UPDATE_ATTEMPTS: u32 = 3;

/// Result of one claim attempt
#[derive(Debug, Default)]
pub struct Claim {
    /// Job now leased to the caller
    pub job: Option<Job>,
    /// Jobs dead-lettered during the scan because their leases kept expiring
    pub exhausted: Vec<Job>,
}

/// Store keys for one queue
#[derive(Debug, Clone)]
pub(crate) struct QueueKeys {
    name: String,
}

impl QueueKeys {
    pub(crate) fn new(name: &str) -> Self {
        Self {
            name: name.to_string(),
        }
    }

    pub(crate) fn job(&self, id: &Uuid) -> String {
        format!("queue:{}:job:{}", self.name, id)
    }

    pub(crate) fn ready(&self) -> String {
        format!("queue:{}:ready", self.name)
    }

    pub(crate) fn dead(&self) -> String {
        format!("queue:{}:dead", self.name)
    }
}

/// Durable work queue with leases, backoff retries and a dead letter set
pub struct JobQueue {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    keys: QueueKeys,
    name: String,
    max_retries: u32,
    visibility_timeout: Duration,
    completed_retention: Duration,
    dequeue_batch: usize,
    backoff: Arc<dyn RetryStrategy>,
}

impl JobQueue {
    pub fn new(store: Arc<dyn KeyValueStore>, config: &QueueConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            keys: QueueKeys::new(&config.name),
            name: config.name.clone(),
            max_retries: config.max_retries,
            visibility_timeout: config.visibility_timeout(),
            completed_retention: config.completed_retention(),
            dequeue_batch: config.dequeue_batch.max(1),
            backoff: Arc::new(ExponentialBackoff::for_queue(config)),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Replace the delay curve between failed attempts
    pub fn with_backoff(mut self, backoff: impl RetryStrategy + 'static) -> Self {
        self.backoff = Arc::new(backoff);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn visibility_timeout(&self) -> Duration {
        self.visibility_timeout
    }

    /// Operator view of dead-lettered jobs
    pub fn dead_letters(&self) -> DeadLetterQueue {
        DeadLetterQueue::new(
            Arc::clone(&self.store),
            Arc::clone(&self.clock),
            &self.name,
        )
    }

    /// Enqueue a job that is deliverable immediately
    pub async fn enqueue(&self, payload: Vec<u8>, partition_key: &str) -> Result<Uuid, QueueError> {
        let now = self.clock.now();
        self.enqueue_at(payload, partition_key, now).await
    }

    /// Enqueue a job that becomes deliverable at `available_at`
    #[instrument(skip(self, payload), fields(queue = %self.name))]
    pub async fn enqueue_at(
        &self,
        payload: Vec<u8>,
        partition_key: &str,
        available_at: DateTime<Utc>,
    ) -> Result<Uuid, QueueError> {
        let now = self.clock.now();
        let job = Job::new(&self.name, payload, partition_key, now, available_at);

        let written = self
            .store
            .compare_and_set(&self.keys.job(&job.id), None, &encode(&job)?, None)
            .await?;
        if written.is_none() {
            return Err(QueueError::Conflict(job.id));
        }

        self.store
            .schedule(
                &self.keys.ready(),
                &job.id.to_string(),
                available_at.timestamp_millis(),
            )
            .await?;

        telemetry::record_job_enqueued(&self.name);
        debug!(job_id = %job.id, partition_key = %partition_key, "Job enqueued");
        Ok(job.id)
    }

    /// Claim the next deliverable job for `worker_id`
    ///
    /// The claim holds a lease for the visibility timeout. Unless the job is
    /// acknowledged, failed or requeued first, it becomes deliverable again
    /// once the lease expires.
    pub async fn dequeue(&self, worker_id: &str) -> Result<Option<Job>, QueueError> {
        Ok(self.claim(worker_id).await?.job)
    }

    /// Like `dequeue`, but also hands back the jobs dead-lettered on the way
    /// so the caller can report them.
    #[instrument(skip(self), fields(queue = %self.name))]
    pub async fn claim(&self, worker_id: &str) -> Result<Claim, QueueError> {
        let now = self.clock.now();
        let mut claim = Claim::default();
        let candidates = self
            .store
            .due(&self.keys.ready(), now.timestamp_millis(), self.dequeue_batch)
            .await?;

        for member in candidates {
            let Ok(job_id) = Uuid::parse_str(&member) else {
                warn!(member = %member, "Dropping malformed ready set member");
                self.store.unschedule(&self.keys.ready(), &member).await?;
                continue;
            };

            let job_key = self.keys.job(&job_id);
            let Some(record) = self.store.get(&job_key).await? else {
                debug!(job_id = %job_id, "Dropping ready set member without a record");
                self.store.unschedule(&self.keys.ready(), &member).await?;
                continue;
            };

            let mut job: Job = record.decode()?;
            if job.is_terminal() {
                self.store.unschedule(&self.keys.ready(), &member).await?;
                continue;
            }
            if !job.is_claimable(now) {
                continue;
            }

            let redelivery = job.status == JobStatus::Running;
            if redelivery {
                // An expired lease counts as a failed attempt
                job.retry_count += 1;
                job.last_error = Some(format!(
                    "lease held by {} expired",
                    job.lease_owner.as_deref().unwrap_or("unknown worker")
                ));
                if job.retry_count > self.max_retries {
                    if self.dead_letter(&mut job, record.version, now).await? {
                        error!(
                            job_id = %job.id,
                            attempts = job.retry_count,
                            "Job exhausted its retries through expired leases"
                        );
                        claim.exhausted.push(job);
                    }
                    continue;
                }
            }

            let lease_expires_at = deadline(now, self.visibility_timeout);
            job.status = JobStatus::Running;
            job.lease_owner = Some(worker_id.to_string());
            job.lease_expires_at = Some(lease_expires_at);
            job.deliveries += 1;
            job.updated_at = now;

            let claimed = self
                .store
                .compare_and_set(&job_key, Some(record.version), &encode(&job)?, None)
                .await?;
            if claimed.is_none() {
                debug!(job_id = %job.id, "Lost claim race, trying next candidate");
                continue;
            }

            self.store
                .schedule(
                    &self.keys.ready(),
                    &member,
                    lease_expires_at.timestamp_millis(),
                )
                .await?;

            if redelivery {
                telemetry::record_job_redelivered(&self.name);
                info!(job_id = %job.id, deliveries = job.deliveries, "Job redelivered after lease expiry");
            }
            debug!(job_id = %job.id, worker_id = %worker_id, "Job claimed");
            claim.job = Some(job);
            return Ok(claim);
        }

        Ok(claim)
    }

    /// Mark a leased job as succeeded
    #[instrument(skip(self), fields(queue = %self.name))]
    pub async fn ack(&self, job_id: Uuid, worker_id: &str) -> Result<(), QueueError> {
        let now = self.clock.now();
        let retention = self.completed_retention;
        self.update_leased(job_id, worker_id, Some(retention), |job| {
            job.status = JobStatus::Succeeded;
            job.clear_lease();
            job.updated_at = now;
        })
        .await?;

        self.store
            .unschedule(&self.keys.ready(), &job_id.to_string())
            .await?;
        telemetry::record_job_success(&self.name);
        debug!(job_id = %job_id, "Job acknowledged");
        Ok(())
    }

    /// Record a failed attempt
    ///
    /// Schedules a backoff retry while retries remain. Otherwise the job is
    /// moved to the dead letter set and `JobExhausted` is returned.
    #[instrument(skip(self, reason), fields(queue = %self.name))]
    pub async fn fail(&self, job_id: Uuid, worker_id: &str, reason: &str) -> Result<(), QueueError> {
        let now = self.clock.now();
        let max_retries = self.max_retries;
        let backoff = Arc::clone(&self.backoff);

        let job = self
            .update_leased(job_id, worker_id, None, |job| {
                job.retry_count += 1;
                job.last_error = Some(reason.to_string());
                job.clear_lease();
                job.updated_at = now;
                if job.retry_count > max_retries {
                    job.status = JobStatus::Dead;
                } else {
                    let delay = backoff
                        .next_delay(job.retry_count - 1)
                        .unwrap_or_default();
                    job.status = JobStatus::Failed;
                    job.available_at = deadline(now, delay);
                }
            })
            .await?;

        if job.status == JobStatus::Dead {
            self.park_dead(&job, now).await?;
            error!(
                job_id = %job.id,
                attempts = job.retry_count,
                last_error = %reason,
                "Job exhausted its retries and was moved to the dead letter queue"
            );
            return Err(QueueError::JobExhausted {
                job_id: job.id,
                attempts: job.retry_count,
            });
        }

        self.store
            .schedule(
                &self.keys.ready(),
                &job_id.to_string(),
                job.available_at.timestamp_millis(),
            )
            .await?;
        telemetry::record_job_failure(&self.name);
        warn!(
            job_id = %job.id,
            retry_count = job.retry_count,
            max_retries = self.max_retries,
            retry_at = %job.available_at,
            error = %reason,
            "Job failed, retry scheduled"
        );
        Ok(())
    }

    /// Hand a leased job back without consuming a retry
    #[instrument(skip(self), fields(queue = %self.name))]
    pub async fn requeue(
        &self,
        job_id: Uuid,
        worker_id: &str,
        delay: Duration,
    ) -> Result<(), QueueError> {
        let now = self.clock.now();
        let job = self
            .update_leased(job_id, worker_id, None, |job| {
                job.status = JobStatus::Pending;
                job.available_at = deadline(now, delay);
                job.clear_lease();
                job.updated_at = now;
            })
            .await?;

        self.store
            .schedule(
                &self.keys.ready(),
                &job_id.to_string(),
                job.available_at.timestamp_millis(),
            )
            .await?;
        debug!(job_id = %job_id, delay_ms = delay.as_millis() as u64, "Job requeued");
        Ok(())
    }

    /// Extend the lease of a running job to `now + visibility`
    pub async fn extend_lease(
        &self,
        job_id: Uuid,
        worker_id: &str,
        visibility: Duration,
    ) -> Result<DateTime<Utc>, QueueError> {
        let now = self.clock.now();
        let expires_at = deadline(now, visibility);
        self.update_leased(job_id, worker_id, None, |job| {
            job.lease_expires_at = Some(expires_at);
            job.updated_at = now;
        })
        .await?;

        self.store
            .schedule(
                &self.keys.ready(),
                &job_id.to_string(),
                expires_at.timestamp_millis(),
            )
            .await?;
        Ok(expires_at)
    }

    pub async fn get(&self, job_id: Uuid) -> Result<Option<Job>, QueueError> {
        match self.store.get(&self.keys.job(&job_id)).await? {
            Some(record) => Ok(Some(record.decode()?)),
            None => Ok(None),
        }
    }

    /// Jobs waiting, backing off or leased
    pub async fn ready_len(&self) -> Result<u64, QueueError> {
        let len = self.store.scheduled_len(&self.keys.ready()).await?;
        telemetry::update_queue_size(&self.name, len);
        Ok(len)
    }

    pub async fn dead_len(&self) -> Result<u64, QueueError> {
        Ok(self.store.scheduled_len(&self.keys.dead()).await?)
    }

    /// Apply `mutate` to a job leased by `worker_id` and write it back with
    /// compare-and-set, re-reading on a lost race.
    async fn update_leased<F>(
        &self,
        job_id: Uuid,
        worker_id: &str,
        ttl: Option<Duration>,
        mutate: F,
    ) -> Result<Job, QueueError>
    where
        F: Fn(&mut Job),
    {
        let key = self.keys.job(&job_id);

        for _ in 0..MAX_UPDATE_ATTEMPTS {
            let record = self
                .store
                .get(&key)
                .await?
                .ok_or(QueueError::JobNotFound(job_id))?;
            let mut job: Job = record.decode()?;

            if job.status != JobStatus::Running {
                return Err(QueueError::InvalidState {
                    job_id,
                    status: job.status.to_string(),
                    expected: JobStatus::Running.to_string(),
                });
            }
            if job.lease_owner.as_deref() != Some(worker_id) {
                return Err(QueueError::NotLeaseHolder {
                    job_id,
                    worker_id: worker_id.to_string(),
                });
            }

            mutate(&mut job);
            if self
                .store
                .compare_and_set(&key, Some(record.version), &encode(&job)?, ttl)
                .await?
                .is_some()
            {
                return Ok(job);
            }
        }

        Err(QueueError::Conflict(job_id))
    }

    /// Move a job found with an exhausted budget to the dead set.
    /// Returns false if another worker changed the record first.
    async fn dead_letter(
        &self,
        job: &mut Job,
        version: u64,
        now: DateTime<Utc>,
    ) -> Result<bool, QueueError> {
        job.status = JobStatus::Dead;
        job.clear_lease();
        job.updated_at = now;

        let written = self
            .store
            .compare_and_set(&self.keys.job(&job.id), Some(version), &encode(job)?, None)
            .await?;
        if written.is_none() {
            return Ok(false);
        }
        self.park_dead(job, now).await?;
        Ok(true)
    }

    async fn park_dead(&self, job: &Job, now: DateTime<Utc>) -> Result<(), QueueError> {
        let member = job.id.to_string();
        self.store.unschedule(&self.keys.ready(), &member).await?;
        self.store
            .schedule(&self.keys.dead(), &member, now.timestamp_millis())
            .await?;
        telemetry::record_job_dead(&self.name);
        Ok(())
    }
}

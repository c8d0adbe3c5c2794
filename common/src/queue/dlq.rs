// Dead Letter Queue handling for jobs that exhausted their retries
//
// Dead jobs stay out of the ready set until an operator retries or purges them.

use super::QueueKeys;
use crate::clock::Clock;
use crate::errors::QueueError;
use crate::models::{Job, JobStatus};
use crate::storage::{encode, KeyValueStore};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::{info, instrument, warn};
use uuid::Uuid;

/// Dead Letter Queue handler for one job queue
pub struct DeadLetterQueue {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    keys: QueueKeys,
    name: String,
}

/// Statistics about the Dead Letter Queue
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DlqStats {
    pub queue: String,
    pub total_dead: u64,
    pub oldest_dead_at: Option<DateTime<Utc>>,
}

impl DeadLetterQueue {
    pub(crate) fn new(store: Arc<dyn KeyValueStore>, clock: Arc<dyn Clock>, queue: &str) -> Self {
        Self {
            store,
            clock,
            keys: QueueKeys::new(queue),
            name: queue.to_string(),
        }
    }

    /// Dead jobs, oldest first
    pub async fn list(&self, limit: usize) -> Result<Vec<Job>, QueueError> {
        let members = self.store.due(&self.keys.dead(), i64::MAX, limit).await?;

        let mut jobs = Vec::with_capacity(members.len());
        for member in members {
            let Ok(job_id) = Uuid::parse_str(&member) else {
                continue;
            };
            match self.store.get(&self.keys.job(&job_id)).await? {
                Some(record) => jobs.push(record.decode()?),
                None => {
                    warn!(dlq = %self.name, job_id = %job_id, "Dead job record missing, dropping entry");
                    self.store.unschedule(&self.keys.dead(), &member).await?;
                }
            }
        }
        Ok(jobs)
    }

    /// Manually retry a job from the Dead Letter Queue
    ///
    /// The retry count is reset and the job is deliverable immediately.
    #[instrument(skip(self), fields(dlq = %self.name))]
    pub async fn retry(&self, job_id: Uuid) -> Result<Job, QueueError> {
        let key = self.keys.job(&job_id);
        let record = self
            .store
            .get(&key)
            .await?
            .ok_or(QueueError::JobNotFound(job_id))?;
        let mut job: Job = record.decode()?;

        if job.status != JobStatus::Dead {
            return Err(QueueError::InvalidState {
                job_id,
                status: job.status.to_string(),
                expected: JobStatus::Dead.to_string(),
            });
        }

        let now = self.clock.now();
        let previous_attempts = job.retry_count;
        job.status = JobStatus::Pending;
        job.retry_count = 0;
        job.available_at = now;
        job.clear_lease();
        job.updated_at = now;

        if self
            .store
            .compare_and_set(&key, Some(record.version), &encode(&job)?, None)
            .await?
            .is_none()
        {
            return Err(QueueError::Conflict(job_id));
        }

        let member = job_id.to_string();
        self.store.unschedule(&self.keys.dead(), &member).await?;
        self.store
            .schedule(&self.keys.ready(), &member, now.timestamp_millis())
            .await?;

        info!(
            dlq = %self.name,
            job_id = %job_id,
            previous_attempts,
            "Manually retrying job from Dead Letter Queue"
        );
        Ok(job)
    }

    /// Permanently remove a dead job
    pub async fn purge(&self, job_id: Uuid) -> Result<bool, QueueError> {
        let member = job_id.to_string();
        let listed = self.store.unschedule(&self.keys.dead(), &member).await?;
        if !listed {
            return Ok(false);
        }
        self.store.delete(&self.keys.job(&job_id)).await?;
        info!(dlq = %self.name, job_id = %job_id, "Purged job from Dead Letter Queue");
        Ok(true)
    }

    pub async fn stats(&self) -> Result<DlqStats, QueueError> {
        let total_dead = self.store.scheduled_len(&self.keys.dead()).await?;
        let oldest = self.store.due(&self.keys.dead(), i64::MAX, 1).await?;

        let oldest_dead_at = match oldest.first().and_then(|m| Uuid::parse_str(m).ok()) {
            Some(job_id) => match self.store.get(&self.keys.job(&job_id)).await? {
                Some(record) => Some(record.decode::<Job>()?.updated_at),
                None => None,
            },
            None => None,
        };

        Ok(DlqStats {
            queue: self.name.clone(),
            total_dead,
            oldest_dead_at,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::super::JobQueue;
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::QueueConfig;
    use crate::retry::FixedDelay;
    use crate::storage::MemoryStore;
    use std::time::Duration;

    /// Queue with no retries so one failure dead-letters
    fn queue() -> (JobQueue, ManualClock) {
        let clock = ManualClock::default();
        let store = Arc::new(MemoryStore::with_clock(Arc::new(clock.clone())));
        let config = QueueConfig {
            max_retries: 0,
            ..QueueConfig::default()
        };
        let queue = JobQueue::new(store, &config)
            .with_clock(Arc::new(clock.clone()))
            .with_backoff(FixedDelay::new(Duration::from_secs(1), 0));
        (queue, clock)
    }

    async fn kill(queue: &JobQueue, partition: &str) -> Uuid {
        let id = queue.enqueue(Vec::new(), partition).await.unwrap();
        let job = queue.dequeue("w1").await.unwrap().unwrap();
        assert_eq!(job.id, id);
        let err = queue.fail(id, "w1", "fatal").await.unwrap_err();
        assert!(matches!(err, QueueError::JobExhausted { .. }));
        id
    }

    #[tokio::test]
    async fn test_list_dead_jobs() {
        let (queue, clock) = queue();
        let first = kill(&queue, "a").await;
        clock.advance(Duration::from_millis(10));
        let second = kill(&queue, "b").await;

        let dead = queue.dead_letters().list(10).await.unwrap();
        let ids: Vec<Uuid> = dead.iter().map(|j| j.id).collect();
        assert_eq!(ids, vec![first, second]);
        assert!(dead.iter().all(|j| j.status == JobStatus::Dead));
        assert_eq!(dead[0].last_error.as_deref(), Some("fatal"));
    }

    #[tokio::test]
    async fn test_manual_retry_resets_attempts() {
        let (queue, _) = queue();
        let id = kill(&queue, "a").await;
        let dlq = queue.dead_letters();

        let job = dlq.retry(id).await.unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.retry_count, 0);
        assert_eq!(queue.dead_len().await.unwrap(), 0);

        let redelivered = queue.dequeue("w2").await.unwrap().unwrap();
        assert_eq!(redelivered.id, id);
    }

    #[tokio::test]
    async fn test_retry_rejects_live_job() {
        let (queue, _) = queue();
        let id = queue.enqueue(Vec::new(), "a").await.unwrap();

        let err = queue.dead_letters().retry(id).await.unwrap_err();
        assert!(matches!(err, QueueError::InvalidState { .. }));
    }

    #[tokio::test]
    async fn test_purge_removes_job() {
        let (queue, _) = queue();
        let id = kill(&queue, "a").await;
        let dlq = queue.dead_letters();

        assert!(dlq.purge(id).await.unwrap());
        assert!(!dlq.purge(id).await.unwrap());
        assert!(queue.get(id).await.unwrap().is_none());
        assert_eq!(dlq.stats().await.unwrap().total_dead, 0);
    }

    #[tokio::test]
    async fn test_stats() {
        let (queue, clock) = queue();
        let dlq = queue.dead_letters();

        let empty = dlq.stats().await.unwrap();
        assert_eq!(empty.total_dead, 0);
        assert_eq!(empty.oldest_dead_at, None);

        let died_at = clock.now();
        kill(&queue, "a").await;
        clock.advance(Duration::from_secs(5));
        kill(&queue, "b").await;

        let stats = dlq.stats().await.unwrap();
        assert_eq!(stats.queue, "default");
        assert_eq!(stats.total_dead, 2);
        assert_eq!(stats.oldest_dead_at, Some(died_at));
    }
}

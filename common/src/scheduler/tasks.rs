// Periodic task actions

use super::engine::TaskAction;
use crate::clock::{Clock, SystemClock};
use crate::queue::JobQueue;
use crate::worker::CacheRefreshPayload;
use anyhow::{Context, Result};
use async_trait::async_trait;
use std::sync::Arc;
use tracing::debug;

/// Enqueues one cache refresh job per key, partitioned by key
pub struct EnqueueTask {
    queue: Arc<JobQueue>,
    keys: Vec<String>,
    key_prefix: String,
    ttl_seconds: Option<u64>,
    clock: Arc<dyn Clock>,
}

impl EnqueueTask {
    /// Prewarm `prewarm:{key}` cache entries
    pub fn prewarm(queue: Arc<JobQueue>, keys: Vec<String>, ttl_seconds: Option<u64>) -> Self {
        Self {
            queue,
            keys,
            key_prefix: "prewarm".to_string(),
            ttl_seconds,
            clock: Arc::new(SystemClock),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }
}

#[async_trait]
impl TaskAction for EnqueueTask {
    async fn run(&self) -> Result<usize> {
        let now = self.clock.now();
        for key in &self.keys {
            let payload = CacheRefreshPayload {
                key: format!("{}:{}", self.key_prefix, key),
                value: serde_json::json!({ "key": key, "prewarmed_at": now }),
                ttl_seconds: self.ttl_seconds,
            };
            let bytes = serde_json::to_vec(&payload)?;
            let job_id = self
                .queue
                .enqueue(bytes, key)
                .await
                .with_context(|| format!("Failed to enqueue refresh for {}", key))?;
            debug!(key = %key, job_id = %job_id, "Refresh job enqueued");
        }
        Ok(self.keys.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::QueueConfig;
    use crate::storage::MemoryStore;

    #[tokio::test]
    async fn test_enqueues_one_job_per_key() {
        let queue = Arc::new(JobQueue::new(
            Arc::new(MemoryStore::new()),
            &QueueConfig::default(),
        ));
        let keys = vec!["seoul".to_string(), "busan".to_string(), "tokyo".to_string()];
        let task = EnqueueTask::prewarm(Arc::clone(&queue), keys.clone(), Some(300));

        assert_eq!(task.run().await.unwrap(), 3);
        assert_eq!(queue.ready_len().await.unwrap(), 3);

        let mut partitions = Vec::new();
        while let Some(job) = queue.dequeue("w").await.unwrap() {
            let payload: CacheRefreshPayload = job.payload_json().unwrap();
            assert_eq!(payload.key, format!("prewarm:{}", job.partition_key));
            assert_eq!(payload.ttl_seconds, Some(300));
            partitions.push(job.partition_key);
        }
        partitions.sort();
        assert_eq!(partitions, vec!["busan", "seoul", "tokyo"]);
    }
}

// Property-based tests for queue delivery, retries and dead lettering

use chrono::{TimeZone, Utc};
use common::clock::ManualClock;
use common::config::QueueConfig;
use common::errors::QueueError;
use common::models::JobStatus;
use common::queue::JobQueue;
use common::retry::FixedDelay;
use common::storage::{KeyValueStore, MemoryStore};
use proptest::prelude::*;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

fn runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_multi_thread()
        .worker_threads(4)
        .enable_all()
        .build()
        .unwrap()
}

fn queue_config(max_retries: u32) -> QueueConfig {
    QueueConfig {
        max_retries,
        visibility_timeout_seconds: 30,
        ..QueueConfig::default()
    }
}

/// **Property: exclusive delivery**
///
/// *For any* number of jobs and concurrent workers, every job is claimed by
/// exactly one worker while its lease is valid.
#[test]
fn property_concurrent_dequeuers_never_share_a_job() {
    proptest!(ProptestConfig::with_cases(32), |(
        jobs in 1usize..40usize,
        workers in 2usize..8usize
    )| {
        let runtime = runtime();
        let claimed = runtime.block_on(async {
            let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
            let queue = Arc::new(JobQueue::new(store, &queue_config(3)));
            for i in 0..jobs {
                queue
                    .enqueue(format!("{{\"n\":{}}}", i).into_bytes(), &format!("p{}", i % 3))
                    .await
                    .unwrap();
            }

            let mut handles = Vec::new();
            for w in 0..workers {
                let queue = Arc::clone(&queue);
                handles.push(tokio::spawn(async move {
                    let worker_id = format!("worker-{}", w);
                    let mut mine = Vec::new();
                    while let Some(job) = queue.dequeue(&worker_id).await.unwrap() {
                        assert_eq!(job.lease_owner.as_deref(), Some(worker_id.as_str()));
                        mine.push(job.id);
                    }
                    mine
                }));
            }

            let mut claimed = Vec::new();
            for handle in handles {
                claimed.extend(handle.await.unwrap());
            }
            claimed
        });

        let unique: HashSet<_> = claimed.iter().collect();
        prop_assert_eq!(unique.len(), claimed.len(), "a job was delivered twice");
        prop_assert_eq!(claimed.len(), jobs);
    });
}

/// **Property: retry exhaustion**
///
/// *For any* retry budget, a job that always fails is delivered
/// `max_retries + 1` times, then lands in the dead letter queue and is
/// never delivered again.
#[test]
fn property_exhausted_jobs_are_dead_lettered() {
    proptest!(|(max_retries in 0u32..6u32)| {
        let runtime = runtime();
        runtime.block_on(async {
            let clock = Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            ));
            let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::with_clock(clock.clone()));
            let queue = JobQueue::new(store, &queue_config(max_retries))
                .with_clock(clock.clone())
                .with_backoff(FixedDelay::new(Duration::from_secs(1), max_retries));

            let job_id = queue.enqueue(b"{}".to_vec(), "seoul").await.unwrap();

            for attempt in 0..=max_retries {
                let job = queue.dequeue("w").await.unwrap().expect("job deliverable");
                assert_eq!(job.id, job_id);
                assert_eq!(job.retry_count, attempt);

                let result = queue.fail(job_id, "w", "boom").await;
                if attempt < max_retries {
                    assert!(result.is_ok());
                    clock.advance(Duration::from_secs(1));
                } else {
                    assert!(matches!(
                        result,
                        Err(QueueError::JobExhausted { attempts, .. }) if attempts == max_retries + 1
                    ));
                }
            }

            clock.advance(Duration::from_secs(3_600));
            assert!(queue.dequeue("w").await.unwrap().is_none());
            assert_eq!(queue.dead_len().await.unwrap(), 1);
            let dead = queue.get(job_id).await.unwrap().unwrap();
            assert_eq!(dead.status, JobStatus::Dead);
        });
    });
}

/// **Property: crash redelivery**
///
/// *For any* lease overshoot, a job whose worker never acknowledges it is
/// invisible before the lease expires and redelivered afterwards.
#[test]
fn property_unacked_job_redelivered_after_lease() {
    proptest!(|(
        before_expiry_secs in 0u64..30u64,
        overshoot_secs in 0u64..600u64
    )| {
        let runtime = runtime();
        runtime.block_on(async {
            let clock = Arc::new(ManualClock::new(
                Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap(),
            ));
            let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::with_clock(clock.clone()));
            let queue = JobQueue::new(store, &queue_config(3)).with_clock(clock.clone());

            let job_id = queue.enqueue(b"{}".to_vec(), "busan").await.unwrap();
            let first = queue.dequeue("crashed").await.unwrap().unwrap();
            assert_eq!(first.id, job_id);

            clock.advance(Duration::from_secs(before_expiry_secs));
            assert!(queue.dequeue("other").await.unwrap().is_none());

            clock.advance(Duration::from_secs(30 - before_expiry_secs + overshoot_secs));
            let second = queue.dequeue("other").await.unwrap().expect("redelivered");
            assert_eq!(second.id, job_id);
            assert_eq!(second.deliveries, 2);
            assert_eq!(second.lease_owner.as_deref(), Some("other"));

            // The crashed worker can no longer settle the job
            assert!(matches!(
                queue.ack(job_id, "crashed").await,
                Err(QueueError::NotLeaseHolder { .. })
            ));
        });
    });
}

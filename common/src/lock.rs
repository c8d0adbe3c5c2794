// Distributed locking over versioned records in the backing store

use crate::clock::{deadline, Clock, SystemClock};
use crate::config::LockConfig;
use crate::errors::LockError;
use crate::storage::{encode, KeyValueStore, VersionedRecord};
use crate::telemetry;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Proof of ownership returned by a successful acquisition
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LockToken {
    pub key: String,
    pub token: String,
    pub expires_at: DateTime<Utc>,
}

/// What `with_lock` does when the lock cannot be taken
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OnLockFailure {
    /// Return `Ok(None)` without running the action
    Skip,
    /// Return `LockError::Unavailable`
    Fail,
}

/// Distributed lock trait for ensuring exclusive access to resources
#[async_trait]
pub trait DistributedLock: Send + Sync {
    /// Single non-blocking attempt
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockToken, LockError>;

    /// Keep trying until `wait` elapses
    async fn acquire_with_wait(
        &self,
        key: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<LockToken, LockError>;

    /// Release the lock, `NotHolder` if `token` no longer owns it
    async fn release(&self, key: &str, token: &str) -> Result<(), LockError>;

    /// Push the expiry out to `now + ttl` without releasing
    async fn renew(&self, key: &str, token: &str, ttl: Duration) -> Result<LockToken, LockError>;
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct LockRecord {
    token: String,
    expires_at: DateTime<Utc>,
}

/// Lock implementation on any `KeyValueStore`
///
/// Ownership moves only through compare-and-set on the lock record, so two
/// processes racing for an absent or expired lock cannot both win.
pub struct StoreLock {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    prefix: String,
    retry_delay: Duration,
}

impl StoreLock {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self::from_config(store, &LockConfig::default())
    }

    pub fn from_config(store: Arc<dyn KeyValueStore>, config: &LockConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            prefix: config.prefix.clone(),
            retry_delay: Duration::from_millis(config.retry_delay_ms.max(1)),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    fn record_key(&self, key: &str) -> String {
        format!("{}{}", self.prefix, key)
    }

    /// Current record if it is still held at `now`
    fn live_record(
        &self,
        record: Option<VersionedRecord>,
        now: DateTime<Utc>,
    ) -> Result<Option<(u64, LockRecord)>, LockError> {
        let Some(record) = record else {
            return Ok(None);
        };
        let lock: LockRecord = record.decode()?;
        if lock.expires_at <= now {
            return Ok(None);
        }
        Ok(Some((record.version, lock)))
    }

    async fn try_acquire_once(&self, key: &str, ttl: Duration) -> Result<LockToken, LockError> {
        let record_key = self.record_key(key);
        let now = self.clock.now();
        let existing = self.store.get(&record_key).await?;
        let expected = existing.as_ref().map(|record| record.version);

        if self.live_record(existing, now)?.is_some() {
            return Err(LockError::Unavailable(key.to_string()));
        }

        let lock = LockRecord {
            token: Uuid::new_v4().to_string(),
            expires_at: deadline(now, ttl),
        };
        let written = self
            .store
            .compare_and_set(&record_key, expected, &encode(&lock)?, Some(ttl))
            .await?;

        match written {
            Some(_) => {
                debug!(resource = %key, ttl_seconds = ttl.as_secs(), "Lock acquired");
                Ok(LockToken {
                    key: key.to_string(),
                    token: lock.token,
                    expires_at: lock.expires_at,
                })
            }
            None => Err(LockError::Unavailable(key.to_string())),
        }
    }

    /// Version of the record if `token` currently holds it
    async fn held_version(&self, key: &str, token: &str) -> Result<u64, LockError> {
        let record = self.store.get(&self.record_key(key)).await?;
        match self.live_record(record, self.clock.now())? {
            Some((version, lock)) if lock.token == token => Ok(version),
            _ => Err(LockError::NotHolder(key.to_string())),
        }
    }
}

#[async_trait]
impl DistributedLock for StoreLock {
    #[instrument(skip(self), fields(resource = %key, ttl_seconds = ttl.as_secs()))]
    async fn acquire(&self, key: &str, ttl: Duration) -> Result<LockToken, LockError> {
        let result = self.try_acquire_once(key, ttl).await;
        if matches!(result, Err(LockError::Unavailable(_))) {
            telemetry::record_lock_contention(key);
        }
        result
    }

    #[instrument(skip(self), fields(resource = %key, ttl_seconds = ttl.as_secs(), wait_ms = wait.as_millis() as u64))]
    async fn acquire_with_wait(
        &self,
        key: &str,
        ttl: Duration,
        wait: Duration,
    ) -> Result<LockToken, LockError> {
        let started = Instant::now();
        let mut attempts = 0u32;

        loop {
            attempts += 1;
            match self.try_acquire_once(key, ttl).await {
                Ok(token) => {
                    info!(resource = %key, attempts, "Lock acquired successfully");
                    return Ok(token);
                }
                Err(LockError::Unavailable(_)) if started.elapsed() + self.retry_delay <= wait => {
                    debug!(
                        resource = %key,
                        attempt = attempts,
                        retry_delay_ms = self.retry_delay.as_millis() as u64,
                        "Lock acquisition failed, retrying"
                    );
                    sleep(self.retry_delay).await;
                }
                Err(e) => {
                    if matches!(e, LockError::Unavailable(_)) {
                        telemetry::record_lock_contention(key);
                        warn!(resource = %key, attempts, "Failed to acquire lock within wait time");
                    }
                    return Err(e);
                }
            }
        }
    }

    #[instrument(skip(self, token), fields(resource = %key))]
    async fn release(&self, key: &str, token: &str) -> Result<(), LockError> {
        let version = self.held_version(key, token).await?;
        if self.store.compare_and_delete(&self.record_key(key), version).await? {
            debug!(resource = %key, "Lock released successfully");
            Ok(())
        } else {
            warn!(resource = %key, "Lock changed hands during release");
            Err(LockError::NotHolder(key.to_string()))
        }
    }

    #[instrument(skip(self, token), fields(resource = %key, ttl_seconds = ttl.as_secs()))]
    async fn renew(&self, key: &str, token: &str, ttl: Duration) -> Result<LockToken, LockError> {
        let version = self.held_version(key, token).await?;
        let lock = LockRecord {
            token: token.to_string(),
            expires_at: deadline(self.clock.now(), ttl),
        };

        let written = self
            .store
            .compare_and_set(&self.record_key(key), Some(version), &encode(&lock)?, Some(ttl))
            .await?;
        if written.is_none() {
            return Err(LockError::NotHolder(key.to_string()));
        }

        debug!(resource = %key, expires_at = %lock.expires_at, "Lock renewed");
        Ok(LockToken {
            key: key.to_string(),
            token: lock.token,
            expires_at: lock.expires_at,
        })
    }
}

/// Run `action` while holding `key`, releasing afterwards
///
/// Returns `Ok(None)` when the lock is busy and `on_failure` is `Skip`.
pub async fn with_lock<F, Fut, T>(
    lock: &dyn DistributedLock,
    key: &str,
    ttl: Duration,
    wait: Duration,
    on_failure: OnLockFailure,
    action: F,
) -> Result<Option<T>, LockError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let acquired = if wait.is_zero() {
        lock.acquire(key, ttl).await
    } else {
        lock.acquire_with_wait(key, ttl, wait).await
    };

    let token = match acquired {
        Ok(token) => token,
        Err(LockError::Unavailable(_)) if on_failure == OnLockFailure::Skip => {
            debug!(resource = %key, "Lock held elsewhere, skipping");
            return Ok(None);
        }
        Err(e) => return Err(e),
    };

    let output = action().await;

    if let Err(e) = lock.release(key, &token.token).await {
        warn!(resource = %key, error = %e, "Failed to release lock after action");
    }
    Ok(Some(output))
}

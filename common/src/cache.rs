// Read-through cache with TTL eviction
//
// A miss is a normal `None`. Entries carry their own expiry, checked against
// the clock on every read, so a value is never served past its TTL even if the
// backing store has not evicted it yet.

use crate::clock::{deadline, Clock, SystemClock};
use crate::config::CacheConfig;
use crate::errors::StorageError;
use crate::storage::{encode, KeyValueStore};
use crate::telemetry;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, instrument, warn};

/// Stored form of a cached value
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub key: String,
    pub value: serde_json::Value,
    pub expires_at: DateTime<Utc>,
}

pub struct Cache {
    store: Arc<dyn KeyValueStore>,
    clock: Arc<dyn Clock>,
    prefix: String,
    default_ttl: Duration,
}

impl Cache {
    pub fn new(store: Arc<dyn KeyValueStore>, config: &CacheConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            prefix: config.prefix.clone(),
            default_ttl: Duration::from_secs(config.default_ttl_seconds),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    fn entry_key(&self, key: &str) -> String {
        format!("{}:{}", self.prefix, key)
    }

    /// Fresh value for `key`, `None` on a miss
    pub async fn get<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>, StorageError> {
        let record = self.store.get(&self.entry_key(key)).await?;
        let value = match record {
            Some(record) => {
                let entry: CacheEntry = record.decode()?;
                if entry.expires_at <= self.clock.now() {
                    None
                } else {
                    match serde_json::from_value(entry.value) {
                        Ok(value) => Some(value),
                        Err(e) => {
                            warn!(key = %key, error = %e, "Cached value has an unexpected shape, treating as miss");
                            None
                        }
                    }
                }
            }
            None => None,
        };

        telemetry::record_cache_lookup(&self.prefix, value.is_some());
        Ok(value)
    }

    /// Store `value` for `ttl`, or the configured default TTL
    pub async fn put<T: Serialize>(
        &self,
        key: &str,
        value: &T,
        ttl: Option<Duration>,
    ) -> Result<(), StorageError> {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let entry = CacheEntry {
            key: key.to_string(),
            value: serde_json::to_value(value)?,
            expires_at: deadline(self.clock.now(), ttl),
        };
        self.store
            .set(&self.entry_key(key), &encode(&entry)?, Some(ttl))
            .await?;
        debug!(key = %key, ttl_seconds = ttl.as_secs(), "Cache entry stored");
        Ok(())
    }

    /// Drop the entry, returns whether one existed
    pub async fn invalidate(&self, key: &str) -> Result<bool, StorageError> {
        self.store.delete(&self.entry_key(key)).await
    }

    /// Return the cached value, or run `loader` and cache its result
    ///
    /// The loader runs only on a miss. A failed load is returned as is and
    /// nothing is cached.
    #[instrument(skip(self, loader), fields(prefix = %self.prefix))]
    pub async fn get_or_load<T, E, F, Fut>(
        &self,
        key: &str,
        ttl: Option<Duration>,
        loader: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<StorageError>,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        if let Some(value) = self.get(key).await? {
            return Ok(value);
        }

        let value = loader().await?;
        self.put(key, &value, ttl).await?;
        Ok(value)
    }
}

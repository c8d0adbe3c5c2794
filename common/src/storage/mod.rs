// Backing store abstraction
//
// All shared cluster state (job records, lock records, cache entries, sessions)
// lives behind `KeyValueStore`. Ownership changes go through compare-and-set on
// a store-wide record version, never through in-process locking.

pub mod memory;
pub mod redis;

pub use memory::MemoryStore;
pub use redis::{RedisPool, RedisStore};

use crate::errors::StorageError;
use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::time::Duration;

/// A stored value together with the version it was written at
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedRecord {
    pub version: u64,
    pub value: Vec<u8>,
}

impl VersionedRecord {
    /// Decode the JSON value
    pub fn decode<T: DeserializeOwned>(&self) -> Result<T, StorageError> {
        Ok(serde_json::from_slice(&self.value)?)
    }
}

/// Encode a value the way every component stores it
pub fn encode<T: Serialize>(value: &T) -> Result<Vec<u8>, StorageError> {
    Ok(serde_json::to_vec(value)?)
}

/// Key-value store with atomic versioned writes and sorted-set scheduling
#[async_trait]
pub trait KeyValueStore: Send + Sync {
    /// Read a record, `None` when absent or expired
    async fn get(&self, key: &str) -> Result<Option<VersionedRecord>, StorageError>;

    /// Write `value` only if the record is currently at `expected` version
    /// (`None` means the key must be absent). Returns the new version, or
    /// `None` when the comparison failed.
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<u64>,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<Option<u64>, StorageError>;

    /// Delete the record only if it is still at `expected` version
    async fn compare_and_delete(&self, key: &str, expected: u64) -> Result<bool, StorageError>;

    /// Unconditional write, last writer wins
    async fn set(&self, key: &str, value: &[u8], ttl: Option<Duration>)
        -> Result<u64, StorageError>;

    /// Delete the record, returns whether it existed
    async fn delete(&self, key: &str) -> Result<bool, StorageError>;

    /// Add or move `member` in the sorted set at `score`
    async fn schedule(&self, set: &str, member: &str, score: i64) -> Result<(), StorageError>;

    /// Members with score <= `max_score`, lowest score first
    async fn due(&self, set: &str, max_score: i64, limit: usize)
        -> Result<Vec<String>, StorageError>;

    /// Remove `member` from the sorted set
    async fn unschedule(&self, set: &str, member: &str) -> Result<bool, StorageError>;

    /// Number of members in the sorted set
    async fn scheduled_len(&self, set: &str) -> Result<u64, StorageError>;
}

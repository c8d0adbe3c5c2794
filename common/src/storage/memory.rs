// In-process store with the same atomicity guarantees as the Redis store

use super::{KeyValueStore, VersionedRecord};
use crate::clock::{deadline, Clock, SystemClock};
use crate::errors::StorageError;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
struct Entry {
    version: u64,
    value: Vec<u8>,
    expires_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default)]
struct State {
    sequence: u64,
    records: HashMap<String, Entry>,
    sorted_sets: HashMap<String, HashMap<String, i64>>,
}

impl State {
    fn next_version(&mut self) -> u64 {
        self.sequence += 1;
        self.sequence
    }

    /// Live entry for `key`, dropping it first if it has expired
    fn live(&mut self, key: &str, now: DateTime<Utc>) -> Option<&Entry> {
        let expired = matches!(
            self.records.get(key),
            Some(Entry { expires_at: Some(at), .. }) if *at <= now
        );
        if expired {
            self.records.remove(key);
        }
        self.records.get(key)
    }

    fn write(&mut self, key: &str, value: &[u8], ttl: Option<Duration>, now: DateTime<Utc>) -> u64 {
        let version = self.next_version();
        self.records.insert(
            key.to_string(),
            Entry {
                version,
                value: value.to_vec(),
                expires_at: ttl.map(|ttl| deadline(now, ttl)),
            },
        );
        version
    }
}

/// Memory-backed `KeyValueStore`
///
/// Every operation runs under one async mutex, which gives the same
/// linearizable compare-and-set the Lua scripts give on Redis. Expiry is
/// evaluated against the injected clock.
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<State>>,
    clock: Arc<dyn Clock>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Arc::new(Mutex::new(State::default())),
            clock,
        }
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl KeyValueStore for MemoryStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedRecord>, StorageError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        Ok(state.live(key, now).map(|entry| VersionedRecord {
            version: entry.version,
            value: entry.value.clone(),
        }))
    }

    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<u64>,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<Option<u64>, StorageError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let current = state.live(key, now).map(|entry| entry.version);
        if current != expected {
            return Ok(None);
        }
        Ok(Some(state.write(key, value, ttl, now)))
    }

    async fn compare_and_delete(&self, key: &str, expected: u64) -> Result<bool, StorageError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let current = state.live(key, now).map(|entry| entry.version);
        if current != Some(expected) {
            return Ok(false);
        }
        state.records.remove(key);
        Ok(true)
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<u64, StorageError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        Ok(state.write(key, value, ttl, now))
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let existed = state.live(key, now).is_some();
        state.records.remove(key);
        Ok(existed)
    }

    async fn schedule(&self, set: &str, member: &str, score: i64) -> Result<(), StorageError> {
        let mut state = self.state.lock().await;
        state
            .sorted_sets
            .entry(set.to_string())
            .or_default()
            .insert(member.to_string(), score);
        Ok(())
    }

    async fn due(
        &self,
        set: &str,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<String>, StorageError> {
        let state = self.state.lock().await;
        let Some(members) = state.sorted_sets.get(set) else {
            return Ok(Vec::new());
        };

        let mut due: Vec<(&String, i64)> = members
            .iter()
            .filter(|(_, score)| **score <= max_score)
            .map(|(member, score)| (member, *score))
            .collect();
        // Redis orders equal scores lexicographically
        due.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(b.0)));

        Ok(due
            .into_iter()
            .take(limit)
            .map(|(member, _)| member.clone())
            .collect())
    }

    async fn unschedule(&self, set: &str, member: &str) -> Result<bool, StorageError> {
        let mut state = self.state.lock().await;
        Ok(state
            .sorted_sets
            .get_mut(set)
            .map(|members| members.remove(member).is_some())
            .unwrap_or(false))
    }

    async fn scheduled_len(&self, set: &str) -> Result<u64, StorageError> {
        let state = self.state.lock().await;
        Ok(state
            .sorted_sets
            .get(set)
            .map(|members| members.len() as u64)
            .unwrap_or(0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;

    fn store() -> (MemoryStore, ManualClock) {
        let clock = ManualClock::default();
        (MemoryStore::with_clock(Arc::new(clock.clone())), clock)
    }

    #[tokio::test]
    async fn test_compare_and_set_requires_absent_key() {
        let (store, _) = store();

        let first = store.compare_and_set("k", None, b"a", None).await.unwrap();
        assert!(first.is_some());

        let second = store.compare_and_set("k", None, b"b", None).await.unwrap();
        assert!(second.is_none());

        let record = store.get("k").await.unwrap().unwrap();
        assert_eq!(record.value, b"a");
    }

    #[tokio::test]
    async fn test_compare_and_set_rejects_stale_version() {
        let (store, _) = store();
        let v1 = store.set("k", b"a", None).await.unwrap();
        let v2 = store.compare_and_set("k", Some(v1), b"b", None).await.unwrap().unwrap();
        assert!(v2 > v1);

        let stale = store.compare_and_set("k", Some(v1), b"c", None).await.unwrap();
        assert!(stale.is_none());
    }

    #[tokio::test]
    async fn test_versions_are_never_reused_after_delete() {
        let (store, _) = store();
        let v1 = store.set("k", b"a", None).await.unwrap();
        assert!(store.delete("k").await.unwrap());
        let v2 = store.set("k", b"a", None).await.unwrap();
        assert_ne!(v1, v2);
        assert!(!store.compare_and_delete("k", v1).await.unwrap());
    }

    #[tokio::test]
    async fn test_records_expire_with_clock() {
        let (store, clock) = store();
        store.set("k", b"a", Some(Duration::from_secs(60))).await.unwrap();

        clock.advance(Duration::from_secs(59));
        assert!(store.get("k").await.unwrap().is_some());

        clock.advance(Duration::from_secs(2));
        assert!(store.get("k").await.unwrap().is_none());

        // An expired key counts as absent for compare-and-set
        let taken = store.compare_and_set("k", None, b"b", None).await.unwrap();
        assert!(taken.is_some());
    }

    #[tokio::test]
    async fn test_due_orders_by_score_and_limits() {
        let (store, _) = store();
        store.schedule("ready", "c", 30).await.unwrap();
        store.schedule("ready", "a", 10).await.unwrap();
        store.schedule("ready", "b", 20).await.unwrap();
        store.schedule("ready", "later", 100).await.unwrap();

        assert_eq!(store.due("ready", 50, 10).await.unwrap(), vec!["a", "b", "c"]);
        assert_eq!(store.due("ready", 50, 2).await.unwrap(), vec!["a", "b"]);
        assert_eq!(store.scheduled_len("ready").await.unwrap(), 4);

        // Rescheduling moves the member instead of duplicating it
        store.schedule("ready", "a", 200).await.unwrap();
        assert_eq!(store.due("ready", 50, 10).await.unwrap(), vec!["b", "c"]);
        assert_eq!(store.scheduled_len("ready").await.unwrap(), 4);

        assert!(store.unschedule("ready", "b").await.unwrap());
        assert!(!store.unschedule("ready", "b").await.unwrap());
        assert!(store.due("missing", 50, 10).await.unwrap().is_empty());
    }
}

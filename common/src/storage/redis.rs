// Redis connection pool and Redis-backed KeyValueStore

use super::{KeyValueStore, VersionedRecord};
use crate::config::RedisConfig;
use crate::errors::StorageError;
use async_trait::async_trait;
use redis::aio::{ConnectionManager, PubSub};
use redis::{AsyncCommands, Client, Script};
use std::time::Duration;
use tracing::{debug, info, instrument};

/// Redis connection pool wrapper
#[derive(Clone)]
pub struct RedisPool {
    client: Client,
    manager: ConnectionManager,
}

impl RedisPool {
    /// Create a new Redis connection pool
    #[instrument(skip(config), fields(redis_url = %config.url))]
    pub async fn new(config: &RedisConfig) -> Result<Self, StorageError> {
        info!("Initializing Redis connection pool");

        let client = Client::open(config.url.as_str()).map_err(|e| {
            StorageError::ConnectionFailed(format!("Failed to create Redis client: {}", e))
        })?;

        let manager = ConnectionManager::new(client.clone()).await.map_err(|e| {
            StorageError::ConnectionFailed(format!("Failed to create connection manager: {}", e))
        })?;

        info!("Redis connection pool initialized successfully");

        Ok(Self { client, manager })
    }

    /// Get a connection from the pool
    pub fn get_connection(&self) -> ConnectionManager {
        self.manager.clone()
    }

    /// Open a dedicated connection in subscriber mode
    pub async fn pubsub(&self) -> Result<PubSub, StorageError> {
        self.client.get_async_pubsub().await.map_err(|e| {
            StorageError::ConnectionFailed(format!("Failed to open pub/sub connection: {}", e))
        })
    }

    /// Health check - verify Redis connection is working
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), StorageError> {
        let mut conn = self.get_connection();

        let response: String = redis::cmd("PING")
            .query_async(&mut conn)
            .await
            .map_err(|e| StorageError::RedisError(format!("Health check failed: {}", e)))?;

        if response != "PONG" {
            return Err(StorageError::RedisError(format!(
                "Unexpected PING response: {}",
                response
            )));
        }

        Ok(())
    }
}

// Records are hashes {v: version, d: data}. Versions come from one INCR
// sequence per namespace so a recreated key never repeats a version.
const COMPARE_AND_SET_LUA: &str = r#"
local current = redis.call('HGET', KEYS[1], 'v')
if ARGV[1] == '' then
    if current then
        return 0
    end
elseif current ~= ARGV[1] then
    return 0
end
local version = redis.call('INCR', KEYS[2])
redis.call('DEL', KEYS[1])
redis.call('HSET', KEYS[1], 'v', version, 'd', ARGV[2])
if tonumber(ARGV[3]) > 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[3])
end
return version
"#;

const SET_LUA: &str = r#"
local version = redis.call('INCR', KEYS[2])
redis.call('DEL', KEYS[1])
redis.call('HSET', KEYS[1], 'v', version, 'd', ARGV[1])
if tonumber(ARGV[2]) > 0 then
    redis.call('PEXPIRE', KEYS[1], ARGV[2])
end
return version
"#;

const COMPARE_AND_DELETE_LUA: &str = r#"
if redis.call('HGET', KEYS[1], 'v') == ARGV[1] then
    return redis.call('DEL', KEYS[1])
else
    return 0
end
"#;

/// Redis-backed `KeyValueStore`
#[derive(Clone)]
pub struct RedisStore {
    pool: RedisPool,
    namespace: String,
    compare_and_set_script: Script,
    set_script: Script,
    compare_and_delete_script: Script,
}

impl RedisStore {
    pub fn new(pool: RedisPool, namespace: impl Into<String>) -> Self {
        Self {
            pool,
            namespace: namespace.into(),
            compare_and_set_script: Script::new(COMPARE_AND_SET_LUA),
            set_script: Script::new(SET_LUA),
            compare_and_delete_script: Script::new(COMPARE_AND_DELETE_LUA),
        }
    }

    /// Connect using the Redis section of the settings
    pub async fn connect(config: &RedisConfig) -> Result<Self, StorageError> {
        let pool = RedisPool::new(config).await?;
        Ok(Self::new(pool, config.namespace.clone()))
    }

    pub fn pool(&self) -> &RedisPool {
        &self.pool
    }

    fn key(&self, key: &str) -> String {
        format!("{}:{}", self.namespace, key)
    }

    fn sequence_key(&self) -> String {
        format!("{}:__version_seq", self.namespace)
    }
}

fn ttl_millis(ttl: Option<Duration>) -> u64 {
    // PEXPIRE 0 would delete the key, so sub-millisecond TTLs round up
    ttl.map(|ttl| (ttl.as_millis() as u64).max(1)).unwrap_or(0)
}

#[async_trait]
impl KeyValueStore for RedisStore {
    async fn get(&self, key: &str) -> Result<Option<VersionedRecord>, StorageError> {
        let mut conn = self.pool.get_connection();
        let (version, value): (Option<u64>, Option<Vec<u8>>) = redis::cmd("HMGET")
            .arg(self.key(key))
            .arg("v")
            .arg("d")
            .query_async(&mut conn)
            .await?;

        Ok(match (version, value) {
            (Some(version), Some(value)) => Some(VersionedRecord { version, value }),
            _ => None,
        })
    }

    #[instrument(skip(self, value), fields(namespace = %self.namespace))]
    async fn compare_and_set(
        &self,
        key: &str,
        expected: Option<u64>,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<Option<u64>, StorageError> {
        let mut conn = self.pool.get_connection();
        let expected = expected.map(|v| v.to_string()).unwrap_or_default();

        let version: u64 = self
            .compare_and_set_script
            .key(self.key(key))
            .key(self.sequence_key())
            .arg(expected)
            .arg(value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;

        if version == 0 {
            debug!(key = %key, "Compare-and-set lost");
            return Ok(None);
        }
        Ok(Some(version))
    }

    async fn compare_and_delete(&self, key: &str, expected: u64) -> Result<bool, StorageError> {
        let mut conn = self.pool.get_connection();
        let deleted: i64 = self
            .compare_and_delete_script
            .key(self.key(key))
            .arg(expected.to_string())
            .invoke_async(&mut conn)
            .await?;
        Ok(deleted == 1)
    }

    async fn set(
        &self,
        key: &str,
        value: &[u8],
        ttl: Option<Duration>,
    ) -> Result<u64, StorageError> {
        let mut conn = self.pool.get_connection();
        let version: u64 = self
            .set_script
            .key(self.key(key))
            .key(self.sequence_key())
            .arg(value)
            .arg(ttl_millis(ttl))
            .invoke_async(&mut conn)
            .await?;
        Ok(version)
    }

    async fn delete(&self, key: &str) -> Result<bool, StorageError> {
        let mut conn = self.pool.get_connection();
        let deleted: i64 = conn.del(self.key(key)).await?;
        Ok(deleted > 0)
    }

    async fn schedule(&self, set: &str, member: &str, score: i64) -> Result<(), StorageError> {
        let mut conn = self.pool.get_connection();
        let _: () = conn.zadd(self.key(set), member, score).await?;
        Ok(())
    }

    async fn due(
        &self,
        set: &str,
        max_score: i64,
        limit: usize,
    ) -> Result<Vec<String>, StorageError> {
        let mut conn = self.pool.get_connection();
        let members: Vec<String> = conn
            .zrangebyscore_limit(self.key(set), "-inf", max_score, 0, limit as isize)
            .await?;
        Ok(members)
    }

    async fn unschedule(&self, set: &str, member: &str) -> Result<bool, StorageError> {
        let mut conn = self.pool.get_connection();
        let removed: i64 = conn.zrem(self.key(set), member).await?;
        Ok(removed > 0)
    }

    async fn scheduled_len(&self, set: &str) -> Result<u64, StorageError> {
        let mut conn = self.pool.get_connection();
        let len: u64 = conn.zcard(self.key(set)).await?;
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RedisConfig {
        RedisConfig {
            url: std::env::var("REDIS_URL").unwrap_or_else(|_| "redis://localhost:6379".to_string()),
            namespace: format!("test-{}", uuid::Uuid::new_v4()),
        }
    }

    #[test]
    fn test_ttl_millis() {
        assert_eq!(ttl_millis(None), 0);
        assert_eq!(ttl_millis(Some(Duration::from_secs(60))), 60_000);
        assert_eq!(ttl_millis(Some(Duration::from_micros(10))), 1);
    }

    #[tokio::test]
    async fn test_redis_pool_invalid_url() {
        let config = RedisConfig {
            url: "not-a-redis-url".to_string(),
            namespace: "test".to_string(),
        };
        let result = RedisPool::new(&config).await;
        assert!(matches!(result, Err(StorageError::ConnectionFailed(_))));
    }

    #[tokio::test]
    #[ignore] // Requires Redis to be running
    async fn test_redis_health_check() {
        let pool = RedisPool::new(&test_config()).await.unwrap();
        assert!(pool.health_check().await.is_ok());
    }

    #[tokio::test]
    #[ignore] // Requires Redis to be running
    async fn test_redis_compare_and_set() {
        let store = RedisStore::connect(&test_config()).await.unwrap();

        let v1 = store.compare_and_set("k", None, b"a", None).await.unwrap().unwrap();
        assert!(store.compare_and_set("k", None, b"b", None).await.unwrap().is_none());

        let v2 = store
            .compare_and_set("k", Some(v1), b"b", Some(Duration::from_secs(30)))
            .await
            .unwrap()
            .unwrap();
        assert!(v2 > v1);

        let record = store.get("k").await.unwrap().unwrap();
        assert_eq!(record.value, b"b");
        assert_eq!(record.version, v2);

        assert!(!store.compare_and_delete("k", v1).await.unwrap());
        assert!(store.compare_and_delete("k", v2).await.unwrap());
        assert!(store.get("k").await.unwrap().is_none());
    }

    #[tokio::test]
    #[ignore] // Requires Redis to be running
    async fn test_redis_sorted_set() {
        let store = RedisStore::connect(&test_config()).await.unwrap();
        store.schedule("ready", "b", 20).await.unwrap();
        store.schedule("ready", "a", 10).await.unwrap();
        store.schedule("ready", "c", 99).await.unwrap();

        assert_eq!(store.due("ready", 50, 10).await.unwrap(), vec!["a", "b"]);
        assert_eq!(store.scheduled_len("ready").await.unwrap(), 3);
        assert!(store.unschedule("ready", "a").await.unwrap());
        assert_eq!(store.due("ready", 50, 10).await.unwrap(), vec!["b"]);
    }
}

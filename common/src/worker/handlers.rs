// Job handlers shipped with the worker binary

use super::JobHandler;
use crate::cache::Cache;
use crate::models::Job;
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

/// Payload of a cache refresh job
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheRefreshPayload {
    pub key: String,
    pub value: serde_json::Value,
    /// Falls back to the cache default
    #[serde(default)]
    pub ttl_seconds: Option<u64>,
}

/// Writes the job's value through the cache
pub struct CacheRefreshHandler {
    cache: Arc<Cache>,
}

impl CacheRefreshHandler {
    pub fn new(cache: Arc<Cache>) -> Self {
        Self { cache }
    }
}

#[async_trait]
impl JobHandler for CacheRefreshHandler {
    async fn handle(&self, job: &Job) -> anyhow::Result<()> {
        let payload: CacheRefreshPayload = job
            .payload_json()
            .context("Invalid cache refresh payload")?;

        let ttl = payload.ttl_seconds.map(Duration::from_secs);
        self.cache
            .put(&payload.key, &payload.value, ttl)
            .await
            .with_context(|| format!("Failed to refresh cache key {}", payload.key))?;

        info!(key = %payload.key, "Cache entry refreshed");
        Ok(())
    }
}

// Job lifecycle events published for other services to observe

use crate::models::Job;
use crate::storage::RedisPool;
use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, BoxStream, StreamExt};
use redis::AsyncCommands;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;
use tokio::sync::broadcast;
use tracing::{debug, info, instrument, warn};
use uuid::Uuid;

/// Messages buffered per channel before slow local subscribers start losing them
const LOCAL_CHANNEL_CAPACITY: usize = 256;

pub const JOB_SUCCEEDED: &str = "job.succeeded";
pub const JOB_FAILED: &str = "job.failed";
pub const JOB_DEAD: &str = "job.dead";

/// Message published on the event channel
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobEvent {
    pub event: String,
    pub job_id: Uuid,
    pub queue: String,
    pub partition_key: String,
    pub deliveries: u32,
    pub error: Option<String>,
    pub at: DateTime<Utc>,
}

impl JobEvent {
    fn from_job(event: &str, job: &Job, error: Option<&str>, at: DateTime<Utc>) -> Self {
        Self {
            event: event.to_string(),
            job_id: job.id,
            queue: job.queue.clone(),
            partition_key: job.partition_key.clone(),
            deliveries: job.deliveries,
            error: error.map(str::to_string),
            at,
        }
    }

    pub fn succeeded(job: &Job, at: DateTime<Utc>) -> Self {
        Self::from_job(JOB_SUCCEEDED, job, None, at)
    }

    pub fn failed(job: &Job, error: &str, at: DateTime<Utc>) -> Self {
        Self::from_job(JOB_FAILED, job, Some(error), at)
    }

    pub fn dead(job: &Job, error: &str, at: DateTime<Utc>) -> Self {
        Self::from_job(JOB_DEAD, job, Some(error), at)
    }
}

/// Fire-and-forget message publishing
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait EventPublisher: Send + Sync {
    async fn publish(&self, channel: &str, message: &str) -> Result<()>;
}

/// Receives the messages published on a channel
#[async_trait]
pub trait EventSubscriber: Send + Sync {
    /// Messages published after the subscription is in place. The stream
    /// ends when the connection is lost.
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>>;
}

/// Serialize and publish a job event
pub async fn publish_event(
    publisher: &dyn EventPublisher,
    channel: &str,
    event: &JobEvent,
) -> Result<()> {
    let message = serde_json::to_string(event).context("Failed to serialize job event")?;
    publisher.publish(channel, &message).await
}

/// Publishes with Redis `PUBLISH`
pub struct RedisEventPublisher {
    pool: RedisPool,
}

impl RedisEventPublisher {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventPublisher for RedisEventPublisher {
    #[instrument(skip(self, message))]
    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        let mut conn = self.pool.get_connection();
        let receivers: i64 = conn
            .publish(channel, message)
            .await
            .with_context(|| format!("Failed to publish to channel {}", channel))?;
        debug!(channel = %channel, receivers, "Event published");
        Ok(())
    }
}

/// Subscribes with Redis `SUBSCRIBE` on a dedicated connection
pub struct RedisEventSubscriber {
    pool: RedisPool,
}

impl RedisEventSubscriber {
    pub fn new(pool: RedisPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl EventSubscriber for RedisEventSubscriber {
    #[instrument(skip(self))]
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        let mut pubsub = self.pool.pubsub().await?;
        pubsub
            .subscribe(channel)
            .await
            .with_context(|| format!("Failed to subscribe to channel {}", channel))?;
        info!(channel = %channel, "Subscribed to channel");

        let messages = pubsub.into_on_message().filter_map(|msg| async move {
            match msg.get_payload::<String>() {
                Ok(payload) => Some(payload),
                Err(e) => {
                    warn!(channel = %msg.get_channel_name(), error = %e, "Dropping non-text message");
                    None
                }
            }
        });
        Ok(messages.boxed())
    }
}

/// In-process fan-out for single-node runs and tests
#[derive(Default)]
pub struct LocalEventBus {
    channels: Mutex<HashMap<String, broadcast::Sender<String>>>,
}

impl LocalEventBus {
    pub fn new() -> Self {
        Self::default()
    }

    fn sender(&self, channel: &str) -> broadcast::Sender<String> {
        let mut channels = self.channels.lock().unwrap_or_else(|e| e.into_inner());
        channels
            .entry(channel.to_string())
            .or_insert_with(|| broadcast::channel(LOCAL_CHANNEL_CAPACITY).0)
            .clone()
    }
}

#[async_trait]
impl EventPublisher for LocalEventBus {
    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        // Like PUBLISH, a message nobody listens to is dropped
        let receivers = self.sender(channel).send(message.to_string()).unwrap_or(0);
        debug!(channel = %channel, receivers, "Event published");
        Ok(())
    }
}

#[async_trait]
impl EventSubscriber for LocalEventBus {
    async fn subscribe(&self, channel: &str) -> Result<BoxStream<'static, String>> {
        let receiver = self.sender(channel).subscribe();
        let messages = stream::unfold(receiver, |mut receiver| async move {
            loop {
                match receiver.recv().await {
                    Ok(message) => return Some((message, receiver)),
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        warn!(skipped, "Subscriber fell behind, messages dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => return None,
                }
            }
        });
        Ok(messages.boxed())
    }
}

/// Logs events instead of sending them, for single-node runs
pub struct LogEventPublisher;

#[async_trait]
impl EventPublisher for LogEventPublisher {
    async fn publish(&self, channel: &str, message: &str) -> Result<()> {
        info!(channel = %channel, message = %message, "Event");
        Ok(())
    }
}

// Domain models

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A unit of work owned by a `JobQueue`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: Uuid,
    pub queue: String,
    /// Opaque to the queue, usually JSON
    pub payload: Vec<u8>,
    /// Jobs sharing a partition key never run concurrently
    pub partition_key: String,
    pub status: JobStatus,
    /// Failed attempts so far
    pub retry_count: u32,
    /// Times the job has been handed to a worker
    pub deliveries: u32,
    pub enqueued_at: DateTime<Utc>,
    /// Not deliverable before this instant
    pub available_at: DateTime<Utc>,
    pub lease_owner: Option<String>,
    pub lease_expires_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn new(
        queue: impl Into<String>,
        payload: Vec<u8>,
        partition_key: impl Into<String>,
        now: DateTime<Utc>,
        available_at: DateTime<Utc>,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            queue: queue.into(),
            payload,
            partition_key: partition_key.into(),
            status: JobStatus::Pending,
            retry_count: 0,
            deliveries: 0,
            enqueued_at: now,
            available_at,
            lease_owner: None,
            lease_expires_at: None,
            last_error: None,
            updated_at: now,
        }
    }

    /// Decode a JSON payload
    pub fn payload_json<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        serde_json::from_slice(&self.payload)
    }

    /// Whether a worker may claim the job at `now`
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        match self.status {
            JobStatus::Pending | JobStatus::Failed => self.available_at <= now,
            JobStatus::Running => self.lease_expired(now),
            JobStatus::Succeeded | JobStatus::Dead => false,
        }
    }

    pub fn lease_expired(&self, now: DateTime<Utc>) -> bool {
        self.lease_expires_at.map(|at| at <= now).unwrap_or(true)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self.status, JobStatus::Succeeded | JobStatus::Dead)
    }

    pub(crate) fn clear_lease(&mut self) {
        self.lease_owner = None;
        self.lease_expires_at = None;
    }
}

/// Job lifecycle
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    /// Failed, waiting for its backoff retry
    Failed,
    /// Retries exhausted, parked in the dead letter queue
    Dead,
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Succeeded => write!(f, "succeeded"),
            JobStatus::Failed => write!(f, "failed"),
            JobStatus::Dead => write!(f, "dead"),
        }
    }
}

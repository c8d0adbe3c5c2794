// Error handling framework

use thiserror::Error;
use uuid::Uuid;

/// Backing store errors
#[derive(Error, Debug)]
pub enum StorageError {
    #[error("Redis error: {0}")]
    RedisError(String),

    #[error("Connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Serialization failed: {0}")]
    Serialization(String),
}

/// Distributed lock errors
#[derive(Error, Debug)]
pub enum LockError {
    #[error("Lock unavailable for resource: {0}")]
    Unavailable(String),

    #[error("Token does not hold lock on resource: {0}")]
    NotHolder(String),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Job queue errors
#[derive(Error, Debug)]
pub enum QueueError {
    #[error("Job not found: {0}")]
    JobNotFound(Uuid),

    #[error("Worker '{worker_id}' does not hold the lease on job {job_id}")]
    NotLeaseHolder { job_id: Uuid, worker_id: String },

    #[error("Job {job_id} is {status}, expected {expected}")]
    InvalidState {
        job_id: Uuid,
        status: String,
        expected: String,
    },

    #[error("Job {job_id} exhausted {attempts} attempts and was moved to the dead-letter queue")]
    JobExhausted { job_id: Uuid, attempts: u32 },

    #[error("Concurrent update on job {0}, retry the operation")]
    Conflict(Uuid),

    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Worker errors
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error(transparent)]
    Queue(#[from] QueueError),

    #[error(transparent)]
    Lock(#[from] LockError),
}

impl From<redis::RedisError> for StorageError {
    fn from(err: redis::RedisError) -> Self {
        StorageError::RedisError(err.to_string())
    }
}

impl From<serde_json::Error> for StorageError {
    fn from(err: serde_json::Error) -> Self {
        StorageError::Serialization(err.to_string())
    }
}

impl From<serde_json::Error> for QueueError {
    fn from(err: serde_json::Error) -> Self {
        QueueError::Storage(err.into())
    }
}

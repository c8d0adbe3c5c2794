// Common library for the Redis-backed job queue, locks, resilience and caching

pub mod bootstrap;
pub mod cache;
pub mod circuit_breaker;
pub mod clock;
pub mod config;
pub mod errors;
pub mod lock;
pub mod models;
pub mod notify;
pub mod queue;
pub mod resilience;
pub mod retry;
pub mod scheduler;
pub mod session;
pub mod storage;
pub mod telemetry;
pub mod worker;

//! Job queue
//!
//! At-least-once delivery of submission IDs:
//! - `RedisQueue`: pending list plus a claims sorted set scored by deadline
//! - `MemoryQueue`: In-process queue for tests and local runs
//!
//! A dequeued job is claimed, not removed. Claims that are not acknowledged
//! before their visibility timeout are handed out again.

pub mod memory;
pub mod redis;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

pub use self::memory::MemoryQueue;
pub use self::redis::RedisQueue;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("Queue unavailable: {0}")]
    Unavailable(String),

    #[error("Corrupt queue entry: {0}")]
    Corrupt(String),
}

impl From<::redis::RedisError> for QueueError {
    fn from(e: ::redis::RedisError) -> Self {
        QueueError::Unavailable(e.to_string())
    }
}

/// Exclusive, time-limited hold on one queued job
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Claim {
    /// Unique per delivery
    pub token: String,
    pub submission_id: i64,
    /// Times this job has been handed out, 1 on first delivery
    pub deliveries: u32,
}

#[async_trait]
pub trait JobQueue: Send + Sync {
    async fn enqueue(&self, submission_id: i64) -> Result<(), QueueError>;

    /// Claim the next job, waiting at most `poll` for one to appear.
    async fn dequeue(&self, poll: Duration) -> Result<Option<Claim>, QueueError>;

    /// Push the claim's visibility deadline a full timeout into the future.
    /// Returns `false` when the claim is no longer held (acknowledged, or
    /// reclaimed by another delivery).
    async fn extend(&self, claim: &Claim) -> Result<bool, QueueError>;

    /// Remove a claimed job for good. Acknowledging an expired claim that was
    /// handed to someone else is a no-op.
    async fn acknowledge(&self, claim: &Claim) -> Result<(), QueueError>;
}

/// Sleep between claim attempts while polling
pub(crate) fn poll_step(poll: Duration) -> Duration {
    (poll / 10).clamp(Duration::from_millis(20), Duration::from_millis(250))
}

pub(crate) fn new_token() -> String {
    uuid::Uuid::new_v4().to_string()
}

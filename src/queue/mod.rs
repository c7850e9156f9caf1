//! URL queue abstraction
//!
//! The crawler consumes an abstract FIFO of URL strings. Two backends are
//! provided: an in-process queue for single-process deployments and tests,
//! and a Redis-backed queue shared between crawler processes.
//!
//! An empty queue is `Ok(None)` from `dequeue`, never an error; workers
//! treat it as "nothing to do, try again later".

mod memory;
mod redis;

pub use memory::MemoryQueue;
pub use redis::RedisQueue;

use std::time::Duration;

use async_trait::async_trait;
use thiserror::Error;

/// Errors from queue operations
#[derive(Debug, Error)]
pub enum QueueError {
    /// The Redis backend failed
    #[error("redis error: {0}")]
    Redis(#[from] ::redis::RedisError),
}

/// A FIFO of URL strings with blocking-dequeue semantics
#[async_trait]
pub trait UrlQueue: Send + Sync {
    /// Append a URL to the tail of the queue
    async fn enqueue(&self, url: &str) -> Result<(), QueueError>;

    /// Remove and return the head of the queue, blocking up to `wait`
    /// when empty. Implementations must not spin on an empty queue.
    async fn dequeue(&self, wait: Duration) -> Result<Option<String>, QueueError>;

    /// Current queue depth (feeds the queue_size gauge)
    async fn len(&self) -> Result<usize, QueueError>;
}

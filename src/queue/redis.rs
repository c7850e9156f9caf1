//! Redis-backed URL queue
//!
//! Shared FIFO for multi-process deployments: LPUSH at the tail, BRPOP at
//! the head. The connection manager reconnects transparently, and an empty
//! poll backs off 100 ms so idle workers never spin against the server.

use std::time::Duration;

use async_trait::async_trait;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;

use super::{QueueError, UrlQueue};

/// Redis list key holding the pending URLs
const QUEUE_KEY: &str = "crawld:url_queue";

/// Pause after an empty poll before reporting "nothing to do"
const EMPTY_POLL_BACKOFF: Duration = Duration::from_millis(100);

/// Queue shared through a Redis list
pub struct RedisQueue {
    conn: ConnectionManager,
    queue_key: String,
}

impl RedisQueue {
    /// Connect to Redis and verify the connection with a PING.
    pub async fn new(redis_url: &str) -> Result<Self, QueueError> {
        let client = redis::Client::open(redis_url)?;
        let mut conn = ConnectionManager::new(client).await?;

        redis::cmd("PING").query_async::<()>(&mut conn).await?;

        Ok(Self {
            conn,
            queue_key: QUEUE_KEY.to_string(),
        })
    }
}

#[async_trait]
impl UrlQueue for RedisQueue {
    async fn enqueue(&self, url: &str) -> Result<(), QueueError> {
        let mut conn = self.conn.clone();
        conn.lpush::<_, _, ()>(&self.queue_key, url).await?;
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<String>, QueueError> {
        let mut conn = self.conn.clone();

        // BRPOP with sub-second resolution; zero means block forever, so
        // clamp to at least a millisecond-scale timeout
        let timeout_secs = wait.as_secs_f64().max(0.001);
        let result: Option<(String, String)> =
            conn.brpop(&self.queue_key, timeout_secs).await?;

        match result {
            Some((_key, url)) => Ok(Some(url)),
            None => {
                // Empty or timed out; back off briefly so callers polling
                // in a loop don't hammer the server
                tokio::time::sleep(EMPTY_POLL_BACKOFF).await;
                Ok(None)
            }
        }
    }

    async fn len(&self) -> Result<usize, QueueError> {
        let mut conn = self.conn.clone();
        let len: usize = conn.llen(&self.queue_key).await?;
        Ok(len)
    }
}

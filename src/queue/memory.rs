//! In-process URL queue
//!
//! Backs single-process deployments and tests. A `Notify` wakes blocked
//! dequeuers when work arrives, so waiting costs nothing.

use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use tokio::sync::Notify;

use super::{QueueError, UrlQueue};

/// In-memory FIFO of URL strings
#[derive(Debug, Default)]
pub struct MemoryQueue {
    items: Mutex<VecDeque<String>>,
    notify: Notify,
}

impl MemoryQueue {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UrlQueue for MemoryQueue {
    async fn enqueue(&self, url: &str) -> Result<(), QueueError> {
        self.items.lock().push_back(url.to_string());
        self.notify.notify_one();
        Ok(())
    }

    async fn dequeue(&self, wait: Duration) -> Result<Option<String>, QueueError> {
        let deadline = tokio::time::Instant::now() + wait;

        loop {
            // Register interest before checking, so an enqueue landing
            // between the check and the await still wakes us
            let notified = self.notify.notified();

            if let Some(url) = self.items.lock().pop_front() {
                return Ok(Some(url));
            }

            tokio::select! {
                _ = notified => {}
                _ = tokio::time::sleep_until(deadline) => return Ok(None),
            }
        }
    }

    async fn len(&self) -> Result<usize, QueueError> {
        Ok(self.items.lock().len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Instant;

    #[tokio::test]
    async fn fifo_order() {
        let queue = MemoryQueue::new();
        queue.enqueue("http://a.test/1").await.unwrap();
        queue.enqueue("http://a.test/2").await.unwrap();
        queue.enqueue("http://a.test/3").await.unwrap();

        assert_eq!(queue.len().await.unwrap(), 3);
        assert_eq!(
            queue.dequeue(Duration::ZERO).await.unwrap().as_deref(),
            Some("http://a.test/1")
        );
        assert_eq!(
            queue.dequeue(Duration::ZERO).await.unwrap().as_deref(),
            Some("http://a.test/2")
        );
        assert_eq!(
            queue.dequeue(Duration::ZERO).await.unwrap().as_deref(),
            Some("http://a.test/3")
        );
    }

    #[tokio::test]
    async fn empty_queue_returns_none_after_wait() {
        let queue = MemoryQueue::new();
        let start = Instant::now();
        let result = queue.dequeue(Duration::from_millis(50)).await.unwrap();
        assert!(result.is_none());
        assert!(start.elapsed() >= Duration::from_millis(40));
    }

    #[tokio::test]
    async fn blocked_dequeue_wakes_on_enqueue() {
        let queue = Arc::new(MemoryQueue::new());

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.dequeue(Duration::from_secs(5)).await })
        };

        tokio::time::sleep(Duration::from_millis(30)).await;
        queue.enqueue("http://late.test/").await.unwrap();

        let got = consumer.await.unwrap().unwrap();
        assert_eq!(got.as_deref(), Some("http://late.test/"));
    }

    #[tokio::test]
    async fn duplicate_urls_are_kept() {
        // Idempotence is not part of the queue contract
        let queue = MemoryQueue::new();
        queue.enqueue("http://a.test/").await.unwrap();
        queue.enqueue("http://a.test/").await.unwrap();
        assert_eq!(queue.len().await.unwrap(), 2);
    }
}

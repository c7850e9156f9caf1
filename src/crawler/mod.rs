//! Crawl orchestration
//!
//! The `Crawler` owns the worker pool and the per-host policy state. URLs
//! enter through `enqueue_url`, workers pull them off the queue one at a
//! time and run them through the fetch pipeline with retry, and a
//! broadcast shutdown drains everything cleanly.
//!
//! Components:
//! - `limiter`: per-host token-bucket rate limiting with idle eviction
//! - `circuit`: per-host circuit breaking over rolling failure windows
//! - `robots`: TTL-cached robots.txt compliance
//! - `fetcher`: the single-URL pipeline tying them together

pub mod circuit;
pub mod fetcher;
pub mod limiter;
pub mod robots;

pub use circuit::{CircuitBreaker, CircuitState};
pub use fetcher::{FetchError, FetchOutcome, Fetcher};
pub use limiter::{HostRateLimiter, RateLimitError};
pub use robots::{RobotsCache, RobotsError};

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;

use crate::config::CrawlerConfig;
use crate::metrics::CrawlerMetrics;
use crate::proxy::{ProxyPool, REFRESH_INTERVAL};
use crate::queue::{QueueError, UrlQueue};
use crate::store::PageStore;

/// How long a worker blocks on an empty queue per iteration
const DEQUEUE_WAIT: Duration = Duration::from_secs(1);

/// Pause after an empty dequeue before polling again
const EMPTY_QUEUE_PAUSE: Duration = Duration::from_secs(1);

/// Pause after a dequeue error before retrying
const DEQUEUE_ERROR_PAUSE: Duration = Duration::from_millis(500);

/// Manages the crawling process
pub struct Crawler {
    config: CrawlerConfig,
    queue: Arc<dyn UrlQueue>,
    fetcher: Arc<Fetcher>,
    limiter: Arc<HostRateLimiter>,
    circuit: Arc<CircuitBreaker>,
    proxies: Arc<ProxyPool>,
    metrics: Arc<CrawlerMetrics>,
    shutdown_tx: broadcast::Sender<()>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    running: AtomicBool,
}

impl Crawler {
    /// Build a crawler over the given collaborators. Fails when the HTTP
    /// client stack cannot be constructed.
    pub fn new(
        config: CrawlerConfig,
        queue: Arc<dyn UrlQueue>,
        store: Arc<dyn PageStore>,
        metrics: Arc<CrawlerMetrics>,
        proxies: Arc<ProxyPool>,
    ) -> Result<Self, FetchError> {
        let limiter = Arc::new(HostRateLimiter::new(
            config.default_rate(),
            config.max_concurrent_hosts,
        ));
        let circuit = Arc::new(CircuitBreaker::new(
            config.circuit_breaker_ratio,
            config.circuit_breaker_reset(),
        ));

        let robots_client = reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.request_timeout())
            .build()
            .map_err(FetchError::Http)?;
        let robots = Arc::new(RobotsCache::new(&config.user_agent, robots_client));

        let fetcher = Arc::new(Fetcher::new(
            config.clone(),
            store,
            robots,
            Arc::clone(&limiter),
            Arc::clone(&circuit),
            Arc::clone(&proxies),
            Arc::clone(&metrics),
        )?);

        let (shutdown_tx, _) = broadcast::channel(1);

        Ok(Self {
            config,
            queue,
            fetcher,
            limiter,
            circuit,
            proxies,
            metrics,
            shutdown_tx,
            tasks: Mutex::new(Vec::new()),
            running: AtomicBool::new(false),
        })
    }

    /// Spawn the worker pool and background maintenance tasks.
    pub fn start(&self) {
        if self.running.swap(true, Ordering::SeqCst) {
            tracing::warn!("Crawler already running, ignoring start");
            return;
        }

        tracing::info!("Starting {} crawler workers...", self.config.worker_count);
        let mut tasks = self.tasks.lock();

        for id in 0..self.config.worker_count {
            let worker = WorkerContext {
                id,
                config: self.config.clone(),
                queue: Arc::clone(&self.queue),
                fetcher: Arc::clone(&self.fetcher),
                metrics: Arc::clone(&self.metrics),
            };
            let shutdown_rx = self.shutdown_tx.subscribe();
            tasks.push(tokio::spawn(worker.run(shutdown_rx)));
        }

        tasks.push(self.spawn_limiter_sweep());
        if self.proxies.has_refresh_endpoint() {
            tasks.push(self.spawn_proxy_refresh());
        }

        self.metrics
            .workers_running
            .set(self.config.worker_count as u64);
        tracing::info!("Crawler started");
    }

    /// Broadcast stop and wait for every worker and background task.
    pub async fn stop(&self) {
        if !self.running.swap(false, Ordering::SeqCst) {
            return;
        }

        tracing::info!("Stopping crawler workers...");
        let _ = self.shutdown_tx.send(());

        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            if let Err(e) = task.await {
                tracing::warn!("Crawler task panicked during shutdown: {}", e);
            }
        }

        self.metrics.workers_running.set(0);
        tracing::info!("Crawler stopped");
    }

    /// Add a URL to the queue for crawling
    pub async fn enqueue_url(&self, url: &str) -> Result<(), QueueError> {
        self.queue.enqueue(url).await?;
        self.metrics.urls_queued_total.inc();
        if let Ok(len) = self.queue.len().await {
            self.metrics.queue_size.set(len as u64);
        }
        Ok(())
    }

    /// Whether the worker pool is running
    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::SeqCst)
    }

    /// Circuit state for a host (admin/introspection)
    pub fn circuit_state(&self, host: &str) -> CircuitState {
        self.circuit.state(host)
    }

    /// Reset a host's circuit to closed (admin)
    pub fn reset_circuit(&self, host: &str) {
        self.circuit.reset(host);
    }

    /// Replace the rate limit for a host (admin)
    pub fn set_host_rate(&self, host: &str, rate: f64, burst: u32) {
        self.limiter.set_rate(host, rate, burst);
    }

    /// The crawler's metric sink
    pub fn metrics(&self) -> Arc<CrawlerMetrics> {
        Arc::clone(&self.metrics)
    }

    fn spawn_limiter_sweep(&self) -> JoinHandle<()> {
        let limiter = Arc::clone(&self.limiter);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(limiter::SWEEP_INTERVAL);
            ticker.tick().await; // immediate first tick

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        let removed = limiter.sweep();
                        if removed > 0 {
                            tracing::debug!("Rate limiter sweep evicted {} idle hosts", removed);
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }

    fn spawn_proxy_refresh(&self) -> JoinHandle<()> {
        let proxies = Arc::clone(&self.proxies);
        let metrics = Arc::clone(&self.metrics);
        let mut shutdown_rx = self.shutdown_tx.subscribe();

        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(REFRESH_INTERVAL);
            ticker.tick().await; // immediate first tick

            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match proxies.refresh_once().await {
                            Ok(_) => {
                                metrics.healthy_proxies.set(proxies.healthy_count() as u64);
                            }
                            Err(e) => tracing::warn!("Proxy refresh failed: {}", e),
                        }
                    }
                    _ = shutdown_rx.recv() => break,
                }
            }
        })
    }
}

/// Everything one worker needs, detached from the crawler's lifetime
struct WorkerContext {
    id: usize,
    config: CrawlerConfig,
    queue: Arc<dyn UrlQueue>,
    fetcher: Arc<Fetcher>,
    metrics: Arc<CrawlerMetrics>,
}

impl WorkerContext {
    async fn run(self, mut shutdown_rx: broadcast::Receiver<()>) {
        tracing::debug!("Worker {} started", self.id);

        loop {
            // Observe stop between iterations
            match shutdown_rx.try_recv() {
                Ok(_) | Err(broadcast::error::TryRecvError::Closed) => break,
                Err(_) => {}
            }

            let waited = Instant::now();
            let url = match self.queue.dequeue(DEQUEUE_WAIT).await {
                Ok(Some(url)) => url,
                Ok(None) => {
                    // Queue is empty; don't spin
                    tokio::time::sleep(EMPTY_QUEUE_PAUSE).await;
                    continue;
                }
                Err(e) => {
                    tracing::warn!("Worker {}: error dequeuing URL: {}", self.id, e);
                    tokio::time::sleep(DEQUEUE_ERROR_PAUSE).await;
                    continue;
                }
            };
            self.metrics.queue_latency.observe(waited.elapsed());

            tracing::debug!("Worker {}: dequeued URL: {}", self.id, url);
            let started = Instant::now();

            match self.fetch_with_retry(&url).await {
                Ok(FetchOutcome::Fetched { status, .. }) => {
                    tracing::debug!("Worker {}: fetched {} ({})", self.id, url, status);
                }
                Ok(FetchOutcome::FreshInStore) => {
                    tracing::debug!("Worker {}: {} fresh in store, skipped", self.id, url);
                }
                Err(e) => {
                    tracing::warn!(
                        "Worker {}: failed to process URL {} after retries: {}",
                        self.id,
                        url,
                        e
                    );
                    self.metrics.scraping_errors_total.inc();
                }
            }

            self.metrics.processing_time.observe(started.elapsed());
            if let Ok(len) = self.queue.len().await {
                self.metrics.queue_size.set(len as u64);
            }
        }

        tracing::debug!("Worker {} stopping", self.id);
    }

    /// Run the fetch pipeline with retry. Attempt k (k >= 1) is delayed by
    /// `retry_delay * 2^(k-1)`; permanent errors abandon the URL at once.
    async fn fetch_with_retry(&self, url: &str) -> Result<FetchOutcome, FetchError> {
        let mut attempt: u32 = 0;

        loop {
            match self.fetcher.fetch(url).await {
                Ok(outcome) => return Ok(outcome),
                Err(e) if e.is_permanent() || attempt >= self.config.max_retries => {
                    return Err(e);
                }
                Err(e) => {
                    attempt += 1;
                    let backoff = self.config.retry_delay() * 2u32.pow(attempt - 1);
                    tracing::debug!(
                        "Worker {}: retry {}/{} for URL {} in {:?} ({})",
                        self.id,
                        attempt,
                        self.config.max_retries,
                        url,
                        backoff,
                        e
                    );
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::MemoryQueue;
    use crate::store::SqliteStore;

    async fn test_crawler(config: CrawlerConfig) -> Crawler {
        let queue: Arc<dyn UrlQueue> = Arc::new(MemoryQueue::new());
        let store: Arc<dyn PageStore> = Arc::new(SqliteStore::in_memory().await.unwrap());
        Crawler::new(
            config,
            queue,
            store,
            CrawlerMetrics::shared(),
            Arc::new(ProxyPool::disabled()),
        )
        .unwrap()
    }

    fn small_config() -> CrawlerConfig {
        CrawlerConfig {
            worker_count: 2,
            respect_robots: false,
            request_timeout_secs: 5,
            ..CrawlerConfig::default()
        }
    }

    #[tokio::test]
    async fn enqueue_counts_urls() {
        let crawler = test_crawler(small_config()).await;

        crawler.enqueue_url("http://a.test/").await.unwrap();
        crawler.enqueue_url("http://b.test/").await.unwrap();

        let snapshot = crawler.metrics().snapshot();
        assert_eq!(snapshot.urls_queued_total, 2);
        assert_eq!(snapshot.queue_size, 2);
    }

    #[tokio::test]
    async fn start_and_stop_join_cleanly() {
        let crawler = test_crawler(small_config()).await;

        assert!(!crawler.is_running());
        crawler.start();
        assert!(crawler.is_running());
        assert_eq!(crawler.metrics().snapshot().workers_running, 2);

        // Double start is a no-op
        crawler.start();

        crawler.stop().await;
        assert!(!crawler.is_running());
        assert_eq!(crawler.metrics().snapshot().workers_running, 0);

        // Double stop is a no-op too
        crawler.stop().await;
    }

    #[tokio::test]
    async fn circuit_admin_surface() {
        let crawler = test_crawler(small_config()).await;
        assert_eq!(crawler.circuit_state("x.test"), CircuitState::Closed);
        crawler.reset_circuit("x.test");
        crawler.set_host_rate("x.test", 10.0, 5);
    }
}

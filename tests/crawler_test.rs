//! End-to-end crawler scenarios
//!
//! Drives the full worker pool against mock HTTP servers: enqueue, fetch,
//! hash, persist, and the politeness/fault-tolerance paths around them.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use crawld::config::CrawlerConfig;
use crawld::crawler::Crawler;
use crawld::metrics::CrawlerMetrics;
use crawld::proxy::ProxyPool;
use crawld::queue::{MemoryQueue, UrlQueue};
use crawld::store::{PageStore, SqliteStore};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// sha256("hello")
const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

fn test_config() -> CrawlerConfig {
    CrawlerConfig {
        worker_count: 2,
        respect_robots: false,
        // Fast per-host rate so multi-fetch tests aren't throttled
        default_delay_ms: 10,
        max_retries: 3,
        retry_delay_ms: 100,
        request_timeout_secs: 5,
        ..CrawlerConfig::default()
    }
}

struct Harness {
    crawler: Crawler,
    store: SqliteStore,
    metrics: Arc<CrawlerMetrics>,
}

async fn harness(config: CrawlerConfig) -> Harness {
    let queue: Arc<dyn UrlQueue> = Arc::new(MemoryQueue::new());
    let store = SqliteStore::in_memory().await.expect("in-memory store");
    let metrics = CrawlerMetrics::shared();

    let crawler = Crawler::new(
        config,
        queue,
        Arc::new(store.clone()),
        Arc::clone(&metrics),
        Arc::new(ProxyPool::disabled()),
    )
    .expect("crawler construction");

    Harness {
        crawler,
        store,
        metrics,
    }
}

/// Poll until `check` passes or the timeout elapses
async fn wait_until<F: FnMut() -> bool>(mut check: F, timeout: Duration) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(25)).await;
    }
    check()
}

#[tokio::test]
async fn happy_path_fetches_hashes_and_persists() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/"))
        .respond_with(ResponseTemplate::new(200).set_body_string("hello"))
        .mount(&server)
        .await;

    let h = harness(test_config()).await;
    let url = format!("{}/", server.uri());

    h.crawler.start();
    h.crawler.enqueue_url(&url).await.unwrap();

    let metrics = Arc::clone(&h.metrics);
    assert!(
        wait_until(
            || metrics.pages_scraped_total.get() >= 1,
            Duration::from_secs(5)
        )
        .await,
        "page was never scraped"
    );
    h.crawler.stop().await;

    let snapshot = h.metrics.snapshot();
    assert_eq!(snapshot.pages_scraped_total, 1);
    assert_eq!(snapshot.scraping_errors_total, 0);

    let pages = h.store.pages(10).await.unwrap();
    assert_eq!(pages.len(), 1);
    assert_eq!(pages[0].url, url);
    assert_eq!(pages[0].content_hash, HELLO_SHA256);
    let age = Utc::now().signed_duration_since(pages[0].scraped_at);
    assert!(age < chrono::Duration::seconds(10), "scraped_at is stale");
}

#[tokio::test]
async fn robots_disallow_blocks_the_fetch_entirely() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .and(path("/robots.txt"))
        .respond_with(
            ResponseTemplate::new(200).set_body_string("User-agent: *\nDisallow: /secret"),
        )
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/secret"))
        .respond_with(ResponseTemplate::new(200).set_body_string("forbidden fruit"))
        .mount(&server)
        .await;

    let mut config = test_config();
    config.respect_robots = true;
    let h = harness(config).await;
    let url = format!("{}/secret", server.uri());

    h.crawler.start();
    h.crawler.enqueue_url(&url).await.unwrap();

    let metrics = Arc::clone(&h.metrics);
    assert!(
        wait_until(
            || metrics.robots_disallowed_total.get() >= 1,
            Duration::from_secs(5)
        )
        .await,
        "robots disallow was never recorded"
    );
    h.crawler.stop().await;

    let snapshot = h.metrics.snapshot();
    assert_eq!(snapshot.robots_disallowed_total, 1);
    assert_eq!(snapshot.pages_scraped_total, 0);
    // Permanent error: one attempt, no retries, counted once
    assert_eq!(snapshot.scraping_errors_total, 1);

    // Only robots.txt was ever requested
    let requests = server.received_requests().await.unwrap();
    assert!(!requests.is_empty());
    assert!(requests.iter().all(|r| r.url.path() == "/robots.txt"));

    assert!(h.store.last_scrape_time(&url).await.unwrap().is_none());
}

#[tokio::test]
async fn fresh_url_is_skipped_without_any_request() {
    let server = MockServer::start().await;
    // Nothing mounted: any request would be recorded and fail the assert

    let h = harness(test_config()).await;
    let url = format!("{}/already-seen", server.uri());

    // Scraped a minute ago, well inside the 24h freshness window
    let a_minute_ago = Utc::now() - chrono::Duration::minutes(1);
    h.store
        .save_scraped_page(&url, a_minute_ago, "priorhash")
        .await
        .unwrap();

    h.crawler.start();
    h.crawler.enqueue_url(&url).await.unwrap();

    // Silent success: wait for the queue to drain and the worker to settle
    let metrics = Arc::clone(&h.metrics);
    assert!(
        wait_until(|| metrics.queue_size.get() == 0, Duration::from_secs(5)).await,
        "queue never drained"
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    h.crawler.stop().await;

    assert_eq!(server.received_requests().await.unwrap().len(), 0);
    let snapshot = h.metrics.snapshot();
    assert_eq!(snapshot.pages_scraped_total, 0);
    assert_eq!(snapshot.scraping_errors_total, 0);

    // The stored row did not change (timestamps round to microseconds)
    let stored = h.store.last_scrape_time(&url).await.unwrap().unwrap();
    let drift = (stored - a_minute_ago).num_milliseconds().abs();
    assert!(drift < 5, "stored timestamp moved by {}ms", drift);
}

#[tokio::test]
async fn transient_failures_retry_with_backoff_until_success() {
    let server = MockServer::start().await;

    // A first healthy endpoint seeds a success into the host's circuit
    // window so three consecutive 500s don't trip the breaker mid-test
    Mock::given(method("GET"))
        .and(path("/ok"))
        .respond_with(ResponseTemplate::new(200).set_body_string("fine"))
        .mount(&server)
        .await;

    // Three failures, then success
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(500))
        .up_to_n_times(3)
        .mount(&server)
        .await;
    Mock::given(method("GET"))
        .and(path("/flaky"))
        .respond_with(ResponseTemplate::new(200).set_body_string("finally"))
        .mount(&server)
        .await;

    let mut config = test_config();
    // With one success in the window, 3 failures give a ratio of 0.75 and
    // stay under a threshold of 1.0
    config.circuit_breaker_ratio = 1.0;
    let h = harness(config).await;

    h.crawler.start();
    h.crawler
        .enqueue_url(&format!("{}/ok", server.uri()))
        .await
        .unwrap();
    let metrics = Arc::clone(&h.metrics);
    assert!(
        wait_until(
            || metrics.pages_scraped_total.get() >= 1,
            Duration::from_secs(5)
        )
        .await
    );

    let flaky_url = format!("{}/flaky", server.uri());
    let started = Instant::now();
    h.crawler.enqueue_url(&flaky_url).await.unwrap();

    let metrics = Arc::clone(&h.metrics);
    assert!(
        wait_until(
            || metrics.pages_scraped_total.get() >= 2,
            Duration::from_secs(10)
        )
        .await,
        "flaky URL never succeeded"
    );
    let elapsed = started.elapsed();
    h.crawler.stop().await;

    // Backoff schedule: 100ms, 200ms, 400ms before attempts 2-4
    assert!(
        elapsed >= Duration::from_millis(700),
        "retries came back too fast: {:?}",
        elapsed
    );

    // 4 attempts at /flaky plus the initial /ok
    let requests = server.received_requests().await.unwrap();
    let flaky_hits = requests.iter().filter(|r| r.url.path() == "/flaky").count();
    assert_eq!(flaky_hits, 4);

    // One row, written by the final successful attempt
    assert!(h.store.last_scrape_time(&flaky_url).await.unwrap().is_some());
    assert_eq!(h.metrics.snapshot().scraping_errors_total, 0);
}

#[tokio::test]
async fn persistent_failures_trip_the_host_circuit() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
        .respond_with(ResponseTemplate::new(500))
        .mount(&server)
        .await;

    let mut config = test_config();
    config.max_retries = 0; // no retry noise; each URL is one attempt
    let h = harness(config).await;

    h.crawler.start();
    for i in 0..3 {
        h.crawler
            .enqueue_url(&format!("{}/dead/{}", server.uri(), i))
            .await
            .unwrap();
    }

    let metrics = Arc::clone(&h.metrics);
    assert!(
        wait_until(
            || metrics.circuit_breaker_trips_total.get() >= 1,
            Duration::from_secs(10)
        )
        .await,
        "circuit never tripped"
    );

    // Subsequent URLs for the host are rejected without a request
    let before = server.received_requests().await.unwrap().len();
    h.crawler
        .enqueue_url(&format!("{}/dead/rejected", server.uri()))
        .await
        .unwrap();
    let metrics = Arc::clone(&h.metrics);
    assert!(
        wait_until(|| metrics.queue_size.get() == 0, Duration::from_secs(5)).await
    );
    tokio::time::sleep(Duration::from_millis(300)).await;
    h.crawler.stop().await;

    assert_eq!(server.received_requests().await.unwrap().len(), before);
    assert_eq!(h.metrics.snapshot().open_circuits, 1);
    assert_eq!(h.metrics.snapshot().pages_scraped_total, 0);
}

#[tokio::test]
async fn stop_drains_workers_promptly() {
    let h = harness(test_config()).await;

    h.crawler.start();
    assert!(h.crawler.is_running());
    assert_eq!(h.metrics.snapshot().workers_running, 2);

    let started = Instant::now();
    h.crawler.stop().await;

    assert!(!h.crawler.is_running());
    assert_eq!(h.metrics.snapshot().workers_running, 0);
    // Workers observe stop between bounded waits; a drain should take at
    // most a couple of dequeue/pause cycles
    assert!(started.elapsed() < Duration::from_secs(5));
}

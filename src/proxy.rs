//! Proxy rotation and health accounting
//!
//! Round-robin rotation over a pool of proxy URLs, skipping entries whose
//! error ratio has marked them unhealthy. Selection is explicit: the
//! fetcher asks for a proxy, performs the request through it, and records
//! the outcome against that same proxy, so health attribution is exact.
//! An optional background refresh replaces the pool from a provider API.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::{Duration, Instant};

use parking_lot::RwLock;
use serde::Deserialize;
use url::Url;

use crate::config::ProxyConfig;

/// How often the pool is refreshed from the provider API
pub const REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

/// Error ratio at or above which a proxy is considered unhealthy
const UNHEALTHY_ERROR_RATE: f64 = 0.5;

/// Cumulative failures after which a proxy is unhealthy regardless of ratio
const UNHEALTHY_FAILURE_FLOOR: u64 = 5;

/// A proxy server with its health accounting
#[derive(Debug, Clone)]
pub struct ProxyEntry {
    pub url: String,
    pub healthy: bool,
    pub successes: u64,
    pub failures: u64,
    pub last_check: Instant,
}

impl ProxyEntry {
    fn new(url: String) -> Self {
        Self {
            url,
            // Assume healthy until proven otherwise
            healthy: true,
            successes: 0,
            failures: 0,
            last_check: Instant::now(),
        }
    }

    fn error_rate(&self) -> f64 {
        let total = self.successes + self.failures;
        if total == 0 {
            return 0.0;
        }
        self.failures as f64 / total as f64
    }
}

/// Response shape of the proxy provider's refresh endpoint
#[derive(Debug, Deserialize)]
struct ProxyListResponse {
    proxies: Vec<String>,
}

/// Rotating proxy pool
pub struct ProxyPool {
    entries: RwLock<Vec<ProxyEntry>>,
    cursor: AtomicUsize,
    enabled: bool,
    api_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl ProxyPool {
    /// Build a pool from configuration. Invalid proxy URLs are skipped
    /// with a warning; a disabled config yields an inert pool.
    pub fn new(cfg: &ProxyConfig) -> Self {
        let mut entries = Vec::new();
        if cfg.enabled {
            for raw in &cfg.urls {
                match Url::parse(raw) {
                    Ok(_) => entries.push(ProxyEntry::new(raw.clone())),
                    Err(e) => tracing::warn!("Skipping invalid proxy URL {}: {}", raw, e),
                }
            }
        }

        Self {
            entries: RwLock::new(entries),
            cursor: AtomicUsize::new(0),
            enabled: cfg.enabled,
            api_url: cfg.api_url.clone(),
            api_key: cfg.api_key.clone(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(10))
                .build()
                .unwrap_or_default(),
        }
    }

    /// An inert pool (no proxies, requests go direct)
    pub fn disabled() -> Self {
        Self::new(&ProxyConfig::default())
    }

    /// Pick the next proxy, round-robin, preferring healthy entries.
    /// Returns None when the pool is disabled or empty, in which case the
    /// caller goes direct.
    pub fn select(&self) -> Option<String> {
        if !self.enabled {
            return None;
        }

        let entries = self.entries.read();
        if entries.is_empty() {
            return None;
        }

        let start = self.cursor.fetch_add(1, Ordering::Relaxed) % entries.len();
        for offset in 0..entries.len() {
            let entry = &entries[(start + offset) % entries.len()];
            if entry.healthy {
                return Some(entry.url.clone());
            }
        }

        // Nothing healthy; hand out the scheduled entry and let the health
        // accounting recover it if it starts working again
        Some(entries[start].url.clone())
    }

    /// Record a successful request through a proxy
    pub fn record_success(&self, proxy_url: &str) {
        if !self.enabled {
            return;
        }

        let mut entries = self.entries.write();
        if let Some(entry) = entries.iter_mut().find(|e| e.url == proxy_url) {
            entry.successes += 1;
            entry.last_check = Instant::now();
            entry.healthy = entry.error_rate() < UNHEALTHY_ERROR_RATE;
        }
    }

    /// Record a failed request through a proxy
    pub fn record_failure(&self, proxy_url: &str) {
        if !self.enabled {
            return;
        }

        let mut entries = self.entries.write();
        if let Some(entry) = entries.iter_mut().find(|e| e.url == proxy_url) {
            entry.failures += 1;
            entry.last_check = Instant::now();
            entry.healthy = entry.error_rate() < UNHEALTHY_ERROR_RATE
                && entry.failures < UNHEALTHY_FAILURE_FLOOR;
        }
    }

    /// Number of currently healthy proxies (feeds the healthy_proxies gauge)
    pub fn healthy_count(&self) -> usize {
        self.entries.read().iter().filter(|e| e.healthy).count()
    }

    /// Total pool size
    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Whether a refresh endpoint is configured
    pub fn has_refresh_endpoint(&self) -> bool {
        self.enabled && !self.api_url.is_empty() && !self.api_key.is_empty()
    }

    /// Fetch a fresh proxy list from the provider and replace the pool
    /// atomically. Returns the new pool size.
    pub async fn refresh_once(&self) -> Result<usize, reqwest::Error> {
        let response = self
            .client
            .get(&self.api_url)
            .bearer_auth(&self.api_key)
            .send()
            .await?
            .error_for_status()?;

        let list: ProxyListResponse = response.json().await?;

        let fresh: Vec<ProxyEntry> = list
            .proxies
            .into_iter()
            .filter(|raw| match Url::parse(raw) {
                Ok(_) => true,
                Err(e) => {
                    tracing::warn!("Skipping invalid refreshed proxy URL {}: {}", raw, e);
                    false
                }
            })
            .map(ProxyEntry::new)
            .collect();

        let count = fresh.len();
        *self.entries.write() = fresh;
        tracing::info!("Refreshed proxy pool: {} entries", count);
        Ok(count)
    }

    /// Snapshot of the pool for introspection
    pub fn entries(&self) -> Vec<ProxyEntry> {
        self.entries.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with(urls: &[&str]) -> ProxyPool {
        ProxyPool::new(&ProxyConfig {
            enabled: true,
            urls: urls.iter().map(|s| s.to_string()).collect(),
            api_url: String::new(),
            api_key: String::new(),
        })
    }

    #[test]
    fn disabled_pool_selects_nothing() {
        let pool = ProxyPool::disabled();
        assert!(pool.select().is_none());
        assert_eq!(pool.healthy_count(), 0);
    }

    #[test]
    fn invalid_urls_are_skipped_at_construction() {
        let pool = pool_with(&["http://proxy1:8080", "not a url", "http://proxy2:8080"]);
        assert_eq!(pool.len(), 2);
    }

    #[test]
    fn rotation_cycles_through_the_pool() {
        let pool = pool_with(&["http://p1:8080", "http://p2:8080", "http://p3:8080"]);

        let picks: Vec<String> = (0..3).map(|_| pool.select().unwrap()).collect();
        assert_eq!(picks[0], "http://p1:8080");
        assert_eq!(picks[1], "http://p2:8080");
        assert_eq!(picks[2], "http://p3:8080");

        // Wraps around
        assert_eq!(pool.select().unwrap(), "http://p1:8080");
    }

    #[test]
    fn rotation_skips_unhealthy_entries() {
        let pool = pool_with(&["http://p1:8080", "http://p2:8080"]);

        // Drive p1 unhealthy: 5 failures crosses the floor
        for _ in 0..5 {
            pool.record_failure("http://p1:8080");
        }
        assert_eq!(pool.healthy_count(), 1);

        for _ in 0..4 {
            assert_eq!(pool.select().unwrap(), "http://p2:8080");
        }
    }

    #[test]
    fn error_ratio_marks_unhealthy() {
        let pool = pool_with(&["http://p1:8080"]);

        pool.record_success("http://p1:8080");
        pool.record_failure("http://p1:8080");
        // 1 failure / 2 total = 0.5, at the threshold
        assert_eq!(pool.healthy_count(), 0);

        // Successes dilute the ratio back under the threshold
        pool.record_success("http://p1:8080");
        pool.record_success("http://p1:8080");
        assert_eq!(pool.healthy_count(), 1);
    }

    #[test]
    fn failure_floor_outweighs_good_ratio() {
        let pool = pool_with(&["http://p1:8080"]);

        for _ in 0..20 {
            pool.record_success("http://p1:8080");
        }
        for _ in 0..5 {
            pool.record_failure("http://p1:8080");
        }
        // Ratio is 5/25 = 0.2, but 5 cumulative failures is the cap
        assert_eq!(pool.healthy_count(), 0);
    }

    #[test]
    fn all_unhealthy_still_serves_an_entry() {
        let pool = pool_with(&["http://p1:8080"]);
        for _ in 0..5 {
            pool.record_failure("http://p1:8080");
        }
        assert_eq!(pool.healthy_count(), 0);
        // Better a bad proxy than no request at all
        assert!(pool.select().is_some());
    }

    #[test]
    fn unknown_proxy_records_are_ignored() {
        let pool = pool_with(&["http://p1:8080"]);
        pool.record_failure("http://stranger:9999");
        assert_eq!(pool.healthy_count(), 1);
    }

    #[tokio::test]
    async fn refresh_replaces_pool_atomically() {
        use wiremock::matchers::{header, method, path};
        use wiremock::{Mock, MockServer, ResponseTemplate};

        let server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/proxies"))
            .and(header("authorization", "Bearer sekrit"))
            .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
                "proxies": ["http://fresh1:8080", "http://fresh2:8080"]
            })))
            .mount(&server)
            .await;

        let pool = ProxyPool::new(&ProxyConfig {
            enabled: true,
            urls: vec!["http://stale:8080".to_string()],
            api_url: format!("{}/proxies", server.uri()),
            api_key: "sekrit".to_string(),
        });
        assert!(pool.has_refresh_endpoint());

        let count = pool.refresh_once().await.unwrap();
        assert_eq!(count, 2);
        assert_eq!(pool.len(), 2);
        assert!(pool.entries().iter().all(|e| e.url.starts_with("http://fresh")));
    }
}

//! Single-URL fetch pipeline
//!
//! Runs one URL through, in order: parse, dedup lookup, circuit admission,
//! robots check, per-host rate limit, the HTTP GET itself, status
//! classification, capped body read, content hashing, and persistence.
//! Any step may short-circuit; errors carry their retry classification.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use dashmap::DashMap;
use sha2::{Digest, Sha256};
use thiserror::Error;
use url::Url;

use crate::config::CrawlerConfig;
use crate::crawler::circuit::CircuitBreaker;
use crate::crawler::limiter::HostRateLimiter;
use crate::crawler::robots::RobotsCache;
use crate::metrics::CrawlerMetrics;
use crate::proxy::ProxyPool;
use crate::store::PageStore;

/// Hard cap on response bodies
const MAX_BODY_BYTES: usize = 10 * 1024 * 1024;

/// Errors from fetching a single URL
#[derive(Debug, Error)]
pub enum FetchError {
    /// The URL string does not parse or has no host (permanent)
    #[error("invalid URL: {0}")]
    InvalidUrl(String),

    /// robots.txt disallows this URL (permanent)
    #[error("robots.txt disallowed URL {0}")]
    RobotsDisallowed(String),

    /// The host's circuit is open (permanent for this attempt)
    #[error("circuit breaker open for host {0}")]
    CircuitOpen(String),

    /// The rate-limiter wait hit the request deadline (transient)
    #[error("rate limiting wait failed for host {0}")]
    RateLimitDeadline(String),

    /// Network-level request failure (transient)
    #[error("http request failed: {0}")]
    Http(#[source] reqwest::Error),

    /// Non-2xx response status (transient)
    #[error("received non-2xx status code: {0}")]
    Status(u16),

    /// The response body could not be read (transient)
    #[error("failed to read response body: {0}")]
    BodyRead(#[source] reqwest::Error),

    /// The response body exceeded the size cap (transient)
    #[error("response body exceeded {MAX_BODY_BYTES} bytes")]
    BodyTooLarge,
}

impl FetchError {
    /// Permanent errors are not worth retrying: the same outcome is
    /// guaranteed on the next attempt.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            FetchError::InvalidUrl(_)
                | FetchError::RobotsDisallowed(_)
                | FetchError::CircuitOpen(_)
        )
    }
}

/// What a successful pipeline run produced
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FetchOutcome {
    /// The URL was fetched, hashed, and persisted
    Fetched {
        status: u16,
        content_hash: String,
        body_bytes: usize,
    },
    /// The URL was scraped recently enough that no request was made
    FreshInStore,
}

/// Executes the fetch pipeline for single URLs
pub struct Fetcher {
    config: CrawlerConfig,
    store: Arc<dyn PageStore>,
    robots: Arc<RobotsCache>,
    limiter: Arc<HostRateLimiter>,
    circuit: Arc<CircuitBreaker>,
    proxies: Arc<ProxyPool>,
    metrics: Arc<CrawlerMetrics>,
    /// Client for direct (unproxied) requests
    direct_client: reqwest::Client,
    /// One client per proxy URL, built on first use
    proxy_clients: DashMap<String, reqwest::Client>,
}

impl Fetcher {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: CrawlerConfig,
        store: Arc<dyn PageStore>,
        robots: Arc<RobotsCache>,
        limiter: Arc<HostRateLimiter>,
        circuit: Arc<CircuitBreaker>,
        proxies: Arc<ProxyPool>,
        metrics: Arc<CrawlerMetrics>,
    ) -> Result<Self, FetchError> {
        let direct_client = Self::client_builder(&config)
            .build()
            .map_err(FetchError::Http)?;

        Ok(Self {
            config,
            store,
            robots,
            limiter,
            circuit,
            proxies,
            metrics,
            direct_client,
            proxy_clients: DashMap::new(),
        })
    }

    /// Shared builder so direct and per-proxy clients stay consistent
    fn client_builder(config: &CrawlerConfig) -> reqwest::ClientBuilder {
        reqwest::Client::builder()
            .user_agent(&config.user_agent)
            .timeout(config.request_timeout())
            .pool_max_idle_per_host(20)
            .pool_idle_timeout(Duration::from_secs(30))
            .gzip(true)
            .brotli(true)
    }

    /// Run the full pipeline for one URL.
    pub async fn fetch(&self, url_str: &str) -> Result<FetchOutcome, FetchError> {
        // 1. Parse; a URL without a host has no rate-limit or circuit key
        let url = Url::parse(url_str)
            .map_err(|e| FetchError::InvalidUrl(format!("{}: {}", url_str, e)))?;
        let host = url
            .host_str()
            .ok_or_else(|| FetchError::InvalidUrl(format!("{}: no host", url_str)))?
            .to_string();

        // 2. Dedup: skip anything scraped within the freshness window. A
        // store read failure degrades to a fetch, not an error.
        match self.store.last_scrape_time(url_str).await {
            Ok(Some(last)) => {
                let age = Utc::now().signed_duration_since(last);
                let window = chrono::Duration::from_std(self.config.cache_expiration())
                    .unwrap_or(chrono::Duration::MAX);
                if age < window {
                    tracing::debug!("URL {} was scraped {} ago, skipping", url_str, age);
                    return Ok(FetchOutcome::FreshInStore);
                }
            }
            Ok(None) => {}
            Err(e) => {
                tracing::warn!("Dedup lookup failed for {}: {}", url_str, e);
            }
        }

        // 3. Circuit admission
        if !self.circuit.is_allowed(&host) {
            tracing::debug!("Circuit breaker is open for {}, skipping", host);
            return Err(FetchError::CircuitOpen(host));
        }

        // 4. Robots. A robots.txt that cannot be fetched at all is logged
        // and treated as allowed.
        if self.config.respect_robots {
            match self.robots.is_allowed(&url).await {
                Ok(true) => {}
                Ok(false) => {
                    self.metrics.robots_disallowed_total.inc();
                    return Err(FetchError::RobotsDisallowed(url_str.to_string()));
                }
                Err(e) => {
                    tracing::warn!("Error checking robots.txt for {}: {}", url_str, e);
                }
            }
        }

        // 5. Rate limit, bounded by the request timeout
        self.limiter
            .wait(&host, self.config.request_timeout())
            .await
            .map_err(|_| FetchError::RateLimitDeadline(host.clone()))?;

        // 6. HTTP GET, through a proxy when the pool offers one
        let proxy = self.proxies.select();
        let client = self.client_for(proxy.as_deref())?;

        tracing::debug!("Fetching {}...", url_str);
        let started = Instant::now();
        let response = client.get(url.as_str()).send().await;
        self.metrics
            .scraping_duration
            .observe_duration(started.elapsed());

        let response = match response {
            Ok(response) => response,
            Err(e) => {
                self.record_failure(&host, proxy.as_deref());
                return Err(FetchError::Http(e));
            }
        };

        // 7. Status classification: anything non-2xx is a host failure
        let status = response.status();
        if !status.is_success() {
            self.record_failure(&host, None);
            return Err(FetchError::Status(status.as_u16()));
        }

        // 8. Capped body read, hash, persist
        let body = match self.read_body_capped(response).await {
            Ok(body) => body,
            Err(e) => {
                self.record_failure(&host, None);
                return Err(e);
            }
        };
        self.metrics.response_size.observe(body.len() as u64);

        let mut hasher = Sha256::new();
        hasher.update(&body);
        let content_hash = hex::encode(hasher.finalize());

        let scraped_at = Utc::now();
        if let Err(e) = self
            .store
            .save_scraped_page(url_str, scraped_at, &content_hash)
            .await
        {
            // Persistence failure costs durability, not the fetch
            tracing::warn!("Error saving scrape data for {}: {}", url_str, e);
        }

        // 9. Accounting
        self.circuit.record_success(&host);
        if let Some(proxy_url) = &proxy {
            self.proxies.record_success(proxy_url);
        }
        self.metrics.pages_scraped_total.inc();
        self.refresh_gauges();

        tracing::debug!(
            "Fetched {} ({}) in {:?}, {} bytes",
            url_str,
            status,
            started.elapsed(),
            body.len()
        );

        Ok(FetchOutcome::Fetched {
            status: status.as_u16(),
            content_hash,
            body_bytes: body.len(),
        })
    }

    /// Record a host failure and, for network-level errors, the proxy
    /// failure as well.
    fn record_failure(&self, host: &str, proxy: Option<&str>) {
        if self.circuit.record_failure(host) {
            self.metrics.circuit_breaker_trips_total.inc();
        }
        if let Some(proxy_url) = proxy {
            self.proxies.record_failure(proxy_url);
            self.metrics.proxy_failures_total.inc();
        }
        self.refresh_gauges();
    }

    fn refresh_gauges(&self) {
        self.metrics
            .open_circuits
            .set(self.circuit.open_count() as u64);
        self.metrics
            .healthy_proxies
            .set(self.proxies.healthy_count() as u64);
    }

    /// Read the response body, refusing anything past the cap
    async fn read_body_capped(&self, mut response: reqwest::Response) -> Result<Vec<u8>, FetchError> {
        if let Some(len) = response.content_length() {
            if len as usize > MAX_BODY_BYTES {
                return Err(FetchError::BodyTooLarge);
            }
        }

        let mut body = Vec::new();
        while let Some(chunk) = response.chunk().await.map_err(FetchError::BodyRead)? {
            if body.len() + chunk.len() > MAX_BODY_BYTES {
                return Err(FetchError::BodyTooLarge);
            }
            body.extend_from_slice(&chunk);
        }
        Ok(body)
    }

    /// Client for the selected proxy, or the direct client when none
    fn client_for(&self, proxy: Option<&str>) -> Result<reqwest::Client, FetchError> {
        let Some(proxy_url) = proxy else {
            return Ok(self.direct_client.clone());
        };

        if let Some(client) = self.proxy_clients.get(proxy_url) {
            return Ok(client.clone());
        }

        let proxy = reqwest::Proxy::all(proxy_url).map_err(FetchError::Http)?;
        let client = Self::client_builder(&self.config)
            .proxy(proxy)
            .build()
            .map_err(FetchError::Http)?;
        self.proxy_clients
            .insert(proxy_url.to_string(), client.clone());
        Ok(client)
    }
}

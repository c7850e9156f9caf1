//! Configuration for the crawler
//!
//! TOML-backed with per-field defaults, so a partial file (or none at all)
//! yields a working configuration. `validate` collects every violation into
//! a single report.

use anyhow::Result;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Default user agent for all HTTP requests (fetching and robots.txt)
pub const DEFAULT_USER_AGENT: &str = "crawld/1.0 (+https://github.com/crawld)";

/// Main configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Crawler behavior
    #[serde(default)]
    pub crawler: CrawlerConfig,
    /// Persistent store location
    #[serde(default)]
    pub database: DatabaseConfig,
    /// Queue backend selection
    #[serde(default)]
    pub queue: QueueConfig,
    /// Proxy pool
    #[serde(default)]
    pub proxies: ProxyConfig,
}

/// Crawler behavior configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CrawlerConfig {
    /// User-Agent header and robots.txt agent token
    pub user_agent: String,
    /// Honor robots.txt (disable only for sites you control)
    pub respect_robots: bool,
    /// Default delay between requests to the same host (milliseconds);
    /// the per-host rate is 1/delay
    pub default_delay_ms: u64,
    /// Additional fetch attempts after the first failure
    pub max_retries: u32,
    /// Base backoff delay, doubled per retry (milliseconds)
    pub retry_delay_ms: u64,
    /// Number of parallel workers
    pub worker_count: usize,
    /// Per-HTTP-call deadline; also bounds the rate-limiter wait (seconds)
    pub request_timeout_secs: u64,
    /// Burst capacity of the per-host rate limiter
    pub max_concurrent_hosts: u32,
    /// Failure ratio that trips a host circuit (0.0-1.0)
    pub circuit_breaker_ratio: f64,
    /// How long a tripped circuit stays open before probing (seconds)
    pub circuit_breaker_reset_secs: u64,
    /// Freshness window: skip URLs scraped more recently than this (seconds)
    pub cache_expiration_secs: u64,
}

impl Default for CrawlerConfig {
    fn default() -> Self {
        Self {
            user_agent: DEFAULT_USER_AGENT.to_string(),
            respect_robots: true,
            default_delay_ms: 1000,
            max_retries: 3,
            retry_delay_ms: 5000,
            worker_count: 10,
            request_timeout_secs: 30,
            max_concurrent_hosts: 2,
            circuit_breaker_ratio: 0.5,
            circuit_breaker_reset_secs: 300,
            cache_expiration_secs: 86_400, // 24 hours
        }
    }
}

impl CrawlerConfig {
    /// Default per-host rate in requests/second (1 / default delay)
    pub fn default_rate(&self) -> f64 {
        1000.0 / self.default_delay_ms.max(1) as f64
    }

    pub fn retry_delay(&self) -> Duration {
        Duration::from_millis(self.retry_delay_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }

    pub fn cache_expiration(&self) -> Duration {
        Duration::from_secs(self.cache_expiration_secs)
    }

    pub fn circuit_breaker_reset(&self) -> Duration {
        Duration::from_secs(self.circuit_breaker_reset_secs)
    }
}

/// Persistent store configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// SQLite database file path
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: "./data/crawld.db".to_string(),
        }
    }
}

/// Queue backend selection
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueConfig {
    /// "memory" for single-process deployments and testing,
    /// "redis" for a queue shared between processes
    pub backend: QueueBackend,
    /// Redis connection URL (used when backend = "redis")
    pub redis_url: String,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self {
            backend: QueueBackend::Memory,
            redis_url: "redis://127.0.0.1:6379".to_string(),
        }
    }
}

/// Available queue backends
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum QueueBackend {
    Memory,
    Redis,
}

/// Proxy pool configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Enable the pool; when false all requests go direct
    #[serde(default)]
    pub enabled: bool,
    /// Static proxy URLs to rotate through
    #[serde(default)]
    pub urls: Vec<String>,
    /// Optional provider endpoint for hourly pool refresh
    #[serde(default)]
    pub api_url: String,
    /// Bearer token for the refresh endpoint
    #[serde(default)]
    pub api_key: String,
}

impl Config {
    /// Load configuration from a TOML file and validate it.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| anyhow::anyhow!("Failed to read config file '{}': {}", path.display(), e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| anyhow::anyhow!("Failed to parse config file '{}': {}", path.display(), e))?;
        config.validate()?;
        Ok(config)
    }

    /// Validate all configuration fields.
    ///
    /// Collects all validation errors and reports them together so the user
    /// can fix everything in one pass rather than playing whack-a-mole.
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if self.crawler.user_agent.trim().is_empty() {
            errors.push("user_agent must not be empty".to_string());
        }
        if self.crawler.worker_count == 0 {
            errors.push("worker_count must be positive".to_string());
        }
        if self.crawler.default_delay_ms == 0 {
            errors.push("default_delay_ms must be positive".to_string());
        }
        if self.crawler.request_timeout_secs == 0 {
            errors.push("request_timeout_secs must be positive".to_string());
        }
        if self.crawler.max_concurrent_hosts == 0 {
            errors.push("max_concurrent_hosts must be positive".to_string());
        }
        if !(0.0..=1.0).contains(&self.crawler.circuit_breaker_ratio) {
            errors.push("circuit_breaker_ratio must be between 0.0 and 1.0".to_string());
        }
        if self.crawler.circuit_breaker_reset_secs == 0 {
            errors.push("circuit_breaker_reset_secs must be positive".to_string());
        }

        if self.database.path.trim().is_empty() {
            errors.push("database path must not be empty".to_string());
        }

        if self.queue.backend == QueueBackend::Redis && self.queue.redis_url.trim().is_empty() {
            errors.push("redis_url must be set when queue backend is redis".to_string());
        }

        if self.proxies.enabled && self.proxies.urls.is_empty() && self.proxies.api_url.is_empty() {
            errors.push(
                "proxies.enabled requires at least one proxy URL or an api_url to refresh from"
                    .to_string(),
            );
        }

        if errors.is_empty() {
            Ok(())
        } else {
            anyhow::bail!(
                "Configuration validation failed:\n  - {}",
                errors.join("\n  - ")
            );
        }
    }
}

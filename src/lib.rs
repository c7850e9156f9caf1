//! crawld: fault-tolerant crawl orchestration
//!
//! The core of a distributed web scraper: URLs go in, workers fetch them
//! politely, and a content fingerprint comes out the other side. Features:
//! - Per-host token-bucket rate limiting with idle eviction
//! - Per-host circuit breaking over rolling failure windows
//! - robots.txt compliance with a 24h parsed-rules cache
//! - Retry with exponential backoff, permanent/transient classification
//! - Proxy rotation with per-proxy health accounting
//! - At-most-one-recent-fetch-per-URL dedup backed by a persistent store
//! - Pluggable queue (in-memory or Redis) for multi-process deployments

pub mod config;
pub mod crawler;
pub mod metrics;
pub mod proxy;
pub mod queue;
pub mod store;

pub use config::Config;
pub use crawler::{Crawler, FetchError, FetchOutcome};
pub use metrics::CrawlerMetrics;
pub use proxy::ProxyPool;
pub use queue::{MemoryQueue, RedisQueue, UrlQueue};
pub use store::{PageStore, ScrapedPage, SqliteStore};

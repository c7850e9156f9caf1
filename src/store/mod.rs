//! Persistent store abstraction
//!
//! The crawler needs three things from durable storage: a dedup lookup by
//! URL, an upsert of the per-URL scrape record, and paginated reads for
//! external consumers. Everything else about the schema is the backend's
//! business.

mod sqlite;

pub use sqlite::SqliteStore;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

/// Errors from store operations
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("stored timestamp for {url} is not parseable: {value}")]
    InvalidTimestamp { url: String, value: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type for store operations
pub type StoreResult<T> = Result<T, StoreError>;

/// A scraped page record
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScrapedPage {
    pub url: String,
    pub scraped_at: DateTime<Utc>,
    pub content_hash: String,
}

/// Durable record of what was scraped and when
#[async_trait]
pub trait PageStore: Send + Sync {
    /// Upsert the scrape record for a URL. A later `scraped_at` overwrites
    /// an earlier one; the URL is the primary key.
    async fn save_scraped_page(
        &self,
        url: &str,
        scraped_at: DateTime<Utc>,
        content_hash: &str,
    ) -> StoreResult<()>;

    /// When was this URL last scraped? `None` if never.
    async fn last_scrape_time(&self, url: &str) -> StoreResult<Option<DateTime<Utc>>>;

    /// Most recently scraped pages, newest first
    async fn pages(&self, limit: u32) -> StoreResult<Vec<ScrapedPage>>;

    /// Total number of stored pages
    async fn page_count(&self) -> StoreResult<u64>;

    /// Page listing with an offset, newest first
    async fn pages_paginated(&self, limit: u32, offset: u32) -> StoreResult<Vec<ScrapedPage>>;
}

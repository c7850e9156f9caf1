//! SQLite store implementation
//!
//! One table, `scraped_pages`, keyed by URL, with WAL journaling for
//! concurrent readers. Timestamps are stored as RFC 3339 text with fixed
//! microsecond precision so lexicographic and chronological order agree.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::{Row, SqlitePool};

use super::{PageStore, ScrapedPage, StoreError, StoreResult};

/// SQLite-backed page store
#[derive(Clone)]
pub struct SqliteStore {
    pool: SqlitePool,
}

impl SqliteStore {
    /// Open (or create) the database at `path` and ensure the schema.
    pub async fn new(path: &Path) -> StoreResult<Self> {
        if let Some(dir) = path.parent() {
            if !dir.as_os_str().is_empty() {
                std::fs::create_dir_all(dir)?;
            }
        }

        let options = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(sqlx::sqlite::SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;

        Self::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// Open from a database URL such as `sqlite:crawld.db`.
    pub async fn from_url(database_url: &str) -> StoreResult<Self> {
        let options = SqliteConnectOptions::from_str(database_url)?.create_if_missing(true);
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect_with(options)
            .await?;
        Self::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    /// In-memory database for tests. A single connection keeps every query
    /// on the same ephemeral database.
    pub async fn in_memory() -> StoreResult<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        Self::init_schema(&pool).await?;
        Ok(Self { pool })
    }

    async fn init_schema(pool: &SqlitePool) -> StoreResult<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS scraped_pages (
                url TEXT PRIMARY KEY,
                scraped_at TEXT NOT NULL,
                content_hash TEXT
            )
            "#,
        )
        .execute(pool)
        .await?;

        sqlx::query(
            "CREATE INDEX IF NOT EXISTS idx_scraped_at ON scraped_pages (scraped_at)",
        )
        .execute(pool)
        .await?;

        Ok(())
    }

    fn encode_timestamp(ts: DateTime<Utc>) -> String {
        ts.to_rfc3339_opts(SecondsFormat::Micros, true)
    }

    fn decode_timestamp(url: &str, value: &str) -> StoreResult<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(value)
            .map(|t| t.with_timezone(&Utc))
            .map_err(|_| StoreError::InvalidTimestamp {
                url: url.to_string(),
                value: value.to_string(),
            })
    }

    fn row_to_page(row: &sqlx::sqlite::SqliteRow) -> StoreResult<ScrapedPage> {
        let url: String = row.get("url");
        let scraped_at: String = row.get("scraped_at");
        let content_hash: Option<String> = row.get("content_hash");
        Ok(ScrapedPage {
            scraped_at: Self::decode_timestamp(&url, &scraped_at)?,
            url,
            content_hash: content_hash.unwrap_or_default(),
        })
    }
}

#[async_trait]
impl PageStore for SqliteStore {
    async fn save_scraped_page(
        &self,
        url: &str,
        scraped_at: DateTime<Utc>,
        content_hash: &str,
    ) -> StoreResult<()> {
        sqlx::query(
            r#"
            INSERT INTO scraped_pages (url, scraped_at, content_hash)
            VALUES (?, ?, ?)
            ON CONFLICT(url) DO UPDATE SET
                scraped_at = excluded.scraped_at,
                content_hash = excluded.content_hash
            "#,
        )
        .bind(url)
        .bind(Self::encode_timestamp(scraped_at))
        .bind(content_hash)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn last_scrape_time(&self, url: &str) -> StoreResult<Option<DateTime<Utc>>> {
        let row = sqlx::query("SELECT scraped_at FROM scraped_pages WHERE url = ?")
            .bind(url)
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => {
                let value: String = row.get("scraped_at");
                Ok(Some(Self::decode_timestamp(url, &value)?))
            }
            None => Ok(None),
        }
    }

    async fn pages(&self, limit: u32) -> StoreResult<Vec<ScrapedPage>> {
        let rows = sqlx::query(
            "SELECT url, scraped_at, content_hash FROM scraped_pages \
             ORDER BY scraped_at DESC LIMIT ?",
        )
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_page).collect()
    }

    async fn page_count(&self) -> StoreResult<u64> {
        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM scraped_pages")
            .fetch_one(&self.pool)
            .await?;
        Ok(count as u64)
    }

    async fn pages_paginated(&self, limit: u32, offset: u32) -> StoreResult<Vec<ScrapedPage>> {
        let rows = sqlx::query(
            "SELECT url, scraped_at, content_hash FROM scraped_pages \
             ORDER BY scraped_at DESC LIMIT ? OFFSET ?",
        )
        .bind(limit)
        .bind(offset)
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(Self::row_to_page).collect()
    }
}

//! crawld: fault-tolerant crawl orchestration
//!
//! Thin CLI over the crawler library: run the worker pool, enqueue URLs,
//! inspect stored pages.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Result;
use clap::{Parser, Subcommand};
use crawld::{
    config::{Config, QueueBackend},
    crawler::Crawler,
    metrics::CrawlerMetrics,
    proxy::ProxyPool,
    queue::{MemoryQueue, RedisQueue, UrlQueue},
    store::{PageStore, SqliteStore},
};
use tracing::{info, warn, Level};
use tracing_subscriber::FmtSubscriber;

#[derive(Parser)]
#[command(name = "crawld")]
#[command(about = "Fault-tolerant crawl orchestration")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, default_value = "crawld.toml")]
    config: PathBuf,

    /// Verbosity level
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the crawler until interrupted
    Run {
        /// Seed URLs to enqueue at startup
        #[arg(short, long)]
        seed: Vec<String>,

        /// Use the in-memory queue regardless of configuration
        #[arg(long)]
        mem_queue: bool,
    },

    /// Enqueue URLs onto the shared queue
    Enqueue {
        /// URLs to enqueue
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// List scraped pages, newest first
    Pages {
        /// Number of pages to show
        #[arg(short, long, default_value = "20")]
        limit: u32,

        /// Offset into the listing
        #[arg(short, long, default_value = "0")]
        offset: u32,
    },

    /// Write a default configuration file
    Init {
        /// Output directory
        #[arg(default_value = ".")]
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = match cli.verbose {
        0 => Level::INFO,
        1 => Level::DEBUG,
        _ => Level::TRACE,
    };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config = if cli.config.exists() {
        Config::load(&cli.config)?
    } else {
        Config::default()
    };

    match cli.command {
        Commands::Run { seed, mem_queue } => run_crawler(config, seed, mem_queue).await,
        Commands::Enqueue { urls } => enqueue_urls(config, urls).await,
        Commands::Pages { limit, offset } => show_pages(config, limit, offset).await,
        Commands::Init { path } => init_config(path),
    }
}

/// Build the queue selected by configuration, falling back to memory when
/// Redis is unreachable (matching single-process expectations).
async fn build_queue(config: &Config, force_memory: bool) -> Arc<dyn UrlQueue> {
    if force_memory || config.queue.backend == QueueBackend::Memory {
        info!("Using in-memory queue");
        return Arc::new(MemoryQueue::new());
    }

    match RedisQueue::new(&config.queue.redis_url).await {
        Ok(queue) => {
            info!("Using Redis queue at {}", config.queue.redis_url);
            Arc::new(queue)
        }
        Err(e) => {
            warn!("Failed to connect to Redis ({}), falling back to in-memory queue", e);
            Arc::new(MemoryQueue::new())
        }
    }
}

async fn run_crawler(config: Config, seeds: Vec<String>, mem_queue: bool) -> Result<()> {
    let queue = build_queue(&config, mem_queue).await;

    info!("Opening store at {}", config.database.path);
    let store: Arc<dyn PageStore> =
        Arc::new(SqliteStore::new(config.database.path.as_ref()).await?);

    let proxies = Arc::new(ProxyPool::new(&config.proxies));
    let metrics = CrawlerMetrics::shared();

    let crawler = Crawler::new(
        config.crawler.clone(),
        queue,
        store,
        Arc::clone(&metrics),
        proxies,
    )?;

    crawler.start();

    for seed in &seeds {
        info!("Enqueuing seed URL: {}", seed);
        if let Err(e) = crawler.enqueue_url(seed).await {
            warn!("Failed to enqueue seed URL {}: {}", seed, e);
        }
    }

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping crawler...");
    crawler.stop().await;

    let snapshot = metrics.snapshot();
    println!("\nCrawl summary");
    println!("=============");
    println!("Pages scraped:     {}", snapshot.pages_scraped_total);
    println!("Errors:            {}", snapshot.scraping_errors_total);
    println!("Robots disallowed: {}", snapshot.robots_disallowed_total);
    println!("Circuit trips:     {}", snapshot.circuit_breaker_trips_total);
    println!("Queue remaining:   {}", snapshot.queue_size);

    Ok(())
}

async fn enqueue_urls(config: Config, urls: Vec<String>) -> Result<()> {
    let queue = build_queue(&config, false).await;
    if config.queue.backend == QueueBackend::Memory {
        warn!("Enqueueing into an in-memory queue only affects this process");
    }

    for url in &urls {
        queue.enqueue(url).await?;
        println!("Queued {}", url);
    }
    Ok(())
}

async fn show_pages(config: Config, limit: u32, offset: u32) -> Result<()> {
    let store = SqliteStore::new(config.database.path.as_ref()).await?;

    let total = store.page_count().await?;
    let pages = store.pages_paginated(limit, offset).await?;

    println!("Scraped pages ({} total):\n", total);
    for page in pages {
        println!(
            "{}  {}  {}",
            page.scraped_at.format("%Y-%m-%d %H:%M:%S"),
            &page.content_hash[..page.content_hash.len().min(12)],
            page.url
        );
    }
    Ok(())
}

fn init_config(path: PathBuf) -> Result<()> {
    let config_path = path.join("crawld.toml");
    let toml_content = toml::to_string_pretty(&Config::default())?;
    std::fs::write(&config_path, toml_content)?;
    println!("Created configuration file: {}", config_path.display());
    Ok(())
}

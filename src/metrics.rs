//! Crawler metrics collection
//!
//! Lock-free instruments (counters, gauges, histograms, summaries) that the
//! crawler updates at every decision point. Exposition is left to the
//! embedding process; `to_prometheus` renders the standard text format.

use std::fmt::Write as FmtWrite;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Atomic counter for thread-safe incrementing
#[derive(Debug, Default)]
pub struct Counter {
    value: AtomicU64,
}

impl Counter {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Increment the counter by 1
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Increment the counter by a value
    pub fn add(&self, n: u64) {
        self.value.fetch_add(n, Ordering::Relaxed);
    }

    /// Get the current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Atomic gauge for thread-safe value tracking
#[derive(Debug, Default)]
pub struct Gauge {
    value: AtomicU64,
}

impl Gauge {
    pub fn new() -> Self {
        Self {
            value: AtomicU64::new(0),
        }
    }

    /// Set the gauge value
    pub fn set(&self, value: u64) {
        self.value.store(value, Ordering::Relaxed);
    }

    /// Increment the gauge
    pub fn inc(&self) {
        self.value.fetch_add(1, Ordering::Relaxed);
    }

    /// Decrement the gauge
    pub fn dec(&self) {
        self.value.fetch_sub(1, Ordering::Relaxed);
    }

    /// Get the current value
    pub fn get(&self) -> u64 {
        self.value.load(Ordering::Relaxed)
    }
}

/// Histogram with exponential buckets over integer-valued observations.
///
/// Values are stored in their native unit (microseconds for durations,
/// bytes for sizes); `to_prometheus` applies a per-metric scale when
/// rendering.
#[derive(Debug)]
pub struct Histogram {
    /// Bucket upper bounds in the native unit
    buckets: Vec<u64>,
    /// Count per bucket
    counts: Vec<AtomicU64>,
    /// Overflow count (values exceeding all bucket boundaries)
    overflow: AtomicU64,
    /// Sum of all values (for mean calculation)
    sum: AtomicU64,
    /// Total count
    count: AtomicU64,
}

impl Histogram {
    /// Create a histogram with the given bucket upper bounds
    pub fn with_buckets(buckets: Vec<u64>) -> Self {
        let counts = buckets.iter().map(|_| AtomicU64::new(0)).collect();
        Self {
            buckets,
            counts,
            overflow: AtomicU64::new(0),
            sum: AtomicU64::new(0),
            count: AtomicU64::new(0),
        }
    }

    /// Duration buckets: 10ms doubling to ~5s, stored as microseconds
    pub fn new_duration() -> Self {
        Self::with_buckets((0..10).map(|i| 10_000u64 << i).collect())
    }

    /// Size buckets: 1 KiB doubling to 512 KiB, stored as bytes
    pub fn new_size() -> Self {
        Self::with_buckets((0..10).map(|i| 1024u64 << i).collect())
    }

    /// Record a raw value in the native unit
    pub fn observe(&self, value: u64) {
        self.sum.fetch_add(value, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);

        for (i, &boundary) in self.buckets.iter().enumerate() {
            if value <= boundary {
                self.counts[i].fetch_add(1, Ordering::Relaxed);
                return;
            }
        }
        self.overflow.fetch_add(1, Ordering::Relaxed);
    }

    /// Record a duration (for duration-bucketed histograms)
    pub fn observe_duration(&self, duration: Duration) {
        self.observe(duration.as_micros() as u64);
    }

    /// Get the count of observations
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Get the mean observed value in the native unit
    pub fn mean(&self) -> f64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.sum.load(Ordering::Relaxed) as f64 / count as f64
    }

    /// Get bucket upper bounds in the native unit
    pub fn bucket_boundaries(&self) -> &[u64] {
        &self.buckets
    }

    /// Get per-bucket counts (non-cumulative)
    pub fn bucket_counts(&self) -> Vec<u64> {
        self.counts.iter().map(|c| c.load(Ordering::Relaxed)).collect()
    }

    /// Get the sum of all observed values in the native unit
    pub fn sum(&self) -> u64 {
        self.sum.load(Ordering::Relaxed)
    }
}

/// Summary instrument tracking count and sum of observations.
///
/// Quantile estimation is deliberately omitted; count, sum, and mean cover
/// what the crawler reports.
#[derive(Debug, Default)]
pub struct Summary {
    /// Sum of all values in microseconds
    sum: AtomicU64,
    /// Total count
    count: AtomicU64,
}

impl Summary {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a duration
    pub fn observe(&self, duration: Duration) {
        self.sum
            .fetch_add(duration.as_micros() as u64, Ordering::Relaxed);
        self.count.fetch_add(1, Ordering::Relaxed);
    }

    /// Get the count of observations
    pub fn count(&self) -> u64 {
        self.count.load(Ordering::Relaxed)
    }

    /// Get the sum of observations in seconds
    pub fn sum_seconds(&self) -> f64 {
        self.sum.load(Ordering::Relaxed) as f64 / 1_000_000.0
    }

    /// Get the mean observation in milliseconds
    pub fn mean_ms(&self) -> f64 {
        let count = self.count.load(Ordering::Relaxed);
        if count == 0 {
            return 0.0;
        }
        self.sum.load(Ordering::Relaxed) as f64 / count as f64 / 1000.0
    }
}

/// All crawler metrics
#[derive(Debug)]
pub struct CrawlerMetrics {
    // Counters
    pub pages_scraped_total: Counter,
    pub scraping_errors_total: Counter,
    pub urls_queued_total: Counter,
    pub robots_disallowed_total: Counter,
    pub circuit_breaker_trips_total: Counter,
    pub proxy_failures_total: Counter,

    // Gauges
    pub workers_running: Gauge,
    pub queue_size: Gauge,
    pub open_circuits: Gauge,
    pub healthy_proxies: Gauge,

    // Histograms
    pub scraping_duration: Histogram,
    pub response_size: Histogram,

    // Summaries
    pub queue_latency: Summary,
    pub processing_time: Summary,
}

impl CrawlerMetrics {
    /// Create new metrics
    pub fn new() -> Self {
        Self {
            pages_scraped_total: Counter::new(),
            scraping_errors_total: Counter::new(),
            urls_queued_total: Counter::new(),
            robots_disallowed_total: Counter::new(),
            circuit_breaker_trips_total: Counter::new(),
            proxy_failures_total: Counter::new(),
            workers_running: Gauge::new(),
            queue_size: Gauge::new(),
            open_circuits: Gauge::new(),
            healthy_proxies: Gauge::new(),
            scraping_duration: Histogram::new_duration(),
            response_size: Histogram::new_size(),
            queue_latency: Summary::new(),
            processing_time: Summary::new(),
        }
    }

    /// Create a shareable metrics instance
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    /// Take a snapshot of all metrics
    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            pages_scraped_total: self.pages_scraped_total.get(),
            scraping_errors_total: self.scraping_errors_total.get(),
            urls_queued_total: self.urls_queued_total.get(),
            robots_disallowed_total: self.robots_disallowed_total.get(),
            circuit_breaker_trips_total: self.circuit_breaker_trips_total.get(),
            proxy_failures_total: self.proxy_failures_total.get(),

            workers_running: self.workers_running.get(),
            queue_size: self.queue_size.get(),
            open_circuits: self.open_circuits.get(),
            healthy_proxies: self.healthy_proxies.get(),

            scraping_duration_ms: self.scraping_duration.mean() / 1000.0,
            response_size_bytes: self.response_size.mean(),
            queue_latency_ms: self.queue_latency.mean_ms(),
            processing_time_ms: self.processing_time.mean_ms(),
        }
    }

    /// Export all metrics in Prometheus exposition format
    pub fn to_prometheus(&self) -> String {
        let mut out = String::with_capacity(4096);

        write_counter(&mut out, "scraper_pages_scraped_total", "The total number of pages scraped", self.pages_scraped_total.get());
        write_counter(&mut out, "scraper_errors_total", "The total number of scraping errors", self.scraping_errors_total.get());
        write_counter(&mut out, "scraper_urls_queued_total", "The total number of URLs queued", self.urls_queued_total.get());
        write_counter(&mut out, "scraper_robots_disallowed_total", "The total number of URLs disallowed by robots.txt", self.robots_disallowed_total.get());
        write_counter(&mut out, "scraper_circuit_breaker_trips_total", "The total number of circuit breaker trips", self.circuit_breaker_trips_total.get());
        write_counter(&mut out, "scraper_proxy_failures_total", "The total number of proxy failures", self.proxy_failures_total.get());

        write_gauge(&mut out, "scraper_workers_running", "The number of scraper workers currently running", self.workers_running.get());
        write_gauge(&mut out, "scraper_queue_size", "The current size of the scraping queue", self.queue_size.get());
        write_gauge(&mut out, "scraper_open_circuits", "The number of currently open circuits", self.open_circuits.get());
        write_gauge(&mut out, "scraper_healthy_proxies", "The number of healthy proxies available", self.healthy_proxies.get());

        // Durations are stored in microseconds, sizes in bytes
        write_histogram(&mut out, "scraper_scraping_duration_seconds", "The distribution of scraping durations", &self.scraping_duration, 1_000_000.0);
        write_histogram(&mut out, "scraper_response_size_bytes", "The distribution of response sizes", &self.response_size, 1.0);

        write_summary(&mut out, "scraper_queue_latency_seconds", "The time URLs spend in the queue before being processed", &self.queue_latency);
        write_summary(&mut out, "scraper_processing_time_seconds", "The time spent processing each URL", &self.processing_time);

        out
    }
}

impl Default for CrawlerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

/// Write a counter metric in Prometheus exposition format
fn write_counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} counter", name);
    let _ = writeln!(out, "{} {}", name, value);
    let _ = writeln!(out);
}

/// Write a gauge metric in Prometheus exposition format
fn write_gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} gauge", name);
    let _ = writeln!(out, "{} {}", name, value);
    let _ = writeln!(out);
}

/// Write a histogram metric, dividing native-unit values by `scale`
fn write_histogram(out: &mut String, name: &str, help: &str, hist: &Histogram, scale: f64) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} histogram", name);

    let boundaries = hist.bucket_boundaries();
    let counts = hist.bucket_counts();

    // Cumulative le buckets (each includes all lower buckets)
    let mut cumulative: u64 = 0;
    for (i, &boundary) in boundaries.iter().enumerate() {
        cumulative += counts[i];
        let le = boundary as f64 / scale;
        let _ = writeln!(out, "{}_bucket{{le=\"{:.3}\"}} {}", name, le, cumulative);
    }
    let total_count = hist.count();
    let _ = writeln!(out, "{}_bucket{{le=\"+Inf\"}} {}", name, total_count);

    let sum = hist.sum() as f64 / scale;
    let _ = writeln!(out, "{}_sum {:.6}", name, sum);
    let _ = writeln!(out, "{}_count {}", name, total_count);
    let _ = writeln!(out);
}

/// Write a summary metric (sum and count; no quantiles)
fn write_summary(out: &mut String, name: &str, help: &str, summary: &Summary) {
    let _ = writeln!(out, "# HELP {} {}", name, help);
    let _ = writeln!(out, "# TYPE {} summary", name);
    let _ = writeln!(out, "{}_sum {:.6}", name, summary.sum_seconds());
    let _ = writeln!(out, "{}_count {}", name, summary.count());
    let _ = writeln!(out);
}

/// Point-in-time snapshot of all metrics
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MetricsSnapshot {
    pub pages_scraped_total: u64,
    pub scraping_errors_total: u64,
    pub urls_queued_total: u64,
    pub robots_disallowed_total: u64,
    pub circuit_breaker_trips_total: u64,
    pub proxy_failures_total: u64,

    pub workers_running: u64,
    pub queue_size: u64,
    pub open_circuits: u64,
    pub healthy_proxies: u64,

    pub scraping_duration_ms: f64,
    pub response_size_bytes: f64,
    pub queue_latency_ms: f64,
    pub processing_time_ms: f64,
}

//! Per-host rate limiting
//!
//! Token-bucket admission keyed by hostname. Buckets are created lazily on
//! first use with the configured default rate and burst, and reclaimed by a
//! periodic sweep once idle for longer than the TTL. Buckets are handed out
//! as `Arc` handles, so a sweep can drop the map entry while a waiter
//! finishes on its own handle.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use thiserror::Error;

/// How often the idle sweep runs
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(600);

/// How long a bucket may sit unused before the sweep reclaims it
pub const IDLE_TTL: Duration = Duration::from_secs(3600);

/// Errors from rate-limiter waits
#[derive(Debug, Error, PartialEq, Eq)]
pub enum RateLimitError {
    /// The next token could not be granted before the deadline
    #[error("rate limit wait exceeded the deadline")]
    DeadlineExceeded,
}

/// A single host's token bucket
#[derive(Debug)]
pub struct TokenBucket {
    state: Mutex<BucketState>,
}

#[derive(Debug)]
struct BucketState {
    /// Tokens added per second (fractional allowed; 0.2 = one per 5s)
    rate: f64,
    /// Maximum token pool
    burst: f64,
    /// Currently available tokens
    tokens: f64,
    /// Last refill instant
    last_refill: Instant,
    /// Last successful acquisition, for idle eviction
    last_used: Instant,
}

impl TokenBucket {
    fn new(rate: f64, burst: u32) -> Self {
        let now = Instant::now();
        Self {
            state: Mutex::new(BucketState {
                rate,
                burst: burst as f64,
                // A fresh bucket starts full
                tokens: burst as f64,
                last_refill: now,
                last_used: now,
            }),
        }
    }

    /// Try to take one token. On refusal, returns how long until the next
    /// token becomes available.
    fn try_acquire(&self) -> Result<(), Duration> {
        let mut state = self.state.lock();
        let now = Instant::now();

        let elapsed = now.duration_since(state.last_refill).as_secs_f64();
        state.tokens = (state.tokens + elapsed * state.rate).min(state.burst);
        state.last_refill = now;

        if state.tokens >= 1.0 {
            state.tokens -= 1.0;
            state.last_used = now;
            Ok(())
        } else {
            let missing = 1.0 - state.tokens;
            Err(Duration::from_secs_f64(missing / state.rate))
        }
    }

    fn last_used(&self) -> Instant {
        self.state.lock().last_used
    }
}

/// Manages rate limits for different hosts
#[derive(Debug)]
pub struct HostRateLimiter {
    buckets: RwLock<HashMap<String, Arc<TokenBucket>>>,
    default_rate: f64,
    default_burst: u32,
    ttl: Duration,
}

impl HostRateLimiter {
    /// Create a limiter whose lazily-created buckets use `default_rate`
    /// tokens/second with `default_burst` capacity.
    pub fn new(default_rate: f64, default_burst: u32) -> Self {
        Self::with_ttl(default_rate, default_burst, IDLE_TTL)
    }

    /// Create a limiter with a custom idle TTL (used by tests)
    pub fn with_ttl(default_rate: f64, default_burst: u32, ttl: Duration) -> Self {
        Self {
            buckets: RwLock::new(HashMap::new()),
            default_rate,
            default_burst,
            ttl,
        }
    }

    /// Block until a token is available for `host` or the deadline fires.
    pub async fn wait(&self, host: &str, timeout: Duration) -> Result<(), RateLimitError> {
        let deadline = Instant::now() + timeout;
        let bucket = self.bucket(host);

        loop {
            match bucket.try_acquire() {
                Ok(()) => return Ok(()),
                Err(wait) => {
                    // Fail fast when the grant cannot land before the deadline
                    if Instant::now() + wait > deadline {
                        return Err(RateLimitError::DeadlineExceeded);
                    }
                    tokio::time::sleep(wait).await;
                }
            }
        }
    }

    /// Report whether a token would be granted now, consuming it if so.
    pub fn allow(&self, host: &str) -> bool {
        self.bucket(host).try_acquire().is_ok()
    }

    /// Replace the bucket for `host` with new parameters. In-flight waiters
    /// finish on the bucket they already hold.
    pub fn set_rate(&self, host: &str, rate: f64, burst: u32) {
        self.buckets
            .write()
            .insert(host.to_string(), Arc::new(TokenBucket::new(rate, burst)));
    }

    /// Number of live buckets (feeds debugging/introspection)
    pub fn bucket_count(&self) -> usize {
        self.buckets.read().len()
    }

    /// Remove buckets idle for longer than the TTL. A bucket some task is
    /// currently waiting on is kept: the waiter's `Arc` clone raises the
    /// strong count above the map's own reference.
    pub fn sweep(&self) -> usize {
        let now = Instant::now();
        let mut buckets = self.buckets.write();
        let before = buckets.len();
        buckets.retain(|_, bucket| {
            Arc::strong_count(bucket) > 1 || now.duration_since(bucket.last_used()) <= self.ttl
        });
        before - buckets.len()
    }

    /// Get or lazily create the bucket for a host (double-checked so
    /// creation happens exactly once per host under contention).
    fn bucket(&self, host: &str) -> Arc<TokenBucket> {
        if let Some(bucket) = self.buckets.read().get(host) {
            return Arc::clone(bucket);
        }

        let mut buckets = self.buckets.write();
        // Re-check: another task may have inserted while we upgraded
        if let Some(bucket) = buckets.get(host) {
            return Arc::clone(bucket);
        }
        let bucket = Arc::new(TokenBucket::new(self.default_rate, self.default_burst));
        buckets.insert(host.to_string(), Arc::clone(&bucket));
        bucket
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allow_consumes_burst_then_denies() {
        let limiter = HostRateLimiter::new(1.0, 2);

        assert!(limiter.allow("a.test"));
        assert!(limiter.allow("a.test"));
        assert!(!limiter.allow("a.test"));

        // Separate host gets its own bucket
        assert!(limiter.allow("b.test"));
    }

    #[test]
    fn lazy_creation_is_once_per_host() {
        let limiter = HostRateLimiter::new(1.0, 1);
        let first = limiter.bucket("a.test");
        let second = limiter.bucket("a.test");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(limiter.bucket_count(), 1);
    }

    #[test]
    fn set_rate_replaces_bucket() {
        let limiter = HostRateLimiter::new(1.0, 1);
        assert!(limiter.allow("a.test"));
        assert!(!limiter.allow("a.test"));

        limiter.set_rate("a.test", 100.0, 5);
        for _ in 0..5 {
            assert!(limiter.allow("a.test"));
        }
        assert!(!limiter.allow("a.test"));
    }

    #[tokio::test]
    async fn wait_grants_after_refill() {
        // 50 tokens/sec: a token every 20ms
        let limiter = HostRateLimiter::new(50.0, 1);
        assert!(limiter.allow("a.test"));

        let start = Instant::now();
        limiter
            .wait("a.test", Duration::from_millis(500))
            .await
            .expect("wait should succeed within the deadline");
        assert!(start.elapsed() >= Duration::from_millis(10));
    }

    #[tokio::test]
    async fn wait_fails_fast_past_deadline() {
        // One token per 10 seconds
        let limiter = HostRateLimiter::new(0.1, 1);
        assert!(limiter.allow("slow.test"));

        let start = Instant::now();
        let err = limiter
            .wait("slow.test", Duration::from_millis(50))
            .await
            .unwrap_err();
        assert_eq!(err, RateLimitError::DeadlineExceeded);
        // Must not have slept anywhere near the 10s refill interval
        assert!(start.elapsed() < Duration::from_secs(1));
    }

    #[test]
    fn sweep_reclaims_idle_buckets() {
        let limiter = HostRateLimiter::with_ttl(1.0, 1, Duration::ZERO);
        limiter.allow("a.test");
        limiter.allow("b.test");
        assert_eq!(limiter.bucket_count(), 2);

        let removed = limiter.sweep();
        assert_eq!(removed, 2);
        assert_eq!(limiter.bucket_count(), 0);
    }

    #[test]
    fn sweep_keeps_fresh_buckets() {
        let limiter = HostRateLimiter::with_ttl(1.0, 1, Duration::from_secs(60));
        limiter.allow("a.test");
        assert_eq!(limiter.sweep(), 0);
        assert_eq!(limiter.bucket_count(), 1);
    }

    #[tokio::test]
    async fn sweep_spares_buckets_with_waiters() {
        let limiter = Arc::new(HostRateLimiter::with_ttl(5.0, 1, Duration::ZERO));
        // Exhaust the bucket so the waiter actually blocks (~200ms refill)
        assert!(limiter.allow("busy.test"));

        let waiter = {
            let limiter = Arc::clone(&limiter);
            tokio::spawn(async move { limiter.wait("busy.test", Duration::from_secs(2)).await })
        };

        // Give the waiter time to grab its bucket handle
        tokio::time::sleep(Duration::from_millis(50)).await;

        // TTL is zero, but the in-flight waiter keeps the entry alive
        assert_eq!(limiter.sweep(), 0);
        assert_eq!(limiter.bucket_count(), 1);

        waiter
            .await
            .expect("waiter task panicked")
            .expect("wait should complete despite the sweep");
    }
}

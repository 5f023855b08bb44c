//! Per-client token-bucket rate limiting.
//!
//! Each unique client key (normally the resolved remote IP) gets its own
//! bucket, created lazily on first contact. A background sweeper evicts
//! buckets that have been idle longer than the configured timeout. Rate and
//! burst are captured per bucket at creation, so parameter changes apply only
//! to buckets created afterwards.

use std::net::IpAddr;
use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::{Duration, Instant};

use dashmap::DashMap;
use governor::clock::DefaultClock;
use governor::middleware::NoOpMiddleware;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter as GovernorLimiter};
use tracing::debug;

use crate::config::RateLimitConfig;

type Bucket = GovernorLimiter<NotKeyed, InMemoryState, DefaultClock, NoOpMiddleware>;

/// Key a bucket is addressed by: a remote IP, or a salted token hash when the
/// `token` strategy is active.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum BucketKey {
    Ip(IpAddr),
    Token(String),
}

struct BucketEntry {
    bucket: Bucket,
    last_seen: Instant,
}

pub struct RateLimiter {
    enabled: bool,
    buckets: DashMap<BucketKey, BucketEntry>,
    quota: Quota,
    idle_eviction: Duration,
    cleanup_interval: Duration,
}

impl RateLimiter {
    pub fn new(config: &RateLimitConfig) -> Self {
        let rps = NonZeroU32::new(config.requests_per_second.max(1)).expect("non-zero rps");
        let burst = NonZeroU32::new(config.burst.max(1)).expect("non-zero burst");
        Self {
            enabled: config.enabled,
            buckets: DashMap::new(),
            quota: Quota::per_second(rps).allow_burst(burst),
            idle_eviction: config.idle_eviction,
            cleanup_interval: config.cleanup_interval,
        }
    }

    pub fn enabled(&self) -> bool {
        self.enabled
    }

    /// Non-blocking admission check. Locating the bucket is the only shared
    /// work; the token probe itself is constant-time.
    pub fn allow(&self, key: BucketKey) -> bool {
        if !self.enabled {
            return true;
        }
        let mut entry = self.buckets.entry(key).or_insert_with(|| BucketEntry {
            bucket: GovernorLimiter::direct(self.quota),
            last_seen: Instant::now(),
        });
        entry.last_seen = Instant::now();
        entry.bucket.check().is_ok()
    }

    /// Remove buckets idle longer than the eviction timeout. Returns the
    /// number removed.
    pub fn sweep(&self) -> usize {
        let cutoff = match Instant::now().checked_sub(self.idle_eviction) {
            Some(c) => c,
            None => return 0,
        };
        let before = self.buckets.len();
        self.buckets.retain(|_, entry| entry.last_seen > cutoff);
        let removed = before - self.buckets.len();
        if removed > 0 {
            debug!(removed, remaining = self.buckets.len(), "rate limiter sweep");
        }
        removed
    }

    pub fn tracked(&self) -> usize {
        self.buckets.len()
    }

    /// Spawn the periodic idle-bucket sweeper.
    pub fn spawn_sweeper(self: &Arc<Self>) {
        if !self.enabled {
            return;
        }
        let limiter = Arc::clone(self);
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(limiter.cleanup_interval);
            tick.tick().await;
            loop {
                tick.tick().await;
                limiter.sweep();
            }
        });
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter(rps: u32, burst: u32) -> RateLimiter {
        let mut config = RateLimitConfig::default();
        config.requests_per_second = rps;
        config.burst = burst;
        RateLimiter::new(&config)
    }

    fn ip(s: &str) -> BucketKey {
        BucketKey::Ip(s.parse().unwrap())
    }

    #[test]
    fn burst_is_honoured_then_rejected() {
        let rl = limiter(2, 3);
        for _ in 0..3 {
            assert!(rl.allow(ip("10.0.0.1")));
        }
        assert!(!rl.allow(ip("10.0.0.1")));
    }

    #[test]
    fn refill_allows_again() {
        let rl = limiter(2, 3);
        for _ in 0..3 {
            assert!(rl.allow(ip("10.0.0.2")));
        }
        assert!(!rl.allow(ip("10.0.0.2")));
        // 2 rps means one token roughly every 500 ms; 600 ms is enough for
        // one more request (scenario S4).
        std::thread::sleep(Duration::from_millis(600));
        assert!(rl.allow(ip("10.0.0.2")));
    }

    #[test]
    fn ips_are_independent() {
        let rl = limiter(1, 1);
        assert!(rl.allow(ip("10.0.0.3")));
        assert!(!rl.allow(ip("10.0.0.3")));
        assert!(rl.allow(ip("10.0.0.4")));
    }

    #[test]
    fn token_buckets_are_separate_from_ip_buckets() {
        let rl = limiter(1, 1);
        assert!(rl.allow(ip("10.0.0.5")));
        assert!(rl.allow(BucketKey::Token("deadbeef".into())));
        assert!(!rl.allow(BucketKey::Token("deadbeef".into())));
    }

    #[test]
    fn disabled_limiter_always_allows() {
        let mut config = RateLimitConfig::default();
        config.enabled = false;
        config.requests_per_second = 1;
        config.burst = 1;
        let rl = RateLimiter::new(&config);
        for _ in 0..10 {
            assert!(rl.allow(ip("10.0.0.6")));
        }
        assert_eq!(rl.tracked(), 0);
    }

    #[test]
    fn sweep_evicts_idle_buckets_only() {
        let mut config = RateLimitConfig::default();
        config.idle_eviction = Duration::from_millis(10);
        let rl = RateLimiter::new(&config);
        rl.allow(ip("10.0.0.7"));
        assert_eq!(rl.tracked(), 1);
        std::thread::sleep(Duration::from_millis(20));
        rl.allow(ip("10.0.0.8"));
        assert_eq!(rl.sweep(), 1);
        assert_eq!(rl.tracked(), 1);
    }
}

//! Per-client token-bucket rate limiting.
//!
//! One bucket per `client_key:route_id` pair, created lazily on first use.
//! Refill is continuous: on every check the bucket gains
//! `elapsed * refill_per_sec` tokens, capped at `capacity`, then one token is
//! consumed if available. Denied requests are terminal; nothing is queued.
//!
//! Buckets idle beyond a configurable window are removed by [`RateLimiterMap::sweep`],
//! which a background task runs periodically so the map stays bounded.
use std::{
    sync::Mutex,
    time::{Duration, Instant},
};

use scc::HashMap;

use crate::config::models::RateLimitConfig;

/// A single token bucket. All mutation goes through [`TokenBucket::allow`].
#[derive(Debug)]
pub struct TokenBucket {
    tokens: f64,
    last_refill: Instant,
    last_seen: Instant,
}

impl TokenBucket {
    /// A fresh bucket starts full.
    pub fn new(policy: &RateLimitConfig, now: Instant) -> Self {
        Self {
            tokens: policy.capacity as f64,
            last_refill: now,
            last_seen: now,
        }
    }

    fn refill(&mut self, policy: &RateLimitConfig, now: Instant) {
        let elapsed = now.saturating_duration_since(self.last_refill).as_secs_f64();
        self.tokens = (self.tokens + elapsed * policy.refill_per_sec).min(policy.capacity as f64);
        self.last_refill = now;
    }

    /// Refill for elapsed time, then try to consume one token.
    pub fn allow(&mut self, policy: &RateLimitConfig, now: Instant) -> bool {
        self.refill(policy, now);
        self.last_seen = now;
        if self.tokens >= 1.0 {
            self.tokens -= 1.0;
            true
        } else {
            false
        }
    }

    /// Tokens currently available (after a refill at `now`).
    pub fn available(&mut self, policy: &RateLimitConfig, now: Instant) -> f64 {
        self.refill(policy, now);
        self.tokens
    }

    fn idle_since(&self) -> Instant {
        self.last_seen
    }
}

/// Concurrent map of buckets keyed by `client_key:route_id`.
///
/// Synchronization is per entry; checks for unrelated keys never contend.
pub struct RateLimiterMap {
    buckets: HashMap<String, Mutex<TokenBucket>>,
}

impl RateLimiterMap {
    pub fn new() -> Self {
        Self {
            buckets: HashMap::new(),
        }
    }

    /// Combined bucket key for a client on a route.
    pub fn bucket_key(client_key: &str, route_id: &str) -> String {
        format!("{client_key}:{route_id}")
    }

    /// Check and consume one token for `key` under `policy`.
    /// The bucket is created full (and one token consumed) on first sight.
    pub async fn allow(&self, key: &str, policy: &RateLimitConfig, now: Instant) -> bool {
        let entry = self
            .buckets
            .entry_async(key.to_string())
            .await
            .or_insert_with(|| Mutex::new(TokenBucket::new(policy, now)));

        let mut bucket = entry
            .get()
            .lock()
            .expect("token bucket mutex poisoned");
        bucket.allow(policy, now)
    }

    /// Remove buckets unseen for longer than `idle_window`. Returns the
    /// number of evicted buckets.
    pub async fn sweep(&self, now: Instant, idle_window: Duration) -> usize {
        let before = self.buckets.len();
        self.buckets
            .retain_async(|_, bucket| {
                let bucket = bucket.lock().expect("token bucket mutex poisoned");
                now.saturating_duration_since(bucket.idle_since()) <= idle_window
            })
            .await;
        before.saturating_sub(self.buckets.len())
    }

    /// Number of live buckets.
    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

impl Default for RateLimiterMap {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn policy(capacity: u32, refill_per_sec: f64) -> RateLimitConfig {
        RateLimitConfig {
            capacity,
            refill_per_sec,
        }
    }

    #[test]
    fn test_burst_limited_to_capacity() {
        let policy = policy(2, 0.0);
        let now = Instant::now();
        let mut bucket = TokenBucket::new(&policy, now);

        assert!(bucket.allow(&policy, now));
        assert!(bucket.allow(&policy, now));
        // Third request within the window is denied; refill rate is zero.
        assert!(!bucket.allow(&policy, now));
        assert!(!bucket.allow(&policy, now + Duration::from_secs(3600)));
    }

    #[test]
    fn test_refill_restores_tokens_over_time() {
        let policy = policy(5, 2.0);
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(&policy, t0);

        for _ in 0..5 {
            assert!(bucket.allow(&policy, t0));
        }
        assert!(!bucket.allow(&policy, t0));

        // 2 tokens/s for 1.5s -> 3 tokens available
        let t1 = t0 + Duration::from_millis(1500);
        assert!(bucket.allow(&policy, t1));
        assert!(bucket.allow(&policy, t1));
        assert!(bucket.allow(&policy, t1));
        assert!(!bucket.allow(&policy, t1));
    }

    #[test]
    fn test_refill_capped_at_capacity() {
        let policy = policy(3, 10.0);
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(&policy, t0);
        for _ in 0..3 {
            assert!(bucket.allow(&policy, t0));
        }

        // A long idle period refills to capacity, never beyond it.
        let t1 = t0 + Duration::from_secs(60);
        assert!((bucket.available(&policy, t1) - 3.0).abs() < f64::EPSILON);
    }

    #[test]
    fn test_admission_bound_over_window() {
        // Admitted calls over any window never exceed
        // capacity + floor(window * refill_per_sec).
        let policy = policy(10, 4.0);
        let t0 = Instant::now();
        let mut bucket = TokenBucket::new(&policy, t0);

        let window = Duration::from_secs(5);
        let mut admitted = 0u64;
        // Hammer the bucket every 10ms across the window.
        for tick in 0..500 {
            let now = t0 + Duration::from_millis(tick * 10);
            if now > t0 + window {
                break;
            }
            if bucket.allow(&policy, now) {
                admitted += 1;
            }
        }

        let bound = policy.capacity as u64 + (window.as_secs_f64() * policy.refill_per_sec) as u64;
        assert!(
            admitted <= bound,
            "admitted {admitted} exceeds bound {bound}"
        );
    }

    #[tokio::test]
    async fn test_map_keys_are_independent() {
        let map = RateLimiterMap::new();
        let policy = policy(1, 0.0);
        let now = Instant::now();

        assert!(map.allow("alice:recipes", &policy, now).await);
        assert!(!map.allow("alice:recipes", &policy, now).await);
        // A different client on the same route has its own bucket.
        assert!(map.allow("bob:recipes", &policy, now).await);
        // Same client on a different route too.
        assert!(map.allow("alice:users", &policy, now).await);
    }

    #[tokio::test]
    async fn test_sweep_evicts_idle_buckets() {
        let map = RateLimiterMap::new();
        let policy = policy(5, 1.0);
        let t0 = Instant::now();

        map.allow("stale:recipes", &policy, t0).await;
        map.allow("fresh:recipes", &policy, t0 + Duration::from_secs(590))
            .await;
        assert_eq!(map.len(), 2);

        let evicted = map
            .sweep(t0 + Duration::from_secs(601), Duration::from_secs(600))
            .await;
        assert_eq!(evicted, 1);
        assert_eq!(map.len(), 1);

        // The evicted key starts over with a full bucket.
        assert!(
            map.allow("stale:recipes", &policy, t0 + Duration::from_secs(602))
                .await
        );
    }
}

//! Fixed-window per-key admission control.
//!
//! Generalizes the teacher crate's `middleware::rate_limit::RateLimitLayer`
//! (per-IP sliding window with burst allowance) from an HTTP-only,
//! `IpAddr`-keyed limiter to a generic per-key limiter usable for order
//! submission throttling, keyed by whatever identifier the caller supplies
//! (a session id, an adapter client id, and so on). Uses wall-clock time
//! deliberately: admission control is an operational safeguard against a
//! caller hammering the API, not part of the deterministic replay state.

use std::collections::HashMap;
use std::hash::Hash;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tracing::warn;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitConfig {
    pub max_requests: u32,
    pub window: Duration,
    pub burst: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 100,
            window: Duration::from_secs(1),
            burst: 20,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitResult {
    Allowed { remaining: u32 },
    BurstUsed { remaining: u32 },
    Exceeded { retry_after: Duration },
}

impl RateLimitResult {
    pub fn is_allowed(&self) -> bool {
        !matches!(self, RateLimitResult::Exceeded { .. })
    }
}

struct WindowEntry {
    count: u32,
    window_start: Instant,
}

/// Fixed-window admission control keyed by an arbitrary `K`.
pub struct RateLimiter<K> {
    config: RateLimitConfig,
    state: Mutex<HashMap<K, WindowEntry>>,
}

impl<K: Eq + Hash + Clone + std::fmt::Debug> RateLimiter<K> {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HashMap::new()),
        }
    }

    /// Checks and records one request for `key`, resetting the window if
    /// it has elapsed.
    pub fn check(&self, key: K) -> RateLimitResult {
        let mut state = self.state.lock();
        let now = Instant::now();

        let entry = state.entry(key.clone()).or_insert(WindowEntry {
            count: 0,
            window_start: now,
        });

        if now.duration_since(entry.window_start) >= self.config.window {
            entry.count = 0;
            entry.window_start = now;
        }

        entry.count += 1;
        let limit = self.config.max_requests + self.config.burst;
        let remaining = limit.saturating_sub(entry.count);
        let reset_at = entry.window_start + self.config.window;

        if entry.count > limit {
            warn!(?key, count = entry.count, limit, "rate limit exceeded");
            RateLimitResult::Exceeded {
                retry_after: reset_at.saturating_duration_since(now),
            }
        } else if entry.count > self.config.max_requests {
            RateLimitResult::BurstUsed { remaining }
        } else {
            RateLimitResult::Allowed { remaining }
        }
    }

    /// Drops bookkeeping for `key`, e.g. when a session is destroyed.
    pub fn forget(&self, key: &K) {
        self.state.lock().remove(key);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn allows_up_to_the_configured_limit() {
        let limiter: RateLimiter<&str> = RateLimiter::new(RateLimitConfig {
            max_requests: 2,
            window: Duration::from_secs(60),
            burst: 0,
        });
        assert!(limiter.check("s1").is_allowed());
        assert!(limiter.check("s1").is_allowed());
        assert!(!limiter.check("s1").is_allowed());
    }

    #[test]
    fn burst_allowance_is_distinguished_from_base_limit() {
        let limiter: RateLimiter<&str> = RateLimiter::new(RateLimitConfig {
            max_requests: 1,
            window: Duration::from_secs(60),
            burst: 1,
        });
        assert!(matches!(limiter.check("s1"), RateLimitResult::Allowed { .. }));
        assert!(matches!(limiter.check("s1"), RateLimitResult::BurstUsed { .. }));
        assert!(matches!(limiter.check("s1"), RateLimitResult::Exceeded { .. }));
    }

    #[test]
    fn keys_are_independent() {
        let limiter: RateLimiter<&str> = RateLimiter::new(RateLimitConfig {
            max_requests: 1,
            window: Duration::from_secs(60),
            burst: 0,
        });
        assert!(limiter.check("a").is_allowed());
        assert!(limiter.check("b").is_allowed());
    }
}

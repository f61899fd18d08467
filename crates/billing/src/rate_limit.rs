//! In-process webhook rate limiting
//!
//! Fixed one-second windows keyed by provider name. Process-local by
//! design; a multi-instance deployment would move this to a shared
//! counter store.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Default ceiling: 30 admitted events per provider per second.
pub const DEFAULT_EVENTS_PER_SECOND: u32 = 30;

#[derive(Debug, Clone, Copy)]
pub struct RateLimitResult {
    pub allowed: bool,
    pub remaining: u32,
    pub retry_after_seconds: Option<u64>,
}

#[derive(Debug)]
struct Window {
    started_at: Instant,
    count: u32,
}

/// In-memory fixed-window rate limiter.
#[derive(Clone)]
pub struct RateLimiter {
    windows: Arc<Mutex<HashMap<String, Window>>>,
    limit: u32,
}

impl RateLimiter {
    pub fn new_in_memory(limit: u32) -> Self {
        Self {
            windows: Arc::new(Mutex::new(HashMap::new())),
            limit,
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Count one event against the key's current window.
    pub async fn check(&self, key: &str) -> RateLimitResult {
        let mut windows = self.windows.lock().await;
        let now = Instant::now();

        let window = windows.entry(key.to_string()).or_insert(Window {
            started_at: now,
            count: 0,
        });

        if now.duration_since(window.started_at) >= Duration::from_secs(1) {
            window.started_at = now;
            window.count = 0;
        }

        if window.count >= self.limit {
            return RateLimitResult {
                allowed: false,
                remaining: 0,
                retry_after_seconds: Some(1),
            };
        }

        window.count += 1;
        RateLimitResult {
            allowed: true,
            remaining: self.limit - window.count,
            retry_after_seconds: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn allows_up_to_limit_within_window() {
        let limiter = RateLimiter::new_in_memory(3);

        for i in 0..3 {
            let result = limiter.check("paylink").await;
            assert!(result.allowed, "event {i} should be admitted");
        }

        let result = limiter.check("paylink").await;
        assert!(!result.allowed);
        assert_eq!(result.retry_after_seconds, Some(1));
    }

    #[tokio::test]
    async fn providers_are_limited_independently() {
        let limiter = RateLimiter::new_in_memory(1);

        assert!(limiter.check("paylink").await.allowed);
        assert!(!limiter.check("paylink").await.allowed);
        assert!(limiter.check("other").await.allowed);
    }
}

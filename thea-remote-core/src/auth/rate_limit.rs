use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::Mutex;

const WINDOW: i64 = 60;

/// Sliding-window connection-attempt limiter, keyed by remote host.
pub struct AttemptRateLimiter {
    max_per_minute: usize,
    attempts: Mutex<HashMap<String, Vec<DateTime<Utc>>>>,
}

impl AttemptRateLimiter {
    pub fn new(max_per_minute: usize) -> Self {
        Self {
            max_per_minute,
            attempts: Mutex::new(HashMap::new()),
        }
    }

    /// Records an attempt and reports whether it is within the limit.
    pub async fn check(&self, host: &str) -> bool {
        let now = Utc::now();
        let cutoff = now - Duration::seconds(WINDOW);
        let mut attempts = self.attempts.lock().await;
        let entry = attempts.entry(host.to_owned()).or_default();
        entry.retain(|t| *t > cutoff);
        if entry.len() >= self.max_per_minute {
            return false;
        }
        entry.push(now);
        true
    }

    /// Drops hosts whose whole window has expired.
    pub async fn cleanup(&self) {
        let cutoff = Utc::now() - Duration::seconds(WINDOW);
        let mut attempts = self.attempts.lock().await;
        attempts.retain(|_, times| {
            times.retain(|t| *t > cutoff);
            !times.is_empty()
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_eleventh_attempt_in_window_is_refused() {
        let limiter = AttemptRateLimiter::new(10);
        for _ in 0..10 {
            assert!(limiter.check("192.168.1.50").await);
        }
        assert!(!limiter.check("192.168.1.50").await);
    }

    #[tokio::test]
    async fn test_hosts_are_tracked_independently() {
        let limiter = AttemptRateLimiter::new(1);
        assert!(limiter.check("10.0.0.1").await);
        assert!(!limiter.check("10.0.0.1").await);
        assert!(limiter.check("10.0.0.2").await);
    }

    #[tokio::test]
    async fn test_cleanup_drops_empty_hosts() {
        let limiter = AttemptRateLimiter::new(10);
        limiter.check("10.0.0.1").await;
        limiter.cleanup().await;
        // host still inside the window, so the attempt count persists
        assert_eq!(limiter.attempts.lock().await.len(), 1);
    }
}

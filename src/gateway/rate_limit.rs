//! Per-connection message rate limiting
//!
//! Rolling 60-second window. Each connection gets its own budget; frames
//! over budget are answered with RATE_LIMITED and otherwise ignored. Entries
//! for closed connections are reaped by the periodic cleanup.

use dashmap::DashMap;
use std::time::{Duration, Instant};
use uuid::Uuid;

const WINDOW: Duration = Duration::from_secs(60);

pub struct MessageRateLimiter {
    limit: u32,
    windows: DashMap<Uuid, Vec<Instant>>,
}

impl MessageRateLimiter {
    pub fn new(limit: u32) -> Self {
        Self {
            limit,
            windows: DashMap::new(),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    pub fn window_secs(&self) -> u64 {
        WINDOW.as_secs()
    }

    /// Record one frame for the connection. Returns false when the budget
    /// for the rolling window is exhausted.
    pub fn allow(&self, conn_id: Uuid) -> bool {
        let now = Instant::now();
        let mut stamps = self.windows.entry(conn_id).or_default();
        stamps.retain(|t| now.duration_since(*t) < WINDOW);
        if stamps.len() >= self.limit as usize {
            return false;
        }
        stamps.push(now);
        true
    }

    pub fn forget(&self, conn_id: Uuid) {
        self.windows.remove(&conn_id);
    }

    /// Drop windows with no recent activity
    pub fn cleanup(&self) {
        let now = Instant::now();
        self.windows
            .retain(|_, stamps| stamps.iter().any(|t| now.duration_since(*t) < WINDOW));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_budget_is_per_connection() {
        let limiter = MessageRateLimiter::new(3);
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        for _ in 0..3 {
            assert!(limiter.allow(a));
        }
        assert!(!limiter.allow(a));
        // Other connections are unaffected
        assert!(limiter.allow(b));
    }

    #[test]
    fn test_forget_resets_budget() {
        let limiter = MessageRateLimiter::new(1);
        let conn = Uuid::new_v4();
        assert!(limiter.allow(conn));
        assert!(!limiter.allow(conn));
        limiter.forget(conn);
        assert!(limiter.allow(conn));
    }
}

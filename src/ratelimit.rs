use chrono::Utc;
use dashmap::DashMap;

use crate::error::ServiceError;

pub const WINDOW_SECS: i64 = 60;
pub const IP_LIMIT: u32 = 30;
pub const VOTE_LIMIT: u32 = 5;
pub const CLAIM_LIMIT: u32 = 5;
pub const PING_LIMIT: u32 = 10;

#[derive(Debug, Clone, Copy)]
struct Window {
    count: u32,
    reset_at: i64,
}

/// Fixed 60-second windows keyed by `ip`, `vote_<addr>`, `claim_<addr>`,
/// `ping_<addr>`.
#[derive(Default)]
pub struct RateLimiter {
    windows: DashMap<String, Window>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn check(&self, key: &str, limit: u32) -> Result<(), ServiceError> {
        self.check_at(key, limit, Utc::now().timestamp())
    }

    fn check_at(&self, key: &str, limit: u32, now: i64) -> Result<(), ServiceError> {
        let mut entry = self.windows.entry(key.to_string()).or_insert(Window {
            count: 0,
            reset_at: now + WINDOW_SECS,
        });
        if now >= entry.reset_at {
            entry.count = 0;
            entry.reset_at = now + WINDOW_SECS;
        }
        if entry.count >= limit {
            return Err(ServiceError::RateLimited);
        }
        entry.count += 1;
        Ok(())
    }

    /// Drop windows whose reset time has passed.
    pub fn prune(&self) -> usize {
        let now = Utc::now().timestamp();
        let before = self.windows.len();
        self.windows.retain(|_, window| window.reset_at >= now);
        before - self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::{RateLimiter, VOTE_LIMIT};

    #[test]
    fn enforces_limit_within_window() {
        let limiter = RateLimiter::new();
        for _ in 0..VOTE_LIMIT {
            assert!(limiter.check_at("vote_x", VOTE_LIMIT, 1_000).is_ok());
        }
        assert!(limiter.check_at("vote_x", VOTE_LIMIT, 1_000).is_err());
        // Separate keys have separate budgets.
        assert!(limiter.check_at("vote_y", VOTE_LIMIT, 1_000).is_ok());
    }

    #[test]
    fn window_expiry_resets_the_budget() {
        let limiter = RateLimiter::new();
        for _ in 0..VOTE_LIMIT {
            limiter.check_at("vote_x", VOTE_LIMIT, 1_000).unwrap();
        }
        assert!(limiter.check_at("vote_x", VOTE_LIMIT, 1_000).is_err());
        assert!(limiter.check_at("vote_x", VOTE_LIMIT, 1_061).is_ok());
    }
}

//! Sliding-window rate limiting
//!
//! Each bearer token gets an independent window of recent request instants.
//! On every check the window is pruned to the trailing interval, then the
//! request is admitted only while the retained count is under the budget.
//! Windows live in memory only and reset on process restart.

use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

/// Default window length
const DEFAULT_WINDOW: Duration = Duration::from_secs(60);

/// Default number of requests admitted per window
const DEFAULT_MAX_REQUESTS: usize = 60;

/// Rate limiter configuration
#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Trailing interval considered for admission
    pub window: Duration,
    /// Requests admitted within one window
    pub max_requests: usize,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: DEFAULT_WINDOW,
            max_requests: DEFAULT_MAX_REQUESTS,
        }
    }
}

/// Outcome of a rate-limit check
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    /// Request admitted; its timestamp has been recorded
    Admitted,
    /// Window is full; request must be rejected with 429
    Limited,
}

/// Per-key sliding-window rate limiter
///
/// Not internally synchronized; the server owns one instance behind its
/// state mutex.
pub struct RateLimiter {
    config: RateLimitConfig,
    windows: HashMap<String, VecDeque<Instant>>,
}

impl RateLimiter {
    /// Create a limiter with the given configuration
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            config,
            windows: HashMap::new(),
        }
    }

    /// Check and record a request for `key` at the current instant
    pub fn check(&mut self, key: &str) -> RateDecision {
        self.check_at(key, Instant::now())
    }

    /// Check and record a request for `key` at an explicit instant
    pub fn check_at(&mut self, key: &str, now: Instant) -> RateDecision {
        let window = self.windows.entry(key.to_string()).or_default();

        if let Some(cutoff) = now.checked_sub(self.config.window) {
            while window.front().is_some_and(|&t| t <= cutoff) {
                window.pop_front();
            }
        }

        if window.len() >= self.config.max_requests {
            return RateDecision::Limited;
        }

        window.push_back(now);
        RateDecision::Admitted
    }

    /// Drop windows whose newest entry has aged out of the interval
    ///
    /// Called periodically so tokens that went quiet do not pin memory.
    pub fn sweep(&mut self, now: Instant) {
        if let Some(cutoff) = now.checked_sub(self.config.window) {
            self.windows
                .retain(|_, window| window.back().is_some_and(|&t| t > cutoff));
        }
    }

    /// Number of keys currently tracked
    pub fn tracked_keys(&self) -> usize {
        self.windows.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn limiter() -> RateLimiter {
        RateLimiter::new(RateLimitConfig::default())
    }

    #[test]
    fn test_window_admits_budget_then_rejects() {
        let mut limiter = limiter();
        let base = Instant::now();

        for i in 0..60 {
            let at = base + Duration::from_millis(i * 10);
            assert_eq!(limiter.check_at("token-a", at), RateDecision::Admitted);
        }

        // 61st request inside the same window
        let at = base + Duration::from_secs(30);
        assert_eq!(limiter.check_at("token-a", at), RateDecision::Limited);
    }

    #[test]
    fn test_requests_spread_past_window_all_admitted() {
        let mut limiter = limiter();
        let base = Instant::now();

        // 60 requests over 61.5 seconds: by the time the later ones arrive,
        // the oldest have fallen out of the trailing window
        for i in 0..60u64 {
            let at = base + Duration::from_millis(i * 1050);
            assert_eq!(limiter.check_at("token-a", at), RateDecision::Admitted);
        }

        let at = base + Duration::from_millis(61 * 1050);
        assert_eq!(limiter.check_at("token-a", at), RateDecision::Admitted);
    }

    #[test]
    fn test_windows_are_independent_per_key() {
        let mut limiter = limiter();
        let base = Instant::now();

        for _ in 0..60 {
            limiter.check_at("token-a", base);
        }
        assert_eq!(limiter.check_at("token-a", base), RateDecision::Limited);
        assert_eq!(limiter.check_at("token-b", base), RateDecision::Admitted);
    }

    #[test]
    fn test_rejected_request_is_not_recorded() {
        let mut limiter = RateLimiter::new(RateLimitConfig {
            window: Duration::from_secs(60),
            max_requests: 1,
        });
        let base = Instant::now();

        assert_eq!(limiter.check_at("token-a", base), RateDecision::Admitted);
        assert_eq!(
            limiter.check_at("token-a", base + Duration::from_secs(1)),
            RateDecision::Limited
        );

        // The rejection above did not consume window space: once the first
        // entry ages out, the next request goes through
        assert_eq!(
            limiter.check_at("token-a", base + Duration::from_secs(61)),
            RateDecision::Admitted
        );
    }

    #[test]
    fn test_sweep_drops_idle_windows() {
        let mut limiter = limiter();
        let base = Instant::now();

        limiter.check_at("token-a", base);
        limiter.check_at("token-b", base + Duration::from_secs(50));
        assert_eq!(limiter.tracked_keys(), 2);

        limiter.sweep(base + Duration::from_secs(70));
        assert_eq!(limiter.tracked_keys(), 1);
    }
}

// =============================================================================
// Rate limiter — leaky bucket guarding the broker request path
// =============================================================================
//
// The broker allows 50 requests per trailing 1-second window. `acquire`
// suspends the caller until a slot frees up instead of rejecting, so
// bursty bootstrap sequences (symbol-detail chunks, history fetches) are
// smoothed rather than erroring.
// =============================================================================

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use tokio::sync::Mutex;

/// Async leaky bucket over a trailing time window.
pub struct RateLimiter {
    rate: usize,
    window: Duration,
    timestamps: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    /// Default broker budget: 50 requests per second.
    pub fn new(rate: usize) -> Self {
        Self::with_window(rate, Duration::from_secs(1))
    }

    pub fn with_window(rate: usize, window: Duration) -> Self {
        Self {
            rate,
            window,
            timestamps: Mutex::new(VecDeque::with_capacity(rate)),
        }
    }

    /// Wait until a request slot is available, then consume it.
    pub async fn acquire(&self) {
        let mut stamps = self.timestamps.lock().await;

        let now = Instant::now();
        while let Some(front) = stamps.front() {
            if now.duration_since(*front) >= self.window {
                stamps.pop_front();
            } else {
                break;
            }
        }

        if stamps.len() >= self.rate {
            let wait = self.window - now.duration_since(*stamps.front().unwrap());
            tokio::time::sleep(wait).await;
            // Re-trim after sleeping.
            let now = Instant::now();
            while let Some(front) = stamps.front() {
                if now.duration_since(*front) >= self.window {
                    stamps.pop_front();
                } else {
                    break;
                }
            }
        }

        stamps.push_back(Instant::now());
    }

    /// Requests consumed within the current window.
    pub async fn current_usage(&self) -> usize {
        let mut stamps = self.timestamps.lock().await;
        let now = Instant::now();
        while let Some(front) = stamps.front() {
            if now.duration_since(*front) >= self.window {
                stamps.pop_front();
            } else {
                break;
            }
        }
        stamps.len()
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn under_budget_never_blocks() {
        let limiter = RateLimiter::new(10);
        let start = Instant::now();
        for _ in 0..10 {
            limiter.acquire().await;
        }
        assert!(start.elapsed() < Duration::from_millis(100));
        assert_eq!(limiter.current_usage().await, 10);
    }

    #[tokio::test]
    async fn over_budget_suspends_until_window_frees() {
        let limiter = RateLimiter::with_window(2, Duration::from_millis(100));
        limiter.acquire().await;
        limiter.acquire().await;

        let start = Instant::now();
        limiter.acquire().await;
        assert!(start.elapsed() >= Duration::from_millis(80));
    }

    #[tokio::test]
    async fn usage_decays_after_window() {
        let limiter = RateLimiter::with_window(5, Duration::from_millis(50));
        limiter.acquire().await;
        limiter.acquire().await;
        assert_eq!(limiter.current_usage().await, 2);

        tokio::time::sleep(Duration::from_millis(70)).await;
        assert_eq!(limiter.current_usage().await, 0);
    }
}

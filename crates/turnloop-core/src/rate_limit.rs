//! Sliding-window admission control for upstream calls
//!
//! `acquire` never rejects a caller because of load; it only delays until the
//! oldest admission leaves the window.

use std::collections::VecDeque;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tokio::time::Instant;
use tracing::debug;

/// Default window length
pub const DEFAULT_WINDOW_MS: u64 = 60_000;

/// Upper bound on admission re-checks within a single `acquire`
const DEFAULT_MAX_ADMISSION_CHECKS: u32 = 1_000;

/// Rate limiter settings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RateLimitConfig {
    /// Maximum admissions within one window
    pub max_requests: usize,
    /// Window length in milliseconds
    pub window_ms: u64,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            max_requests: 50,
            window_ms: DEFAULT_WINDOW_MS,
        }
    }
}

/// Raised only for configurations that can never admit a request
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RateLimitError {
    #[error("rate limiter is configured with zero capacity")]
    ZeroCapacity,
    #[error("admission not granted after {checks} checks")]
    Starved { checks: u32 },
}

/// Point-in-time view of the limiter
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimitStats {
    /// Admissions currently inside the window
    pub current: usize,
    pub max: usize,
    pub window_ms: u64,
}

/// Sliding-window rate limiter, safe to share between tasks
#[derive(Debug)]
pub struct RateLimiter {
    max_requests: usize,
    window: Duration,
    max_checks: u32,
    admitted: Mutex<VecDeque<Instant>>,
}

impl RateLimiter {
    pub fn new(max_requests: usize, window: Duration) -> Self {
        Self {
            max_requests,
            window,
            max_checks: DEFAULT_MAX_ADMISSION_CHECKS,
            admitted: Mutex::new(VecDeque::with_capacity(max_requests)),
        }
    }

    /// Limiter with the default 60s window
    pub fn per_minute(max_requests: usize) -> Self {
        Self::new(max_requests, Duration::from_millis(DEFAULT_WINDOW_MS))
    }

    pub fn from_config(config: &RateLimitConfig) -> Self {
        Self::new(config.max_requests, Duration::from_millis(config.window_ms))
    }

    /// Override the bound on admission re-checks
    pub fn with_max_checks(mut self, checks: u32) -> Self {
        self.max_checks = checks.max(1);
        self
    }

    /// Wait until a request may be issued, then record it
    pub async fn acquire(&self) -> Result<(), RateLimitError> {
        if self.max_requests == 0 {
            return Err(RateLimitError::ZeroCapacity);
        }

        for check in 1..=self.max_checks {
            let wait = {
                let mut admitted = self.admitted.lock().await;
                let now = Instant::now();
                self.prune(&mut admitted, now);

                if admitted.len() < self.max_requests {
                    admitted.push_back(now);
                    return Ok(());
                }

                // Full window: sleep until the oldest admission expires
                match admitted.front() {
                    Some(oldest) => (*oldest + self.window).saturating_duration_since(now),
                    None => self.window,
                }
            };

            debug!(
                check,
                wait_ms = wait.as_millis() as u64,
                max_requests = self.max_requests,
                "Rate limit reached, waiting for window"
            );
            tokio::time::sleep(wait.max(Duration::from_millis(1))).await;
        }

        Err(RateLimitError::Starved {
            checks: self.max_checks,
        })
    }

    /// Current window occupancy
    pub async fn stats(&self) -> RateLimitStats {
        let mut admitted = self.admitted.lock().await;
        self.prune(&mut admitted, Instant::now());
        RateLimitStats {
            current: admitted.len(),
            max: self.max_requests,
            window_ms: self.window.as_millis() as u64,
        }
    }

    fn prune(&self, admitted: &mut VecDeque<Instant>, now: Instant) {
        while let Some(oldest) = admitted.front() {
            if now.saturating_duration_since(*oldest) >= self.window {
                admitted.pop_front();
            } else {
                break;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[tokio::test(start_paused = true)]
    async fn test_admits_up_to_max_without_waiting() {
        let limiter = RateLimiter::new(3, Duration::from_secs(10));
        let start = Instant::now();

        for _ in 0..3 {
            limiter.acquire().await.unwrap();
        }

        assert_eq!(start.elapsed(), Duration::ZERO);
        let stats = limiter.stats().await;
        assert_eq!(stats.current, 3);
        assert_eq!(stats.max, 3);
        assert_eq!(stats.window_ms, 10_000);
    }

    #[tokio::test(start_paused = true)]
    async fn test_extra_request_waits_at_most_one_window() {
        let window = Duration::from_secs(10);
        let limiter = RateLimiter::new(2, window);

        limiter.acquire().await.unwrap();
        tokio::time::advance(Duration::from_secs(3)).await;
        limiter.acquire().await.unwrap();

        let start = Instant::now();
        limiter.acquire().await.unwrap();
        let waited = start.elapsed();

        assert!(waited > Duration::ZERO);
        assert!(waited <= window);
        // The first admission left the window 10s after it was taken
        assert_eq!(waited, Duration::from_secs(7));
    }

    #[tokio::test(start_paused = true)]
    async fn test_window_expiry_frees_capacity() {
        let limiter = RateLimiter::new(1, Duration::from_millis(500));
        limiter.acquire().await.unwrap();
        assert_eq!(limiter.stats().await.current, 1);

        tokio::time::advance(Duration::from_millis(500)).await;
        assert_eq!(limiter.stats().await.current, 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_capacity_is_reported() {
        let limiter = RateLimiter::per_minute(0);
        assert_eq!(limiter.acquire().await, Err(RateLimitError::ZeroCapacity));
    }

    #[tokio::test(start_paused = true)]
    async fn test_bounded_checks_end_in_starvation() {
        let limiter = RateLimiter::new(1, Duration::from_secs(10)).with_max_checks(1);
        limiter.acquire().await.unwrap();

        let start = Instant::now();
        assert_eq!(limiter.acquire().await, Err(RateLimitError::Starved { checks: 1 }));
        // one full wait for the window, then give up
        assert_eq!(start.elapsed(), Duration::from_secs(10));
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_acquire_respects_window() {
        let limiter = Arc::new(RateLimiter::new(2, Duration::from_secs(1)));
        let start = Instant::now();

        let handles: Vec<_> = (0..4)
            .map(|_| {
                let limiter = Arc::clone(&limiter);
                tokio::spawn(async move {
                    limiter.acquire().await.unwrap();
                    start.elapsed()
                })
            })
            .collect();

        let mut waits = Vec::new();
        for handle in handles {
            waits.push(handle.await.unwrap());
        }
        waits.sort();

        assert_eq!(waits[0], Duration::ZERO);
        assert_eq!(waits[1], Duration::ZERO);
        assert!(waits[2] >= Duration::from_secs(1));
        assert!(waits[3] >= Duration::from_secs(1));
    }
}

//! Bounded retry with exponential backoff and jitter

use std::fmt;
use std::future::Future;
use std::time::Duration;

use rand::Rng;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Fraction of the base delay added as random jitter (upper bound)
const JITTER_RATIO: f64 = 0.3;

/// Retry policy for a fallible async operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Maximum number of invocations, including the first
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub base_delay_ms: u64,
    /// Cap on the exponential delay (before jitter)
    pub max_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 1000,
            max_delay_ms: 30_000,
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: u32, base_delay_ms: u64, max_delay_ms: u64) -> Self {
        Self {
            max_attempts,
            base_delay_ms,
            max_delay_ms,
        }
    }

    /// Exponential delay for a 1-based attempt, capped at `max_delay_ms`
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        let millis = self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms);
        Duration::from_millis(millis)
    }

    /// Base delay plus up to 30% uniform jitter
    pub fn delay_with_jitter(&self, attempt: u32) -> Duration {
        let base = self.base_delay(attempt);
        let max_jitter = base.as_secs_f64() * JITTER_RATIO;
        let jitter = if max_jitter > 0.0 {
            rand::thread_rng().gen_range(0.0..=max_jitter)
        } else {
            0.0
        };
        base + Duration::from_secs_f64(jitter)
    }

    /// Decide what to do after `attempt` failed
    pub fn plan(&self, attempt: u32, retryable: bool) -> RetryAttempt {
        self.plan_with_floor(attempt, retryable, None)
    }

    /// Like `plan`, but never sleep less than `floor` (itself capped at `max_delay_ms`)
    pub fn plan_with_floor(
        &self,
        attempt: u32,
        retryable: bool,
        floor: Option<Duration>,
    ) -> RetryAttempt {
        let delay = if retryable && attempt < self.max_attempts {
            let delay = self.delay_with_jitter(attempt);
            let cap = Duration::from_millis(self.max_delay_ms);
            Some(floor.map_or(delay, |floor| delay.max(floor.min(cap))))
        } else {
            None
        };
        RetryAttempt {
            attempt,
            retryable,
            delay,
        }
    }
}

/// Decision taken after a single failed attempt
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryAttempt {
    /// 1-based number of the attempt that failed
    pub attempt: u32,
    /// Classification of the failure
    pub retryable: bool,
    /// Sleep before the next attempt; `None` means give up
    pub delay: Option<Duration>,
}

/// Why a retried operation finally failed. Always carries the most recent error.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The error was classified as non-retryable
    Terminal { error: E, attempts: u32 },
    /// Every allowed attempt failed with a retryable error
    Exhausted { error: E, attempts: u32 },
}

impl<E> RetryError<E> {
    pub fn attempts(&self) -> u32 {
        match self {
            RetryError::Terminal { attempts, .. } | RetryError::Exhausted { attempts, .. } => {
                *attempts
            }
        }
    }

    pub fn last_error(&self) -> &E {
        match self {
            RetryError::Terminal { error, .. } | RetryError::Exhausted { error, .. } => error,
        }
    }

    pub fn into_inner(self) -> E {
        match self {
            RetryError::Terminal { error, .. } | RetryError::Exhausted { error, .. } => error,
        }
    }
}

impl<E: fmt::Display> fmt::Display for RetryError<E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            RetryError::Terminal { error, attempts } => {
                write!(f, "{} (non-retryable, attempt {})", error, attempts)
            }
            RetryError::Exhausted { error, attempts } => {
                write!(f, "{} (gave up after {} attempts)", error, attempts)
            }
        }
    }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for RetryError<E> {}

/// Run `operation` until it succeeds, fails terminally, or the policy runs out.
///
/// `operation` is invoked at most `policy.max_attempts` times (at least once).
pub async fn with_retry<T, E, F, Fut, C>(
    policy: &RetryPolicy,
    is_retryable: C,
    operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    E: fmt::Display,
{
    with_retry_hinted(policy, is_retryable, |_: &E| None, operation).await
}

/// `with_retry`, where `retry_hint` may raise the next delay to a floor taken
/// from the error (e.g. a server's `Retry-After`).
pub async fn with_retry_hinted<T, E, F, Fut, C, H>(
    policy: &RetryPolicy,
    is_retryable: C,
    retry_hint: H,
    mut operation: F,
) -> Result<T, RetryError<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    C: Fn(&E) -> bool,
    H: Fn(&E) -> Option<Duration>,
    E: fmt::Display,
{
    let mut attempt = 0;
    loop {
        attempt += 1;
        let error = match operation(attempt).await {
            Ok(value) => return Ok(value),
            Err(e) => e,
        };

        let decision = policy.plan_with_floor(attempt, is_retryable(&error), retry_hint(&error));
        match decision.delay {
            Some(delay) => {
                debug!(
                    attempt,
                    max_attempts = policy.max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    error = %error,
                    "Retrying after failure"
                );
                tokio::time::sleep(delay).await;
            }
            None if !decision.retryable => {
                warn!(attempt, error = %error, "Non-retryable failure");
                return Err(RetryError::Terminal {
                    error,
                    attempts: attempt,
                });
            }
            None => {
                warn!(attempt, error = %error, "Retry attempts exhausted");
                return Err(RetryError::Exhausted {
                    error,
                    attempts: attempt,
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_base_delay_doubles_and_caps() {
        let policy = RetryPolicy::new(10, 100, 1000);
        assert_eq!(policy.base_delay(1), Duration::from_millis(100));
        assert_eq!(policy.base_delay(2), Duration::from_millis(200));
        assert_eq!(policy.base_delay(3), Duration::from_millis(400));
        assert_eq!(policy.base_delay(5), Duration::from_millis(1000));
        assert_eq!(policy.base_delay(80), Duration::from_millis(1000));
    }

    #[test]
    fn test_jitter_stays_within_bounds() {
        let policy = RetryPolicy::new(5, 1000, 10_000);
        for attempt in 1..5 {
            let base = policy.base_delay(attempt);
            let delay = policy.delay_with_jitter(attempt);
            assert!(delay >= base);
            assert!(delay <= base.mul_f64(1.0 + JITTER_RATIO) + Duration::from_millis(1));
        }
    }

    #[test]
    fn test_plan_gives_up_on_last_attempt() {
        let policy = RetryPolicy::new(3, 10, 100);
        assert!(policy.plan(1, true).delay.is_some());
        assert!(policy.plan(2, true).delay.is_some());
        assert!(policy.plan(3, true).delay.is_none());
        assert!(policy.plan(1, false).delay.is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_always_retryable_runs_max_attempts() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(4, 10, 100);

        let result: Result<(), _> = with_retry(&policy, |_: &String| true, |attempt| {
            calls.fetch_add(1, Ordering::SeqCst);
            async move { Err(format!("failure {}", attempt)) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 4);
        match result {
            Err(RetryError::Exhausted { error, attempts }) => {
                assert_eq!(attempts, 4);
                // most recent failure, not the first
                assert_eq!(error, "failure 4");
            }
            other => panic!("unexpected result: {:?}", other),
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_runs_once() {
        let calls = AtomicU32::new(0);
        let policy = RetryPolicy::new(5, 10, 100);

        let result: Result<(), _> = with_retry(&policy, |_: &String| false, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("bad request".to_string()) }
        })
        .await;

        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(matches!(result, Err(RetryError::Terminal { attempts: 1, .. })));
    }

    #[tokio::test(start_paused = true)]
    async fn test_recovers_after_transient_failures() {
        let policy = RetryPolicy::new(3, 1000, 5000);
        let start = tokio::time::Instant::now();

        let result = with_retry(&policy, |_: &String| true, |attempt| async move {
            if attempt < 3 {
                Err("reset".to_string())
            } else {
                Ok(attempt)
            }
        })
        .await;

        assert_eq!(result.unwrap(), 3);
        // 1000ms + 2000ms of base backoff, plus jitter
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(3000));
        assert!(elapsed <= Duration::from_millis(3900 + 10));
    }

    #[test]
    fn test_floor_is_capped_at_max_delay() {
        let policy = RetryPolicy::new(3, 10, 100);
        let delay = policy
            .plan_with_floor(1, true, Some(Duration::from_secs(20)))
            .delay
            .unwrap();
        assert_eq!(delay, Duration::from_millis(100));
        assert!(policy
            .plan_with_floor(3, true, Some(Duration::from_secs(20)))
            .delay
            .is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_hint_raises_delay() {
        let policy = RetryPolicy::new(2, 10, 100);
        let start = tokio::time::Instant::now();

        let result: Result<(), _> = with_retry_hinted(
            &policy,
            |_: &String| true,
            |_: &String| Some(Duration::from_secs(20)),
            |_| async { Err("slow down".to_string()) },
        )
        .await;

        assert!(matches!(result, Err(RetryError::Exhausted { attempts: 2, .. })));
        // hint of 20s is bounded by max_delay_ms
        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(100));
        assert!(elapsed <= Duration::from_millis(101));
    }

    #[tokio::test(start_paused = true)]
    async fn test_retry_hint_below_backoff_is_ignored() {
        let policy = RetryPolicy::new(2, 50, 1000);
        let start = tokio::time::Instant::now();

        let _: Result<(), _> = with_retry_hinted(
            &policy,
            |_: &String| true,
            |_: &String| Some(Duration::from_millis(1)),
            |_| async { Err("reset".to_string()) },
        )
        .await;

        let elapsed = start.elapsed();
        assert!(elapsed >= Duration::from_millis(50));
        assert!(elapsed <= Duration::from_millis(65 + 1));
    }
}

//! Retry policies for failed service calls.
//!
//! A [`RetryPolicy`] decides, after a failed attempt, whether the pool
//! should try again — and sleeps out any backoff delay before answering.
//! Policies are pure strategy objects: the dispatcher owns attempt
//! counting and elapsed-time tracking and passes both in.
//!
//! Two implementations are provided: [`RetryNTimes`] (fixed attempt
//! budget, optional constant delay) and [`ExponentialBackoffRetry`]
//! (doubling, jittered delay with a cap).

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;

/// Strategy for determining when to retry operations.
#[async_trait]
pub trait RetryPolicy: Send + Sync {
    /// Called when an operation has failed. Returns `true` if the
    /// operation should be tried again.
    ///
    /// Any backoff delay is slept inside this method, so a `true` return
    /// means the caller may retry immediately. Dropping the returned
    /// future cancels the backoff sleep along with the call.
    ///
    /// `num_attempts` is the number of attempts so far and must be at
    /// least 1; `elapsed` is how long the operation has been attempted.
    async fn allow_retry(&self, num_attempts: u32, elapsed: Duration) -> bool;
}

/// A retry policy that permits a fixed number of attempts.
///
/// `max_attempts` counts the initial attempt: a value of 3 means at most
/// two retries. A value of 0 is accepted for backward compatibility and
/// behaves like 1 — exactly one attempt, no retry.
#[derive(Debug, Clone)]
pub struct RetryNTimes {
    max_attempts: u32,
    sleep_between: Duration,
}

impl RetryNTimes {
    /// Attempt the operation at most `max_attempts` times with no delay
    /// between attempts.
    pub fn new(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            sleep_between: Duration::ZERO,
        }
    }

    /// Attempt the operation at most `max_attempts` times, sleeping
    /// `sleep_between` before each retry.
    pub fn with_sleep(max_attempts: u32, sleep_between: Duration) -> Self {
        Self {
            max_attempts,
            sleep_between,
        }
    }
}

#[async_trait]
impl RetryPolicy for RetryNTimes {
    async fn allow_retry(&self, num_attempts: u32, _elapsed: Duration) -> bool {
        debug_assert!(num_attempts >= 1);
        if num_attempts >= self.max_attempts {
            return false;
        }
        if !self.sleep_between.is_zero() {
            tokio::time::sleep(self.sleep_between).await;
        }
        true
    }
}

/// A retry policy that sleeps an exponentially growing, jittered delay
/// between attempts.
///
/// The delay before retry `n` is drawn uniformly from
/// `[base_sleep * 2^(n-1), base_sleep * 2^n)` and clipped to `max_sleep`.
#[derive(Debug, Clone)]
pub struct ExponentialBackoffRetry {
    max_attempts: u32,
    base_sleep: Duration,
    max_sleep: Duration,
}

impl ExponentialBackoffRetry {
    /// Create a policy allowing `max_attempts` total attempts with delays
    /// starting at `base_sleep` and capped at `max_sleep`.
    pub fn new(max_attempts: u32, base_sleep: Duration, max_sleep: Duration) -> Self {
        Self {
            max_attempts,
            base_sleep,
            max_sleep,
        }
    }

    /// The jittered sleep before retrying after attempt `num_attempts`.
    ///
    /// Exposed so callers (and tests) can inspect the delay schedule
    /// without sleeping.
    pub fn sleep_for_attempt(&self, num_attempts: u32) -> Duration {
        debug_assert!(num_attempts >= 1);
        let factor = 2u32.saturating_pow(num_attempts.saturating_sub(1));
        let lower = self.base_sleep.saturating_mul(factor);
        let lower_ms = u64::try_from(lower.as_millis()).unwrap_or(u64::MAX);
        let jitter_ms = if lower_ms == 0 {
            0
        } else {
            rand::thread_rng().gen_range(0..lower_ms)
        };
        let sleep = lower.saturating_add(Duration::from_millis(jitter_ms));
        sleep.min(self.max_sleep)
    }
}

#[async_trait]
impl RetryPolicy for ExponentialBackoffRetry {
    async fn allow_retry(&self, num_attempts: u32, _elapsed: Duration) -> bool {
        debug_assert!(num_attempts >= 1);
        if num_attempts >= self.max_attempts {
            return false;
        }
        let sleep = self.sleep_for_attempt(num_attempts);
        if !sleep.is_zero() {
            tokio::time::sleep(sleep).await;
        }
        true
    }
}

//! # Exponential Backoff
//!
//! One retry policy shared by the watch loop (transport errors) and the
//! notifier (delivery errors). Callers supply their own retryable predicate.
//!
//! Delays grow as `initial_delay * multiplier^n`, are capped at `max_delay`,
//! and are then shortened by a random fraction of up to `jitter` so that many
//! watchers restarting together do not hammer the API server in lockstep.

use rand::Rng;
use std::fmt::Display;
use std::future::Future;
use std::time::Duration;
use tracing::warn;

/// Retry policy: attempt budget plus exponential backoff with jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    /// Total attempts, including the first one
    pub max_attempts: u32,
    /// Delay before the first retry
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor between consecutive delays
    pub multiplier: f64,
    /// Fraction (0.0..=1.0) of each delay that may be randomly removed
    pub jitter: f64,
}

impl RetryPolicy {
    /// Default policy for re-establishing the pod watch.
    pub const WATCH: Self = Self {
        max_attempts: 8,
        initial_delay: Duration::from_millis(500),
        max_delay: Duration::from_secs(30),
        multiplier: 2.0,
        jitter: 0.2,
    };

    /// Default policy for delivering a single event to clusterapi.
    pub const DELIVERY: Self = Self {
        max_attempts: 5,
        initial_delay: Duration::from_millis(200),
        max_delay: Duration::from_secs(10),
        multiplier: 2.0,
        jitter: 0.2,
    };

    /// Delay before retry number `retry` (0-indexed), without jitter.
    pub fn base_delay(&self, retry: u32) -> Duration {
        let exponent = i32::try_from(retry).unwrap_or(i32::MAX);
        let secs = self.initial_delay.as_secs_f64() * self.multiplier.powi(exponent);
        let capped = secs.min(self.max_delay.as_secs_f64());
        if capped.is_finite() && capped >= 0.0 {
            Duration::from_secs_f64(capped)
        } else {
            self.max_delay
        }
    }

    /// Delay before retry number `retry` (0-indexed), with jitter applied.
    ///
    /// The result lies in `[base * (1 - jitter), base]`.
    pub fn delay_for_retry(&self, retry: u32) -> Duration {
        let base = self.base_delay(retry);
        let jitter = self.jitter.clamp(0.0, 1.0);
        if jitter == 0.0 {
            return base;
        }
        let removed = rand::rng().random_range(0.0..=jitter);
        base.mul_f64(1.0 - removed)
    }

    /// Runs `operation` until it succeeds, fails permanently or the attempt
    /// budget is spent. `operation` receives the 0-indexed attempt number.
    pub async fn retry<T, E, F, Fut, P>(&self, mut operation: F, is_retryable: P) -> Result<T, RetryError<E>>
    where
        F: FnMut(u32) -> Fut,
        Fut: Future<Output = Result<T, E>>,
        P: Fn(&E) -> bool,
        E: Display,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut attempt = 0;

        loop {
            match operation(attempt).await {
                Ok(value) => return Ok(value),
                Err(error) => {
                    attempt += 1;

                    if !is_retryable(&error) {
                        return Err(RetryError::Permanent { error, attempts: attempt });
                    }
                    if attempt >= max_attempts {
                        return Err(RetryError::Exhausted { error, attempts: attempt });
                    }

                    let delay = self.delay_for_retry(attempt - 1);
                    warn!(
                        "Attempt {}/{} failed: {}. Retrying in {:?}",
                        attempt, max_attempts, error, delay
                    );
                    tokio::time::sleep(delay).await;
                }
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::WATCH
    }
}

/// Why [`RetryPolicy::retry`] gave up.
#[derive(Debug)]
pub enum RetryError<E> {
    /// The predicate classified the error as not retryable
    Permanent {
        /// The error
        error: E,
        /// Attempts made, including the failing one
        attempts: u32,
    },
    /// Every attempt failed with a retryable error
    Exhausted {
        /// The last error
        error: E,
        /// Attempts made
        attempts: u32,
    },
}

/// Stateful backoff for loops that cannot be expressed as one closure.
///
/// Counts consecutive failures; [`Backoff::reset`] after any success.
#[derive(Debug, Clone)]
pub struct Backoff {
    policy: RetryPolicy,
    failures: u32,
}

impl Backoff {
    /// Create a fresh backoff for the given policy
    #[must_use]
    pub fn new(policy: RetryPolicy) -> Self {
        Self { policy, failures: 0 }
    }

    /// Record a failure and return the delay before the next attempt, or
    /// `None` once the attempt budget is spent.
    pub fn next_delay(&mut self) -> Option<Duration> {
        self.failures += 1;
        if self.failures >= self.policy.max_attempts.max(1) {
            return None;
        }
        Some(self.policy.delay_for_retry(self.failures - 1))
    }

    /// Consecutive failures recorded since the last reset
    pub fn failures(&self) -> u32 {
        self.failures
    }

    /// Reset after a successful attempt
    pub fn reset(&mut self) {
        self.failures = 0;
    }
}

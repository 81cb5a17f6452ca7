//! Failure accounting and bounded retry.
//!
//! Each failure domain (token fetch, transport connect) owns a
//! [`FailureCounter`]. The counter outlives individual operations so callers
//! can observe it, and it is reset only by a success in the same domain.

use std::future::Future;
use std::time::Duration;

use tracing::debug;

/// Consecutive-failure counter for one failure domain.
///
/// The domain is exhausted once `count` exceeds `max`; at that point the
/// owner must stop retrying and surface a terminal error.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct FailureCounter {
    count: u32,
    max: u32,
}

impl FailureCounter {
    /// Creates a counter that tolerates up to `max` retried failures.
    pub fn new(max: u32) -> Self {
        Self { count: 0, max }
    }

    /// Number of consecutive failures recorded since the last success.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Maximum number of failures that are still retried.
    pub fn max(&self) -> u32 {
        self.max
    }

    /// Records a failure and returns `true` while another attempt is allowed.
    pub fn record_failure(&mut self) -> bool {
        self.count = self.count.saturating_add(1);
        !self.is_exhausted()
    }

    /// Returns `true` once more than `max` consecutive failures were recorded.
    pub fn is_exhausted(&self) -> bool {
        self.count > self.max
    }

    /// Clears the counter after a success.
    pub fn reset(&mut self) {
        self.count = 0;
    }
}

/// Fixed-delay retry policy for one failure domain.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub struct RetryPolicy {
    /// Failures tolerated before the domain fails terminally.
    pub max_failures: u32,
    /// Delay applied before every retry.
    pub delay: Duration,
}

impl RetryPolicy {
    /// Creates a policy with a constant delay between attempts.
    pub fn fixed(max_failures: u32, delay: Duration) -> Self {
        Self {
            max_failures,
            delay,
        }
    }

    /// Returns a fresh counter sized for this policy.
    pub fn counter(&self) -> FailureCounter {
        FailureCounter::new(self.max_failures)
    }
}

/// Why [`retry_async`] gave up.
#[derive(Debug, Eq, PartialEq)]
pub enum RetryError<E> {
    /// The operation failed with an error the predicate marked as final.
    Fatal(E),
    /// The failure counter exceeded its maximum.
    Exhausted {
        /// Counter value at the moment the loop stopped.
        failures: u32,
        /// Error returned by the last attempt.
        last: E,
    },
}

/// Runs `op` until it succeeds, fails fatally, or `counter` is exhausted.
///
/// `op` receives the 1-based attempt number. Every retryable error bumps
/// `counter` and sleeps `policy.delay` before the next attempt; a success
/// resets `counter` to zero.
pub async fn retry_async<T, E, Op, Fut, ShouldRetry>(
    policy: &RetryPolicy,
    counter: &mut FailureCounter,
    mut op: Op,
    mut should_retry: ShouldRetry,
) -> Result<T, RetryError<E>>
where
    Op: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
    ShouldRetry: FnMut(&E) -> bool,
{
    loop {
        let attempt = counter.count().saturating_add(1);
        match op(attempt).await {
            Ok(value) => {
                counter.reset();
                return Ok(value);
            }
            Err(error) if !should_retry(&error) => return Err(RetryError::Fatal(error)),
            Err(error) => {
                if !counter.record_failure() {
                    return Err(RetryError::Exhausted {
                        failures: counter.count(),
                        last: error,
                    });
                }

                debug!(
                    event = "retry_attempt_failed",
                    attempt,
                    max_failures = counter.max(),
                    delay_ms = policy.delay.as_millis() as u64
                );
                if !policy.delay.is_zero() {
                    tokio::time::sleep(policy.delay).await;
                }
            }
        }
    }
}

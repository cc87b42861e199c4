//! Bounded retry primitive
//!
//! Every wait loop in stackctl (readiness polling, the certificate client) is
//! one call to [`retry`], parameterized by interval, maximum attempts, total
//! budget and per-attempt timeout. Nothing retries without a bound.

use serde::{Deserialize, Serialize};
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;

/// Retry budget for one operation
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Delay after the first failed attempt
    pub interval: Duration,
    /// Maximum number of attempts (at least 1)
    pub max_attempts: u32,
    /// Total wall-clock budget across all attempts and delays
    pub total_timeout: Duration,
    /// Upper bound for a single attempt
    pub attempt_timeout: Duration,
    /// Delay growth factor; 1.0 keeps a fixed interval
    pub backoff_multiplier: f64,
    /// Cap on the grown delay
    pub max_interval: Duration,
}

impl RetryPolicy {
    /// Fixed-interval policy
    #[must_use]
    pub fn fixed(interval: Duration, max_attempts: u32, total_timeout: Duration) -> Self {
        Self {
            interval,
            max_attempts: max_attempts.max(1),
            total_timeout,
            attempt_timeout: interval.max(Duration::from_secs(1)),
            backoff_multiplier: 1.0,
            max_interval: interval,
        }
    }

    /// Set the per-attempt timeout
    #[must_use]
    pub fn with_attempt_timeout(mut self, timeout: Duration) -> Self {
        self.attempt_timeout = timeout;
        self
    }

    /// Grow the delay by `multiplier` per attempt, capped at `max_interval`
    #[must_use]
    pub fn with_backoff(mut self, multiplier: f64, max_interval: Duration) -> Self {
        self.backoff_multiplier = multiplier.max(1.0);
        self.max_interval = max_interval.max(self.interval);
        self
    }

    /// Shrink the total budget so it ends no later than `deadline`
    #[must_use]
    pub fn capped_at(mut self, deadline: Option<Instant>) -> Self {
        if let Some(deadline) = deadline {
            let remaining = deadline.saturating_duration_since(Instant::now());
            self.total_timeout = self.total_timeout.min(remaining);
        }
        self
    }

    /// Delay to wait after failed attempt number `attempt` (1-based)
    #[must_use]
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if self.backoff_multiplier <= 1.0 {
            return self.interval;
        }
        #[allow(clippy::cast_possible_wrap)] // attempt count is small
        let factor = self.backoff_multiplier.powi(attempt.saturating_sub(1) as i32);
        let secs = self.interval.as_secs_f64() * factor;
        if secs >= self.max_interval.as_secs_f64() {
            self.max_interval
        } else {
            Duration::from_secs_f64(secs)
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::fixed(Duration::from_secs(5), 10, Duration::from_secs(60))
            .with_attempt_timeout(Duration::from_secs(5))
    }
}

/// A single failed attempt
#[derive(Debug)]
pub enum AttemptError<E> {
    /// The operation returned an error
    Failed(E),
    /// The operation ran past its per-attempt timeout
    TimedOut(Duration),
}

impl<E: std::fmt::Display> std::fmt::Display for AttemptError<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Failed(e) => write!(f, "{e}"),
            Self::TimedOut(after) => write!(f, "attempt timed out after {after:?}"),
        }
    }
}

/// Why retrying stopped
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    /// `max_attempts` used up
    AttemptsExhausted,
    /// `total_timeout` reached
    DeadlineReached,
}

/// Successful outcome
#[derive(Debug)]
pub struct Succeeded<T> {
    /// Value returned by the successful attempt
    pub value: T,
    /// Attempts used, including the successful one
    pub attempts: u32,
    /// Time from first attempt to success
    pub elapsed: Duration,
}

/// Budget exhausted without success
#[derive(Debug)]
pub struct Exhausted<E> {
    /// Attempts made
    pub attempts: u32,
    /// Time spent
    pub elapsed: Duration,
    /// Which bound stopped the loop
    pub reason: StopReason,
    /// Error from the final attempt
    pub last_error: Option<AttemptError<E>>,
}

/// Run `op` until it succeeds or the policy's budget is used up.
///
/// `op` receives the 1-based attempt number. Each attempt is bounded by
/// `attempt_timeout` (and by whatever is left of `total_timeout`); a timed
/// out attempt counts as a failure. When the next delay would overrun the
/// total budget the loop stops immediately instead of sleeping.
///
/// # Errors
/// [`Exhausted`] carrying the last error when no attempt succeeds
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<Succeeded<T>, Exhausted<E>>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let start = Instant::now();
    // `None` when the budget reaches past what an Instant can represent
    let deadline = start.checked_add(policy.total_timeout);
    let remaining = || deadline.map_or(Duration::MAX, |d| d.saturating_duration_since(Instant::now()));
    let max_attempts = policy.max_attempts.max(1);
    let mut last_error = None;
    let mut attempt = 0;

    loop {
        let left = remaining();
        if left.is_zero() {
            return Err(Exhausted {
                attempts: attempt,
                elapsed: start.elapsed(),
                reason: StopReason::DeadlineReached,
                last_error,
            });
        }

        attempt += 1;
        let budget = policy.attempt_timeout.min(left);
        match tokio::time::timeout(budget, op(attempt)).await {
            Ok(Ok(value)) => {
                return Ok(Succeeded {
                    value,
                    attempts: attempt,
                    elapsed: start.elapsed(),
                })
            }
            Ok(Err(e)) => last_error = Some(AttemptError::Failed(e)),
            Err(_) => last_error = Some(AttemptError::TimedOut(budget)),
        }

        if attempt >= max_attempts {
            return Err(Exhausted {
                attempts: attempt,
                elapsed: start.elapsed(),
                reason: StopReason::AttemptsExhausted,
                last_error,
            });
        }

        let delay = policy.delay_for_attempt(attempt);
        if delay >= remaining() {
            return Err(Exhausted {
                attempts: attempt,
                elapsed: start.elapsed(),
                reason: StopReason::DeadlineReached,
                last_error,
            });
        }
        tokio::time::sleep(delay).await;
    }
}

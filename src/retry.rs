//! Retry policies applied between attempts of a single request.

use std::time::Duration;

use rand::Rng;

use crate::client::RequestKind;

/// Decides whether and when a failed request attempt may be retried.
///
/// `attempt` is the number of attempts already handed to the transport for
/// the request, so it is at least 1 by the time a policy is consulted.
pub trait RetryPolicy: Send + Sync + 'static {
    /// Whether another attempt may be made after `attempt` completed attempts.
    fn should_retry(&self, attempt: usize, request: &RequestKind) -> bool;

    /// How long to sleep before the next attempt.
    fn sleep_time(&self, attempt: usize, request: &RequestKind) -> Duration;
}

/// Retry immediately and forever.
///
/// Used when a leader hint is available: the next attempt is expected to
/// succeed against the hinted server, so there is nothing to wait for.
#[derive(Clone, Copy, Debug, Default)]
pub struct RetryForeverNoSleep;

impl RetryPolicy for RetryForeverNoSleep {
    fn should_retry(&self, _attempt: usize, _request: &RequestKind) -> bool {
        true
    }

    fn sleep_time(&self, _attempt: usize, _request: &RequestKind) -> Duration {
        Duration::from_millis(0)
    }
}

/// Retry forever with a fixed sleep between attempts.
#[derive(Clone, Copy, Debug)]
pub struct RetryForeverWithSleep {
    pub sleep: Duration,
}

impl RetryPolicy for RetryForeverWithSleep {
    fn should_retry(&self, _attempt: usize, _request: &RequestKind) -> bool {
        true
    }

    fn sleep_time(&self, _attempt: usize, _request: &RequestKind) -> Duration {
        self.sleep
    }
}

/// Retry with a fixed sleep between attempts, up to a maximum attempt count.
#[derive(Clone, Copy, Debug)]
pub struct RetryUpToMaximumCount {
    pub max_attempts: usize,
    pub sleep: Duration,
}

impl RetryPolicy for RetryUpToMaximumCount {
    fn should_retry(&self, attempt: usize, _request: &RequestKind) -> bool {
        attempt < self.max_attempts
    }

    fn sleep_time(&self, _attempt: usize, _request: &RequestKind) -> Duration {
        self.sleep
    }
}

/// Exponential backoff with jitter.
///
/// The sleep for attempt `n` is `base_sleep * 2^(n-1)`, capped at
/// `max_sleep`, then scaled by a random factor in `[0.5, 1.5)` so that a
/// burst of failed requests does not retry in lockstep.
#[derive(Clone, Copy, Debug)]
pub struct ExponentialBackoff {
    pub base_sleep: Duration,
    pub max_sleep: Duration,
    /// When `None`, the policy never refuses a retry.
    pub max_attempts: Option<usize>,
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self {
            base_sleep: Duration::from_millis(50),
            max_sleep: Duration::from_secs(10),
            max_attempts: None,
        }
    }
}

impl RetryPolicy for ExponentialBackoff {
    fn should_retry(&self, attempt: usize, _request: &RequestKind) -> bool {
        match self.max_attempts {
            Some(max) => attempt < max,
            None => true,
        }
    }

    fn sleep_time(&self, attempt: usize, _request: &RequestKind) -> Duration {
        // 2^20 * any sane base is already past every practical max_sleep.
        let exp = attempt.saturating_sub(1).min(20) as u32;
        let sleep = self
            .base_sleep
            .checked_mul(2u32.saturating_pow(exp))
            .unwrap_or(self.max_sleep)
            .min(self.max_sleep);
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        sleep.mul_f64(jitter)
    }
}

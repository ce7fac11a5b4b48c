//! Shared retry policy: bounded attempts with doubling backoff.

use crate::error::is_retryable;
use crate::pipeline::types::LimitsConfig;
use anyhow::Result;
use std::future::Future;
use std::time::Duration;
use tokio_retry::{strategy::ExponentialBackoff, RetryIf};
use tracing::warn;

/// Retry policy configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts including the first one
    pub max_attempts: usize,
    /// Delay before the first retry; doubles on every further retry
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl RetryPolicy {
    pub fn new(max_attempts: usize, base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_attempts: max_attempts.max(1),
            base_delay,
            max_delay,
        }
    }

    pub fn from_limits(limits: &LimitsConfig) -> Self {
        Self::new(limits.max_attempts, limits.retry_base_delay(), limits.retry_max_delay())
    }

    /// Delays between attempts: base, 2*base, 4*base, ... capped at `max_delay`.
    pub fn delays(&self) -> impl Iterator<Item = Duration> {
        // tokio-retry multiplies `factor` by base^n, so base 2 with factor base/2 doubles from `base_delay`
        let half_base_ms = (self.base_delay.as_millis() as u64 / 2).max(1);
        let strategy = ExponentialBackoff::from_millis(2)
            .factor(half_base_ms)
            .max_delay(self.max_delay.max(self.base_delay));
        let zero = self.base_delay.is_zero();
        strategy
            .map(move |d| if zero { Duration::ZERO } else { d })
            .take(self.max_attempts.saturating_sub(1))
    }

    /// Run `action` until it succeeds, fails with a non-retryable error, or
    /// attempts run out. The last error is returned.
    pub async fn run<A, Fut, T>(&self, label: &str, mut action: A) -> Result<T>
    where
        A: FnMut() -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        RetryIf::spawn(
            self.delays(),
            || action(),
            |err: &anyhow::Error| {
                let retry = is_retryable(err);
                if retry {
                    warn!("{} attempt failed, retrying: {:#}", label, err);
                }
                retry
            },
        )
        .await
    }
}

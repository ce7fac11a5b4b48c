//! Request pacing for outbound HTTP and RPC calls.
//!
//! Two policies are supported. The sliding window admits at most N task
//! starts in any trailing window and is the default everywhere. The fixed
//! interval policy dispatches one task per `period` through a `governor`
//! limiter and is kept for call sites that were tuned against it.

use governor::{DefaultDirectRateLimiter, Quota, RateLimiter as GovernorLimiter};
use std::collections::VecDeque;
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tokio::time::{sleep_until, Instant};
use tracing::{debug, instrument};

/// Pacing policy of a limiter instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitPolicy {
    /// At most `max_requests` starts within any trailing `window`
    SlidingWindow { max_requests: u32, window: Duration },
    /// One start every `period` (legacy)
    FixedInterval { period: Duration },
}

impl RateLimitPolicy {
    pub fn sliding(max_requests: u32, window: Duration) -> Self {
        Self::SlidingWindow {
            max_requests: max_requests.max(1),
            window,
        }
    }

    pub fn fixed(requests_per_second: u32) -> Self {
        Self::every(Duration::from_secs(1) / requests_per_second.max(1))
    }

    /// One start per `period`. A zero period is raised to one microsecond.
    pub fn every(period: Duration) -> Self {
        Self::FixedInterval {
            period: period.max(Duration::from_micros(1)),
        }
    }
}

enum Gate {
    Sliding {
        starts: Mutex<VecDeque<Instant>>,
        max_requests: usize,
        window: Duration,
    },
    Fixed {
        limiter: DefaultDirectRateLimiter,
        // governor does not queue fairly on its own
        queue: Mutex<()>,
    },
}

/// FIFO rate limiter. Each instance is independent; share it with `Arc`.
pub struct RateLimiter {
    name: String,
    policy: RateLimitPolicy,
    gate: Gate,
    dispatched: AtomicU64,
}

impl RateLimiter {
    /// Create a limiter with the given policy. `name` only shows up in logs.
    pub fn new(name: impl Into<String>, policy: RateLimitPolicy) -> Self {
        let gate = match policy {
            RateLimitPolicy::SlidingWindow { max_requests, window } => Gate::Sliding {
                starts: Mutex::new(VecDeque::with_capacity(max_requests as usize)),
                max_requests: max_requests.max(1) as usize,
                window,
            },
            RateLimitPolicy::FixedInterval { period } => {
                let quota = Quota::with_period(period)
                    .unwrap_or_else(|| Quota::per_second(NonZeroU32::MIN))
                    .allow_burst(NonZeroU32::MIN);
                Gate::Fixed {
                    limiter: GovernorLimiter::direct(quota),
                    queue: Mutex::new(()),
                }
            }
        };

        Self {
            name: name.into(),
            policy,
            gate,
            dispatched: AtomicU64::new(0),
        }
    }

    pub fn sliding_window(name: impl Into<String>, max_requests: u32, window: Duration) -> Self {
        Self::new(name, RateLimitPolicy::sliding(max_requests, window))
    }

    pub fn fixed_interval(name: impl Into<String>, requests_per_second: u32) -> Self {
        Self::new(name, RateLimitPolicy::fixed(requests_per_second))
    }

    pub fn policy(&self) -> RateLimitPolicy {
        self.policy
    }

    /// Wait for a start slot, then run `task`.
    ///
    /// Starts are granted in the order callers reach the limiter. The task
    /// itself runs outside the gate, so a slow task never delays the next
    /// start and a failing task only affects its own caller.
    pub async fn schedule<F, Fut, T>(&self, task: F) -> T
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = T>,
    {
        self.acquire().await;
        task().await
    }

    /// Block until the policy admits one more start and record it.
    #[instrument(skip(self), fields(limiter = %self.name))]
    pub async fn acquire(&self) {
        match &self.gate {
            Gate::Sliding {
                starts,
                max_requests,
                window,
            } => {
                // Holding the lock while sleeping keeps later callers queued behind us.
                let mut starts = starts.lock().await;
                loop {
                    let now = Instant::now();
                    prune(&mut starts, now, *window);

                    if starts.len() < *max_requests {
                        starts.push_back(now);
                        break;
                    }

                    if let Some(&oldest) = starts.front() {
                        let ready_at = oldest + *window;
                        debug!(
                            "Window full ({} starts), waiting {:?}",
                            starts.len(),
                            ready_at.saturating_duration_since(now)
                        );
                        sleep_until(ready_at).await;
                    }
                }
            }
            Gate::Fixed { limiter, queue } => {
                let _turn = queue.lock().await;
                limiter.until_ready().await;
            }
        }

        self.dispatched.fetch_add(1, Ordering::Relaxed);
    }

    /// Current pacing statistics.
    pub async fn stats(&self) -> RateLimitStats {
        let in_window = match &self.gate {
            Gate::Sliding { starts, window, .. } => {
                let mut starts = starts.lock().await;
                prune(&mut starts, Instant::now(), *window);
                starts.len()
            }
            Gate::Fixed { .. } => 0,
        };

        RateLimitStats {
            name: self.name.clone(),
            policy: self.policy,
            dispatched: self.dispatched.load(Ordering::Relaxed),
            in_window,
        }
    }
}

fn prune(starts: &mut VecDeque<Instant>, now: Instant, window: Duration) {
    while let Some(&oldest) = starts.front() {
        if now.duration_since(oldest) >= window {
            starts.pop_front();
        } else {
            break;
        }
    }
}

/// Rate limiting statistics.
#[derive(Debug, Clone)]
pub struct RateLimitStats {
    pub name: String,
    pub policy: RateLimitPolicy,
    pub dispatched: u64,
    /// Starts still inside the sliding window (always 0 for the fixed policy)
    pub in_window: usize,
}

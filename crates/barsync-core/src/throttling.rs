use std::num::NonZeroU32;
use std::sync::Arc;
use std::time::Duration;

use governor::clock::DefaultClock;
use governor::state::direct::NotKeyed;
use governor::state::InMemoryState;
use governor::{Quota, RateLimiter};

use crate::config::PacingPolicy;

type DirectRateLimiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;

/// Submission pacing for feeds that limit how many requests may start per window.
#[derive(Clone)]
pub struct ThrottlingQueue {
    limiter: Arc<DirectRateLimiter>,
    retry_delay: Duration,
}

impl ThrottlingQueue {
    pub fn new(window: Duration, limit: u32) -> Self {
        let safe_limit = NonZeroU32::new(limit).unwrap_or(NonZeroU32::MIN);
        let per_cell = (window.as_secs_f64() / f64::from(safe_limit.get())).max(0.001);
        let period = Duration::from_secs_f64(per_cell);
        let quota = Quota::with_period(period)
            .unwrap_or_else(|| Quota::per_second(safe_limit))
            .allow_burst(safe_limit);

        Self {
            limiter: Arc::new(RateLimiter::direct(quota)),
            retry_delay: period,
        }
    }

    pub fn from_policy(policy: &PacingPolicy) -> Self {
        Self::new(policy.window, policy.limit)
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    /// Take one unit of budget, or report how long to wait before trying again.
    pub fn acquire(&self) -> Result<(), Duration> {
        self.limiter.check().map_err(|_| self.retry_delay)
    }
}

impl std::fmt::Debug for ThrottlingQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThrottlingQueue")
            .field("retry_delay", &self.retry_delay)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defers_once_burst_is_spent() {
        let queue = ThrottlingQueue::new(Duration::from_secs(60), 2);

        assert!(queue.acquire().is_ok());
        assert!(queue.acquire().is_ok());
        let wait = queue.acquire().expect_err("third submit must wait");
        assert_eq!(wait, Duration::from_secs(30));
    }

    #[test]
    fn zero_limit_is_treated_as_one() {
        let queue = ThrottlingQueue::new(Duration::from_secs(10), 0);
        assert!(queue.acquire().is_ok());
        assert!(queue.acquire().is_err());
    }
}

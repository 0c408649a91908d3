//! Backoff for transient feed errors.

use std::time::Duration;

use crate::feed::FeedError;

/// Delay schedule between attempts of one request.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Backoff {
    Fixed {
        delay: Duration,
    },
    /// `base * factor^attempt`, capped at `max`, optionally spread by ±50%.
    Exponential {
        base: Duration,
        factor: f64,
        max: Duration,
        jitter: bool,
    },
}

impl Default for Backoff {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_millis(500),
            factor: 2.0,
            max: Duration::from_secs(30),
            jitter: true,
        }
    }
}

impl Backoff {
    /// Delay before retry number `attempt` (0-based).
    pub fn delay(self, attempt: u32) -> Duration {
        match self {
            Self::Fixed { delay } => delay,
            Self::Exponential {
                base,
                factor,
                max,
                jitter,
            } => {
                let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
                let seconds = (base.as_secs_f64() * factor.powi(exponent)).min(max.as_secs_f64());
                let seconds = if jitter {
                    seconds * (0.5 + fastrand::f64())
                } else {
                    seconds
                };
                Duration::from_secs_f64(seconds.max(0.0))
            }
        }
    }
}

/// Retry policy applied by the request scheduler.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryConfig {
    pub enabled: bool,
    /// Retries after the first attempt; total attempts are `max_retries + 1`.
    pub max_retries: u32,
    pub backoff: Backoff,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_retries: 3,
            backoff: Backoff::default(),
        }
    }
}

impl RetryConfig {
    pub fn exponential(max_retries: u32) -> Self {
        Self {
            max_retries,
            ..Self::default()
        }
    }

    pub fn fixed(delay: Duration, max_retries: u32) -> Self {
        Self {
            enabled: true,
            max_retries,
            backoff: Backoff::Fixed { delay },
        }
    }

    pub fn no_retry() -> Self {
        Self {
            enabled: false,
            max_retries: 0,
            ..Self::default()
        }
    }

    /// Delay before retrying after `error` on attempt `attempt`, or `None` to give up.
    pub fn next_delay(&self, attempt: u32, error: &FeedError) -> Option<Duration> {
        if !self.enabled || !error.retryable() || attempt >= self.max_retries {
            return None;
        }
        Some(self.backoff.delay(attempt))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn exponential_backoff_is_capped() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(100),
            factor: 2.0,
            max: Duration::from_secs(1),
            jitter: false,
        };

        assert_eq!(backoff.delay(0), Duration::from_millis(100));
        assert_eq!(backoff.delay(2), Duration::from_millis(400));
        assert_eq!(backoff.delay(4), Duration::from_secs(1));
        assert_eq!(backoff.delay(40), Duration::from_secs(1));
    }

    #[test]
    fn jitter_stays_within_half_either_way() {
        let backoff = Backoff::Exponential {
            base: Duration::from_millis(200),
            factor: 2.0,
            max: Duration::from_secs(5),
            jitter: true,
        };

        for _ in 0..20 {
            let millis = backoff.delay(1).as_millis();
            assert!((199..=601).contains(&millis), "delay {millis}ms");
        }
    }

    #[test]
    fn only_transient_errors_are_retried() {
        let config = RetryConfig::fixed(Duration::from_millis(50), 2);

        assert_eq!(
            config.next_delay(0, &FeedError::transient("socket reset")),
            Some(Duration::from_millis(50))
        );
        assert_eq!(config.next_delay(2, &FeedError::transient("socket reset")), None);
        assert_eq!(config.next_delay(0, &FeedError::rejected("bad contract")), None);
        assert_eq!(
            RetryConfig::no_retry().next_delay(0, &FeedError::transient("x")),
            None
        );
    }
}

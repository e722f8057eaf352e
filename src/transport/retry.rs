//! Retry delays for reconnecting and re-polling.

use std::time::Duration;

/// How the delay grows with consecutive failures.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum BackoffStrategy {
    /// Always `initial_delay`.
    Fixed,
    /// `initial_delay * 2^failures`, capped.
    Exponential,
}

/// Retry policy.
#[derive(Clone, Debug)]
pub struct RetryPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub backoff: BackoffStrategy,
    /// Add up to 100ms of random jitter.
    pub jitter: bool,
}

impl RetryPolicy {
    pub fn fixed(delay: Duration) -> Self {
        Self {
            initial_delay: delay,
            max_delay: delay,
            backoff: BackoffStrategy::Fixed,
            jitter: false,
        }
    }

    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self {
            initial_delay: initial,
            max_delay: max.max(initial),
            backoff: BackoffStrategy::Exponential,
            jitter: false,
        }
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Delay before the next attempt after `failures` consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let base = match self.backoff {
            BackoffStrategy::Fixed => self.initial_delay,
            BackoffStrategy::Exponential => {
                let factor = 2u32.saturating_pow(failures.min(16));
                self.initial_delay.saturating_mul(factor)
            }
        };

        let delay = base.min(self.max_delay);

        if self.jitter {
            delay + Duration::from_millis(rand::random::<u64>() % 100)
        } else {
            delay
        }
    }
}

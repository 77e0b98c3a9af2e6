//! Retry backoff for transient delivery failures

use std::time::Duration;

/// Exponential backoff: `initial * coefficient^(attempt - 1)`, capped at `maximum`.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RetryPolicy {
    pub backoff_coefficient: u32,
    pub initial_interval: Duration,
    pub maximum_interval: Option<Duration>,
}

impl RetryPolicy {
    pub fn new(backoff_coefficient: u32, initial_interval: Duration) -> Self {
        Self {
            backoff_coefficient,
            initial_interval,
            maximum_interval: None,
        }
    }

    pub fn with_maximum(mut self, interval: Duration) -> Self {
        self.maximum_interval = Some(interval);
        self
    }

    pub fn from_config(queue: &crate::config::QueueConfig) -> Self {
        Self::new(2, Duration::from_secs(queue.retry_backoff_secs))
            .with_maximum(Duration::from_secs(queue.max_backoff_secs))
    }

    /// Delay before retrying after failed attempt number `attempt` (1-based).
    pub fn retry_interval(&self, attempt: u32) -> Duration {
        let factor = self
            .backoff_coefficient
            .checked_pow(attempt.saturating_sub(1))
            .unwrap_or(u32::MAX);
        let candidate = self
            .initial_interval
            .checked_mul(factor)
            .unwrap_or(Duration::MAX);

        match self.maximum_interval {
            Some(max) => candidate.min(max),
            None => candidate,
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::new(2, Duration::from_secs(1))
    }
}

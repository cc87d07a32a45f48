use std::time::Duration;

use crate::JobError;

/// What to do with a failed attempt
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Re-insert after the delay
    Retry(Duration),
    DeadLetter,
}

/// Per-pool retry budget and exponential backoff
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    /// Attempts after the first; a job runs at most `max_retries + 1` times
    pub max_retries: u32,
    pub backoff_base: Duration,
    pub backoff_cap: Duration,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, backoff_base: Duration, backoff_cap: Duration) -> Self {
        Self {
            max_retries,
            backoff_base,
            backoff_cap,
        }
    }

    /// `min(base * 2^attempt, cap)`, saturating
    pub fn backoff(&self, attempt: u32) -> Duration {
        let factor = 2u32.checked_pow(attempt).unwrap_or(u32::MAX);
        self.backoff_base.saturating_mul(factor).min(self.backoff_cap)
    }

    pub fn decide(&self, attempt: u32, error: &JobError) -> RetryDecision {
        if !error.is_retryable() || attempt >= self.max_retries {
            RetryDecision::DeadLetter
        } else {
            RetryDecision::Retry(self.backoff(attempt))
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 25,
            backoff_base: Duration::from_secs(1),
            backoff_cap: Duration::from_secs(3600),
        }
    }
}

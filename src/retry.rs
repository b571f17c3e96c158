//! Bounded retry with exponential backoff for single page fetches

use crate::error::SyncError;
use rand::Rng;
use std::time::Duration;

/// How often and how long to retry a failing page
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total requests per page, the first one included
    pub max_attempts: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
    /// Longest server supplied `Retry-After` we are willing to wait out.
    /// A longer wait ends the page's attempts instead.
    pub max_rate_limit_wait: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            max_rate_limit_wait: Duration::from_secs(120),
        }
    }
}

impl RetryPolicy {
    /// No backoff between attempts; a server `Retry-After` is still honored
    pub fn immediate(max_attempts: usize) -> Self {
        Self {
            max_attempts,
            base_delay: Duration::ZERO,
            max_delay: Duration::ZERO,
            max_rate_limit_wait: Duration::MAX,
        }
    }

    /// Whether another attempt is allowed after `attempt` (1-based) failed with `err`
    pub fn should_retry(&self, attempt: usize, err: &SyncError) -> bool {
        if let SyncError::RateLimited {
            retry_after: Some(wait),
        } = err
        {
            if *wait > self.max_rate_limit_wait {
                return false;
            }
        }
        err.is_retryable() && attempt < self.max_attempts
    }

    /// Exponential backoff for the given failed attempt, without jitter
    pub fn backoff(&self, attempt: usize) -> Duration {
        let exp = (attempt.saturating_sub(1) as u32).min(16);
        self.base_delay
            .saturating_mul(1_u32 << exp)
            .min(self.max_delay)
    }

    /// Delay before the next attempt
    ///
    /// Rate limits wait exactly the server's `Retry-After`; everything else
    /// backs off exponentially with up to 20% jitter.
    pub fn delay_for(&self, attempt: usize, err: &SyncError) -> Duration {
        if let SyncError::RateLimited {
            retry_after: Some(wait),
        } = err
        {
            return *wait;
        }

        let backoff = self.backoff(attempt);
        let millis = backoff.as_millis() as u64;
        if millis == 0 {
            return backoff;
        }
        let jitter = rand::thread_rng().gen_range(0..=(millis / 5).max(1));
        backoff + Duration::from_millis(jitter)
    }
}

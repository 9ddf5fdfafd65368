use crate::config::RetryConfig;
use std::collections::BTreeSet;
use std::time::Duration;

/// Status code that is never retried, whatever the configuration says
const NEVER_RETRY_STATUS: u16 = 404;

/// What to do with a failed fetch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDecision {
    /// Resubmit after `delay`; `attempt` is the new retry count
    Retry { delay: Duration, attempt: u32 },
    /// Eligible, but the retry budget is spent
    Exhausted { retries: u32 },
    /// The failure is not eligible for retry
    NotRetryable,
}

/// Decides retry eligibility and backoff for fetch failures
#[derive(Debug, Clone)]
pub struct RetryPolicy {
    max_retries: u32,
    retry_codes: BTreeSet<u16>,
    retry_on_timeout: bool,
}

impl RetryPolicy {
    pub fn new(max_retries: u32, retry_codes: impl IntoIterator<Item = u16>, retry_on_timeout: bool) -> Self {
        Self {
            max_retries,
            retry_codes: retry_codes.into_iter().collect(),
            retry_on_timeout,
        }
    }

    pub fn from_config(config: &RetryConfig) -> Self {
        Self::new(
            config.max_retries,
            config.retry_http_codes.iter().copied(),
            config.retry_on_timeout,
        )
    }

    pub fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Whether a failure with this status and message may be retried at all
    ///
    /// `status` is 0 for transport errors.
    pub fn is_retryable(&self, status: u16, message: &str) -> bool {
        if status == NEVER_RETRY_STATUS {
            return false;
        }

        self.retry_codes.contains(&status)
            || (self.retry_on_timeout
                && (message.contains("timeout") || message.contains("deadline exceeded")))
    }

    /// Backoff before the retry following `retries` earlier retries: 2^retries seconds
    pub fn backoff(retries: u32) -> Duration {
        Duration::from_secs(1u64.checked_shl(retries).unwrap_or(u64::MAX))
    }

    /// Evaluates a failure given the retries already spent on the request
    pub fn evaluate(&self, status: u16, message: &str, retries: u32) -> RetryDecision {
        if !self.is_retryable(status, message) {
            return RetryDecision::NotRetryable;
        }

        if retries < self.max_retries {
            RetryDecision::Retry {
                delay: Self::backoff(retries),
                attempt: retries + 1,
            }
        } else {
            RetryDecision::Exhausted { retries }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

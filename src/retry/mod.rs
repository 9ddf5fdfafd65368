//! Retry controller
//!
//! [`RetryPolicy`] decides whether a failed fetch is retried and how long to back
//! off; [`RetryScheduler`] holds the retry until the backoff elapses or the crawl
//! is cancelled.

mod policy;
mod scheduler;

pub use policy::{RetryDecision, RetryPolicy};
pub use scheduler::{RetryEvent, RetryScheduler, ScheduledRetry, MAX_RETRY_DELAY};

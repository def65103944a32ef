//! Tuning for the dispatcher and the poll runner.
use std::time::Duration;

use chrono::TimeDelta;

use crate::backoff::RetryBackoff;

/// What [`crate::dispatcher::Dispatcher::start_job`] does with a job that may not start yet.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RateLimitStrategy {
    /// Leave the job queued for a later pass.
    #[default]
    Queue,
    /// Reschedule the job to the suggested scheduling time.
    Delay,
    /// Cancel the job, recording the denial reason.
    Reject,
    /// Start the job anyway. It takes no slot and is not counted against the limits.
    Bypass,
}

/// Configuration for [`crate::Joblin`].
///
/// # Example
///
/// ```
/// # use joblin::config::{JoblinConfig, RateLimitStrategy};
/// # use std::time::Duration;
/// let config = JoblinConfig::default()
///     .with_poll_interval(Duration::from_secs(1))
///     .with_batch_size(50)
///     .with_rate_limit_strategy(RateLimitStrategy::Delay);
///
/// assert_eq!(config.batch_size(), 50);
/// ```
#[derive(Debug, Clone, PartialEq)]
pub struct JoblinConfig {
    poll_interval: Duration,
    batch_size: usize,
    fallback_delay: TimeDelta,
    default_max_retries: i32,
    max_cas_attempts: usize,
    rate_limit_strategy: RateLimitStrategy,
    retry_backoff: RetryBackoff,
}

impl Default for JoblinConfig {
    fn default() -> Self {
        Self {
            poll_interval: Self::DEFAULT_POLL_INTERVAL,
            batch_size: Self::DEFAULT_BATCH_SIZE,
            fallback_delay: Self::DEFAULT_FALLBACK_DELAY,
            default_max_retries: Self::DEFAULT_MAX_RETRIES,
            max_cas_attempts: Self::DEFAULT_MAX_CAS_ATTEMPTS,
            rate_limit_strategy: RateLimitStrategy::default(),
            retry_backoff: RetryBackoff::none(),
        }
    }
}

impl JoblinConfig {
    pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(5);
    pub const DEFAULT_BATCH_SIZE: usize = 10;
    /// Suggested wait when a job is blocked by the concurrency limit, whose end is unknown.
    pub const DEFAULT_FALLBACK_DELAY: TimeDelta = TimeDelta::minutes(5);
    pub const DEFAULT_MAX_RETRIES: i32 = 3;
    pub const DEFAULT_MAX_CAS_ATTEMPTS: usize = 5;

    pub fn with_poll_interval(mut self, poll_interval: Duration) -> Self {
        self.poll_interval = poll_interval;
        self
    }

    pub fn with_batch_size(mut self, batch_size: usize) -> Self {
        self.batch_size = batch_size;
        self
    }

    pub fn with_fallback_delay(mut self, fallback_delay: TimeDelta) -> Self {
        self.fallback_delay = fallback_delay;
        self
    }

    /// Retries allowed for jobs created through [`crate::dispatcher::Dispatcher::enqueue`]
    /// without an explicit limit.
    pub fn with_default_max_retries(mut self, default_max_retries: i32) -> Self {
        self.default_max_retries = default_max_retries.max(0);
        self
    }

    /// How many times a conflicting counter update is retried before giving up.
    pub fn with_max_cas_attempts(mut self, max_cas_attempts: usize) -> Self {
        self.max_cas_attempts = max_cas_attempts.max(1);
        self
    }

    pub fn with_rate_limit_strategy(mut self, rate_limit_strategy: RateLimitStrategy) -> Self {
        self.rate_limit_strategy = rate_limit_strategy;
        self
    }

    pub fn with_retry_backoff(mut self, retry_backoff: RetryBackoff) -> Self {
        self.retry_backoff = retry_backoff;
        self
    }

    pub fn poll_interval(&self) -> Duration {
        self.poll_interval
    }

    pub fn batch_size(&self) -> usize {
        self.batch_size
    }

    pub fn fallback_delay(&self) -> TimeDelta {
        self.fallback_delay
    }

    pub fn default_max_retries(&self) -> i32 {
        self.default_max_retries
    }

    pub fn max_cas_attempts(&self) -> usize {
        self.max_cas_attempts
    }

    pub fn rate_limit_strategy(&self) -> RateLimitStrategy {
        self.rate_limit_strategy
    }

    pub fn retry_backoff(&self) -> &RetryBackoff {
        &self.retry_backoff
    }
}

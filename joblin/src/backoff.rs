//! Delays applied before a failed job that is being retried becomes due again.
//!
//! # Example
//!
//! ```
//! # use joblin::backoff::{Jitter, RetryBackoff};
//! # use chrono::TimeDelta;
//! let backoff = RetryBackoff::linear(TimeDelta::seconds(20))
//!     .with_max(TimeDelta::seconds(60))
//!     .with_jitter(Jitter::Absolute(TimeDelta::seconds(10)));
//!
//! let delay = backoff.delay(2).unwrap();
//! assert!(delay >= TimeDelta::seconds(30));
//! assert!(delay <= TimeDelta::seconds(50));
//! // Note the max here is the max plus max jitter
//! assert!(backoff.delay(10).unwrap() <= TimeDelta::seconds(70));
//! assert_eq!(RetryBackoff::none().delay(3), None);
//! ```
use chrono::TimeDelta;
use rand::Rng;

#[derive(Debug, Clone, Copy, PartialEq)]
enum Strategy {
    Immediate,
    Constant(TimeDelta),
    Linear(TimeDelta),
    Exponential(TimeDelta),
}

/// A random jitter to be applied to a given delay.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Jitter {
    /// A random jitter to be added to the delay in the range `-delta =< jitter =< delta`.
    Absolute(TimeDelta),
    /// A random jitter to be added as a proportion of the current delay.
    Relative(f64),
}

impl Jitter {
    fn apply_jitter(&self, value: TimeDelta) -> TimeDelta {
        let milliseconds = match self {
            Self::Absolute(delta) => delta.num_milliseconds(),
            Self::Relative(ratio) => (value.num_milliseconds() as f64 * ratio).round() as i64,
        }
        .abs();
        let jitter = rand::thread_rng().gen_range(-milliseconds..=milliseconds);
        value
            .checked_add(&TimeDelta::milliseconds(jitter))
            .unwrap_or(value)
    }
}

/// How long a job re-queued by a retry waits before it is due again.
///
/// All of the constructors and configuration functions are `const`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryBackoff {
    strategy: Strategy,
    max: Option<TimeDelta>,
    jitter: Option<Jitter>,
    min: TimeDelta,
}

impl Default for RetryBackoff {
    fn default() -> Self {
        Self::none()
    }
}

impl RetryBackoff {
    const fn new(strategy: Strategy) -> Self {
        Self {
            strategy,
            max: None,
            jitter: None,
            min: TimeDelta::zero(),
        }
    }

    /// Retries are due immediately.
    pub const fn none() -> Self {
        Self::new(Strategy::Immediate)
    }

    /// The same delay for every retry.
    ///
    /// ```
    /// # use joblin::backoff::RetryBackoff;
    /// # use chrono::TimeDelta;
    /// let backoff = RetryBackoff::constant(TimeDelta::seconds(10));
    ///
    /// assert_eq!(backoff.delay(1), Some(TimeDelta::seconds(10)));
    /// assert_eq!(backoff.delay(3), Some(TimeDelta::seconds(10)));
    /// ```
    pub const fn constant(delay: TimeDelta) -> Self {
        Self::new(Strategy::Constant(delay))
    }

    /// `factor` times the retry number.
    pub const fn linear(factor: TimeDelta) -> Self {
        Self::new(Strategy::Linear(factor))
    }

    /// The number of seconds in `base` raised to the retry number.
    ///
    /// ```
    /// # use joblin::backoff::RetryBackoff;
    /// # use chrono::TimeDelta;
    /// let backoff = RetryBackoff::exponential(TimeDelta::seconds(2)).with_max(TimeDelta::seconds(30));
    ///
    /// assert_eq!(backoff.delay(1), Some(TimeDelta::seconds(2)));
    /// assert_eq!(backoff.delay(3), Some(TimeDelta::seconds(8)));
    /// assert_eq!(backoff.delay(5), Some(TimeDelta::seconds(30)));
    /// ```
    pub const fn exponential(base: TimeDelta) -> Self {
        Self::new(Strategy::Exponential(base))
    }

    /// Clamps the delay, before jitter, to `max`.
    pub const fn with_max(mut self, max: TimeDelta) -> Self {
        self.max = Some(max);
        self
    }

    pub const fn with_jitter(mut self, jitter: Jitter) -> Self {
        self.jitter = Some(jitter);
        self
    }

    /// A lower bound applied after jitter.
    pub const fn with_min(mut self, min: TimeDelta) -> Self {
        self.min = min;
        self
    }

    /// The delay before retry number `retry` is due, or `None` when it is due immediately.
    pub fn delay(&self, retry: i32) -> Option<TimeDelta> {
        let retry = retry.max(1);
        let mut delay = match self.strategy {
            Strategy::Immediate => return None,
            Strategy::Constant(delay) => delay,
            Strategy::Linear(factor) => factor.checked_mul(retry).unwrap_or(TimeDelta::MAX),
            Strategy::Exponential(base) => base
                .num_seconds()
                .checked_pow(retry.unsigned_abs())
                .and_then(TimeDelta::try_seconds)
                .unwrap_or(TimeDelta::MAX),
        };
        if let Some(max) = self.max {
            delay = delay.min(max);
        }
        if let Some(jitter) = self.jitter {
            delay = jitter.apply_jitter(delay);
        }
        Some(delay.max(self.min))
    }
}

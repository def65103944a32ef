//! Sources of the current time.
//!
//! Everything that depends on "now" (window rollover, age based priority, suggested scheduling
//! times) reads it from a [`Clock`] so that it can be controlled in tests. See
//! [`crate::testing::ManualClock`] for a clock that only moves when told to.
use std::sync::Arc;

use chrono::{DateTime, Utc};

/// A source of the current time.
pub trait Clock: Send + Sync {
    /// The current instant in UTC.
    fn now(&self) -> DateTime<Utc>;
}

/// The wall clock.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

impl<C> Clock for Arc<C>
where
    C: Clock + ?Sized,
{
    fn now(&self) -> DateTime<Utc> {
        self.as_ref().now()
    }
}

use chrono::{DateTime, TimeDelta, Utc};

/// A bare fixed window counter for rate limiting by key alone, without a configuration.
///
/// Counters are stored apart from [`super::RateLimitState`] so that the two modes never share
/// counts, even for the same key. `version` plays the same role as on `RateLimitState`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowCounter {
    pub key: String,
    pub count: i32,
    pub window_start: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub version: i64,
}

impl WindowCounter {
    pub fn new(key: impl Into<String>, now: DateTime<Utc>) -> Self {
        Self {
            key: key.into(),
            count: 0,
            window_start: now,
            last_updated: now,
            version: 0,
        }
    }

    /// Whether the current window has already seen `max` increments. An elapsed window counts
    /// as empty.
    pub fn is_exceeded(&self, window: TimeDelta, max: i32, now: DateTime<Utc>) -> bool {
        if now - self.window_start >= window {
            return false;
        }
        self.count >= max
    }

    pub fn increment(&mut self, window: TimeDelta, now: DateTime<Utc>) {
        if now - self.window_start >= window {
            self.count = 0;
            self.window_start = now;
        }
        self.count += 1;
        self.last_updated = now;
    }
}

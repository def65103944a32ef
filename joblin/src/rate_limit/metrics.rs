use chrono::{DateTime, TimeDelta, Utc};
use serde::{Serialize, Serializer};

use super::{RateLimitConfiguration, RateLimitState};

/// A point in time view of one key's counters against its limits, for observability.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RateLimitMetrics {
    pub rate_limit_key: String,
    pub job_type: String,
    pub active_job_count: i32,
    pub max_concurrent_jobs: i32,
    pub jobs_in_current_window: i32,
    pub max_jobs_per_time_window: i32,
    pub current_window_start: DateTime<Utc>,
    #[serde(rename = "time_window_seconds", serialize_with = "as_seconds")]
    pub time_window: TimeDelta,
}

impl RateLimitMetrics {
    pub fn new(state: &RateLimitState, configuration: &RateLimitConfiguration) -> Self {
        Self {
            rate_limit_key: state.rate_limit_key.clone(),
            job_type: state.job_type.clone(),
            active_job_count: state.active_job_count,
            max_concurrent_jobs: configuration.max_concurrent_jobs(),
            jobs_in_current_window: state.jobs_in_current_window,
            max_jobs_per_time_window: configuration.max_jobs_per_time_window(),
            current_window_start: state.current_window_start,
            time_window: configuration.window_duration(),
        }
    }

    /// Metrics with no counters and no limits.
    pub fn empty(
        rate_limit_key: impl Into<String>,
        job_type: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            rate_limit_key: rate_limit_key.into(),
            job_type: job_type.into(),
            active_job_count: 0,
            max_concurrent_jobs: 0,
            jobs_in_current_window: 0,
            max_jobs_per_time_window: 0,
            current_window_start: now,
            time_window: TimeDelta::zero(),
        }
    }

    pub fn concurrent_utilization(&self) -> f64 {
        percentage(self.active_job_count, self.max_concurrent_jobs)
    }

    pub fn window_utilization(&self) -> f64 {
        percentage(self.jobs_in_current_window, self.max_jobs_per_time_window)
    }

    pub fn is_concurrent_limit_reached(&self) -> bool {
        self.active_job_count >= self.max_concurrent_jobs
    }

    pub fn is_window_limit_reached(&self) -> bool {
        self.jobs_in_current_window >= self.max_jobs_per_time_window
    }

    pub fn time_remaining_in_window(&self, now: DateTime<Utc>) -> TimeDelta {
        let remaining = self.time_window - (now - self.current_window_start);
        remaining.max(TimeDelta::zero())
    }
}

fn as_seconds<S: Serializer>(value: &TimeDelta, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_i64(value.num_seconds())
}

fn percentage(count: i32, cap: i32) -> f64 {
    if cap <= 0 {
        return 0.0;
    }
    f64::from(count) / f64::from(cap) * 100.0
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::rate_limit::configuration::test::configuration;

    #[test]
    fn utilization_and_limit_flags() {
        let now = Utc::now();
        let config = configuration("c").build(now).unwrap();
        let state = RateLimitState::mock_state("k", "t", now).with_counts(1, 5);

        let metrics = RateLimitMetrics::new(&state, &config);

        assert_eq!(metrics.concurrent_utilization(), 50.0);
        assert_eq!(metrics.window_utilization(), 100.0);
        assert!(!metrics.is_concurrent_limit_reached());
        assert!(metrics.is_window_limit_reached());
    }

    #[test]
    fn time_remaining_is_floored_at_zero() {
        let start = Utc::now();
        let config = configuration("c").build(start).unwrap();
        let state = RateLimitState::mock_state("k", "t", start);
        let metrics = RateLimitMetrics::new(&state, &config);

        assert_eq!(
            metrics.time_remaining_in_window(start + TimeDelta::seconds(10)),
            TimeDelta::seconds(50)
        );
        assert_eq!(
            metrics.time_remaining_in_window(start + TimeDelta::seconds(90)),
            TimeDelta::zero()
        );
    }

    #[test]
    fn empty_metrics_have_no_utilization() {
        let metrics = RateLimitMetrics::empty("k", "t", Utc::now());

        assert_eq!(metrics.concurrent_utilization(), 0.0);
        assert_eq!(metrics.time_remaining_in_window(Utc::now()), TimeDelta::zero());
    }
}

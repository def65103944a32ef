use std::fmt::Display;

use chrono::{DateTime, TimeDelta, Utc};

use crate::event::{PendingEvents, RateLimitEvent};

use super::{RateLimitConfiguration, RateLimits};

/// Identifies the counters of one `(rate limit key, job type)` pair.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct StateKey {
    pub rate_limit_key: String,
    pub job_type: String,
}

impl StateKey {
    pub fn new(rate_limit_key: impl Into<String>, job_type: impl Into<String>) -> Self {
        Self {
            rate_limit_key: rate_limit_key.into(),
            job_type: job_type.into(),
        }
    }
}

impl Display for StateKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.rate_limit_key, self.job_type)
    }
}

/// Counters enforcing a configuration for one `(rate limit key, job type)` pair.
///
/// `version` is the optimistic concurrency token. It is the version the state was read at and
/// is `0` for a state that has never been stored. Stores only accept a write when the stored
/// version still matches, see [`crate::store::RateLimitStateStore::compare_and_swap_state`].
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitState {
    pub rate_limit_key: String,
    pub job_type: String,
    pub active_job_count: i32,
    pub jobs_in_current_window: i32,
    pub current_window_start: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub version: i64,
    pub events: PendingEvents<RateLimitEvent>,
}

impl RateLimitState {
    pub fn new(key: StateKey, now: DateTime<Utc>) -> Self {
        Self {
            rate_limit_key: key.rate_limit_key,
            job_type: key.job_type,
            active_job_count: 0,
            jobs_in_current_window: 0,
            current_window_start: now,
            last_updated: now,
            version: 0,
            events: PendingEvents::default(),
        }
    }

    pub fn key(&self) -> StateKey {
        StateKey::new(self.rate_limit_key.clone(), self.job_type.clone())
    }

    pub fn take_events(&mut self) -> Vec<RateLimitEvent> {
        self.events.take()
    }

    pub fn window_elapsed(&self, window: TimeDelta, now: DateTime<Utc>) -> bool {
        now - self.current_window_start >= window
    }

    /// Whether both limits leave room for another job, judged on the counters as they are.
    pub fn can_start_job(&self, limits: &RateLimits) -> bool {
        self.active_job_count < limits.max_concurrent_jobs()
            && self.jobs_in_current_window < limits.max_jobs_per_time_window()
    }

    /// Start a new window if the current one has fully elapsed. Returns whether it did.
    pub fn update_time_window(&mut self, window: TimeDelta, now: DateTime<Utc>) -> bool {
        if !self.window_elapsed(window, now) {
            return false;
        }
        self.jobs_in_current_window = 0;
        self.current_window_start = now;
        self.last_updated = now;
        self.events.push(RateLimitEvent::WindowReset {
            rate_limit_key: self.rate_limit_key.clone(),
            job_type: self.job_type.clone(),
            window_start: now,
        });
        true
    }

    /// A copy with the window rolled forward as of `now`, recording nothing.
    pub fn as_of(&self, window: TimeDelta, now: DateTime<Utc>) -> Self {
        let mut snapshot = self.clone();
        snapshot.update_time_window(window, now);
        snapshot.events = PendingEvents::default();
        snapshot
    }

    /// Count a job start against both limits, rolling the window first if it has elapsed.
    ///
    /// This does not check the limits. Callers decide admission with [`Self::can_start_job`].
    pub fn job_started(&mut self, configuration: &RateLimitConfiguration, now: DateTime<Utc>) {
        self.update_time_window(configuration.window_duration(), now);
        self.active_job_count += 1;
        self.jobs_in_current_window += 1;
        self.last_updated = now;
        self.events.push(RateLimitEvent::JobStarted {
            rate_limit_key: self.rate_limit_key.clone(),
            job_type: self.job_type.clone(),
            active_job_count: self.active_job_count,
            jobs_in_current_window: self.jobs_in_current_window,
            max_concurrent_jobs: configuration.max_concurrent_jobs(),
            max_jobs_per_time_window: configuration.max_jobs_per_time_window(),
            occurred_at: now,
        });
    }

    /// Release a concurrency slot. Returns false, recording nothing, when no job is active.
    pub fn job_completed(&mut self, now: DateTime<Utc>) -> bool {
        if self.active_job_count <= 0 {
            return false;
        }
        self.active_job_count -= 1;
        self.last_updated = now;
        self.events.push(RateLimitEvent::JobCompleted {
            rate_limit_key: self.rate_limit_key.clone(),
            job_type: self.job_type.clone(),
            active_job_count: self.active_job_count,
            occurred_at: now,
        });
        true
    }

    pub fn reset(&mut self, now: DateTime<Utc>) {
        self.active_job_count = 0;
        self.jobs_in_current_window = 0;
        self.current_window_start = now;
        self.last_updated = now;
        self.events.push(RateLimitEvent::StateReset {
            rate_limit_key: self.rate_limit_key.clone(),
            job_type: self.job_type.clone(),
            occurred_at: now,
        });
    }
}

#[cfg(test)]
pub(crate) mod test {
    use assert_matches::assert_matches;

    use super::*;
    use crate::rate_limit::configuration::test::{configuration, limits};

    impl RateLimitState {
        pub(crate) fn mock_state(key: &str, job_type: &str, now: DateTime<Utc>) -> Self {
            Self::new(StateKey::new(key, job_type), now)
        }

        pub(crate) fn with_counts(self, active_job_count: i32, jobs_in_current_window: i32) -> Self {
            Self {
                active_job_count,
                jobs_in_current_window,
                ..self
            }
        }

        pub(crate) fn with_window_start(self, current_window_start: DateTime<Utc>) -> Self {
            Self {
                current_window_start,
                ..self
            }
        }
    }

    #[test]
    fn can_start_job_requires_room_under_both_limits() {
        let now = Utc::now();
        let limits = limits(3, 60, 5);
        let state = |active, window| RateLimitState::mock_state("k", "t", now).with_counts(active, window);

        assert!(!state(3, 0).can_start_job(&limits));
        assert!(!state(2, 5).can_start_job(&limits));
        assert!(!state(3, 5).can_start_job(&limits));
        assert!(state(2, 4).can_start_job(&limits));
    }

    #[test]
    fn window_rolls_over_once_fully_elapsed() {
        let start = Utc::now();
        let window = TimeDelta::seconds(60);
        let mut state = RateLimitState::mock_state("k", "t", start)
            .with_counts(1, 4)
            .with_window_start(start);

        assert!(!state.update_time_window(window, start + TimeDelta::seconds(59)));
        assert_eq!(state.jobs_in_current_window, 4);

        let later = start + window;
        assert!(state.update_time_window(window, later));
        assert_eq!(state.jobs_in_current_window, 0);
        assert_eq!(state.current_window_start, later);
        assert_eq!(state.active_job_count, 1);
        assert_matches!(
            state.take_events().as_slice(),
            [RateLimitEvent::WindowReset { window_start, .. }] if *window_start == later
        );
    }

    #[test]
    fn as_of_rolls_a_copy_without_recording() {
        let start = Utc::now();
        let state = RateLimitState::mock_state("k", "t", start).with_counts(0, 5);

        let snapshot = state.as_of(TimeDelta::seconds(10), start + TimeDelta::seconds(11));

        assert_eq!(snapshot.jobs_in_current_window, 0);
        assert!(snapshot.events.is_empty());
        assert_eq!(state.jobs_in_current_window, 5);
    }

    #[test]
    fn job_started_counts_against_both_limits() {
        let now = Utc::now();
        let config = configuration("c").build(now).unwrap();
        let mut state = RateLimitState::mock_state("k", "t", now);

        state.job_started(&config, now);

        assert_eq!((state.active_job_count, state.jobs_in_current_window), (1, 1));
        assert_matches!(
            state.take_events().as_slice(),
            [RateLimitEvent::JobStarted {
                active_job_count: 1,
                jobs_in_current_window: 1,
                max_concurrent_jobs: 2,
                max_jobs_per_time_window: 5,
                ..
            }]
        );
    }

    #[test]
    fn job_started_after_elapsed_window_starts_a_new_one() {
        let start = Utc::now();
        let config = configuration("c").build(start).unwrap();
        let mut state = RateLimitState::mock_state("k", "t", start).with_counts(1, 5);
        let later = start + TimeDelta::seconds(61);

        state.job_started(&config, later);

        assert_eq!((state.active_job_count, state.jobs_in_current_window), (2, 1));
        assert_eq!(state.current_window_start, later);
        let events = state.take_events();
        assert_matches!(events[0], RateLimitEvent::WindowReset { .. });
        assert_matches!(events[1], RateLimitEvent::JobStarted { .. });
    }

    #[test]
    fn job_completed_never_goes_negative() {
        let now = Utc::now();
        let mut state = RateLimitState::mock_state("k", "t", now).with_counts(1, 1);

        assert!(state.job_completed(now));
        assert!(!state.job_completed(now));

        assert_eq!(state.active_job_count, 0);
        assert_eq!(state.take_events().len(), 1);
    }

    #[test]
    fn reset_zeroes_counters() {
        let start = Utc::now();
        let later = start + TimeDelta::seconds(5);
        let mut state = RateLimitState::mock_state("k", "t", start).with_counts(2, 3);

        state.reset(later);

        assert_eq!((state.active_job_count, state.jobs_in_current_window), (0, 0));
        assert_eq!(state.current_window_start, later);
        assert_matches!(
            state.take_events().as_slice(),
            [RateLimitEvent::StateReset { .. }]
        );
    }
}

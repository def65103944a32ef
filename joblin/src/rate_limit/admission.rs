use std::{fmt::Display, ops::ControlFlow, sync::Arc};

use chrono::{DateTime, TimeDelta, Utc};
use thiserror::Error;
use tracing::instrument;

use crate::{
    clock::Clock,
    job::JobExecutionContext,
    store::{ConfigurationStore, RateLimitStateStore, StoreError},
};

use super::{
    ConfigurationMatcher, RateLimitConfiguration, RateLimitMetrics, RateLimitState, StateKey,
    WindowCounter,
};

/// Which limit stopped a job. Concurrency is reported first when both are exhausted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DenialReason {
    ConcurrentLimit { active: i32, max: i32 },
    WindowLimit { count: i32, max: i32 },
    Exceeded,
}

impl Display for DenialReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::ConcurrentLimit { active, max } => {
                write!(f, "Concurrent job limit reached ({active}/{max})")
            }
            Self::WindowLimit { count, max } => {
                write!(f, "Time window limit reached ({count}/{max})")
            }
            Self::Exceeded => write!(f, "Rate limit exceeded"),
        }
    }
}

/// The outcome of an admission check.
#[derive(Debug, Clone, PartialEq)]
pub enum AdmissionResult {
    /// No configuration governs the job, so nothing limits it.
    NoConfiguration { metrics: RateLimitMetrics },
    Allowed {
        configuration: RateLimitConfiguration,
        metrics: RateLimitMetrics,
    },
    Denied {
        configuration: RateLimitConfiguration,
        metrics: RateLimitMetrics,
        reason: DenialReason,
        /// Unknown when the concurrency limit is exhausted.
        estimated_wait: Option<TimeDelta>,
    },
}

impl AdmissionResult {
    pub const NO_CONFIGURATION_REASON: &'static str =
        "No rate limit configuration found - allowing by default";

    /// Decide admission against `state`, or against fresh counters when there is none.
    ///
    /// The window is rolled forward on a copy before the limits are checked. Nothing is
    /// recorded on `state`.
    pub fn evaluate(
        configuration: &RateLimitConfiguration,
        key: StateKey,
        state: Option<&RateLimitState>,
        now: DateTime<Utc>,
    ) -> Self {
        let window = configuration.window_duration();
        let state = match state {
            Some(state) => state.as_of(window, now),
            None => RateLimitState::new(key, now),
        };
        let metrics = RateLimitMetrics::new(&state, configuration);
        let configuration = configuration.clone();

        if state.can_start_job(configuration.limits()) {
            return Self::Allowed {
                configuration,
                metrics,
            };
        }

        let (reason, estimated_wait) = if metrics.is_concurrent_limit_reached() {
            let reason = DenialReason::ConcurrentLimit {
                active: metrics.active_job_count,
                max: metrics.max_concurrent_jobs,
            };
            (reason, None)
        } else if metrics.is_window_limit_reached() {
            let reason = DenialReason::WindowLimit {
                count: metrics.jobs_in_current_window,
                max: metrics.max_jobs_per_time_window,
            };
            (reason, Some(metrics.time_remaining_in_window(now)))
        } else {
            (DenialReason::Exceeded, None)
        };

        Self::Denied {
            configuration,
            metrics,
            reason,
            estimated_wait,
        }
    }

    pub fn can_proceed(&self) -> bool {
        !matches!(self, Self::Denied { .. })
    }

    pub fn is_no_configuration(&self) -> bool {
        matches!(self, Self::NoConfiguration { .. })
    }

    pub fn reason(&self) -> Option<String> {
        match self {
            Self::NoConfiguration { .. } => Some(Self::NO_CONFIGURATION_REASON.to_owned()),
            Self::Allowed { .. } => None,
            Self::Denied { reason, .. } => Some(reason.to_string()),
        }
    }

    pub fn metrics(&self) -> &RateLimitMetrics {
        match self {
            Self::NoConfiguration { metrics }
            | Self::Allowed { metrics, .. }
            | Self::Denied { metrics, .. } => metrics,
        }
    }

    pub fn configuration(&self) -> Option<&RateLimitConfiguration> {
        match self {
            Self::NoConfiguration { .. } => None,
            Self::Allowed { configuration, .. } | Self::Denied { configuration, .. } => {
                Some(configuration)
            }
        }
    }

    pub fn estimated_wait(&self) -> Option<TimeDelta> {
        match self {
            Self::Denied { estimated_wait, .. } => *estimated_wait,
            _ => None,
        }
    }

    /// The denial as an error, for entry points that must fail when a job cannot start.
    pub fn exceeded(&self) -> Option<RateLimitExceeded> {
        match self {
            Self::Denied {
                metrics,
                reason,
                estimated_wait,
                ..
            } => Some(RateLimitExceeded {
                rate_limit_key: metrics.rate_limit_key.clone(),
                job_type: metrics.job_type.clone(),
                reason: reason.clone(),
                metrics: metrics.clone(),
                estimated_wait: *estimated_wait,
            }),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Error)]
#[error("Rate limit exceeded for {rate_limit_key} ({job_type}): {reason}")]
pub struct RateLimitExceeded {
    pub rate_limit_key: String,
    pub job_type: String,
    pub reason: DenialReason,
    pub metrics: RateLimitMetrics,
    pub estimated_wait: Option<TimeDelta>,
}

/// Makes admission decisions against the stored configurations and counters.
///
/// Checks are read only. Counters only change through [`AdmissionTracker::acquire`],
/// [`AdmissionTracker::release`] and the explicit state operations, each of which is a
/// compare and swap against the store retried up to `max_cas_attempts` times.
pub struct AdmissionTracker<S> {
    store: S,
    clock: Arc<dyn Clock>,
    max_cas_attempts: usize,
}

impl<S: Clone> Clone for AdmissionTracker<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            clock: self.clock.clone(),
            max_cas_attempts: self.max_cas_attempts,
        }
    }
}

impl<S> AdmissionTracker<S>
where
    S: ConfigurationStore + RateLimitStateStore,
{
    pub const DEFAULT_MAX_CAS_ATTEMPTS: usize = 5;

    pub fn new(store: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            store,
            clock,
            max_cas_attempts: Self::DEFAULT_MAX_CAS_ATTEMPTS,
        }
    }

    pub fn with_max_cas_attempts(self, max_cas_attempts: usize) -> Self {
        Self {
            max_cas_attempts: max_cas_attempts.max(1),
            ..self
        }
    }

    pub async fn find_applicable_configuration(
        &self,
        context: &JobExecutionContext,
    ) -> Result<Option<RateLimitConfiguration>, StoreError> {
        let matcher = ConfigurationMatcher::new(self.store.active_configurations().await?);
        Ok(matcher.find_applicable(context).cloned())
    }

    /// Decide whether a job with `context` may start now.
    ///
    /// A missing `configuration` is resolved from the store and a missing `state` is loaded.
    #[instrument(skip(self, configuration, state))]
    pub async fn check_admission(
        &self,
        context: &JobExecutionContext,
        configuration: Option<&RateLimitConfiguration>,
        state: Option<&RateLimitState>,
    ) -> Result<AdmissionResult, StoreError> {
        let resolved;
        let configuration = match configuration {
            Some(configuration) => configuration,
            None => match self.find_applicable_configuration(context).await? {
                Some(configuration) => {
                    resolved = configuration;
                    &resolved
                }
                None => {
                    return Ok(AdmissionResult::NoConfiguration {
                        metrics: RateLimitMetrics::empty(
                            context.effective_rate_limit_key(),
                            context.job_type.clone(),
                            self.clock.now(),
                        ),
                    })
                }
            },
        };
        let key = StateKey::new(context.effective_rate_limit_key(), context.job_type.clone());
        self.check_key(key, configuration, state).await
    }

    /// Decide admission for `rate_limit_key` under a known configuration.
    ///
    /// The job type is the configuration's job type filter, or empty when it has none.
    pub async fn check_admission_by_key(
        &self,
        rate_limit_key: &str,
        configuration: &RateLimitConfiguration,
    ) -> Result<AdmissionResult, StoreError> {
        let key = StateKey::new(rate_limit_key, configuration.job_type().unwrap_or_default());
        self.check_key(key, configuration, None).await
    }

    async fn check_key(
        &self,
        key: StateKey,
        configuration: &RateLimitConfiguration,
        state: Option<&RateLimitState>,
    ) -> Result<AdmissionResult, StoreError> {
        let loaded;
        let state = match state {
            Some(state) => Some(state),
            None => {
                loaded = self.store.load_state(&key).await?;
                loaded.as_ref()
            }
        };
        let result = AdmissionResult::evaluate(configuration, key, state, self.clock.now());
        if !result.can_proceed() {
            tracing::debug!(reason = ?result.reason(), "Admission denied");
        }
        Ok(result)
    }

    /// Count a job start against its counters if, and only if, both limits allow it.
    ///
    /// The check and the increment are one compare and swap, so concurrent callers can never
    /// push the counters past their limits. On success the stored state is returned with its
    /// events still pending.
    #[instrument(skip(self, configuration), fields(configuration = %configuration.name))]
    pub async fn acquire(
        &self,
        key: &StateKey,
        configuration: &RateLimitConfiguration,
    ) -> Result<Result<RateLimitState, AdmissionResult>, StoreError> {
        let flow = self
            .update_state(key, |state, now| {
                let result = AdmissionResult::evaluate(configuration, key.clone(), Some(&*state), now);
                if !result.can_proceed() {
                    return ControlFlow::Break(result);
                }
                state.job_started(configuration, now);
                ControlFlow::Continue(())
            })
            .await?;
        Ok(match flow {
            ControlFlow::Continue(state) => Ok(state),
            ControlFlow::Break(denied) => Err(denied),
        })
    }

    /// Release a concurrency slot. Returns the stored state when a slot was held.
    #[instrument(skip(self))]
    pub async fn release(&self, key: &StateKey) -> Result<Option<RateLimitState>, StoreError> {
        let flow = self
            .update_state(key, |state, now| {
                if state.job_completed(now) {
                    ControlFlow::Continue(())
                } else {
                    ControlFlow::Break(())
                }
            })
            .await?;
        Ok(continued(flow))
    }

    /// Zero the counters of an existing state.
    #[instrument(skip(self))]
    pub async fn reset_state(&self, key: &StateKey) -> Result<Option<RateLimitState>, StoreError> {
        let flow = self
            .update_state(key, |state, now| {
                if state.version == 0 {
                    return ControlFlow::Break(());
                }
                state.reset(now);
                ControlFlow::Continue(())
            })
            .await?;
        Ok(continued(flow))
    }

    /// Persist a window rollover if the stored window has elapsed.
    #[instrument(skip(self))]
    pub async fn update_time_window(
        &self,
        key: &StateKey,
        window: TimeDelta,
    ) -> Result<Option<RateLimitState>, StoreError> {
        let flow = self
            .update_state(key, |state, now| {
                if state.version != 0 && state.update_time_window(window, now) {
                    ControlFlow::Continue(())
                } else {
                    ControlFlow::Break(())
                }
            })
            .await?;
        Ok(continued(flow))
    }

    /// Whether the key only counter for `key` has reached `max` within the current window.
    pub async fn is_rate_limit_exceeded(
        &self,
        key: &str,
        window: TimeDelta,
        max: i32,
    ) -> Result<bool, StoreError> {
        Ok(self
            .store
            .load_counter(key)
            .await?
            .is_some_and(|counter| counter.is_exceeded(window, max, self.clock.now())))
    }

    /// Count one more use of `key`, starting a new window if the current one has elapsed.
    #[instrument(skip(self))]
    pub async fn increment_rate_limit_counter(
        &self,
        key: &str,
        window: TimeDelta,
    ) -> Result<WindowCounter, StoreError> {
        for _ in 0..self.max_cas_attempts {
            let now = self.clock.now();
            let mut counter = self
                .store
                .load_counter(key)
                .await?
                .unwrap_or_else(|| WindowCounter::new(key, now));
            counter.increment(window, now);
            if self.store.compare_and_swap_counter(&counter).await? {
                counter.version += 1;
                return Ok(counter);
            }
            tracing::debug!(key, "Counter changed concurrently, retrying");
        }
        tracing::warn!(key, "Giving up incrementing rate limit counter");
        Err(StoreError::Contention(key.to_owned()))
    }

    /// Read, change and conditionally write the state for `key` until the write wins.
    ///
    /// A missing state is presented to `change` as fresh counters with version `0`.
    async fn update_state<B>(
        &self,
        key: &StateKey,
        mut change: impl FnMut(&mut RateLimitState, DateTime<Utc>) -> ControlFlow<B> + Send,
    ) -> Result<ControlFlow<B, RateLimitState>, StoreError> {
        for _ in 0..self.max_cas_attempts {
            let now = self.clock.now();
            let mut state = self
                .store
                .load_state(key)
                .await?
                .unwrap_or_else(|| RateLimitState::new(key.clone(), now));
            if let ControlFlow::Break(value) = change(&mut state, now) {
                return Ok(ControlFlow::Break(value));
            }
            if self.store.compare_and_swap_state(&state).await? {
                state.version += 1;
                return Ok(ControlFlow::Continue(state));
            }
            tracing::debug!(%key, "Rate limit state changed concurrently, retrying");
        }
        tracing::warn!(%key, "Giving up updating rate limit state");
        Err(StoreError::Contention(key.to_string()))
    }
}

fn continued<B>(flow: ControlFlow<B, RateLimitState>) -> Option<RateLimitState> {
    match flow {
        ControlFlow::Continue(state) => Some(state),
        ControlFlow::Break(_) => None,
    }
}

#[cfg(test)]
mod test {
    use assert_matches::assert_matches;

    use super::*;
    use crate::{
        rate_limit::configuration::test::configuration,
        store::memory::{test::InterleavingStore, InMemoryStore},
        testing::ManualClock,
    };

    struct Harness {
        store: InMemoryStore,
        clock: Arc<ManualClock>,
        tracker: AdmissionTracker<InMemoryStore>,
    }

    impl Harness {
        fn new() -> Self {
            let store = InMemoryStore::new();
            let clock = Arc::new(ManualClock::default());
            let tracker = AdmissionTracker::new(store.clone(), clock.clone());
            Self {
                store,
                clock,
                tracker,
            }
        }

        async fn with_configuration(self, configuration: RateLimitConfiguration) -> Self {
            self.store.save_configuration(&configuration).await.unwrap();
            self
        }

        async fn with_state(self, state: RateLimitState) -> Self {
            assert!(self.store.compare_and_swap_state(&state).await.unwrap());
            self
        }
    }

    fn context() -> JobExecutionContext {
        JobExecutionContext::new("report", "tenant-1", None)
    }

    fn key() -> StateKey {
        StateKey::new("report:tenant-1", "report")
    }

    #[test]
    fn concurrency_denial_has_unknown_wait() {
        let now = Utc::now();
        let config = configuration("c").build(now).unwrap();
        let state = RateLimitState::mock_state("k", "t", now).with_counts(2, 1);

        let result = AdmissionResult::evaluate(&config, state.key(), Some(&state), now);

        assert!(!result.can_proceed());
        assert_eq!(
            result.reason().as_deref(),
            Some("Concurrent job limit reached (2/2)")
        );
        assert_eq!(result.estimated_wait(), None);
    }

    #[test]
    fn window_denial_waits_for_the_rest_of_the_window() {
        let now = Utc::now();
        let config = configuration("c").build(now).unwrap();
        let state = RateLimitState::mock_state("k", "t", now)
            .with_counts(1, 5)
            .with_window_start(now - TimeDelta::seconds(10));

        let result = AdmissionResult::evaluate(&config, state.key(), Some(&state), now);

        assert_eq!(
            result.reason().as_deref(),
            Some("Time window limit reached (5/5)")
        );
        assert_eq!(result.estimated_wait(), Some(TimeDelta::seconds(50)));
    }

    #[test]
    fn concurrency_is_reported_when_both_limits_are_reached() {
        let now = Utc::now();
        let config = configuration("c").build(now).unwrap();
        let state = RateLimitState::mock_state("k", "t", now).with_counts(2, 5);

        let result = AdmissionResult::evaluate(&config, state.key(), Some(&state), now);

        assert_matches!(
            result,
            AdmissionResult::Denied {
                reason: DenialReason::ConcurrentLimit { active: 2, max: 2 },
                estimated_wait: None,
                ..
            }
        );
    }

    #[test]
    fn admission_at_limit_boundaries() {
        let now = Utc::now();
        let config = RateLimitConfiguration::builder(
            "c",
            crate::rate_limit::configuration::test::limits(3, 60, 5),
        )
        .build(now)
        .unwrap();
        let allowed = |active, window| {
            let state = RateLimitState::mock_state("k", "t", now).with_counts(active, window);
            AdmissionResult::evaluate(&config, state.key(), Some(&state), now).can_proceed()
        };

        assert!(!allowed(3, 0));
        assert!(!allowed(2, 5));
        assert!(!allowed(3, 5));
        assert!(allowed(2, 4));
    }

    #[test]
    fn elapsed_window_never_denies() {
        let now = Utc::now();
        let config = configuration("c").build(now).unwrap();
        let state = RateLimitState::mock_state("k", "t", now)
            .with_counts(0, 5)
            .with_window_start(now - TimeDelta::seconds(61));

        let result = AdmissionResult::evaluate(&config, state.key(), Some(&state), now);

        assert!(result.can_proceed());
        assert_eq!(result.metrics().jobs_in_current_window, 0);
        assert_eq!(result.metrics().current_window_start, now);
    }

    #[test]
    fn missing_state_is_full_capacity() {
        let now = Utc::now();
        let config = configuration("c").build(now).unwrap();

        let result = AdmissionResult::evaluate(&config, StateKey::new("k", "t"), None, now);

        assert_matches!(result, AdmissionResult::Allowed { .. });
        assert_eq!(result.metrics().active_job_count, 0);
        assert_eq!(result.metrics().max_concurrent_jobs, 2);
        assert_eq!(result.metrics().current_window_start, now);
    }

    #[tokio::test]
    async fn no_configuration_allows_by_default() {
        let other = configuration("other")
            .for_job_type("email")
            .build(Utc::now())
            .unwrap();
        let harness = Harness::new().with_configuration(other).await;

        let result = harness
            .tracker
            .check_admission(&context(), None, None)
            .await
            .unwrap();

        assert!(result.can_proceed());
        assert!(result.is_no_configuration());
        assert_eq!(
            result.reason().as_deref(),
            Some(AdmissionResult::NO_CONFIGURATION_REASON)
        );
    }

    #[tokio::test]
    async fn check_admission_reads_stored_state() {
        let now = Utc::now();
        let harness = Harness::new()
            .with_configuration(configuration("c").build(now).unwrap())
            .await;
        let state = RateLimitState::new(key(), harness.clock.now()).with_counts(2, 2);
        let harness = harness.with_state(state).await;

        let result = harness
            .tracker
            .check_admission(&context(), None, None)
            .await
            .unwrap();

        assert_matches!(
            result,
            AdmissionResult::Denied {
                reason: DenialReason::ConcurrentLimit { .. },
                ..
            }
        );
    }

    #[tokio::test]
    async fn check_admission_is_read_only() {
        let now = Utc::now();
        let harness = Harness::new()
            .with_configuration(configuration("c").build(now).unwrap())
            .await;

        for _ in 0..3 {
            harness
                .tracker
                .check_admission(&context(), None, None)
                .await
                .unwrap();
        }

        assert!(harness.store.list_states().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn check_admission_by_key_uses_configuration_job_type() {
        let now = Utc::now();
        let state = RateLimitState::mock_state("tenant-1", "report", now).with_counts(2, 2);
        let harness = Harness::new().with_state(state).await;
        let typed = configuration("typed").for_job_type("report").build(now).unwrap();
        let untyped = configuration("untyped").build(now).unwrap();

        let typed = harness
            .tracker
            .check_admission_by_key("tenant-1", &typed)
            .await
            .unwrap();
        let untyped = harness
            .tracker
            .check_admission_by_key("tenant-1", &untyped)
            .await
            .unwrap();

        assert!(!typed.can_proceed());
        assert!(untyped.can_proceed());
        assert_eq!(untyped.metrics().job_type, "");
    }

    #[tokio::test]
    async fn acquire_stops_exactly_at_the_limit() {
        let harness = Harness::new();
        let config = configuration("c").build(Utc::now()).unwrap();

        let first = harness.tracker.acquire(&key(), &config).await.unwrap();
        let second = harness.tracker.acquire(&key(), &config).await.unwrap();
        let third = harness.tracker.acquire(&key(), &config).await.unwrap();

        assert_matches!(first, Ok(RateLimitState { active_job_count: 1, version: 1, .. }));
        assert_matches!(second, Ok(RateLimitState { active_job_count: 2, version: 2, .. }));
        assert_matches!(third, Err(AdmissionResult::Denied { .. }));
        let stored = harness.store.load_state(&key()).await.unwrap().unwrap();
        assert_eq!(stored.active_job_count, 2);
    }

    #[tokio::test]
    async fn concurrent_acquires_never_exceed_the_limit() {
        let store = InterleavingStore::default();
        let tracker = AdmissionTracker::new(store.clone(), Arc::new(ManualClock::default()))
            .with_max_cas_attempts(50);
        let config = RateLimitConfiguration::builder(
            "c",
            crate::rate_limit::configuration::test::limits(3, 60, 100),
        )
        .build(Utc::now())
        .unwrap();

        let key = key();
        let attempts = (0..10).map(|_| tracker.acquire(&key, &config));
        let results = futures::future::join_all(attempts).await;

        let acquired = results
            .iter()
            .filter(|result| matches!(result, Ok(Ok(_))))
            .count();
        assert_eq!(acquired, 3);
        assert!(results
            .iter()
            .all(|result| matches!(result, Ok(Ok(_)) | Ok(Err(AdmissionResult::Denied { .. })))));
        let stored = store.load_state(&key).await.unwrap().unwrap();
        assert_eq!(stored.active_job_count, 3);
        assert_eq!(stored.jobs_in_current_window, 3);
        assert!(store.lost_writes() > 0);
    }

    #[tokio::test]
    async fn concurrent_counter_increments_are_all_counted() {
        let store = InterleavingStore::default();
        let tracker = AdmissionTracker::new(store.clone(), Arc::new(ManualClock::default()))
            .with_max_cas_attempts(50);
        let window = TimeDelta::seconds(30);

        let increments = (0..10).map(|_| tracker.increment_rate_limit_counter("webhooks", window));
        let results = futures::future::join_all(increments).await;

        assert!(results.iter().all(Result::is_ok));
        let stored = store.load_counter("webhooks").await.unwrap().unwrap();
        assert_eq!(stored.count, 10);
        assert!(store.lost_writes() > 0);
    }

    #[tokio::test]
    async fn contention_beyond_the_attempt_limit_gives_up() {
        let store = InterleavingStore::default();
        let tracker = AdmissionTracker::new(store.clone(), Arc::new(ManualClock::default()))
            .with_max_cas_attempts(1);
        let config = configuration("c").build(Utc::now()).unwrap();

        let key = key();
        let (first, second) = tokio::join!(
            tracker.acquire(&key, &config),
            tracker.acquire(&key, &config)
        );

        assert_matches!(first, Ok(Ok(_)));
        assert_matches!(second, Err(StoreError::Contention(ref contended)) if contended == &key.to_string());
        assert_eq!(store.lost_writes(), 1);
    }

    #[tokio::test]
    async fn acquired_state_carries_pending_events() {
        let harness = Harness::new();
        let config = configuration("c").build(Utc::now()).unwrap();

        let mut state = harness
            .tracker
            .acquire(&key(), &config)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(state.take_events().len(), 1);
    }

    #[tokio::test]
    async fn release_is_floored_at_zero() {
        let harness = Harness::new();
        let config = configuration("c").build(Utc::now()).unwrap();
        harness.tracker.acquire(&key(), &config).await.unwrap().unwrap();

        let released = harness.tracker.release(&key()).await.unwrap();
        let again = harness.tracker.release(&key()).await.unwrap();

        assert_matches!(released, Some(RateLimitState { active_job_count: 0, .. }));
        assert_eq!(again, None);
    }

    #[tokio::test]
    async fn reset_and_update_time_window_only_touch_existing_state() {
        let harness = Harness::new();
        let window = TimeDelta::seconds(60);

        assert_eq!(harness.tracker.reset_state(&key()).await.unwrap(), None);
        assert_eq!(
            harness.tracker.update_time_window(&key(), window).await.unwrap(),
            None
        );

        let config = configuration("c").build(Utc::now()).unwrap();
        harness.tracker.acquire(&key(), &config).await.unwrap().unwrap();

        assert_eq!(
            harness.tracker.update_time_window(&key(), window).await.unwrap(),
            None
        );
        harness.clock.advance(window);
        let rolled = harness
            .tracker
            .update_time_window(&key(), window)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(rolled.jobs_in_current_window, 0);
        assert_eq!(rolled.active_job_count, 1);

        let reset = harness.tracker.reset_state(&key()).await.unwrap().unwrap();
        assert_eq!(reset.active_job_count, 0);
    }

    #[tokio::test]
    async fn key_counter_mode_is_separate_from_configured_state() {
        let harness = Harness::new();
        let window = TimeDelta::seconds(30);
        let config = configuration("c").build(Utc::now()).unwrap();
        harness.tracker.acquire(&key(), &config).await.unwrap().unwrap();

        assert!(!harness
            .tracker
            .is_rate_limit_exceeded("report:tenant-1", window, 1)
            .await
            .unwrap());

        let counter = harness
            .tracker
            .increment_rate_limit_counter("report:tenant-1", window)
            .await
            .unwrap();
        assert_eq!(counter.count, 1);
        assert!(harness
            .tracker
            .is_rate_limit_exceeded("report:tenant-1", window, 1)
            .await
            .unwrap());

        harness.clock.advance(window);
        assert!(!harness
            .tracker
            .is_rate_limit_exceeded("report:tenant-1", window, 1)
            .await
            .unwrap());
        let counter = harness
            .tracker
            .increment_rate_limit_counter("report:tenant-1", window)
            .await
            .unwrap();
        assert_eq!(counter.count, 1);
        assert_eq!(counter.version, 2);
    }
}

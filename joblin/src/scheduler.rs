//! Selection of the next jobs to run.
//!
//! A scheduling pass is read only. It loads the queued jobs that are due, drops those whose
//! rate limit would currently deny them, orders the rest by [`effective_priority`] and returns
//! the head of the queue. Nothing is reserved: a selected job still has to win its slot when it
//! is started, see [`crate::dispatcher::Dispatcher::try_start_job`].
use std::{
    collections::{hash_map::Entry, HashMap},
    sync::Arc,
};

use chrono::{DateTime, TimeDelta, Utc};
use fxhash::FxHashMap;
use tracing::instrument;

use crate::{
    clock::Clock,
    config::JoblinConfig,
    job::Job,
    rate_limit::{
        AdmissionResult, AdmissionTracker, ConfigurationMatcher, RateLimitConfiguration,
        RateLimitState, StateKey,
    },
    store::{ConfigurationStore, JobStore, RateLimitStateStore, StoreError},
};

/// Points added per full hour a job has been waiting.
pub const AGE_BONUS_PER_HOUR: i64 = 10;
/// Points removed per previous attempt.
pub const RETRY_PENALTY: i64 = 5;

/// The priority used to order jobs: the base priority plus an age bonus less a retry penalty.
///
/// ```
/// # use joblin::{job::Job, scheduler::effective_priority};
/// # use chrono::{TimeDelta, Utc};
/// let now = Utc::now();
/// let mut job = Job::builder("report", "tenant-1")
///     .with_priority(10)
///     .build(now - TimeDelta::hours(3));
/// job.retry_count = 2;
///
/// assert_eq!(effective_priority(&job, now), 30);
/// ```
pub fn effective_priority(job: &Job, now: DateTime<Utc>) -> i64 {
    let age_bonus = (now - job.created_at).num_hours().max(0) * AGE_BONUS_PER_HOUR;
    let retry_penalty = i64::from(job.retry_count) * RETRY_PENALTY;
    i64::from(job.priority) + age_bonus - retry_penalty
}

/// Partition `jobs` by effective rate limit key, keeping their order within each key.
pub fn group_by_rate_limit_key(jobs: impl IntoIterator<Item = Job>) -> HashMap<String, Vec<Job>> {
    jobs.into_iter().fold(HashMap::new(), |mut groups, job| {
        groups
            .entry(job.effective_rate_limit_key())
            .or_insert_with(Vec::new)
            .push(job);
        groups
    })
}

pub struct PriorityScheduler<S> {
    store: S,
    tracker: AdmissionTracker<S>,
    clock: Arc<dyn Clock>,
    fallback_delay: TimeDelta,
}

impl<S: Clone> Clone for PriorityScheduler<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            tracker: self.tracker.clone(),
            clock: self.clock.clone(),
            fallback_delay: self.fallback_delay,
        }
    }
}

impl<S> PriorityScheduler<S>
where
    S: JobStore + ConfigurationStore + RateLimitStateStore + Clone,
{
    pub fn new(store: S, clock: Arc<dyn Clock>) -> Self {
        Self {
            tracker: AdmissionTracker::new(store.clone(), clock.clone()),
            store,
            clock,
            fallback_delay: JoblinConfig::DEFAULT_FALLBACK_DELAY,
        }
    }

    pub fn with_fallback_delay(self, fallback_delay: TimeDelta) -> Self {
        Self {
            fallback_delay,
            ..self
        }
    }

    /// Up to `max_jobs` due, admissible jobs, highest effective priority first.
    ///
    /// Active configurations are read once per pass and each key's counters at most once.
    /// Jobs of equal effective priority keep the store's oldest first order.
    #[instrument(skip(self))]
    pub async fn next_batch(&self, max_jobs: usize) -> Result<Vec<Job>, StoreError> {
        if max_jobs == 0 {
            return Ok(Vec::new());
        }
        let now = self.clock.now();
        let candidates = self.store.queued_jobs(now).await?;
        if candidates.is_empty() {
            return Ok(Vec::new());
        }

        let matcher = ConfigurationMatcher::new(self.store.active_configurations().await?);
        let mut states: FxHashMap<StateKey, Option<RateLimitState>> = FxHashMap::default();
        let mut admitted = Vec::with_capacity(candidates.len());

        for job in candidates.into_iter().filter(|job| job.is_eligible(now)) {
            let context = job.execution_context();
            let Some(configuration) = matcher.find_applicable(&context) else {
                admitted.push(job);
                continue;
            };
            let key = StateKey::new(context.effective_rate_limit_key(), context.job_type);
            let state = match states.entry(key.clone()) {
                Entry::Occupied(entry) => entry.into_mut(),
                Entry::Vacant(entry) => entry.insert(self.store.load_state(&key).await?),
            };
            let result = AdmissionResult::evaluate(configuration, key, state.as_ref(), now);
            if result.can_proceed() {
                admitted.push(job);
            } else {
                tracing::debug!(job_id = %job.id, reason = ?result.reason(), "Job held back by rate limit");
            }
        }

        let mut prioritized: Vec<_> = admitted
            .into_iter()
            .map(|job| (effective_priority(&job, now), job))
            .collect();
        prioritized.sort_by(|(a, _), (b, _)| b.cmp(a));
        Ok(prioritized
            .into_iter()
            .take(max_jobs)
            .map(|(_, job)| job)
            .collect())
    }

    /// When `job` could next start.
    ///
    /// Now when nothing limits it or it may start now. Otherwise now plus the estimated wait,
    /// or plus the fallback delay when the wait depends on running jobs finishing.
    pub async fn suggest_scheduling_time(
        &self,
        job: &Job,
        configuration: Option<&RateLimitConfiguration>,
        state: Option<&RateLimitState>,
    ) -> Result<DateTime<Utc>, StoreError> {
        let result = self
            .tracker
            .check_admission(&job.execution_context(), configuration, state)
            .await?;
        let now = self.clock.now();
        if result.can_proceed() {
            return Ok(now);
        }
        let wait = result.estimated_wait().unwrap_or(self.fallback_delay);
        Ok(now.checked_add_signed(wait).unwrap_or(now))
    }
}

//! The boundary where jobs start, finish and are managed.
//!
//! Every operation follows the same unit of work: load the aggregate, apply the transition in
//! memory, write it back conditionally, then publish the events the transition recorded. Rate
//! limit slots are taken with a compare and swap when a job starts and recorded on the job as
//! [`Job::rate_limit_slot`]. Leaving [`JobStatus::InProgress`] releases exactly that slot, so
//! concurrent dispatchers, in this process or others, cannot push a key past its limits.
use std::sync::Arc;

use chrono::{DateTime, TimeDelta, Utc};
use tracing::instrument;

use crate::{
    clock::Clock,
    config::{JoblinConfig, RateLimitStrategy},
    event::{publish_all, EventSink},
    job::{Job, JobBuilder, JobExecutionContext, JobId, JobStatus},
    rate_limit::{
        AdmissionTracker, RateLimitConfiguration, RateLimitExceeded, RateLimitState, StateKey,
        WindowCounter,
    },
    scheduler::PriorityScheduler,
    store::{JobFilter, Store},
    JoblinError,
};

/// What happened to a job passed to [`Dispatcher::start_job`].
#[derive(Debug, Clone, PartialEq)]
pub enum StartOutcome {
    Started(Job),
    /// Denied and left queued for a later pass.
    Queued { job: Job, denial: RateLimitExceeded },
    /// Denied and rescheduled to when it is expected to be admitted.
    Delayed {
        job: Job,
        until: DateTime<Utc>,
        denial: RateLimitExceeded,
    },
    /// Denied and cancelled.
    Rejected { job: Job, denial: RateLimitExceeded },
    /// Denied but started anyway, without taking a slot.
    Bypassed { job: Job, denial: RateLimitExceeded },
}

impl StartOutcome {
    pub fn job(&self) -> &Job {
        match self {
            Self::Started(job)
            | Self::Queued { job, .. }
            | Self::Delayed { job, .. }
            | Self::Rejected { job, .. }
            | Self::Bypassed { job, .. } => job,
        }
    }

    pub fn into_job(self) -> Job {
        match self {
            Self::Started(job)
            | Self::Queued { job, .. }
            | Self::Delayed { job, .. }
            | Self::Rejected { job, .. }
            | Self::Bypassed { job, .. } => job,
        }
    }

    /// Whether the job is now running.
    pub fn is_started(&self) -> bool {
        matches!(self, Self::Started(_) | Self::Bypassed { .. })
    }
}

pub struct Dispatcher<S> {
    store: S,
    tracker: AdmissionTracker<S>,
    scheduler: PriorityScheduler<S>,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
    config: JoblinConfig,
}

impl<S: Clone> Clone for Dispatcher<S> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            tracker: self.tracker.clone(),
            scheduler: self.scheduler.clone(),
            clock: self.clock.clone(),
            sink: self.sink.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S> Dispatcher<S>
where
    S: Store,
{
    pub fn new(
        store: S,
        clock: Arc<dyn Clock>,
        sink: Arc<dyn EventSink>,
        config: JoblinConfig,
    ) -> Self {
        let tracker = AdmissionTracker::new(store.clone(), clock.clone())
            .with_max_cas_attempts(config.max_cas_attempts());
        let scheduler = PriorityScheduler::new(store.clone(), clock.clone())
            .with_fallback_delay(config.fallback_delay());
        Self {
            store,
            tracker,
            scheduler,
            clock,
            sink,
            config,
        }
    }

    pub fn scheduler(&self) -> &PriorityScheduler<S> {
        &self.scheduler
    }

    pub fn tracker(&self) -> &AdmissionTracker<S> {
        &self.tracker
    }

    /// A builder for a new job using the configured default retry limit.
    pub fn job_builder(
        &self,
        job_type: impl Into<String>,
        target_resource: impl Into<String>,
    ) -> JobBuilder {
        Job::builder(job_type, target_resource).with_max_retries(self.config.default_max_retries())
    }

    #[instrument(skip(self, builder))]
    pub async fn enqueue(&self, builder: JobBuilder) -> Result<Job, JoblinError> {
        let mut job = builder.build(self.clock.now());
        self.store.insert_job(&job).await?;
        publish_all(self.sink.as_ref(), job.take_events());
        Ok(job)
    }

    /// Insert or replace a configuration, publishing the changes it recorded.
    #[instrument(skip(self, configuration), fields(configuration = %configuration.name))]
    pub async fn save_configuration(
        &self,
        configuration: &mut RateLimitConfiguration,
    ) -> Result<(), JoblinError> {
        self.store.save_configuration(configuration).await?;
        publish_all(self.sink.as_ref(), configuration.take_events());
        Ok(())
    }

    /// Start a queued job now or fail with [`JoblinError::RateLimitExceeded`].
    ///
    /// The rate limit slot is acquired atomically before the job is written. If the job cannot
    /// be written the slot is given back.
    #[instrument(skip(self))]
    pub async fn try_start_job(
        &self,
        id: JobId,
        external_job_id: Option<String>,
    ) -> Result<Job, JoblinError> {
        let mut job = self.load(id).await?;
        job.start(external_job_id, self.clock.now())?;

        let context = job.execution_context();
        let mut acquired = None;
        if let Some(configuration) = self.tracker.find_applicable_configuration(&context).await? {
            let key = state_key(&context);
            match self.tracker.acquire(&key, &configuration).await? {
                Ok(state) => {
                    job.rate_limit_slot = Some(state.key());
                    acquired = Some(state);
                }
                Err(denied) => {
                    return Err(match denied.exceeded() {
                        Some(exceeded) => JoblinError::RateLimitExceeded(exceeded),
                        None => JoblinError::JobChanged(id),
                    })
                }
            }
        }

        match self.store.compare_and_swap_job(&job, JobStatus::Queued).await {
            Ok(true) => {}
            outcome => {
                if let Some(state) = acquired {
                    self.roll_back(&state.key()).await;
                }
                outcome?;
                return Err(JoblinError::JobChanged(id));
            }
        }

        publish_all(self.sink.as_ref(), job.take_events());
        if let Some(mut state) = acquired {
            publish_all(self.sink.as_ref(), state.take_events());
        }
        Ok(job)
    }

    /// Start a queued job, handling a rate limit denial with the configured
    /// [`RateLimitStrategy`].
    #[instrument(skip(self))]
    pub async fn start_job(
        &self,
        id: JobId,
        external_job_id: Option<String>,
    ) -> Result<StartOutcome, JoblinError> {
        let denial = match self.try_start_job(id, external_job_id.clone()).await {
            Ok(job) => return Ok(StartOutcome::Started(job)),
            Err(JoblinError::RateLimitExceeded(denial)) => denial,
            Err(err) => return Err(err),
        };
        tracing::debug!(%id, reason = %denial.reason, "Job denied by rate limit");

        let mut job = self.load(id).await?;
        let now = self.clock.now();
        match self.config.rate_limit_strategy() {
            RateLimitStrategy::Queue => Ok(StartOutcome::Queued { job, denial }),
            RateLimitStrategy::Delay => {
                let until = self
                    .scheduler
                    .suggest_scheduling_time(&job, None, None)
                    .await?;
                job.reschedule(until, Some(denial.reason.to_string()), now)?;
                self.save(&mut job, JobStatus::Queued).await?;
                Ok(StartOutcome::Delayed { job, until, denial })
            }
            RateLimitStrategy::Reject => {
                job.cancel(Some(denial.reason.to_string()), now)?;
                self.save(&mut job, JobStatus::Queued).await?;
                Ok(StartOutcome::Rejected { job, denial })
            }
            RateLimitStrategy::Bypass => {
                job.start(external_job_id, now)?;
                self.save(&mut job, JobStatus::Queued).await?;
                Ok(StartOutcome::Bypassed { job, denial })
            }
        }
    }

    #[instrument(skip(self, result))]
    pub async fn complete_job(
        &self,
        id: JobId,
        result: Option<serde_json::Value>,
    ) -> Result<Job, JoblinError> {
        let mut job = self.load(id).await?;
        job.complete(result, self.clock.now())?;
        let slot = job.take_rate_limit_slot();
        self.save(&mut job, JobStatus::InProgress).await?;
        self.release(slot).await?;
        Ok(job)
    }

    /// Record a failed execution. A job that is re-queued for a retry is due again after the
    /// configured retry backoff.
    #[instrument(skip(self, error_message))]
    pub async fn fail_job(
        &self,
        id: JobId,
        error_message: impl Into<String>,
        should_retry: bool,
    ) -> Result<Job, JoblinError> {
        let mut job = self.load(id).await?;
        let now = self.clock.now();
        job.fail(error_message, should_retry, now)?;
        if job.status == JobStatus::Queued {
            if let Some(delay) = self.config.retry_backoff().delay(job.retry_count) {
                let due = now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC);
                job.scheduled_for = Some(due);
            }
        }
        let slot = job.take_rate_limit_slot();
        self.save(&mut job, JobStatus::InProgress).await?;
        self.release(slot).await?;
        Ok(job)
    }

    /// Cancel a job that has not finished. Cancelling a cancelled job does nothing.
    #[instrument(skip(self))]
    pub async fn cancel_job(&self, id: JobId, reason: Option<String>) -> Result<Job, JoblinError> {
        let mut job = self.load(id).await?;
        let previous = job.status;
        job.cancel(reason, self.clock.now())?;
        if previous == JobStatus::Cancelled {
            return Ok(job);
        }
        let slot = job.take_rate_limit_slot();
        self.save(&mut job, previous).await?;
        self.release(slot).await?;
        Ok(job)
    }

    #[instrument(skip(self))]
    pub async fn reschedule_job(
        &self,
        id: JobId,
        scheduled_for: DateTime<Utc>,
        reason: Option<String>,
    ) -> Result<Job, JoblinError> {
        let mut job = self.load(id).await?;
        job.reschedule(scheduled_for, reason, self.clock.now())?;
        self.save(&mut job, JobStatus::Queued).await?;
        Ok(job)
    }

    /// Record a liveness report for a job. Does not change its status.
    #[instrument(skip(self, message))]
    pub async fn record_heartbeat(
        &self,
        id: JobId,
        progress: Option<i32>,
        message: Option<String>,
    ) -> Result<Job, JoblinError> {
        let mut job = self.load(id).await?;
        job.record_heartbeat(progress, message, self.clock.now());
        let status = job.status;
        self.save(&mut job, status).await?;
        Ok(job)
    }

    /// The status of a job that is expected to exist.
    pub async fn job_status(&self, id: JobId) -> Result<JobStatus, JoblinError> {
        Ok(self.load(id).await?.status)
    }

    pub async fn query_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, JoblinError> {
        Ok(self.store.query_jobs(filter).await?)
    }

    /// All stored rate limit states, for diagnostics.
    pub async fn rate_limit_states(&self) -> Result<Vec<RateLimitState>, JoblinError> {
        Ok(self.store.list_states().await?)
    }

    /// Zero the counters for a key. Returns `None` when the key has no state.
    #[instrument(skip(self))]
    pub async fn reset_rate_limit_state(
        &self,
        rate_limit_key: &str,
        job_type: &str,
    ) -> Result<Option<RateLimitState>, JoblinError> {
        let key = StateKey::new(rate_limit_key, job_type);
        let state = self.tracker.reset_state(&key).await?;
        Ok(self.published(state))
    }

    /// Persist a window rollover for a key if its window has elapsed under the configuration
    /// governing it.
    #[instrument(skip(self))]
    pub async fn update_time_window(
        &self,
        rate_limit_key: &str,
        job_type: &str,
    ) -> Result<Option<RateLimitState>, JoblinError> {
        let context = JobExecutionContext::new(job_type, "", Some(rate_limit_key.to_owned()));
        let Some(configuration) = self.tracker.find_applicable_configuration(&context).await?
        else {
            return Ok(None);
        };
        let key = StateKey::new(rate_limit_key, job_type);
        let state = self
            .tracker
            .update_time_window(&key, configuration.window_duration())
            .await?;
        Ok(self.published(state))
    }

    /// Whether `key` has been used `max` times within the current `window`.
    ///
    /// These key only counters are independent of any configuration.
    pub async fn is_rate_limit_exceeded(
        &self,
        key: &str,
        window: TimeDelta,
        max: i32,
    ) -> Result<bool, JoblinError> {
        Ok(self.tracker.is_rate_limit_exceeded(key, window, max).await?)
    }

    pub async fn increment_rate_limit_counter(
        &self,
        key: &str,
        window: TimeDelta,
    ) -> Result<WindowCounter, JoblinError> {
        Ok(self.tracker.increment_rate_limit_counter(key, window).await?)
    }

    async fn load(&self, id: JobId) -> Result<Job, JoblinError> {
        self.store
            .load_job(id)
            .await?
            .ok_or(JoblinError::JobNotFound(id))
    }

    async fn save(&self, job: &mut Job, expected_status: JobStatus) -> Result<(), JoblinError> {
        if !self.store.compare_and_swap_job(job, expected_status).await? {
            return Err(JoblinError::JobChanged(job.id));
        }
        publish_all(self.sink.as_ref(), job.take_events());
        Ok(())
    }

    /// Give back the slot a finished job took when it started, whatever configuration governs
    /// its key now.
    async fn release(&self, slot: Option<StateKey>) -> Result<(), JoblinError> {
        let Some(key) = slot else {
            return Ok(());
        };
        let state = self.tracker.release(&key).await?;
        self.published(state);
        Ok(())
    }

    /// Undo a slot acquisition whose job could not be started. Nothing is published for either.
    async fn roll_back(&self, key: &StateKey) {
        if let Err(err) = self.tracker.release(key).await {
            tracing::error!(?err, %key, "Failed to release rate limit slot of unstarted job");
        }
    }

    fn published(&self, state: Option<RateLimitState>) -> Option<RateLimitState> {
        state.map(|mut state| {
            publish_all(self.sink.as_ref(), state.take_events());
            state
        })
    }
}

fn state_key(context: &JobExecutionContext) -> StateKey {
    StateKey::new(context.effective_rate_limit_key(), context.job_type.clone())
}

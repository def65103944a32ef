use chrono::{DateTime, Utc};
use joblin::{
    event::PendingEvents,
    rate_limit::{RateLimitConfiguration, RateLimitState, RateLimits, StateKey, WindowCounter},
    store::StoreError,
};
use sqlx::prelude::FromRow;
use uuid::Uuid;

#[derive(sqlx::Type, Debug, Clone, Copy, PartialEq, Eq)]
#[sqlx(type_name = "joblin_job_status", rename_all = "snake_case")]
pub(crate) enum JobStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl From<JobStatus> for joblin::job::JobStatus {
    fn from(value: JobStatus) -> Self {
        match value {
            JobStatus::Queued => Self::Queued,
            JobStatus::InProgress => Self::InProgress,
            JobStatus::Completed => Self::Completed,
            JobStatus::Failed => Self::Failed,
            JobStatus::Cancelled => Self::Cancelled,
        }
    }
}

impl From<joblin::job::JobStatus> for JobStatus {
    fn from(value: joblin::job::JobStatus) -> Self {
        match value {
            joblin::job::JobStatus::Queued => Self::Queued,
            joblin::job::JobStatus::InProgress => Self::InProgress,
            joblin::job::JobStatus::Completed => Self::Completed,
            joblin::job::JobStatus::Failed => Self::Failed,
            joblin::job::JobStatus::Cancelled => Self::Cancelled,
        }
    }
}

pub(crate) const JOB_COLUMNS: &str = "id, job_type, target_resource, rate_limit_key, priority, \
    status, payload, result, error_message, external_job_id, retry_count, max_retries, progress, \
    heartbeat_message, created_at, scheduled_for, started_at, completed_at, last_heartbeat, \
    rate_limit_slot_key, rate_limit_slot_job_type";

#[derive(Debug, FromRow)]
pub(crate) struct Job {
    pub id: Uuid,
    pub job_type: String,
    pub target_resource: String,
    pub rate_limit_key: Option<String>,
    pub priority: i32,
    pub status: JobStatus,
    pub payload: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    pub external_job_id: Option<String>,
    pub retry_count: i32,
    pub max_retries: i32,
    pub progress: Option<i32>,
    pub heartbeat_message: Option<String>,
    pub created_at: DateTime<Utc>,
    pub scheduled_for: Option<DateTime<Utc>>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub rate_limit_slot_key: Option<String>,
    pub rate_limit_slot_job_type: Option<String>,
}

impl From<Job> for joblin::job::Job {
    fn from(value: Job) -> Self {
        Self {
            id: value.id.into(),
            job_type: value.job_type,
            target_resource: value.target_resource,
            rate_limit_key: value.rate_limit_key,
            priority: value.priority,
            status: value.status.into(),
            payload: value.payload,
            result: value.result,
            error_message: value.error_message,
            external_job_id: value.external_job_id,
            retry_count: value.retry_count,
            max_retries: value.max_retries,
            progress: value.progress,
            heartbeat_message: value.heartbeat_message,
            created_at: value.created_at,
            scheduled_for: value.scheduled_for,
            started_at: value.started_at,
            completed_at: value.completed_at,
            last_heartbeat: value.last_heartbeat,
            rate_limit_slot: value
                .rate_limit_slot_key
                .zip(value.rate_limit_slot_job_type)
                .map(|(key, job_type)| StateKey::new(key, job_type)),
            events: PendingEvents::default(),
        }
    }
}

pub(crate) const CONFIGURATION_COLUMNS: &str = "name, description, max_concurrent_jobs, \
    time_window_seconds, max_jobs_per_time_window, is_active, job_type, key_pattern, priority, \
    created_at, updated_at";

#[derive(Debug, FromRow)]
pub(crate) struct Configuration {
    pub name: String,
    pub description: Option<String>,
    pub max_concurrent_jobs: i32,
    pub time_window_seconds: i32,
    pub max_jobs_per_time_window: i32,
    pub is_active: bool,
    pub job_type: Option<String>,
    pub key_pattern: Option<String>,
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
}

impl TryFrom<Configuration> for RateLimitConfiguration {
    type Error = StoreError;

    fn try_from(value: Configuration) -> Result<Self, Self::Error> {
        let invalid = |err: joblin::rate_limit::ConfigurationError| {
            StoreError::InvalidRecord(format!("configuration {}: {err}", value.name))
        };
        let limits = RateLimits::new(
            value.max_concurrent_jobs,
            value.time_window_seconds,
            value.max_jobs_per_time_window,
        )
        .map_err(invalid)?;
        let mut builder = RateLimitConfiguration::builder(value.name.clone(), limits)
            .with_priority(value.priority);
        if let Some(description) = value.description.clone() {
            builder = builder.with_description(description);
        }
        if let Some(job_type) = value.job_type.clone() {
            builder = builder.for_job_type(job_type);
        }
        if let Some(key_pattern) = value.key_pattern.clone() {
            builder = builder.with_key_pattern(key_pattern);
        }
        if !value.is_active {
            builder = builder.inactive();
        }
        builder
            .restore(value.created_at, value.updated_at)
            .map_err(invalid)
    }
}

pub(crate) const STATE_COLUMNS: &str = "rate_limit_key, job_type, active_job_count, \
    jobs_in_current_window, current_window_start, last_updated, version";

#[derive(Debug, FromRow)]
pub(crate) struct State {
    pub rate_limit_key: String,
    pub job_type: String,
    pub active_job_count: i32,
    pub jobs_in_current_window: i32,
    pub current_window_start: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub version: i64,
}

impl From<State> for RateLimitState {
    fn from(value: State) -> Self {
        Self {
            rate_limit_key: value.rate_limit_key,
            job_type: value.job_type,
            active_job_count: value.active_job_count,
            jobs_in_current_window: value.jobs_in_current_window,
            current_window_start: value.current_window_start,
            last_updated: value.last_updated,
            version: value.version,
            events: PendingEvents::default(),
        }
    }
}

#[derive(Debug, FromRow)]
pub(crate) struct Counter {
    pub key: String,
    pub count: i32,
    pub window_start: DateTime<Utc>,
    pub last_updated: DateTime<Utc>,
    pub version: i64,
}

impl From<Counter> for WindowCounter {
    fn from(value: Counter) -> Self {
        Self {
            key: value.key,
            count: value.count,
            window_start: value.window_start,
            last_updated: value.last_updated,
            version: value.version,
        }
    }
}

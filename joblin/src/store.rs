//! The persistence contracts the scheduler works against.
//!
//! Jobs, configurations and rate limit state live in a durable store owned by the caller. The
//! core only reads snapshots and writes changes back through these traits. Writes that race
//! with other scheduler instances are conditional: they name the version (or status) they were
//! derived from and report `false` when the stored record has moved on.
//!
//! [`memory::InMemoryStore`] is a correct, unoptimised implementation for tests. Implementors
//! can check their own store against the shared suite in [`testing`] with [`crate::test_suite`].
use std::error::Error as StdError;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

use crate::{
    job::{Job, JobId, JobStatus},
    rate_limit::{RateLimitConfiguration, RateLimitState, StateKey, WindowCounter},
};

pub mod memory;
#[doc(hidden)]
pub mod testing;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("System in bad state")]
    BadState,
    #[error("Job {0} not found")]
    JobNotFound(JobId),
    #[error("Job {0} already exists")]
    Conflict(JobId),
    #[error("Gave up updating {0} after repeated concurrent modification")]
    Contention(String),
    #[error("Invalid stored record: {0}")]
    InvalidRecord(String),
    #[error("Database error")]
    Database(#[source] Box<dyn StdError + Send + Sync>),
}

#[async_trait]
pub trait JobStore: Send + Sync {
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError>;

    async fn load_job(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    /// Overwrite the stored job if its status is still `expected_status`.
    ///
    /// Returns `Ok(false)` when the status has changed since the job was loaded and
    /// [`StoreError::JobNotFound`] when there is no such job.
    async fn compare_and_swap_job(
        &self,
        job: &Job,
        expected_status: JobStatus,
    ) -> Result<bool, StoreError>;

    /// Queued jobs that are due at `now`, oldest first.
    async fn queued_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError>;

    /// Jobs matching `filter`, newest first.
    async fn query_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError>;
}

#[async_trait]
pub trait ConfigurationStore: Send + Sync {
    async fn active_configurations(&self) -> Result<Vec<RateLimitConfiguration>, StoreError>;

    async fn load_configuration(
        &self,
        name: &str,
    ) -> Result<Option<RateLimitConfiguration>, StoreError>;

    /// Insert or replace the configuration with the same name.
    async fn save_configuration(
        &self,
        configuration: &RateLimitConfiguration,
    ) -> Result<(), StoreError>;
}

#[async_trait]
pub trait RateLimitStateStore: Send + Sync {
    async fn load_state(&self, key: &StateKey) -> Result<Option<RateLimitState>, StoreError>;

    /// Atomically replace the stored state if its version still equals `state.version`.
    ///
    /// A state with version `0` is only inserted when no state exists for its key. On success
    /// the stored version becomes `state.version + 1`. Returns `Ok(false)` when the write lost
    /// a race.
    async fn compare_and_swap_state(&self, state: &RateLimitState) -> Result<bool, StoreError>;

    /// Every stored state, for diagnostics.
    async fn list_states(&self) -> Result<Vec<RateLimitState>, StoreError>;

    async fn load_counter(&self, key: &str) -> Result<Option<WindowCounter>, StoreError>;

    /// Same contract as [`Self::compare_and_swap_state`], for key only counters.
    async fn compare_and_swap_counter(&self, counter: &WindowCounter) -> Result<bool, StoreError>;
}

/// Everything the scheduler needs from a store.
pub trait Store: JobStore + ConfigurationStore + RateLimitStateStore + Clone + 'static {}

impl<T> Store for T where T: JobStore + ConfigurationStore + RateLimitStateStore + Clone + 'static {}

/// Criteria for [`JobStore::query_jobs`]. Unset criteria match every job.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct JobFilter {
    pub status: Option<JobStatus>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    pub limit: Option<usize>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_status(self, status: JobStatus) -> Self {
        Self {
            status: Some(status),
            ..self
        }
    }

    pub fn created_after(self, created_after: DateTime<Utc>) -> Self {
        Self {
            created_after: Some(created_after),
            ..self
        }
    }

    pub fn created_before(self, created_before: DateTime<Utc>) -> Self {
        Self {
            created_before: Some(created_before),
            ..self
        }
    }

    pub fn with_limit(self, limit: usize) -> Self {
        Self {
            limit: Some(limit),
            ..self
        }
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.status.map_or(true, |status| job.status == status)
            && self.created_after.map_or(true, |after| job.created_at > after)
            && self.created_before.map_or(true, |before| job.created_at < before)
    }
}

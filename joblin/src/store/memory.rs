//! Provides an in memory implementation of the store traits.
//!
//! It is not optimized, instead it is designed to be a correct implementation for use in a test
//! setup. Compare and swap writes are atomic with respect to each other because every write
//! holds the relevant lock for its whole check and update.
use std::{
    collections::HashMap,
    sync::{Arc, RwLock},
};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::{
    event::PendingEvents,
    job::{Job, JobId, JobStatus},
    rate_limit::{RateLimitConfiguration, RateLimitState, StateKey, WindowCounter},
};

use super::{ConfigurationStore, JobFilter, JobStore, RateLimitStateStore, StoreError};

/// An in memory implementation of [`JobStore`], [`ConfigurationStore`] and
/// [`RateLimitStateStore`].
///
/// Clones share the same underlying data.
///
/// **This is not designed for use in a production systems.**
#[derive(Clone, Default)]
pub struct InMemoryStore {
    jobs: Arc<RwLock<Vec<Job>>>,
    configurations: Arc<RwLock<Vec<RateLimitConfiguration>>>,
    states: Arc<RwLock<HashMap<StateKey, RateLimitState>>>,
    counters: Arc<RwLock<HashMap<String, WindowCounter>>>,
}

impl InMemoryStore {
    /// Creates a new, empty [`InMemoryStore`].
    pub fn new() -> Self {
        Self::default()
    }
}

/// Stored records never carry unpublished events.
trait Stored: Clone {
    fn stored(&self) -> Self;
}

impl Stored for Job {
    fn stored(&self) -> Self {
        Self {
            events: PendingEvents::default(),
            ..self.clone()
        }
    }
}

impl Stored for RateLimitConfiguration {
    fn stored(&self) -> Self {
        let mut configuration = self.clone();
        configuration.events = PendingEvents::default();
        configuration
    }
}

impl Stored for RateLimitState {
    fn stored(&self) -> Self {
        Self {
            events: PendingEvents::default(),
            ..self.clone()
        }
    }
}

#[async_trait]
impl JobStore for InMemoryStore {
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        if jobs.iter().any(|stored| stored.id == job.id) {
            return Err(StoreError::Conflict(job.id));
        }
        jobs.push(job.stored());
        Ok(())
    }

    async fn load_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        Ok(self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .find(|job| job.id == id)
            .cloned())
    }

    async fn compare_and_swap_job(
        &self,
        job: &Job,
        expected_status: JobStatus,
    ) -> Result<bool, StoreError> {
        let mut jobs = self.jobs.write().map_err(|_| StoreError::BadState)?;
        let stored = jobs
            .iter_mut()
            .find(|stored| stored.id == job.id)
            .ok_or(StoreError::JobNotFound(job.id))?;
        if stored.status != expected_status {
            return Ok(false);
        }
        *stored = job.stored();
        Ok(true)
    }

    async fn queued_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<_> = self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .filter(|job| job.is_eligible(now))
            .cloned()
            .collect();
        jobs.sort_by_key(|job| job.created_at);
        Ok(jobs)
    }

    async fn query_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let mut jobs: Vec<_> = self
            .jobs
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .filter(|job| filter.matches(job))
            .cloned()
            .collect();
        jobs.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        if let Some(limit) = filter.limit {
            jobs.truncate(limit);
        }
        Ok(jobs)
    }
}

#[async_trait]
impl ConfigurationStore for InMemoryStore {
    async fn active_configurations(&self) -> Result<Vec<RateLimitConfiguration>, StoreError> {
        Ok(self
            .configurations
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .filter(|configuration| configuration.is_active)
            .cloned()
            .collect())
    }

    async fn load_configuration(
        &self,
        name: &str,
    ) -> Result<Option<RateLimitConfiguration>, StoreError> {
        Ok(self
            .configurations
            .read()
            .map_err(|_| StoreError::BadState)?
            .iter()
            .find(|configuration| configuration.name == name)
            .cloned())
    }

    async fn save_configuration(
        &self,
        configuration: &RateLimitConfiguration,
    ) -> Result<(), StoreError> {
        let mut configurations = self
            .configurations
            .write()
            .map_err(|_| StoreError::BadState)?;
        match configurations
            .iter_mut()
            .find(|stored| stored.name == configuration.name)
        {
            Some(stored) => *stored = configuration.stored(),
            None => configurations.push(configuration.stored()),
        }
        Ok(())
    }
}

#[async_trait]
impl RateLimitStateStore for InMemoryStore {
    async fn load_state(&self, key: &StateKey) -> Result<Option<RateLimitState>, StoreError> {
        Ok(self
            .states
            .read()
            .map_err(|_| StoreError::BadState)?
            .get(key)
            .cloned())
    }

    async fn compare_and_swap_state(&self, state: &RateLimitState) -> Result<bool, StoreError> {
        let mut states = self.states.write().map_err(|_| StoreError::BadState)?;
        let key = state.key();
        let current_version = states.get(&key).map_or(0, |stored| stored.version);
        if current_version != state.version {
            return Ok(false);
        }
        let stored = RateLimitState {
            version: state.version + 1,
            ..state.stored()
        };
        states.insert(key, stored);
        Ok(true)
    }

    async fn list_states(&self) -> Result<Vec<RateLimitState>, StoreError> {
        let mut states: Vec<_> = self
            .states
            .read()
            .map_err(|_| StoreError::BadState)?
            .values()
            .cloned()
            .collect();
        states.sort_by(|a, b| a.key().cmp(&b.key()));
        Ok(states)
    }

    async fn load_counter(&self, key: &str) -> Result<Option<WindowCounter>, StoreError> {
        Ok(self
            .counters
            .read()
            .map_err(|_| StoreError::BadState)?
            .get(key)
            .cloned())
    }

    async fn compare_and_swap_counter(&self, counter: &WindowCounter) -> Result<bool, StoreError> {
        let mut counters = self.counters.write().map_err(|_| StoreError::BadState)?;
        let current_version = counters.get(&counter.key).map_or(0, |stored| stored.version);
        if current_version != counter.version {
            return Ok(false);
        }
        counters.insert(
            counter.key.clone(),
            WindowCounter {
                version: counter.version + 1,
                ..counter.clone()
            },
        );
        Ok(true)
    }
}

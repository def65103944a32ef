//! Rate limited, priority ordered job scheduling.
//!
//! Jobs wait in a store until a scheduling pass selects them. A pass orders the due jobs by
//! [effective priority](scheduler::effective_priority) and drops those whose
//! [rate limit configuration](rate_limit::RateLimitConfiguration) would be exceeded. Starting a
//! job atomically takes a slot in the counters of its rate limit key and finishing it gives the
//! slot back, so limits hold across any number of scheduler processes sharing a store.
//!
//! [`Joblin`] runs passes on an interval and hands started jobs to the caller.
//!
//! # Example
//!
//! ```
//! # use joblin::prelude::*;
//! # use joblin::store::memory::InMemoryStore;
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let mut joblin = Joblin::new(InMemoryStore::new());
//! let dispatcher = joblin.dispatcher();
//!
//! let mut configuration = RateLimitConfiguration::builder("tenants", RateLimits::new(2, 60, 100)?)
//!     .with_key_pattern("tenant-*")
//!     .build(chrono::Utc::now())?;
//! dispatcher.save_configuration(&mut configuration).await?;
//!
//! let job = dispatcher
//!     .enqueue(dispatcher.job_builder("export", "orders").with_rate_limit_key("tenant-7"))
//!     .await?;
//!
//! let mut started = joblin.spawn()?;
//! assert_eq!(started.recv().await.map(|job| job.id), Some(job.id));
//!
//! dispatcher.complete_job(job.id, None).await?;
//! joblin.graceful_shutdown().await?;
//! # Ok(())
//! # }
//! ```
use std::sync::Arc;

use thiserror::Error;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

pub mod backoff;
pub mod clock;
pub mod config;
pub mod dispatcher;
pub mod event;
pub mod job;
pub mod prelude;
pub mod rate_limit;
mod runner;
pub mod scheduler;
pub mod store;
pub mod testing;

use clock::{Clock, SystemClock};
use config::JoblinConfig;
use dispatcher::Dispatcher;
use event::{EventSink, TracingEventSink};
use job::{Job, JobError, JobId};
use rate_limit::{ConfigurationError, RateLimitExceeded};
use runner::PollRunner;
use scheduler::PriorityScheduler;
use store::{Store, StoreError};

/// Owns the wiring between a store, a clock and an event sink, and runs the poll loop.
pub struct Joblin<S: Store> {
    store: S,
    clock: Arc<dyn Clock>,
    sink: Arc<dyn EventSink>,
    config: JoblinConfig,
    cancellation_token: CancellationToken,
    runner: Option<RunnerHandle>,
}

struct RunnerHandle {
    cancellation_token: CancellationToken,
    handle: Option<JoinHandle<()>>,
}

impl RunnerHandle {
    async fn graceful_shutdown(&mut self) -> Result<(), JoblinError> {
        self.cancellation_token.cancel();
        if let Some(handle) = self.handle.take() {
            handle
                .await
                .map_err(|_| JoblinError::GracefulShutdownFailed)?;
        }
        Ok(())
    }
}

impl<S> Default for Joblin<S>
where
    S: Store + Default,
{
    fn default() -> Self {
        Self::new(Default::default())
    }
}

impl<S> Joblin<S>
where
    S: Store,
{
    /// Uses the wall clock, logs events with `tracing` and the default [`JoblinConfig`].
    pub fn new(store: S) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            sink: Arc::new(TracingEventSink),
            config: JoblinConfig::default(),
            cancellation_token: CancellationToken::new(),
            runner: None,
        }
    }

    pub fn with_config(mut self, config: JoblinConfig) -> Self {
        self.config = config;
        self
    }

    pub fn with_clock(mut self, clock: impl Clock + 'static) -> Self {
        self.clock = Arc::new(clock);
        self
    }

    pub fn with_event_sink(mut self, sink: impl EventSink + 'static) -> Self {
        self.sink = Arc::new(sink);
        self
    }

    /// Stop the poll loop when `cancellation_token` is cancelled, in addition to
    /// [`Joblin::graceful_shutdown`].
    pub fn with_cancellation_token(mut self, cancellation_token: CancellationToken) -> Self {
        self.cancellation_token = cancellation_token;
        self
    }

    pub fn config(&self) -> &JoblinConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> Dispatcher<S> {
        Dispatcher::new(
            self.store.clone(),
            self.clock.clone(),
            self.sink.clone(),
            self.config.clone(),
        )
    }

    pub fn scheduler(&self) -> PriorityScheduler<S> {
        self.dispatcher().scheduler().clone()
    }

    /// Start polling for jobs. Every job the loop starts is sent on the returned channel.
    ///
    /// The loop stops when the receiver is dropped, on cancellation, or on
    /// [`Joblin::graceful_shutdown`].
    pub fn spawn(&mut self) -> Result<mpsc::UnboundedReceiver<Job>, JoblinError> {
        if self.runner.is_some() {
            return Err(JoblinError::AlreadyRunning);
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        let cancellation_token = self.cancellation_token.child_token();
        let handle = PollRunner::new(
            self.dispatcher(),
            self.config.poll_interval(),
            self.config.batch_size(),
            sender,
        )
        .spawn(cancellation_token.clone());
        self.runner = Some(RunnerHandle {
            cancellation_token,
            handle: Some(handle),
        });
        Ok(receiver)
    }

    /// Stop the poll loop, waiting for an in-flight pass to reach a point between jobs.
    pub async fn graceful_shutdown(&mut self) -> Result<(), JoblinError> {
        tracing::debug!("Shutting down Joblin");
        if let Some(mut runner) = self.runner.take() {
            runner.graceful_shutdown().await?;
        }
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum JoblinError {
    #[error("Error communicating with the store")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Job(#[from] JobError),
    #[error("Invalid rate limit configuration")]
    Configuration(#[from] ConfigurationError),
    #[error(transparent)]
    RateLimitExceeded(#[from] RateLimitExceeded),
    #[error("Job {0} not found")]
    JobNotFound(JobId),
    #[error("Job {0} was changed concurrently")]
    JobChanged(JobId),
    #[error("The poll loop is already running")]
    AlreadyRunning,
    #[error("Failed to gracefully shut down")]
    GracefulShutdownFailed,
}

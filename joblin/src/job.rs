//! The schedulable unit of work and its state machine.
//!
//! ```text
//! Queued ──start──▶ InProgress ──complete──▶ Completed
//!   ▲                   │
//!   └──fail (retry)─────┤
//!                       └──fail──▶ Failed
//! Queued | InProgress ──cancel──▶ Cancelled
//! ```
//!
//! Every transition is guarded. Calling an operation from a status that forbids it returns
//! [`JobError::InvalidTransition`] and leaves the job untouched.
use std::fmt::Display;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    event::{JobEvent, JobEventKind, PendingEvents},
    rate_limit::StateKey,
};

pub mod builder;
pub mod context;

pub use builder::JobBuilder;
pub use context::JobExecutionContext;

#[derive(Debug, Eq, PartialEq, Clone, Copy, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    /// A fresh, time ordered id.
    pub fn new() -> Self {
        Self(Uuid::now_v7())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl From<Uuid> for JobId {
    fn from(value: Uuid) -> Self {
        Self(value)
    }
}

impl From<JobId> for Uuid {
    fn from(value: JobId) -> Self {
        value.0
    }
}

impl Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "JobId({})", self.0)
    }
}

#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Queued,
    InProgress,
    Completed,
    Failed,
    Cancelled,
}

impl JobStatus {
    /// Whether no further transitions are possible from this status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Cancelled)
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let val = match self {
            JobStatus::Queued => "queued",
            JobStatus::InProgress => "in_progress",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        write!(f, "{val}")
    }
}

/// Named base priorities. Higher runs first.
#[derive(Debug, Clone, Copy, Eq, PartialEq, Hash, PartialOrd, Ord)]
pub enum JobPriority {
    Low = 0,
    Normal = 10,
    High = 20,
    Critical = 30,
    Emergency = 40,
}

impl From<JobPriority> for i32 {
    fn from(value: JobPriority) -> Self {
        value as i32
    }
}

/// The operations of the job state machine.
#[derive(Debug, Clone, Copy, Eq, PartialEq)]
pub enum JobOperation {
    Start,
    Complete,
    Fail,
    Reschedule,
    Cancel,
}

impl Display for JobOperation {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let val = match self {
            JobOperation::Start => "start",
            JobOperation::Complete => "complete",
            JobOperation::Fail => "fail",
            JobOperation::Reschedule => "reschedule",
            JobOperation::Cancel => "cancel",
        };
        write!(f, "{val}")
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JobError {
    #[error("Cannot {operation} job {job_id} in {status} status")]
    InvalidTransition {
        job_id: JobId,
        status: JobStatus,
        operation: JobOperation,
    },
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub job_type: String,
    pub target_resource: String,
    /// Explicit rate limit key. When unset the key is derived, see
    /// [`JobExecutionContext::effective_rate_limit_key`].
    pub rate_limit_key: Option<String>,
    pub priority: i32,
    pub status: JobStatus,
    pub payload: Option<serde_json::Value>,
    pub result: Option<serde_json::Value>,
    pub error_message: Option<String>,
    /// Handle of the job in whatever system ends up executing it.
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
    /// The rate limit state whose concurrency slot this job holds while it runs. Set only when
    /// a slot was actually taken at start.
    pub rate_limit_slot: Option<StateKey>,
    pub events: PendingEvents<JobEvent>,
}

impl Job {
    pub const DEFAULT_MAX_RETRIES: i32 = 3;

    pub fn builder(job_type: impl Into<String>, target_resource: impl Into<String>) -> JobBuilder {
        JobBuilder::new(job_type, target_resource)
    }

    pub fn execution_context(&self) -> JobExecutionContext {
        JobExecutionContext::new(
            self.job_type.clone(),
            self.target_resource.clone(),
            self.rate_limit_key.clone(),
        )
    }

    pub fn effective_rate_limit_key(&self) -> String {
        self.execution_context().effective_rate_limit_key()
    }

    /// Whether the job may be picked up by a scheduling pass at `now`.
    pub fn is_eligible(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Queued && self.scheduled_for.map_or(true, |at| at <= now)
    }

    /// Hand over the slot held by a job that has left [`JobStatus::InProgress`].
    ///
    /// Returns `None` when the job still runs or never took a slot.
    pub fn take_rate_limit_slot(&mut self) -> Option<StateKey> {
        if self.status == JobStatus::InProgress {
            return None;
        }
        self.rate_limit_slot.take()
    }

    /// Drain the events recorded since the job was loaded.
    pub fn take_events(&mut self) -> Vec<JobEvent> {
        self.events.take()
    }

    pub fn start(
        &mut self,
        external_job_id: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), JobError> {
        self.guard(JobOperation::Start, &[JobStatus::Queued])?;
        self.started_at = Some(now);
        self.external_job_id = external_job_id.clone();
        self.status = JobStatus::InProgress;
        self.record(now, JobEventKind::Started { external_job_id });
        Ok(())
    }

    pub fn complete(
        &mut self,
        result: Option<serde_json::Value>,
        now: DateTime<Utc>,
    ) -> Result<(), JobError> {
        self.guard(JobOperation::Complete, &[JobStatus::InProgress])?;
        self.completed_at = Some(now);
        self.result = result.clone();
        self.status = JobStatus::Completed;
        self.record(now, JobEventKind::Completed { result });
        Ok(())
    }

    /// Record a failed execution.
    ///
    /// When `should_retry` is set and retries remain the job returns to
    /// [`JobStatus::Queued`] with an incremented retry count, otherwise it becomes
    /// [`JobStatus::Failed`].
    pub fn fail(
        &mut self,
        error_message: impl Into<String>,
        should_retry: bool,
        now: DateTime<Utc>,
    ) -> Result<(), JobError> {
        self.guard(JobOperation::Fail, &[JobStatus::InProgress])?;
        let error_message = error_message.into();
        self.error_message = Some(error_message.clone());

        if should_retry && self.retry_count < self.max_retries {
            self.retry_count += 1;
            self.status = JobStatus::Queued;
            self.record(
                now,
                JobEventKind::RetryScheduled {
                    retry_count: self.retry_count,
                    max_retries: self.max_retries,
                    error_message,
                },
            );
        } else {
            self.completed_at = Some(now);
            self.status = JobStatus::Failed;
            self.record(
                now,
                JobEventKind::Failed {
                    error_message,
                    retry_count: self.retry_count,
                },
            );
        }
        Ok(())
    }

    pub fn reschedule(
        &mut self,
        scheduled_for: DateTime<Utc>,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), JobError> {
        self.guard(JobOperation::Reschedule, &[JobStatus::Queued])?;
        self.scheduled_for = Some(scheduled_for);
        self.record(
            now,
            JobEventKind::Rescheduled {
                scheduled_for,
                reason,
            },
        );
        Ok(())
    }

    /// Cancel a job that has not finished.
    ///
    /// Cancelling an already cancelled job does nothing.
    pub fn cancel(&mut self, reason: Option<String>, now: DateTime<Utc>) -> Result<(), JobError> {
        if self.status == JobStatus::Cancelled {
            return Ok(());
        }
        self.guard(
            JobOperation::Cancel,
            &[JobStatus::Queued, JobStatus::InProgress],
        )?;
        self.completed_at = Some(now);
        self.status = JobStatus::Cancelled;
        self.record(now, JobEventKind::Cancelled { reason });
        Ok(())
    }

    pub fn update_external_job_id(&mut self, external_job_id: impl Into<String>) {
        self.external_job_id = Some(external_job_id.into());
    }

    /// Liveness report from whatever is executing the job. Not a state change.
    pub fn record_heartbeat(
        &mut self,
        progress: Option<i32>,
        message: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.last_heartbeat = Some(now);
        if progress.is_some() {
            self.progress = progress;
        }
        if let Some(message) = message.filter(|message| !message.is_empty()) {
            self.heartbeat_message = Some(message);
        }
    }

    fn guard(&self, operation: JobOperation, allowed: &[JobStatus]) -> Result<(), JobError> {
        if allowed.contains(&self.status) {
            Ok(())
        } else {
            Err(JobError::InvalidTransition {
                job_id: self.id,
                status: self.status,
                operation,
            })
        }
    }

    fn record(&mut self, occurred_at: DateTime<Utc>, kind: JobEventKind) {
        self.events.push(JobEvent {
            job_id: self.id,
            occurred_at,
            kind,
        });
    }
}

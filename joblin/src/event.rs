//! Domain events and the sinks they are published to.
//!
//! Aggregates ([`crate::job::Job`], [`crate::rate_limit::RateLimitState`] and
//! [`crate::rate_limit::RateLimitConfiguration`]) never publish directly. Each state changing
//! operation appends exactly one event to the aggregate's pending list, the caller persists the
//! aggregate and only then drains the list with `take_events` and hands the events to an
//! [`EventSink`].
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::mpsc;

use crate::{
    job::{JobId, JobStatus},
    rate_limit::RateLimits,
};

/// Any event produced by the core.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "aggregate", content = "event", rename_all = "snake_case")]
pub enum DomainEvent {
    Job(JobEvent),
    RateLimit(RateLimitEvent),
    Configuration(ConfigurationEvent),
}

impl From<JobEvent> for DomainEvent {
    fn from(value: JobEvent) -> Self {
        Self::Job(value)
    }
}

impl From<RateLimitEvent> for DomainEvent {
    fn from(value: RateLimitEvent) -> Self {
        Self::RateLimit(value)
    }
}

impl From<ConfigurationEvent> for DomainEvent {
    fn from(value: ConfigurationEvent) -> Self {
        Self::Configuration(value)
    }
}

/// Events recorded by an aggregate during a unit of work and not yet published.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingEvents<T>(Vec<T>);

impl<T> Default for PendingEvents<T> {
    fn default() -> Self {
        Self(Vec::new())
    }
}

impl<T> PendingEvents<T> {
    pub(crate) fn push(&mut self, event: T) {
        self.0.push(event)
    }

    /// Drain the pending events, leaving none behind.
    pub fn take(&mut self) -> Vec<T> {
        std::mem::take(&mut self.0)
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

/// Something that happened to a single job.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct JobEvent {
    pub job_id: JobId,
    pub occurred_at: DateTime<Utc>,
    pub kind: JobEventKind,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum JobEventKind {
    Created {
        job_type: String,
        target_resource: String,
        priority: i32,
        rate_limit_key: Option<String>,
    },
    Started {
        external_job_id: Option<String>,
    },
    Completed {
        result: Option<serde_json::Value>,
    },
    RetryScheduled {
        retry_count: i32,
        max_retries: i32,
        error_message: String,
    },
    Failed {
        error_message: String,
        retry_count: i32,
    },
    Rescheduled {
        scheduled_for: DateTime<Utc>,
        reason: Option<String>,
    },
    Cancelled {
        reason: Option<String>,
    },
}

impl JobEvent {
    /// The status the job moved into, for events that record a status change.
    pub fn status_change(&self) -> Option<JobStatus> {
        match self.kind {
            JobEventKind::Started { .. } => Some(JobStatus::InProgress),
            JobEventKind::Completed { .. } => Some(JobStatus::Completed),
            JobEventKind::RetryScheduled { .. } => Some(JobStatus::Queued),
            JobEventKind::Failed { .. } => Some(JobStatus::Failed),
            JobEventKind::Cancelled { .. } => Some(JobStatus::Cancelled),
            JobEventKind::Created { .. } | JobEventKind::Rescheduled { .. } => None,
        }
    }
}

/// Something that happened to the counters of one `(rate limit key, job type)` pair.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum RateLimitEvent {
    JobStarted {
        rate_limit_key: String,
        job_type: String,
        active_job_count: i32,
        jobs_in_current_window: i32,
        max_concurrent_jobs: i32,
        max_jobs_per_time_window: i32,
        occurred_at: DateTime<Utc>,
    },
    JobCompleted {
        rate_limit_key: String,
        job_type: String,
        active_job_count: i32,
        occurred_at: DateTime<Utc>,
    },
    WindowReset {
        rate_limit_key: String,
        job_type: String,
        window_start: DateTime<Utc>,
    },
    StateReset {
        rate_limit_key: String,
        job_type: String,
        occurred_at: DateTime<Utc>,
    },
}

/// Something that happened to a rate limit configuration.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ConfigurationEvent {
    Created {
        name: String,
        max_concurrent_jobs: i32,
        occurred_at: DateTime<Utc>,
    },
    Updated {
        name: String,
        previous: RateLimits,
        current: RateLimits,
        occurred_at: DateTime<Utc>,
    },
    Activated {
        name: String,
        occurred_at: DateTime<Utc>,
    },
    Deactivated {
        name: String,
        occurred_at: DateTime<Utc>,
    },
}

/// Receives domain events once the change that produced them has been persisted.
#[cfg_attr(test, mockall::automock)]
pub trait EventSink: Send + Sync {
    fn publish(&self, event: DomainEvent);
}

/// Publish a batch of pending events in order.
pub fn publish_all<S, E>(sink: &S, events: impl IntoIterator<Item = E>)
where
    S: EventSink + ?Sized,
    E: Into<DomainEvent>,
{
    events
        .into_iter()
        .for_each(|event| sink.publish(event.into()));
}

/// Logs every event through `tracing`.
#[derive(Debug, Clone, Copy, Default)]
pub struct TracingEventSink;

impl EventSink for TracingEventSink {
    fn publish(&self, event: DomainEvent) {
        match &event {
            DomainEvent::Job(JobEvent {
                job_id,
                kind: JobEventKind::Failed { error_message, .. },
                ..
            }) => tracing::warn!(%job_id, ?event, "Job {job_id} failed: {error_message}"),
            DomainEvent::Job(JobEvent { job_id, .. }) => {
                tracing::debug!(%job_id, ?event, "Job event")
            }
            DomainEvent::RateLimit(_) => tracing::debug!(?event, "Rate limit event"),
            DomainEvent::Configuration(_) => tracing::info!(?event, "Configuration event"),
        }
    }
}

impl EventSink for mpsc::UnboundedSender<DomainEvent> {
    fn publish(&self, event: DomainEvent) {
        if let Err(err) = self.send(event) {
            tracing::error!(?err, "Failed to forward domain event, receiver dropped")
        }
    }
}

impl<S> EventSink for Arc<S>
where
    S: EventSink + ?Sized,
{
    fn publish(&self, event: DomainEvent) {
        self.as_ref().publish(event)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    fn started() -> JobEvent {
        JobEvent {
            job_id: JobId::new(),
            occurred_at: Utc::now(),
            kind: JobEventKind::Started {
                external_job_id: None,
            },
        }
    }

    #[test]
    fn status_change_is_reported_for_transitions_only() {
        assert_eq!(started().status_change(), Some(JobStatus::InProgress));

        let rescheduled = JobEvent {
            kind: JobEventKind::Rescheduled {
                scheduled_for: Utc::now(),
                reason: None,
            },
            ..started()
        };
        assert_eq!(rescheduled.status_change(), None);
    }

    #[test]
    fn publish_all_publishes_each_event_once() {
        let mut sink = MockEventSink::new();
        sink.expect_publish().times(2).return_const(());

        publish_all(&sink, [started(), started()]);
    }

    #[tokio::test]
    async fn channel_sink_forwards_events() {
        let (sender, mut receiver) = mpsc::unbounded_channel();
        let event = started();

        sender.publish(event.clone().into());

        assert_eq!(receiver.recv().await, Some(DomainEvent::Job(event)));
    }

    #[test]
    fn events_serialize_with_tags() {
        let value = serde_json::to_value(DomainEvent::from(started())).unwrap();

        assert_eq!(value["aggregate"], "job");
        assert_eq!(value["event"]["kind"]["type"], "started");
    }
}

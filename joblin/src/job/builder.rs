use chrono::{DateTime, Utc};

use crate::event::{JobEventKind, PendingEvents};

use super::{Job, JobId, JobPriority, JobStatus};

/// Builds a new queued [`Job`].
///
/// ```
/// # use joblin::job::{Job, JobPriority};
/// # use chrono::Utc;
/// let job = Job::builder("meter_pull", "device-42")
///     .with_priority(JobPriority::High)
///     .with_rate_limit_key("tenant-7")
///     .with_max_retries(5)
///     .build(Utc::now());
///
/// assert_eq!(job.priority, 20);
/// assert_eq!(job.effective_rate_limit_key(), "tenant-7");
/// ```
#[derive(Debug, Clone)]
pub struct JobBuilder {
    job_type: String,
    target_resource: String,
    rate_limit_key: Option<String>,
    priority: i32,
    payload: Option<serde_json::Value>,
    scheduled_for: Option<DateTime<Utc>>,
    max_retries: i32,
}

impl JobBuilder {
    pub fn new(job_type: impl Into<String>, target_resource: impl Into<String>) -> Self {
        Self {
            job_type: job_type.into(),
            target_resource: target_resource.into(),
            rate_limit_key: None,
            priority: JobPriority::Low.into(),
            payload: None,
            scheduled_for: None,
            max_retries: Job::DEFAULT_MAX_RETRIES,
        }
    }

    pub fn with_priority(self, priority: impl Into<i32>) -> Self {
        Self {
            priority: priority.into(),
            ..self
        }
    }

    pub fn with_rate_limit_key(self, rate_limit_key: impl Into<String>) -> Self {
        Self {
            rate_limit_key: Some(rate_limit_key.into()),
            ..self
        }
    }

    pub fn with_payload(self, payload: serde_json::Value) -> Self {
        Self {
            payload: Some(payload),
            ..self
        }
    }

    pub fn with_max_retries(self, max_retries: i32) -> Self {
        Self {
            max_retries: max_retries.max(0),
            ..self
        }
    }

    pub fn schedule_at(self, scheduled_for: DateTime<Utc>) -> Self {
        Self {
            scheduled_for: Some(scheduled_for),
            ..self
        }
    }

    pub fn build(self, now: DateTime<Utc>) -> Job {
        let mut job = Job {
            id: JobId::new(),
            job_type: self.job_type,
            target_resource: self.target_resource,
            rate_limit_key: self.rate_limit_key,
            priority: self.priority,
            status: JobStatus::Queued,
            payload: self.payload,
            result: None,
            error_message: None,
            external_job_id: None,
            retry_count: 0,
            max_retries: self.max_retries,
            progress: None,
            heartbeat_message: None,
            created_at: now,
            scheduled_for: self.scheduled_for,
            started_at: None,
            completed_at: None,
            last_heartbeat: None,
            rate_limit_slot: None,
            events: PendingEvents::default(),
        };
        job.record(
            now,
            JobEventKind::Created {
                job_type: job.job_type.clone(),
                target_resource: job.target_resource.clone(),
                priority: job.priority,
                rate_limit_key: job.rate_limit_key.clone(),
            },
        );
        job
    }
}

//! The purpose of this module is to alleviate the need to import many of the `[joblin]` types.
//!
//! ```
//! # #![allow(unused_imports)]
//! use joblin::prelude::*;
//! ```
pub use crate::backoff::{Jitter, RetryBackoff};
pub use crate::clock::{Clock, SystemClock};
pub use crate::config::{JoblinConfig, RateLimitStrategy};
pub use crate::dispatcher::{Dispatcher, StartOutcome};
pub use crate::event::{DomainEvent, EventSink, TracingEventSink};
pub use crate::job::{Job, JobId, JobPriority, JobStatus};
pub use crate::rate_limit::{
    AdmissionResult, RateLimitConfiguration, RateLimitExceeded, RateLimitMetrics, RateLimits,
};
pub use crate::scheduler::PriorityScheduler;
pub use crate::store::{JobFilter, Store};
pub use crate::{Joblin, JoblinError};

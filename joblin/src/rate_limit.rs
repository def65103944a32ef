//! Rate limit rules, the per key counters they are enforced against, and the admission decision
//! that combines the two.
//!
//! A [`RateLimitConfiguration`] caps both the number of concurrently running jobs and the number of
//! jobs started within a fixed window. The counters live in a [`RateLimitState`] keyed by the
//! job's effective rate limit key and job type. [`ConfigurationMatcher`] picks the rule for a job
//! and [`AdmissionTracker`] decides whether the job may start now.
pub mod admission;
pub mod configuration;
pub mod counter;
pub mod matcher;
pub mod metrics;
pub mod state;

pub use admission::{AdmissionResult, AdmissionTracker, DenialReason, RateLimitExceeded};
pub use configuration::{
    ConfigurationBuilder, ConfigurationError, KeyPattern, RateLimitConfiguration, RateLimits,
};
pub use counter::WindowCounter;
pub use matcher::ConfigurationMatcher;
pub use metrics::RateLimitMetrics;
pub use state::{RateLimitState, StateKey};

use chrono::{DateTime, TimeDelta, Utc};
use regex::{Regex, RegexBuilder};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::event::{ConfigurationEvent, PendingEvents};

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ConfigurationError {
    #[error("{field} must be greater than 0, got {value}")]
    NonPositive { field: &'static str, value: i32 },
    #[error("Rate limit configuration name must not be empty")]
    EmptyName,
    #[error("Invalid key pattern {pattern:?}: {message}")]
    InvalidKeyPattern { pattern: String, message: String },
}

/// The three numeric limits of a configuration. Always strictly positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RateLimits {
    max_concurrent_jobs: i32,
    time_window_seconds: i32,
    max_jobs_per_time_window: i32,
}

impl RateLimits {
    pub fn new(
        max_concurrent_jobs: i32,
        time_window_seconds: i32,
        max_jobs_per_time_window: i32,
    ) -> Result<Self, ConfigurationError> {
        Self::positive("max_concurrent_jobs", max_concurrent_jobs)?;
        Self::positive("time_window_seconds", time_window_seconds)?;
        Self::positive("max_jobs_per_time_window", max_jobs_per_time_window)?;
        Ok(Self {
            max_concurrent_jobs,
            time_window_seconds,
            max_jobs_per_time_window,
        })
    }

    fn positive(field: &'static str, value: i32) -> Result<(), ConfigurationError> {
        if value <= 0 {
            return Err(ConfigurationError::NonPositive { field, value });
        }
        Ok(())
    }

    pub fn max_concurrent_jobs(&self) -> i32 {
        self.max_concurrent_jobs
    }

    pub fn time_window_seconds(&self) -> i32 {
        self.time_window_seconds
    }

    pub fn max_jobs_per_time_window(&self) -> i32 {
        self.max_jobs_per_time_window
    }

    pub fn window_duration(&self) -> TimeDelta {
        TimeDelta::seconds(self.time_window_seconds.into())
    }
}

/// A case insensitive key pattern.
///
/// A pattern without `*` must equal the key. Each `*` matches any run of characters, including
/// none, and the pattern must cover the whole key. All other characters are literal.
#[derive(Debug, Clone)]
pub struct KeyPattern {
    pattern: String,
    wildcard: Option<Regex>,
}

impl KeyPattern {
    pub fn new(pattern: impl Into<String>) -> Result<Self, ConfigurationError> {
        let pattern = pattern.into();
        let wildcard = if pattern.contains('*') {
            let source = pattern
                .split('*')
                .map(regex::escape)
                .collect::<Vec<_>>()
                .join(".*");
            let regex = RegexBuilder::new(&format!("^{source}$"))
                .case_insensitive(true)
                .build()
                .map_err(|err| ConfigurationError::InvalidKeyPattern {
                    pattern: pattern.clone(),
                    message: err.to_string(),
                })?;
            Some(regex)
        } else {
            None
        };
        Ok(Self { pattern, wildcard })
    }

    pub fn as_str(&self) -> &str {
        &self.pattern
    }

    pub fn is_wildcard(&self) -> bool {
        self.wildcard.is_some()
    }

    pub fn matches(&self, key: &str) -> bool {
        match self.wildcard {
            Some(ref regex) => regex.is_match(key),
            None => self.pattern.to_lowercase() == key.to_lowercase(),
        }
    }
}

impl PartialEq for KeyPattern {
    fn eq(&self, other: &Self) -> bool {
        self.pattern == other.pattern
    }
}

impl Eq for KeyPattern {}

/// A named rate limiting rule.
#[derive(Debug, Clone, PartialEq)]
pub struct RateLimitConfiguration {
    pub name: String,
    pub description: Option<String>,
    limits: RateLimits,
    pub is_active: bool,
    job_type: Option<String>,
    key_pattern: Option<KeyPattern>,
    /// Rank among several matching configurations, higher wins.
    pub priority: i32,
    pub created_at: DateTime<Utc>,
    pub updated_at: Option<DateTime<Utc>>,
    pub events: PendingEvents<ConfigurationEvent>,
}

impl RateLimitConfiguration {
    pub fn builder(name: impl Into<String>, limits: RateLimits) -> ConfigurationBuilder {
        ConfigurationBuilder::new(name, limits)
    }

    pub fn limits(&self) -> &RateLimits {
        &self.limits
    }

    pub fn max_concurrent_jobs(&self) -> i32 {
        self.limits.max_concurrent_jobs
    }

    pub fn time_window_seconds(&self) -> i32 {
        self.limits.time_window_seconds
    }

    pub fn max_jobs_per_time_window(&self) -> i32 {
        self.limits.max_jobs_per_time_window
    }

    pub fn window_duration(&self) -> TimeDelta {
        self.limits.window_duration()
    }

    pub fn job_type(&self) -> Option<&str> {
        self.job_type.as_deref()
    }

    pub fn key_pattern(&self) -> Option<&KeyPattern> {
        self.key_pattern.as_ref()
    }

    pub fn take_events(&mut self) -> Vec<ConfigurationEvent> {
        self.events.take()
    }

    /// Whether this configuration governs jobs of `job_type` under `rate_limit_key`.
    ///
    /// An unset job type filter accepts every job type. An unset pattern, or an empty key,
    /// places no constraint on the key.
    pub fn applies_to(&self, job_type: &str, rate_limit_key: &str) -> bool {
        if !self.is_active {
            return false;
        }
        if let Some(ref filter) = self.job_type {
            if filter.to_lowercase() != job_type.to_lowercase() {
                return false;
            }
        }
        match self.key_pattern {
            Some(ref pattern) if !rate_limit_key.is_empty() => pattern.matches(rate_limit_key),
            _ => true,
        }
    }

    /// Tie break between configurations of equal priority: narrower criteria score higher.
    ///
    /// A job type filter is worth 10, a key pattern 5 and a pattern without wildcards another 5.
    pub fn specificity(&self) -> u8 {
        let mut score = 0;
        if self.job_type.is_some() {
            score += 10;
        }
        if let Some(ref pattern) = self.key_pattern {
            score += 5;
            if !pattern.is_wildcard() {
                score += 5;
            }
        }
        score
    }

    pub fn update_limits(
        &mut self,
        max_concurrent_jobs: i32,
        time_window_seconds: i32,
        max_jobs_per_time_window: i32,
        now: DateTime<Utc>,
    ) -> Result<(), ConfigurationError> {
        let limits = RateLimits::new(
            max_concurrent_jobs,
            time_window_seconds,
            max_jobs_per_time_window,
        )?;
        let previous = std::mem::replace(&mut self.limits, limits);
        self.record_update(previous, now);
        Ok(())
    }

    /// Returns whether the configuration changed.
    pub fn activate(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_active {
            return false;
        }
        self.is_active = true;
        self.updated_at = Some(now);
        self.events.push(ConfigurationEvent::Activated {
            name: self.name.clone(),
            occurred_at: now,
        });
        true
    }

    /// Returns whether the configuration changed.
    pub fn deactivate(&mut self, now: DateTime<Utc>) -> bool {
        if !self.is_active {
            return false;
        }
        self.is_active = false;
        self.updated_at = Some(now);
        self.events.push(ConfigurationEvent::Deactivated {
            name: self.name.clone(),
            occurred_at: now,
        });
        true
    }

    pub fn update_job_type_filter(&mut self, job_type: Option<String>, now: DateTime<Utc>) {
        self.job_type = job_type.filter(|job_type| !job_type.is_empty());
        self.record_update(self.limits, now);
    }

    pub fn update_key_pattern(
        &mut self,
        key_pattern: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<(), ConfigurationError> {
        self.key_pattern = parse_key_pattern(key_pattern)?;
        self.record_update(self.limits, now);
        Ok(())
    }

    fn record_update(&mut self, previous: RateLimits, now: DateTime<Utc>) {
        self.updated_at = Some(now);
        self.events.push(ConfigurationEvent::Updated {
            name: self.name.clone(),
            previous,
            current: self.limits,
            occurred_at: now,
        });
    }
}

fn parse_key_pattern(pattern: Option<String>) -> Result<Option<KeyPattern>, ConfigurationError> {
    pattern
        .filter(|pattern| !pattern.is_empty())
        .map(KeyPattern::new)
        .transpose()
}

/// Builds a [`RateLimitConfiguration`].
///
/// Empty job type filters and key patterns are treated as unset.
///
/// ```
/// # use joblin::rate_limit::{RateLimitConfiguration, RateLimits};
/// # use chrono::Utc;
/// let configuration = RateLimitConfiguration::builder(
///     "meter-pulls",
///     RateLimits::new(2, 60, 5).unwrap(),
/// )
/// .for_job_type("meter_pull")
/// .with_key_pattern("device-*")
/// .build(Utc::now())
/// .unwrap();
///
/// assert!(configuration.applies_to("METER_PULL", "device-17"));
/// assert!(!configuration.applies_to("meter_pull", "gateway-1"));
/// assert_eq!(configuration.specificity(), 15);
/// ```
#[derive(Debug, Clone)]
pub struct ConfigurationBuilder {
    name: String,
    description: Option<String>,
    limits: RateLimits,
    is_active: bool,
    job_type: Option<String>,
    key_pattern: Option<String>,
    priority: i32,
}

impl ConfigurationBuilder {
    pub fn new(name: impl Into<String>, limits: RateLimits) -> Self {
        Self {
            name: name.into(),
            description: None,
            limits,
            is_active: true,
            job_type: None,
            key_pattern: None,
            priority: 0,
        }
    }

    pub fn with_description(self, description: impl Into<String>) -> Self {
        Self {
            description: Some(description.into()),
            ..self
        }
    }

    pub fn for_job_type(self, job_type: impl Into<String>) -> Self {
        Self {
            job_type: Some(job_type.into()),
            ..self
        }
    }

    pub fn with_key_pattern(self, key_pattern: impl Into<String>) -> Self {
        Self {
            key_pattern: Some(key_pattern.into()),
            ..self
        }
    }

    pub fn with_priority(self, priority: i32) -> Self {
        Self { priority, ..self }
    }

    pub fn inactive(self) -> Self {
        Self {
            is_active: false,
            ..self
        }
    }

    /// Build a new configuration, recording its creation.
    pub fn build(self, now: DateTime<Utc>) -> Result<RateLimitConfiguration, ConfigurationError> {
        let mut configuration = self.restore(now, None)?;
        configuration.events.push(ConfigurationEvent::Created {
            name: configuration.name.clone(),
            max_concurrent_jobs: configuration.max_concurrent_jobs(),
            occurred_at: now,
        });
        Ok(configuration)
    }

    /// Rebuild a configuration that already exists, for example when loading it from storage.
    pub fn restore(
        self,
        created_at: DateTime<Utc>,
        updated_at: Option<DateTime<Utc>>,
    ) -> Result<RateLimitConfiguration, ConfigurationError> {
        if self.name.trim().is_empty() {
            return Err(ConfigurationError::EmptyName);
        }
        Ok(RateLimitConfiguration {
            name: self.name,
            description: self.description,
            limits: self.limits,
            is_active: self.is_active,
            job_type: self.job_type.filter(|job_type| !job_type.is_empty()),
            key_pattern: parse_key_pattern(self.key_pattern)?,
            priority: self.priority,
            created_at,
            updated_at,
            events: PendingEvents::default(),
        })
    }
}

#[cfg(test)]
pub(crate) mod test {
    use assert_matches::assert_matches;

    use super::*;

    pub(crate) fn limits(concurrent: i32, window: i32, per_window: i32) -> RateLimits {
        RateLimits::new(concurrent, window, per_window).unwrap()
    }

    pub(crate) fn configuration(name: &str) -> ConfigurationBuilder {
        RateLimitConfiguration::builder(name, limits(2, 60, 5))
    }

    #[test]
    fn limits_must_be_positive() {
        assert_matches!(
            RateLimits::new(0, 60, 5),
            Err(ConfigurationError::NonPositive {
                field: "max_concurrent_jobs",
                value: 0
            })
        );
        assert_matches!(
            RateLimits::new(1, -1, 5),
            Err(ConfigurationError::NonPositive {
                field: "time_window_seconds",
                ..
            })
        );
        assert_matches!(
            RateLimits::new(1, 60, 0),
            Err(ConfigurationError::NonPositive {
                field: "max_jobs_per_time_window",
                ..
            })
        );
        assert!(RateLimits::new(1, 1, 1).is_ok());
    }

    #[test]
    fn update_limits_rejects_non_positive_values_and_keeps_old_ones() {
        let mut config = configuration("c").build(Utc::now()).unwrap();
        config.take_events();

        let result = config.update_limits(3, 0, 10, Utc::now());

        assert!(result.is_err());
        assert_eq!(config.limits(), &limits(2, 60, 5));
        assert!(config.events.is_empty());
    }

    #[test]
    fn update_limits_records_previous_and_current() {
        let mut config = configuration("c").build(Utc::now()).unwrap();
        config.take_events();

        config.update_limits(3, 120, 10, Utc::now()).unwrap();

        assert_matches!(
            config.take_events().as_slice(),
            [ConfigurationEvent::Updated { previous, current, .. }]
                if *previous == limits(2, 60, 5) && *current == limits(3, 120, 10)
        );
    }

    #[test]
    fn empty_name_is_rejected() {
        assert_matches!(
            configuration("  ").build(Utc::now()),
            Err(ConfigurationError::EmptyName)
        );
    }

    #[test]
    fn inactive_configuration_never_applies() {
        let config = configuration("c").inactive().build(Utc::now()).unwrap();

        assert!(!config.applies_to("anything", "any-key"));
    }

    #[test]
    fn job_type_filter_is_case_insensitive() {
        let config = configuration("c")
            .for_job_type("Meter_Pull")
            .build(Utc::now())
            .unwrap();

        assert!(config.applies_to("meter_pull", "k"));
        assert!(!config.applies_to("file_processing", "k"));
    }

    #[test]
    fn exact_pattern_requires_case_insensitive_equality() {
        let config = configuration("c")
            .with_key_pattern("Tenant-1")
            .build(Utc::now())
            .unwrap();

        assert!(config.applies_to("t", "tenant-1"));
        assert!(!config.applies_to("t", "tenant-10"));
    }

    #[test]
    fn wildcard_pattern_matches_any_substring() {
        let config = configuration("c")
            .with_key_pattern("meter_pull:*-eu")
            .build(Utc::now())
            .unwrap();

        assert!(config.applies_to("t", "meter_pull:device-1-eu"));
        assert!(config.applies_to("t", "METER_PULL:-EU"));
        assert!(!config.applies_to("t", "meter_pull:device-1-us"));
        assert!(!config.applies_to("t", "x-meter_pull:device-1-eu"));
    }

    #[test]
    fn pattern_characters_other_than_star_are_literal() {
        let pattern = KeyPattern::new("a.b*").unwrap();

        assert!(pattern.matches("a.bcd"));
        assert!(!pattern.matches("axbcd"));
    }

    #[test]
    fn missing_key_or_pattern_places_no_constraint() {
        let with_pattern = configuration("c")
            .with_key_pattern("device-*")
            .build(Utc::now())
            .unwrap();
        let without_pattern = configuration("c").with_key_pattern("").build(Utc::now()).unwrap();

        assert!(with_pattern.applies_to("t", ""));
        assert!(without_pattern.applies_to("t", "whatever"));
        assert!(without_pattern.key_pattern().is_none());
    }

    #[test]
    fn specificity_scores() {
        let now = Utc::now();
        assert_eq!(configuration("c").build(now).unwrap().specificity(), 0);
        assert_eq!(
            configuration("c")
                .with_key_pattern("a*")
                .build(now)
                .unwrap()
                .specificity(),
            5
        );
        assert_eq!(
            configuration("c")
                .with_key_pattern("a")
                .build(now)
                .unwrap()
                .specificity(),
            10
        );
        assert_eq!(
            configuration("c")
                .for_job_type("t")
                .with_key_pattern("a")
                .build(now)
                .unwrap()
                .specificity(),
            20
        );
    }

    #[test]
    fn activation_is_idempotent() {
        let now = Utc::now();
        let mut config = configuration("c").inactive().build(now).unwrap();
        config.take_events();

        assert!(config.activate(now));
        assert!(!config.activate(now));
        assert!(config.deactivate(now));
        assert!(!config.deactivate(now));

        let events = config.take_events();
        assert_eq!(events.len(), 2);
        assert_matches!(events[0], ConfigurationEvent::Activated { .. });
        assert_matches!(events[1], ConfigurationEvent::Deactivated { .. });
    }

    #[test]
    fn build_records_creation_but_restore_does_not() {
        let now = Utc::now();
        let mut built = configuration("c").build(now).unwrap();
        let restored = configuration("c").restore(now, None).unwrap();

        assert_matches!(
            built.take_events().as_slice(),
            [ConfigurationEvent::Created { max_concurrent_jobs: 2, .. }]
        );
        assert!(restored.events.is_empty());
    }

    #[test]
    fn filters_can_be_updated() {
        let now = Utc::now();
        let mut config = configuration("c").build(now).unwrap();
        config.take_events();

        config.update_job_type_filter(Some("report".to_owned()), now);
        config
            .update_key_pattern(Some("tenant-*".to_owned()), now)
            .unwrap();

        assert_eq!(config.job_type(), Some("report"));
        assert_eq!(config.key_pattern().map(KeyPattern::as_str), Some("tenant-*"));
        assert_eq!(config.take_events().len(), 2);
    }
}

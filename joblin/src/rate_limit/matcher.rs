use crate::job::JobExecutionContext;

use super::RateLimitConfiguration;

/// Picks the configuration governing a job out of a snapshot of configurations.
///
/// Among the configurations that apply, the highest `priority` wins, then the highest
/// [`RateLimitConfiguration::specificity`]. Remaining ties go to the earliest in the snapshot.
#[derive(Debug, Clone, Default)]
pub struct ConfigurationMatcher {
    configurations: Vec<RateLimitConfiguration>,
}

impl ConfigurationMatcher {
    pub fn new(configurations: Vec<RateLimitConfiguration>) -> Self {
        Self { configurations }
    }

    pub fn find_applicable(&self, context: &JobExecutionContext) -> Option<&RateLimitConfiguration> {
        let key = context.effective_rate_limit_key();
        self.configurations
            .iter()
            .filter(|configuration| configuration.applies_to(&context.job_type, &key))
            .fold(None, |best, candidate| match best {
                Some(best) if rank(best) >= rank(candidate) => Some(best),
                _ => Some(candidate),
            })
    }
}

fn rank(configuration: &RateLimitConfiguration) -> (i32, u8) {
    (configuration.priority, configuration.specificity())
}

#[cfg(test)]
mod test {
    use chrono::Utc;

    use super::*;
    use crate::rate_limit::configuration::test::configuration;

    fn context(job_type: &str, key: &str) -> JobExecutionContext {
        JobExecutionContext::new(job_type, "resource", Some(key.to_owned()))
    }

    fn matched<'a>(matcher: &'a ConfigurationMatcher, context: &JobExecutionContext) -> Option<&'a str> {
        matcher
            .find_applicable(context)
            .map(|configuration| configuration.name.as_str())
    }

    #[test]
    fn higher_priority_wins_over_specificity() {
        let now = Utc::now();
        let matcher = ConfigurationMatcher::new(vec![
            configuration("specific")
                .for_job_type("report")
                .with_key_pattern("tenant-1")
                .build(now)
                .unwrap(),
            configuration("catch-all").with_priority(1).build(now).unwrap(),
        ]);

        assert_eq!(matched(&matcher, &context("report", "tenant-1")), Some("catch-all"));
    }

    #[test]
    fn specificity_breaks_priority_ties() {
        let now = Utc::now();
        let matcher = ConfigurationMatcher::new(vec![
            configuration("catch-all").build(now).unwrap(),
            configuration("wildcard")
                .with_key_pattern("tenant-*")
                .build(now)
                .unwrap(),
            configuration("exact")
                .for_job_type("report")
                .with_key_pattern("tenant-1")
                .build(now)
                .unwrap(),
        ]);

        assert_eq!(matched(&matcher, &context("report", "tenant-1")), Some("exact"));
        assert_eq!(matched(&matcher, &context("report", "tenant-2")), Some("wildcard"));
        assert_eq!(matched(&matcher, &context("report", "other")), Some("catch-all"));
    }

    #[test]
    fn full_ties_keep_the_first_configuration() {
        let now = Utc::now();
        let matcher = ConfigurationMatcher::new(vec![
            configuration("first").build(now).unwrap(),
            configuration("second").build(now).unwrap(),
        ]);

        assert_eq!(matched(&matcher, &context("t", "k")), Some("first"));
    }

    #[test]
    fn no_applicable_configuration() {
        let now = Utc::now();
        let matcher = ConfigurationMatcher::new(vec![
            configuration("inactive").inactive().build(now).unwrap(),
            configuration("other-type").for_job_type("email").build(now).unwrap(),
        ]);

        assert_eq!(matched(&matcher, &context("report", "k")), None);
        assert_eq!(matched(&ConfigurationMatcher::default(), &context("report", "k")), None);
    }

    #[test]
    fn derived_key_is_matched_when_no_key_is_set() {
        let now = Utc::now();
        let matcher = ConfigurationMatcher::new(vec![configuration("meters")
            .with_key_pattern("meter_pull:*")
            .build(now)
            .unwrap()]);

        let context = JobExecutionContext::new("meter_pull", "device-1", None);

        assert_eq!(matched(&matcher, &context), Some("meters"));
    }
}

/// What the rate limiting machinery needs to know about a job.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct JobExecutionContext {
    pub job_type: String,
    pub target_resource: String,
    pub rate_limit_key: Option<String>,
}

impl JobExecutionContext {
    pub fn new(
        job_type: impl Into<String>,
        target_resource: impl Into<String>,
        rate_limit_key: Option<String>,
    ) -> Self {
        Self {
            job_type: job_type.into(),
            target_resource: target_resource.into(),
            rate_limit_key,
        }
    }

    /// The key rate limit state is tracked under: the explicit key if there is one, otherwise
    /// `"{job_type}:{target_resource}"`.
    pub fn effective_rate_limit_key(&self) -> String {
        match self.rate_limit_key {
            Some(ref key) => key.clone(),
            None => format!("{}:{}", self.job_type, self.target_resource),
        }
    }
}

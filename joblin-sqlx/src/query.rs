use joblin::store::JobFilter;
use sqlx::{Postgres, QueryBuilder};

use crate::types::{JobStatus, JOB_COLUMNS};

pub(crate) trait ToQuery {
    fn query(&self) -> QueryBuilder<'_, Postgres>;
}

impl ToQuery for JobFilter {
    fn query(&self) -> QueryBuilder<'_, Postgres> {
        let mut builder = QueryBuilder::new(format!("SELECT {JOB_COLUMNS} FROM joblin_jobs"));
        let mut conjunction = " WHERE ";
        if let Some(status) = self.status {
            builder.push(conjunction);
            builder.push("status = ");
            builder.push_bind(JobStatus::from(status));
            conjunction = " AND ";
        }
        if let Some(created_after) = self.created_after {
            builder.push(conjunction);
            builder.push("created_at > ");
            builder.push_bind(created_after);
            conjunction = " AND ";
        }
        if let Some(created_before) = self.created_before {
            builder.push(conjunction);
            builder.push("created_at < ");
            builder.push_bind(created_before);
        }
        builder.push(" ORDER BY created_at DESC, id DESC");
        if let Some(limit) = self.limit {
            builder.push(" LIMIT ");
            builder.push_bind(i64::try_from(limit).unwrap_or(i64::MAX));
        }
        builder
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use chrono::{TimeDelta, Utc};
    use joblin::job::JobStatus;

    #[test]
    fn empty_filter_selects_everything_newest_first() {
        assert_eq!(
            JobFilter::new().query().into_sql(),
            format!("SELECT {JOB_COLUMNS} FROM joblin_jobs ORDER BY created_at DESC, id DESC")
        );
    }

    #[test]
    fn filter_criteria_are_combined() {
        let now = Utc::now();
        let filter = JobFilter::new()
            .with_status(JobStatus::Failed)
            .created_after(now - TimeDelta::hours(1))
            .created_before(now)
            .with_limit(20);

        assert_eq!(
            filter.query().into_sql(),
            format!(
                "SELECT {JOB_COLUMNS} FROM joblin_jobs WHERE status = $1 AND created_at > $2 \
                AND created_at < $3 ORDER BY created_at DESC, id DESC LIMIT $4"
            )
        );
    }

    #[test]
    fn single_criterion_has_no_conjunction() {
        let filter = JobFilter::new().created_before(Utc::now());

        assert_eq!(
            filter.query().into_sql(),
            format!(
                "SELECT {JOB_COLUMNS} FROM joblin_jobs WHERE created_at < $1 \
                ORDER BY created_at DESC, id DESC"
            )
        );
    }
}

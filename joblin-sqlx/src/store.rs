use async_trait::async_trait;
use chrono::{DateTime, Utc};
use joblin::{
    job::{Job, JobId, JobStatus},
    rate_limit::{RateLimitConfiguration, RateLimitState, StateKey, WindowCounter},
    store::{ConfigurationStore, JobFilter, JobStore, RateLimitStateStore, StoreError},
};
use tracing::instrument;
use uuid::Uuid;

use crate::{
    map_err,
    query::ToQuery,
    types::{self, CONFIGURATION_COLUMNS, JOB_COLUMNS, STATE_COLUMNS},
    JoblinPgStore,
};

impl JoblinPgStore {
    fn handle_swap(result: sqlx::Result<u64>) -> Result<bool, StoreError> {
        match result {
            Ok(0) => Ok(false),
            Ok(1) => Ok(true),
            Ok(_) => Err(StoreError::BadState),
            Err(error) => Err(map_err(error)),
        }
    }

    async fn job_exists(&self, id: JobId) -> sqlx::Result<bool> {
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM joblin_jobs WHERE id = $1)")
            .bind(Uuid::from(id))
            .fetch_one(&**self)
            .await
    }

    async fn update_job_if_status(&self, job: &Job, expected_status: JobStatus) -> sqlx::Result<u64> {
        Ok(sqlx::query(
            r#"UPDATE joblin_jobs SET
                job_type = $2,
                target_resource = $3,
                rate_limit_key = $4,
                priority = $5,
                status = $6,
                payload = $7,
                result = $8,
                error_message = $9,
                external_job_id = $10,
                retry_count = $11,
                max_retries = $12,
                progress = $13,
                heartbeat_message = $14,
                scheduled_for = $15,
                started_at = $16,
                completed_at = $17,
                last_heartbeat = $18,
                rate_limit_slot_key = $19,
                rate_limit_slot_job_type = $20
            WHERE id = $1 AND status = $21
            "#,
        )
        .bind(Uuid::from(job.id))
        .bind(&job.job_type)
        .bind(&job.target_resource)
        .bind(&job.rate_limit_key)
        .bind(job.priority)
        .bind(types::JobStatus::from(job.status))
        .bind(&job.payload)
        .bind(&job.result)
        .bind(&job.error_message)
        .bind(&job.external_job_id)
        .bind(job.retry_count)
        .bind(job.max_retries)
        .bind(job.progress)
        .bind(&job.heartbeat_message)
        .bind(job.scheduled_for)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.last_heartbeat)
        .bind(slot_key(job))
        .bind(slot_job_type(job))
        .bind(types::JobStatus::from(expected_status))
        .execute(&**self)
        .await?
        .rows_affected())
    }
}

fn slot_key(job: &Job) -> Option<&str> {
    job.rate_limit_slot
        .as_ref()
        .map(|slot| slot.rate_limit_key.as_str())
}

fn slot_job_type(job: &Job) -> Option<&str> {
    job.rate_limit_slot.as_ref().map(|slot| slot.job_type.as_str())
}

#[async_trait]
impl JobStore for JoblinPgStore {
    #[instrument(skip(self, job), fields(job_id = %job.id))]
    async fn insert_job(&self, job: &Job) -> Result<(), StoreError> {
        let inserted = sqlx::query(
            r#"INSERT INTO joblin_jobs (
                id,
                job_type,
                target_resource,
                rate_limit_key,
                priority,
                status,
                payload,
                result,
                error_message,
                external_job_id,
                retry_count,
                max_retries,
                progress,
                heartbeat_message,
                created_at,
                scheduled_for,
                started_at,
                completed_at,
                last_heartbeat,
                rate_limit_slot_key,
                rate_limit_slot_job_type
            ) VALUES (
                $1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11,
                $12, $13, $14, $15, $16, $17, $18, $19, $20, $21
            )
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(Uuid::from(job.id))
        .bind(&job.job_type)
        .bind(&job.target_resource)
        .bind(&job.rate_limit_key)
        .bind(job.priority)
        .bind(types::JobStatus::from(job.status))
        .bind(&job.payload)
        .bind(&job.result)
        .bind(&job.error_message)
        .bind(&job.external_job_id)
        .bind(job.retry_count)
        .bind(job.max_retries)
        .bind(job.progress)
        .bind(&job.heartbeat_message)
        .bind(job.created_at)
        .bind(job.scheduled_for)
        .bind(job.started_at)
        .bind(job.completed_at)
        .bind(job.last_heartbeat)
        .bind(slot_key(job))
        .bind(slot_job_type(job))
        .execute(&**self)
        .await
        .map_err(map_err)?
        .rows_affected();
        if inserted == 0 {
            return Err(StoreError::Conflict(job.id));
        }
        Ok(())
    }

    async fn load_job(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let sql = format!("SELECT {JOB_COLUMNS} FROM joblin_jobs WHERE id = $1");
        Ok(sqlx::query_as::<_, types::Job>(&sql)
            .bind(Uuid::from(id))
            .fetch_optional(&**self)
            .await
            .map_err(map_err)?
            .map(From::from))
    }

    #[instrument(skip(self, job), fields(job_id = %job.id, status = %job.status))]
    async fn compare_and_swap_job(
        &self,
        job: &Job,
        expected_status: JobStatus,
    ) -> Result<bool, StoreError> {
        let result = self.update_job_if_status(job, expected_status).await;
        if Self::handle_swap(result)? {
            return Ok(true);
        }
        if self.job_exists(job.id).await.map_err(map_err)? {
            Ok(false)
        } else {
            Err(StoreError::JobNotFound(job.id))
        }
    }

    async fn queued_jobs(&self, now: DateTime<Utc>) -> Result<Vec<Job>, StoreError> {
        let sql = format!(
            "SELECT {JOB_COLUMNS} FROM joblin_jobs \
            WHERE status = 'queued' AND (scheduled_for IS NULL OR scheduled_for <= $1) \
            ORDER BY created_at, id"
        );
        Ok(sqlx::query_as::<_, types::Job>(&sql)
            .bind(now)
            .fetch_all(&**self)
            .await
            .map_err(map_err)?
            .into_iter()
            .map(From::from)
            .collect())
    }

    async fn query_jobs(&self, filter: &JobFilter) -> Result<Vec<Job>, StoreError> {
        let mut query = filter.query();
        Ok(query
            .build_query_as::<types::Job>()
            .fetch_all(&**self)
            .await
            .map_err(map_err)?
            .into_iter()
            .map(From::from)
            .collect())
    }
}

#[async_trait]
impl ConfigurationStore for JoblinPgStore {
    async fn active_configurations(&self) -> Result<Vec<RateLimitConfiguration>, StoreError> {
        let sql = format!(
            "SELECT {CONFIGURATION_COLUMNS} FROM joblin_rate_limit_configurations \
            WHERE is_active ORDER BY created_at, name"
        );
        sqlx::query_as::<_, types::Configuration>(&sql)
            .fetch_all(&**self)
            .await
            .map_err(map_err)?
            .into_iter()
            .map(TryFrom::try_from)
            .collect()
    }

    async fn load_configuration(
        &self,
        name: &str,
    ) -> Result<Option<RateLimitConfiguration>, StoreError> {
        let sql = format!(
            "SELECT {CONFIGURATION_COLUMNS} FROM joblin_rate_limit_configurations WHERE name = $1"
        );
        sqlx::query_as::<_, types::Configuration>(&sql)
            .bind(name)
            .fetch_optional(&**self)
            .await
            .map_err(map_err)?
            .map(TryFrom::try_from)
            .transpose()
    }

    #[instrument(skip(self, configuration), fields(configuration = %configuration.name))]
    async fn save_configuration(
        &self,
        configuration: &RateLimitConfiguration,
    ) -> Result<(), StoreError> {
        sqlx::query(
            r#"INSERT INTO joblin_rate_limit_configurations (
                name,
                description,
                max_concurrent_jobs,
                time_window_seconds,
                max_jobs_per_time_window,
                is_active,
                job_type,
                key_pattern,
                priority,
                created_at,
                updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11)
            ON CONFLICT (name) DO UPDATE SET
                description = EXCLUDED.description,
                max_concurrent_jobs = EXCLUDED.max_concurrent_jobs,
                time_window_seconds = EXCLUDED.time_window_seconds,
                max_jobs_per_time_window = EXCLUDED.max_jobs_per_time_window,
                is_active = EXCLUDED.is_active,
                job_type = EXCLUDED.job_type,
                key_pattern = EXCLUDED.key_pattern,
                priority = EXCLUDED.priority,
                created_at = EXCLUDED.created_at,
                updated_at = EXCLUDED.updated_at
            "#,
        )
        .bind(&configuration.name)
        .bind(&configuration.description)
        .bind(configuration.max_concurrent_jobs())
        .bind(configuration.time_window_seconds())
        .bind(configuration.max_jobs_per_time_window())
        .bind(configuration.is_active)
        .bind(configuration.job_type())
        .bind(configuration.key_pattern().map(|pattern| pattern.as_str()))
        .bind(configuration.priority)
        .bind(configuration.created_at)
        .bind(configuration.updated_at)
        .execute(&**self)
        .await
        .map_err(map_err)?;
        Ok(())
    }
}

#[async_trait]
impl RateLimitStateStore for JoblinPgStore {
    async fn load_state(&self, key: &StateKey) -> Result<Option<RateLimitState>, StoreError> {
        let sql = format!(
            "SELECT {STATE_COLUMNS} FROM joblin_rate_limit_states \
            WHERE rate_limit_key = $1 AND job_type = $2"
        );
        Ok(sqlx::query_as::<_, types::State>(&sql)
            .bind(&key.rate_limit_key)
            .bind(&key.job_type)
            .fetch_optional(&**self)
            .await
            .map_err(map_err)?
            .map(From::from))
    }

    #[instrument(skip(self, state), fields(key = %state.key(), version = state.version))]
    async fn compare_and_swap_state(&self, state: &RateLimitState) -> Result<bool, StoreError> {
        let query = if state.version == 0 {
            sqlx::query(
                r#"INSERT INTO joblin_rate_limit_states (
                    rate_limit_key,
                    job_type,
                    active_job_count,
                    jobs_in_current_window,
                    current_window_start,
                    last_updated,
                    version
                ) VALUES ($1, $2, $3, $4, $5, $6, 1)
                ON CONFLICT (rate_limit_key, job_type) DO NOTHING
                "#,
            )
        } else {
            sqlx::query(
                r#"UPDATE joblin_rate_limit_states SET
                    active_job_count = $3,
                    jobs_in_current_window = $4,
                    current_window_start = $5,
                    last_updated = $6,
                    version = version + 1
                WHERE rate_limit_key = $1 AND job_type = $2 AND version = $7
                "#,
            )
        };
        let query = query
            .bind(&state.rate_limit_key)
            .bind(&state.job_type)
            .bind(state.active_job_count)
            .bind(state.jobs_in_current_window)
            .bind(state.current_window_start)
            .bind(state.last_updated);
        let query = match state.version {
            0 => query,
            version => query.bind(version),
        };
        let result = query
            .execute(&**self)
            .await
            .map(|result| result.rows_affected());
        Self::handle_swap(result)
    }

    async fn list_states(&self) -> Result<Vec<RateLimitState>, StoreError> {
        let sql = format!(
            "SELECT {STATE_COLUMNS} FROM joblin_rate_limit_states \
            ORDER BY rate_limit_key COLLATE \"C\", job_type COLLATE \"C\""
        );
        Ok(sqlx::query_as::<_, types::State>(&sql)
            .fetch_all(&**self)
            .await
            .map_err(map_err)?
            .into_iter()
            .map(From::from)
            .collect())
    }

    async fn load_counter(&self, key: &str) -> Result<Option<WindowCounter>, StoreError> {
        Ok(sqlx::query_as::<_, types::Counter>(
            "SELECT key, count, window_start, last_updated, version \
            FROM joblin_rate_limit_counters WHERE key = $1",
        )
        .bind(key)
        .fetch_optional(&**self)
        .await
        .map_err(map_err)?
        .map(From::from))
    }

    #[instrument(skip(self, counter), fields(key = %counter.key, version = counter.version))]
    async fn compare_and_swap_counter(&self, counter: &WindowCounter) -> Result<bool, StoreError> {
        let query = if counter.version == 0 {
            sqlx::query(
                r#"INSERT INTO joblin_rate_limit_counters (
                    key,
                    count,
                    window_start,
                    last_updated,
                    version
                ) VALUES ($1, $2, $3, $4, 1)
                ON CONFLICT (key) DO NOTHING
                "#,
            )
        } else {
            sqlx::query(
                r#"UPDATE joblin_rate_limit_counters SET
                    count = $2,
                    window_start = $3,
                    last_updated = $4,
                    version = version + 1
                WHERE key = $1 AND version = $5
                "#,
            )
        };
        let query = query
            .bind(&counter.key)
            .bind(counter.count)
            .bind(counter.window_start)
            .bind(counter.last_updated);
        let query = match counter.version {
            0 => query,
            version => query.bind(version),
        };
        let result = query
            .execute(&**self)
            .await
            .map(|result| result.rows_affected());
        Self::handle_swap(result)
    }
}

#[cfg(all(test, feature = "postgres-tests"))]
mod test {
    use std::sync::Arc;

    use joblin::{
        clock::SystemClock,
        rate_limit::{AdmissionTracker, RateLimits},
    };
    use sqlx::PgPool;

    use super::*;

    joblin::test_suite!(
        attr: sqlx::test,
        args: (pool: PgPool),
        store: JoblinPgStore::from(pool)
    );

    #[sqlx::test]
    async fn concurrent_acquires_never_exceed_the_limit(pool: PgPool) {
        let store = JoblinPgStore::from(pool);
        let configuration =
            RateLimitConfiguration::builder("shared", RateLimits::new(3, 60, 100).unwrap())
                .build(Utc::now())
                .unwrap();
        let tracker =
            AdmissionTracker::new(store.clone(), Arc::new(SystemClock)).with_max_cas_attempts(100);
        let key = StateKey::new("tenant-1", "report");

        let results =
            futures::future::join_all((0..10).map(|_| tracker.acquire(&key, &configuration))).await;

        let admitted = results
            .into_iter()
            .filter(|result| matches!(result, Ok(Ok(_))))
            .count();
        assert_eq!(admitted, 3);
        let state = store.load_state(&key).await.unwrap().unwrap();
        assert_eq!(state.active_job_count, 3);
        assert_eq!(state.jobs_in_current_window, 3);
    }

    #[sqlx::test]
    async fn empty_stored_key_pattern_loads_as_none(pool: PgPool) {
        let store = JoblinPgStore::from(pool);
        sqlx::query(
            "INSERT INTO joblin_rate_limit_configurations \
            (name, max_concurrent_jobs, time_window_seconds, max_jobs_per_time_window, key_pattern, created_at) \
            VALUES ('broken', 1, 60, 1, '', now())",
        )
        .execute(&*store)
        .await
        .unwrap();

        let loaded = store.load_configuration("broken").await.unwrap().unwrap();

        assert_eq!(loaded.key_pattern(), None);
    }
}

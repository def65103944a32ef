//! Test suite for ensuring a correct implementation of a store.
use chrono::{DateTime, SubsecRound, TimeDelta, Utc};

use crate::{
    job::{Job, JobStatus},
    rate_limit::{RateLimitConfiguration, RateLimitState, RateLimits, StateKey, WindowCounter},
};

use super::{JobFilter, Store, StoreError};

/// Millisecond precision survives every store.
fn now() -> DateTime<Utc> {
    Utc::now().trunc_subsecs(3)
}

fn job(created_at: DateTime<Utc>) -> Job {
    let mut job = Job::builder("meter_pull", "device-1")
        .with_payload(serde_json::json!({ "register": 7 }))
        .build(created_at);
    job.take_events();
    job
}

fn configuration(name: &str) -> RateLimitConfiguration {
    let limits = RateLimits::new(2, 60, 5).expect("valid limits");
    let mut configuration = RateLimitConfiguration::builder(name, limits)
        .for_job_type("meter_pull")
        .with_key_pattern("device-*")
        .with_priority(3)
        .build(now())
        .expect("valid configuration");
    configuration.take_events();
    configuration
}

/// Create test suite for a joblin store.
///
/// For store implementors, it is useful to include this as part of your test suites.
///
/// # Example
///
/// ```
/// use joblin::test_suite;
/// use joblin::store::memory::InMemoryStore;
/// test_suite!(for: InMemoryStore::new());
/// ```
///
/// If you are using a different async test attribute you can configure the macro to use that
/// instead. For example when using `sqlx::test` you could do the following:
///
/// ```ignore
/// use joblin::test_suite;
/// test_suite!(
///     attr: sqlx::test,
///     args: (pool: PgPool),
///     store: JoblinPgStore::from(pool)
/// );
/// ```
#[macro_export]
macro_rules! test_suite {
    (for: $store:expr) => {
        $crate::test_suite!(attr: tokio::test, args: (), store: $store);
    };
    (attr: $attr:meta, args: $args:tt, store: $store:expr) => {
        $crate::test_suite!(@tests $attr, $args, $store,
            insert_and_load_job,
            insert_existing_job_conflicts,
            load_missing_job,
            compare_and_swap_job_checks_status,
            compare_and_swap_missing_job,
            compare_and_swap_job_keeps_rate_limit_slot,
            queued_jobs_are_due_and_oldest_first,
            query_jobs_newest_first_with_limit,
            active_configurations_skip_inactive,
            save_configuration_replaces_by_name,
            load_missing_configuration,
            compare_and_swap_state_inserts_new_state,
            compare_and_swap_state_rejects_stale_version,
            list_states,
            compare_and_swap_counter
        );
    };
    (@tests $attr:meta, $args:tt, $store:expr, $($test:ident),+) => {
        $(
            #[$attr]
            async fn $test $args {
                let store = $store;
                $crate::store::testing::$test(store).await;
            }
        )+
    };
}

#[doc(hidden)]
pub async fn insert_and_load_job(store: impl Store) {
    let job = job(now());

    store.insert_job(&job).await.unwrap();

    assert_eq!(store.load_job(job.id).await.unwrap(), Some(job));
}

#[doc(hidden)]
pub async fn insert_existing_job_conflicts(store: impl Store) {
    let job = job(now());
    store.insert_job(&job).await.unwrap();

    let result = store.insert_job(&job).await;

    assert!(matches!(result, Err(StoreError::Conflict(id)) if id == job.id));
}

#[doc(hidden)]
pub async fn load_missing_job(store: impl Store) {
    assert_eq!(store.load_job(job(now()).id).await.unwrap(), None);
}

#[doc(hidden)]
pub async fn compare_and_swap_job_checks_status(store: impl Store) {
    let mut job = job(now());
    store.insert_job(&job).await.unwrap();
    job.start(Some("ext-1".to_owned()), now()).unwrap();

    assert!(!store
        .compare_and_swap_job(&job, JobStatus::InProgress)
        .await
        .unwrap());
    assert!(store
        .compare_and_swap_job(&job, JobStatus::Queued)
        .await
        .unwrap());

    job.take_events();
    assert_eq!(store.load_job(job.id).await.unwrap(), Some(job));
}

#[doc(hidden)]
pub async fn compare_and_swap_job_keeps_rate_limit_slot(store: impl Store) {
    let mut job = job(now());
    store.insert_job(&job).await.unwrap();
    job.start(None, now()).unwrap();
    job.rate_limit_slot = Some(StateKey::new("device-1", "meter_pull"));
    job.take_events();

    assert!(store
        .compare_and_swap_job(&job, JobStatus::Queued)
        .await
        .unwrap());
    assert_eq!(store.load_job(job.id).await.unwrap(), Some(job.clone()));

    job.complete(None, now()).unwrap();
    job.take_events();
    assert!(job.take_rate_limit_slot().is_some());
    assert!(store
        .compare_and_swap_job(&job, JobStatus::InProgress)
        .await
        .unwrap());
    let stored = store.load_job(job.id).await.unwrap().unwrap();
    assert_eq!(stored.rate_limit_slot, None);
}

#[doc(hidden)]
pub async fn compare_and_swap_missing_job(store: impl Store) {
    let job = job(now());

    let result = store.compare_and_swap_job(&job, JobStatus::Queued).await;

    assert!(matches!(result, Err(StoreError::JobNotFound(id)) if id == job.id));
}

#[doc(hidden)]
pub async fn queued_jobs_are_due_and_oldest_first(store: impl Store) {
    let now = now();
    let newer = job(now - TimeDelta::minutes(1));
    let older = job(now - TimeDelta::minutes(2));
    let mut future = job(now - TimeDelta::minutes(3));
    future.reschedule(now + TimeDelta::hours(1), None, now).unwrap();
    let mut running = job(now - TimeDelta::minutes(4));
    running.start(None, now).unwrap();
    for job in [&newer, &older, &future, &running] {
        store.insert_job(job).await.unwrap();
    }

    let ids: Vec<_> = store
        .queued_jobs(now)
        .await
        .unwrap()
        .into_iter()
        .map(|job| job.id)
        .collect();

    assert_eq!(ids, vec![older.id, newer.id]);
}

#[doc(hidden)]
pub async fn query_jobs_newest_first_with_limit(store: impl Store) {
    let now = now();
    let oldest = job(now - TimeDelta::minutes(3));
    let middle = job(now - TimeDelta::minutes(2));
    let mut newest = job(now - TimeDelta::minutes(1));
    newest.cancel(None, now).unwrap();
    for job in [&oldest, &middle, &newest] {
        store.insert_job(job).await.unwrap();
    }

    let ids = |jobs: Vec<Job>| jobs.into_iter().map(|job| job.id).collect::<Vec<_>>();

    assert_eq!(
        ids(store.query_jobs(&JobFilter::new().with_limit(2)).await.unwrap()),
        vec![newest.id, middle.id]
    );
    assert_eq!(
        ids(store
            .query_jobs(&JobFilter::new().with_status(JobStatus::Queued))
            .await
            .unwrap()),
        vec![middle.id, oldest.id]
    );
    assert_eq!(
        ids(store
            .query_jobs(&JobFilter::new().created_before(now - TimeDelta::seconds(150)))
            .await
            .unwrap()),
        vec![oldest.id]
    );
}

#[doc(hidden)]
pub async fn active_configurations_skip_inactive(store: impl Store) {
    let active = configuration("active");
    let mut inactive = configuration("inactive");
    inactive.deactivate(now());
    inactive.take_events();
    store.save_configuration(&active).await.unwrap();
    store.save_configuration(&inactive).await.unwrap();

    assert_eq!(store.active_configurations().await.unwrap(), vec![active]);
}

#[doc(hidden)]
pub async fn save_configuration_replaces_by_name(store: impl Store) {
    let mut configuration = configuration("meters");
    store.save_configuration(&configuration).await.unwrap();

    configuration.update_limits(4, 30, 8, now()).unwrap();
    configuration.take_events();
    store.save_configuration(&configuration).await.unwrap();

    let loaded = store.load_configuration("meters").await.unwrap();
    assert_eq!(loaded, Some(configuration));
    assert_eq!(store.active_configurations().await.unwrap().len(), 1);
}

#[doc(hidden)]
pub async fn load_missing_configuration(store: impl Store) {
    assert_eq!(store.load_configuration("missing").await.unwrap(), None);
}

#[doc(hidden)]
pub async fn compare_and_swap_state_inserts_new_state(store: impl Store) {
    let key = StateKey::new("device-1", "meter_pull");
    let mut state = RateLimitState::new(key.clone(), now());
    state.active_job_count = 1;
    state.jobs_in_current_window = 1;

    assert!(store.compare_and_swap_state(&state).await.unwrap());
    assert!(!store.compare_and_swap_state(&state).await.unwrap());

    let loaded = store.load_state(&key).await.unwrap().unwrap();
    assert_eq!(loaded.version, 1);
    assert_eq!(loaded.active_job_count, 1);
    assert_eq!(loaded.jobs_in_current_window, 1);
    assert_eq!(loaded.current_window_start, state.current_window_start);
}

#[doc(hidden)]
pub async fn compare_and_swap_state_rejects_stale_version(store: impl Store) {
    let key = StateKey::new("device-1", "meter_pull");
    store
        .compare_and_swap_state(&RateLimitState::new(key.clone(), now()))
        .await
        .unwrap();

    let mut first = store.load_state(&key).await.unwrap().unwrap();
    let mut second = first.clone();
    first.active_job_count = 1;
    second.active_job_count = 2;

    assert!(store.compare_and_swap_state(&first).await.unwrap());
    assert!(!store.compare_and_swap_state(&second).await.unwrap());

    let loaded = store.load_state(&key).await.unwrap().unwrap();
    assert_eq!(loaded.active_job_count, 1);
    assert_eq!(loaded.version, 2);
}

#[doc(hidden)]
pub async fn list_states(store: impl Store) {
    assert!(store.list_states().await.unwrap().is_empty());

    for key in ["b", "a"] {
        store
            .compare_and_swap_state(&RateLimitState::new(StateKey::new(key, "t"), now()))
            .await
            .unwrap();
    }

    let keys: Vec<_> = store
        .list_states()
        .await
        .unwrap()
        .into_iter()
        .map(|state| state.rate_limit_key)
        .collect();
    assert_eq!(keys, vec!["a", "b"]);
}

#[doc(hidden)]
pub async fn compare_and_swap_counter(store: impl Store) {
    let mut counter = WindowCounter::new("api", now());
    counter.increment(TimeDelta::seconds(60), now());

    assert!(store.compare_and_swap_counter(&counter).await.unwrap());
    assert!(!store.compare_and_swap_counter(&counter).await.unwrap());

    let loaded = store.load_counter("api").await.unwrap().unwrap();
    assert_eq!(loaded.count, 1);
    assert_eq!(loaded.version, 1);
    assert_eq!(store.load_counter("other").await.unwrap(), None);
}

//! A Postgres implementation of the joblin store traits.
//!
//! Every conditional write of [`joblin::store`] is a single statement guarded by the expected
//! version or status, so concurrent schedulers sharing a database can never both win.
use std::ops::Deref;

use joblin::store::StoreError;
use sqlx::PgPool;

mod query;
mod store;
mod types;

#[derive(Clone, Debug)]
pub struct JoblinPgStore {
    pool: PgPool,
}

impl Deref for JoblinPgStore {
    type Target = PgPool;

    fn deref(&self) -> &Self::Target {
        &self.pool
    }
}

impl From<PgPool> for JoblinPgStore {
    fn from(pool: PgPool) -> Self {
        Self { pool }
    }
}

impl From<&PgPool> for JoblinPgStore {
    fn from(value: &PgPool) -> Self {
        Self {
            pool: value.to_owned(),
        }
    }
}

impl JoblinPgStore {
    /// Wrap `pool`, bringing the joblin tables up to date first.
    pub async fn new(pool: PgPool) -> Result<Self, StoreError> {
        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|err| StoreError::Database(Box::new(err)))?;
        Ok(Self { pool })
    }

    /// Connect to `database_url` and bring the joblin tables up to date.
    pub async fn from_db_url(database_url: &str) -> Result<Self, StoreError> {
        let pool = PgPool::connect(database_url).await.map_err(map_err)?;
        Self::new(pool).await
    }
}

fn map_err(error: sqlx::Error) -> StoreError {
    tracing::error!(?error, "Postgres error: {error}");
    StoreError::Database(Box::new(error))
}

use async_trait::async_trait;
use sqlx::{postgres::PgPoolOptions, PgPool};
use std::time::Duration;

use crate::models::job::{JobId, SwapJob};

pub mod queries;

/// Initialize PostgreSQL connection pool
pub async fn init_pool(database_url: &str) -> Result<PgPool, sqlx::Error> {
    PgPoolOptions::new()
        .max_connections(10)
        .min_connections(2)
        .acquire_timeout(Duration::from_secs(10))
        .idle_timeout(Duration::from_secs(600))
        .max_lifetime(Duration::from_secs(1800))
        .connect(database_url)
        .await
}

/// Run database migrations
pub async fn run_migrations(pool: &PgPool) -> Result<(), sqlx::Error> {
    sqlx::migrate!("./migrations")
        .run(pool)
        .await
        .map_err(|e| sqlx::Error::Migrate(Box::new(e)))
}

/// Persistent record of swap jobs. The only place job status lives.
///
/// Status writes are conditional so a job can only move
/// `pending -> processing -> completed | failed`; each write reports whether
/// it took effect.
#[async_trait]
pub trait JobLedger: Send + Sync {
    async fn get_job(&self, id: JobId) -> Result<Option<SwapJob>, LedgerError>;

    /// Move a pending job to processing. `false` if it was not pending.
    async fn claim_job(&self, id: JobId) -> Result<bool, LedgerError>;

    /// Record the result of a processing job. `false` if it was not processing.
    async fn complete_job(&self, id: JobId, result_ref: &str) -> Result<bool, LedgerError>;

    /// Record the failure of a processing job. `false` if it was not processing.
    async fn fail_job(&self, id: JobId, error_message: &str) -> Result<bool, LedgerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Job {id} has an unusable record: {reason}")]
    MalformedJob { id: JobId, reason: String },
}

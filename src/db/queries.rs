use async_trait::async_trait;
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Row};

use crate::db::{JobLedger, LedgerError};
use crate::models::job::{JobId, JobKind, JobStatus, MediaRef, SwapJob};

/// Postgres-backed job ledger over the `swap_tasks` table.
#[derive(Clone)]
pub struct PgJobLedger {
    pool: PgPool,
}

impl PgJobLedger {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

/// Insert a new pending job (used by tooling and tests; the API owns job creation).
pub async fn create_job(
    pool: &PgPool,
    user_id: Option<i64>,
    kind: JobKind,
    cost: i32,
    source_url: &str,
    template_url: &str,
) -> Result<JobId, sqlx::Error> {
    let row = sqlx::query(
        r#"
        INSERT INTO swap_tasks (user_id, type, status, cost, source_url, template_url)
        VALUES ($1, $2, 'pending', $3, $4, $5)
        RETURNING id
        "#,
    )
    .bind(user_id)
    .bind(kind.as_ref())
    .bind(cost)
    .bind(source_url)
    .bind(template_url)
    .fetch_one(pool)
    .await?;

    row.try_get("id")
}

/// Get a job by ID
pub async fn get_job(pool: &PgPool, job_id: JobId) -> Result<Option<SwapJob>, LedgerError> {
    let row = sqlx::query(
        r#"
        SELECT id, type, status, cost, source_url, template_url, result_url,
               error_message, created_at, updated_at
        FROM swap_tasks
        WHERE id = $1
        "#,
    )
    .bind(job_id)
    .fetch_optional(pool)
    .await?;

    row.map(|r| job_from_row(job_id, &r)).transpose()
}

fn job_from_row(job_id: JobId, r: &PgRow) -> Result<SwapJob, LedgerError> {
    let malformed = |reason: String| LedgerError::MalformedJob { id: job_id, reason };

    let kind: String = r.try_get("type")?;
    let kind = kind
        .parse::<JobKind>()
        .map_err(|_| malformed(format!("unknown job type {:?}", kind)))?;

    let status: String = r.try_get("status")?;
    let status = status
        .parse::<JobStatus>()
        .map_err(|_| malformed(format!("unknown status {:?}", status)))?;

    let media = |column: &str| -> Result<MediaRef, LedgerError> {
        let raw: Option<String> = r.try_get(column)?;
        MediaRef::parse(raw.as_deref().unwrap_or_default())
            .map_err(|e| malformed(format!("{}: {}", column, e)))
    };

    Ok(SwapJob {
        id: r.try_get("id")?,
        kind,
        status,
        cost: r.try_get("cost")?,
        source_ref: media("source_url")?,
        template_ref: media("template_url")?,
        result_ref: r.try_get("result_url")?,
        error_message: r.try_get("error_message")?,
        created_at: r.try_get("created_at")?,
        updated_at: r.try_get("updated_at")?,
    })
}

/// Conditionally move a job from `from` to `to`.
async fn transition(
    pool: &PgPool,
    job_id: JobId,
    from: JobStatus,
    to: JobStatus,
    result_url: Option<&str>,
    error_message: Option<&str>,
) -> Result<bool, sqlx::Error> {
    let result = sqlx::query(
        r#"
        UPDATE swap_tasks
        SET status = $1,
            result_url = COALESCE($2, result_url),
            error_message = COALESCE($3, error_message),
            updated_at = NOW()
        WHERE id = $4 AND status = $5
        "#,
    )
    .bind(to.as_ref())
    .bind(result_url)
    .bind(error_message)
    .bind(job_id)
    .bind(from.as_ref())
    .execute(pool)
    .await?;

    Ok(result.rows_affected() == 1)
}

#[async_trait]
impl JobLedger for PgJobLedger {
    async fn get_job(&self, id: JobId) -> Result<Option<SwapJob>, LedgerError> {
        get_job(&self.pool, id).await
    }

    async fn claim_job(&self, id: JobId) -> Result<bool, LedgerError> {
        Ok(transition(&self.pool, id, JobStatus::Pending, JobStatus::Processing, None, None).await?)
    }

    async fn complete_job(&self, id: JobId, result_ref: &str) -> Result<bool, LedgerError> {
        Ok(transition(
            &self.pool,
            id,
            JobStatus::Processing,
            JobStatus::Completed,
            Some(result_ref),
            None,
        )
        .await?)
    }

    async fn fail_job(&self, id: JobId, error_message: &str) -> Result<bool, LedgerError> {
        Ok(transition(
            &self.pool,
            id,
            JobStatus::Processing,
            JobStatus::Failed,
            None,
            Some(error_message),
        )
        .await?)
    }
}

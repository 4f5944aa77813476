use anyhow::anyhow;
use async_trait::async_trait;
use sqlx::types::Json;
use sqlx::{FromRow, PgPool};
use time::OffsetDateTime;
use uuid::Uuid;

use super::model::{CompleteOutcome, Job, JobPayload, JobState};
use super::queue::{JobStore, QueueError};

#[derive(Debug, FromRow)]
struct JobRow {
    id: Uuid,
    payload: Json<JobPayload>,
    state: String,
    attempts: i32,
    max_attempts: i32,
    locked_by: Option<String>,
    lock_until: Option<OffsetDateTime>,
    last_error: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

impl TryFrom<JobRow> for Job {
    type Error = QueueError;

    fn try_from(row: JobRow) -> Result<Self, Self::Error> {
        Ok(Job {
            id: row.id,
            payload: row.payload.0,
            state: row.state.parse().map_err(|e: String| anyhow!(e))?,
            attempts: row.attempts.max(0) as u32,
            max_attempts: row.max_attempts.max(1) as u32,
            locked_by: row.locked_by,
            lock_until: row.lock_until,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

const COLUMNS: &str = "id, payload, state, attempts, max_attempts, locked_by, lock_until, last_error, created_at, updated_at";

/// Postgres-backed job store. Claims use `FOR UPDATE SKIP LOCKED` inside a
/// single UPDATE so two workers can never take the same row.
#[derive(Clone)]
pub struct PgJobStore {
    pool: PgPool,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Tells a missing job apart from one leased elsewhere after a guarded
    /// UPDATE matched nothing.
    async fn current_state(&self, job_id: Uuid) -> Result<JobState, QueueError> {
        let state: Option<String> = sqlx::query_scalar("SELECT state FROM jobs WHERE id = $1")
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| anyhow!("Failed to read job {}: {}", job_id, e))?;

        let state = state.ok_or(QueueError::NotFound(job_id))?;
        Ok(state.parse().map_err(|e: String| anyhow!(e))?)
    }
}

/// Partial unique index allowing one `pending` or `active` job per content.
const ONE_OPEN_PER_CONTENT: &str = "jobs_one_open_per_content";

fn db_err(context: &str, e: sqlx::Error) -> QueueError {
    QueueError::Storage(anyhow!("{}: {}", context, e))
}

fn violates_open_rule(e: &sqlx::Error) -> bool {
    e.as_database_error()
        .and_then(|db| db.constraint())
        .is_some_and(|c| c == ONE_OPEN_PER_CONTENT)
}

impl PgJobStore {
    async fn content_busy(&self, content_id: Uuid, e: sqlx::Error) -> QueueError {
        match self.open_for_content(content_id).await {
            Ok(Some(open)) => QueueError::ContentBusy {
                content_id,
                job_id: open.id,
            },
            // The other job settled in between; report the original conflict.
            Ok(None) => db_err("Failed to write job", e),
            Err(lookup) => lookup,
        }
    }
}

#[async_trait]
impl JobStore for PgJobStore {
    async fn insert(&self, job: &Job) -> Result<bool, QueueError> {
        let result = sqlx::query(
            r#"
            INSERT INTO jobs (id, kind, content_id, payload, state, attempts, max_attempts, created_at, updated_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            ON CONFLICT (id) DO NOTHING
            "#,
        )
        .bind(job.id)
        .bind(job.payload.kind())
        .bind(job.content_id())
        .bind(Json(&job.payload))
        .bind(job.state.as_str())
        .bind(job.attempts as i32)
        .bind(job.max_attempts as i32)
        .bind(job.created_at)
        .bind(job.updated_at)
        .execute(&self.pool)
        .await;

        match result {
            Ok(result) => Ok(result.rows_affected() == 1),
            Err(e) if violates_open_rule(&e) => Err(self.content_busy(job.content_id(), e).await),
            Err(e) => Err(db_err("Failed to insert job", e)),
        }
    }

    async fn claim_next(
        &self,
        worker_id: &str,
        now: OffsetDateTime,
        lock_until: OffsetDateTime,
    ) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE jobs
            SET state = 'active',
                attempts = attempts + 1,
                locked_by = $1,
                lock_until = $2,
                updated_at = $3
            WHERE id = (
                SELECT id FROM jobs
                WHERE state = 'pending'
                ORDER BY created_at
                FOR UPDATE SKIP LOCKED
                LIMIT 1
            )
            RETURNING {COLUMNS}
            "#
        ))
        .bind(worker_id)
        .bind(lock_until)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("Failed to claim job", e))?;

        row.map(Job::try_from).transpose()
    }

    async fn renew(
        &self,
        job_id: Uuid,
        worker_id: &str,
        lock_until: OffsetDateTime,
        now: OffsetDateTime,
    ) -> Result<(), QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs SET lock_until = $3, updated_at = $4
            WHERE id = $1 AND state = 'active' AND locked_by = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(lock_until)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("Failed to renew lease", e))?;

        if result.rows_affected() == 0 {
            self.current_state(job_id).await?;
            return Err(QueueError::LeaseLost(job_id));
        }
        Ok(())
    }

    async fn complete(
        &self,
        job_id: Uuid,
        worker_id: &str,
        now: OffsetDateTime,
    ) -> Result<CompleteOutcome, QueueError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET state = 'completed', locked_by = NULL, lock_until = NULL, last_error = NULL, updated_at = $3
            WHERE id = $1 AND state = 'active' AND locked_by = $2
            "#,
        )
        .bind(job_id)
        .bind(worker_id)
        .bind(now)
        .execute(&self.pool)
        .await
        .map_err(|e| db_err("Failed to complete job", e))?;

        if result.rows_affected() == 1 {
            return Ok(CompleteOutcome::Completed);
        }

        match self.current_state(job_id).await? {
            JobState::Completed => Ok(CompleteOutcome::AlreadyCompleted),
            _ => Err(QueueError::LeaseLost(job_id)),
        }
    }

    async fn fail(
        &self,
        job_id: Uuid,
        worker_id: &str,
        permanent: bool,
        error: &str,
        now: OffsetDateTime,
    ) -> Result<Job, QueueError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE jobs
            SET state = CASE WHEN $3 OR attempts >= max_attempts THEN 'failed' ELSE 'pending' END,
                locked_by = NULL,
                lock_until = NULL,
                last_error = $4,
                updated_at = $5
            WHERE id = $1 AND state = 'active' AND locked_by = $2
            RETURNING {COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(worker_id)
        .bind(permanent)
        .bind(error)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("Failed to fail job", e))?;

        match row {
            Some(row) => Job::try_from(row),
            None => {
                self.current_state(job_id).await?;
                Err(QueueError::LeaseLost(job_id))
            }
        }
    }

    async fn release(
        &self,
        job_id: Uuid,
        worker_id: &str,
        reason: &str,
        now: OffsetDateTime,
    ) -> Result<Job, QueueError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE jobs
            SET state = 'pending',
                attempts = GREATEST(attempts - 1, 0),
                locked_by = NULL,
                lock_until = NULL,
                last_error = $3,
                updated_at = $4
            WHERE id = $1 AND state = 'active' AND locked_by = $2
            RETURNING {COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(worker_id)
        .bind(reason)
        .bind(now)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("Failed to release job", e))?;

        match row {
            Some(row) => Job::try_from(row),
            None => {
                self.current_state(job_id).await?;
                Err(QueueError::LeaseLost(job_id))
            }
        }
    }

    async fn reap_expired(&self, now: OffsetDateTime) -> Result<Vec<Job>, QueueError> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE jobs
            SET state = CASE WHEN attempts >= max_attempts THEN 'failed' ELSE 'pending' END,
                locked_by = NULL,
                lock_until = NULL,
                last_error = 'lease expired',
                updated_at = $1
            WHERE state = 'active' AND lock_until < $1
            RETURNING {COLUMNS}
            "#
        ))
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("Failed to reap expired leases", e))?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn cancel_for_content(
        &self,
        content_id: Uuid,
        reason: &str,
        now: OffsetDateTime,
    ) -> Result<Vec<Uuid>, QueueError> {
        let ids: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE jobs
            SET state = 'failed', locked_by = NULL, lock_until = NULL, last_error = $2, updated_at = $3
            WHERE content_id = $1 AND state IN ('pending', 'active')
            RETURNING id
            "#,
        )
        .bind(content_id)
        .bind(reason)
        .bind(now)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("Failed to cancel jobs", e))?;

        Ok(ids)
    }

    async fn get(&self, job_id: Uuid) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query_as::<_, JobRow>(&format!("SELECT {COLUMNS} FROM jobs WHERE id = $1"))
            .bind(job_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(|e| db_err("Failed to load job", e))?;

        row.map(Job::try_from).transpose()
    }

    async fn open_for_content(&self, content_id: Uuid) -> Result<Option<Job>, QueueError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            "SELECT {COLUMNS} FROM jobs WHERE content_id = $1 AND state IN ('pending', 'active') LIMIT 1"
        ))
        .bind(content_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("Failed to look up open job", e))?;

        row.map(Job::try_from).transpose()
    }

    async fn list(&self, state: Option<JobState>, limit: i64) -> Result<Vec<Job>, QueueError> {
        let rows = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            SELECT {COLUMNS} FROM jobs
            WHERE ($1::text IS NULL OR state = $1)
            ORDER BY created_at DESC
            LIMIT $2
            "#
        ))
        .bind(state.map(|s| s.as_str()))
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("Failed to list jobs", e))?;

        rows.into_iter().map(Job::try_from).collect()
    }

    async fn reset(&self, job_id: Uuid, now: OffsetDateTime) -> Result<Job, QueueError> {
        let row = sqlx::query_as::<_, JobRow>(&format!(
            r#"
            UPDATE jobs
            SET state = 'pending', attempts = 0, last_error = NULL, locked_by = NULL, lock_until = NULL, updated_at = $2
            WHERE id = $1 AND state = 'failed'
            RETURNING {COLUMNS}
            "#
        ))
        .bind(job_id)
        .bind(now)
        .fetch_optional(&self.pool)
        .await;

        let row = match row {
            Ok(row) => row,
            Err(e) if violates_open_rule(&e) => {
                let content_id = self.get(job_id).await?.ok_or(QueueError::NotFound(job_id))?.content_id();
                return Err(self.content_busy(content_id, e).await);
            }
            Err(e) => return Err(db_err("Failed to reset job", e)),
        };

        match row {
            Some(row) => Job::try_from(row),
            None => {
                self.current_state(job_id).await?;
                Err(QueueError::NotFailed(job_id))
            }
        }
    }
}

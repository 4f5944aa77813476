use anyhow::anyhow;
use async_trait::async_trait;
use sqlx::{FromRow, PgPool, Postgres, Transaction};
use thiserror::Error;
use time::OffsetDateTime;
use uuid::Uuid;

use super::model::{ContentRecord, ContentStatus, ResolutionArtifact};

#[derive(Debug, Error)]
pub enum ContentError {
    #[error("content {0} not found")]
    NotFound(Uuid),
    #[error("content {0} already exists")]
    AlreadyExists(Uuid),
    #[error("content {id} cannot move from {from} to {to}")]
    InvalidTransition {
        id: Uuid,
        from: ContentStatus,
        to: ContentStatus,
    },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Authoritative store for content records and their published renditions.
#[async_trait]
pub trait ContentStore: Send + Sync {
    async fn create(&self, record: &ContentRecord) -> Result<(), ContentError>;

    async fn get(&self, id: Uuid) -> Result<Option<ContentRecord>, ContentError>;

    async fn list(&self) -> Result<Vec<ContentRecord>, ContentError>;

    /// Compare-and-set on status: succeeds only from one of `to.predecessors()`.
    async fn advance(&self, id: Uuid, to: ContentStatus) -> Result<ContentRecord, ContentError>;

    /// Writes every artifact and flips `processing -> completed` in one
    /// transaction.
    async fn publish_completed(
        &self,
        id: Uuid,
        artifacts: &[ResolutionArtifact],
    ) -> Result<ContentRecord, ContentError>;

    /// Keeps whatever renditions were produced, leaves the status alone and
    /// raises the operator flag.
    async fn flag_for_operator(
        &self,
        id: Uuid,
        partial: &[ResolutionArtifact],
        error: &str,
    ) -> Result<(), ContentError>;

    /// Operator reset to `waiting_for_video`, dropping artifacts and the flag.
    async fn reset(&self, id: Uuid) -> Result<ContentRecord, ContentError>;

    async fn delete(&self, id: Uuid) -> Result<bool, ContentError>;
}

#[derive(Debug, FromRow)]
struct ContentRow {
    id: Uuid,
    title: String,
    status: String,
    needs_attention: bool,
    last_error: Option<String>,
    created_at: OffsetDateTime,
    updated_at: OffsetDateTime,
}

#[derive(Debug, FromRow)]
struct ResolutionRow {
    quality: String,
    rendition_id: Uuid,
    width: i32,
    height: i32,
    manifest_ref: String,
    key_ref: String,
    segment_count: i32,
}

impl From<ResolutionRow> for ResolutionArtifact {
    fn from(row: ResolutionRow) -> Self {
        Self {
            quality: row.quality,
            rendition_id: row.rendition_id,
            width: row.width.max(0) as u32,
            height: row.height.max(0) as u32,
            manifest_ref: row.manifest_ref,
            key_ref: row.key_ref,
            segment_count: row.segment_count.max(0) as u32,
        }
    }
}

fn db_err(context: &str, e: sqlx::Error) -> ContentError {
    ContentError::Storage(anyhow!("{}: {}", context, e))
}

fn parse_status(raw: &str) -> Result<ContentStatus, ContentError> {
    raw.parse().map_err(|e: String| ContentError::Storage(anyhow!(e)))
}

#[derive(Clone)]
pub struct PgContentStore {
    pool: PgPool,
}

impl PgContentStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn load_resolutions(&self, id: Uuid) -> Result<Vec<ResolutionArtifact>, ContentError> {
        let rows = sqlx::query_as::<_, ResolutionRow>(
            r#"
            SELECT quality, rendition_id, width, height, manifest_ref, key_ref, segment_count
            FROM content_resolutions
            WHERE content_id = $1
            ORDER BY position ASC
            "#,
        )
        .bind(id)
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("Failed to load resolutions", e))?;

        Ok(rows.into_iter().map(ResolutionArtifact::from).collect())
    }

    async fn hydrate(&self, row: ContentRow) -> Result<ContentRecord, ContentError> {
        let resolutions = self.load_resolutions(row.id).await?;
        Ok(ContentRecord {
            id: row.id,
            title: row.title,
            status: parse_status(&row.status)?,
            resolutions,
            needs_attention: row.needs_attention,
            last_error: row.last_error,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }

    /// Upserts artifacts keyed by (content_id, quality). `artifacts` arrives in
    /// ladder order, so the slice index is the rendition's position.
    async fn upsert_artifacts(
        tx: &mut Transaction<'_, Postgres>,
        id: Uuid,
        artifacts: &[ResolutionArtifact],
    ) -> Result<(), ContentError> {
        for (offset, artifact) in artifacts.iter().enumerate() {
            sqlx::query(
                r#"
                INSERT INTO content_resolutions
                    (content_id, quality, rendition_id, position, width, height, manifest_ref, key_ref, segment_count)
                VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
                ON CONFLICT (content_id, quality) DO UPDATE SET
                    rendition_id = EXCLUDED.rendition_id,
                    position = EXCLUDED.position,
                    width = EXCLUDED.width,
                    height = EXCLUDED.height,
                    manifest_ref = EXCLUDED.manifest_ref,
                    key_ref = EXCLUDED.key_ref,
                    segment_count = EXCLUDED.segment_count
                "#,
            )
            .bind(id)
            .bind(&artifact.quality)
            .bind(artifact.rendition_id)
            .bind(offset as i32)
            .bind(artifact.width as i32)
            .bind(artifact.height as i32)
            .bind(&artifact.manifest_ref)
            .bind(&artifact.key_ref)
            .bind(artifact.segment_count as i32)
            .execute(&mut **tx)
            .await
            .map_err(|e| db_err("Failed to upsert resolution", e))?;
        }
        Ok(())
    }

    async fn transition_error(&self, id: Uuid, to: ContentStatus) -> ContentError {
        let current: Result<Option<String>, _> = sqlx::query_scalar("SELECT status FROM contents WHERE id = $1")
            .bind(id)
            .fetch_optional(&self.pool)
            .await;

        match current {
            Ok(None) => ContentError::NotFound(id),
            Ok(Some(raw)) => match parse_status(&raw) {
                Ok(from) => ContentError::InvalidTransition { id, from, to },
                Err(e) => e,
            },
            Err(e) => db_err("Failed to read content status", e),
        }
    }
}

const CONTENT_COLUMNS: &str = "id, title, status, needs_attention, last_error, created_at, updated_at";

#[async_trait]
impl ContentStore for PgContentStore {
    async fn create(&self, record: &ContentRecord) -> Result<(), ContentError> {
        sqlx::query(
            r#"
            INSERT INTO contents (id, title, status, needs_attention, created_at, updated_at)
            VALUES ($1, $2, $3, FALSE, $4, $5)
            "#,
        )
        .bind(record.id)
        .bind(&record.title)
        .bind(record.status.as_str())
        .bind(record.created_at)
        .bind(record.updated_at)
        .execute(&self.pool)
        .await
        .map_err(|e| match e.as_database_error() {
            Some(db) if db.is_unique_violation() => ContentError::AlreadyExists(record.id),
            _ => db_err("Failed to create content", e),
        })?;

        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ContentRecord>, ContentError> {
        let row = sqlx::query_as::<_, ContentRow>(&format!(
            "SELECT {CONTENT_COLUMNS} FROM contents WHERE id = $1"
        ))
        .bind(id)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("Failed to load content", e))?;

        match row {
            Some(row) => Ok(Some(self.hydrate(row).await?)),
            None => Ok(None),
        }
    }

    async fn list(&self) -> Result<Vec<ContentRecord>, ContentError> {
        let rows = sqlx::query_as::<_, ContentRow>(&format!(
            "SELECT {CONTENT_COLUMNS} FROM contents ORDER BY created_at DESC"
        ))
        .fetch_all(&self.pool)
        .await
        .map_err(|e| db_err("Failed to list contents", e))?;

        let mut records = Vec::with_capacity(rows.len());
        for row in rows {
            records.push(self.hydrate(row).await?);
        }
        Ok(records)
    }

    async fn advance(&self, id: Uuid, to: ContentStatus) -> Result<ContentRecord, ContentError> {
        let allowed: Vec<&str> = to.predecessors().iter().map(|s| s.as_str()).collect();

        let row = sqlx::query_as::<_, ContentRow>(&format!(
            r#"
            UPDATE contents SET status = $2, updated_at = NOW()
            WHERE id = $1 AND status = ANY($3)
            RETURNING {CONTENT_COLUMNS}
            "#
        ))
        .bind(id)
        .bind(to.as_str())
        .bind(allowed)
        .fetch_optional(&self.pool)
        .await
        .map_err(|e| db_err("Failed to advance content status", e))?;

        match row {
            Some(row) => self.hydrate(row).await,
            None => Err(self.transition_error(id, to).await),
        }
    }

    async fn publish_completed(
        &self,
        id: Uuid,
        artifacts: &[ResolutionArtifact],
    ) -> Result<ContentRecord, ContentError> {
        let mut tx = self.pool.begin().await.map_err(|e| db_err("Failed to begin transaction", e))?;

        let updated = sqlx::query(
            r#"
            UPDATE contents
            SET status = 'completed', needs_attention = FALSE, last_error = NULL, updated_at = NOW()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_err("Failed to complete content", e))?;

        if updated.rows_affected() == 0 {
            tx.rollback().await.map_err(|e| db_err("Failed to roll back", e))?;
            return Err(self.transition_error(id, ContentStatus::Completed).await);
        }

        Self::upsert_artifacts(&mut tx, id, artifacts).await?;
        tx.commit().await.map_err(|e| db_err("Failed to commit publication", e))?;

        self.get(id).await?.ok_or(ContentError::NotFound(id))
    }

    async fn flag_for_operator(
        &self,
        id: Uuid,
        partial: &[ResolutionArtifact],
        error: &str,
    ) -> Result<(), ContentError> {
        let mut tx = self.pool.begin().await.map_err(|e| db_err("Failed to begin transaction", e))?;

        let updated = sqlx::query(
            r#"
            UPDATE contents SET needs_attention = TRUE, last_error = $2, updated_at = NOW()
            WHERE id = $1 AND status <> 'completed'
            "#,
        )
        .bind(id)
        .bind(error)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_err("Failed to flag content", e))?;

        if updated.rows_affected() == 0 {
            tx.rollback().await.map_err(|e| db_err("Failed to roll back", e))?;
            return match self.get(id).await? {
                Some(_) => Ok(()),
                None => Err(ContentError::NotFound(id)),
            };
        }

        Self::upsert_artifacts(&mut tx, id, partial).await?;
        tx.commit().await.map_err(|e| db_err("Failed to commit flag", e))?;
        Ok(())
    }

    async fn reset(&self, id: Uuid) -> Result<ContentRecord, ContentError> {
        let mut tx = self.pool.begin().await.map_err(|e| db_err("Failed to begin transaction", e))?;

        let updated = sqlx::query(
            r#"
            UPDATE contents
            SET status = 'waiting_for_video', needs_attention = FALSE, last_error = NULL, updated_at = NOW()
            WHERE id = $1
            "#,
        )
        .bind(id)
        .execute(&mut *tx)
        .await
        .map_err(|e| db_err("Failed to reset content", e))?;

        if updated.rows_affected() == 0 {
            return Err(ContentError::NotFound(id));
        }

        sqlx::query("DELETE FROM content_resolutions WHERE content_id = $1")
            .bind(id)
            .execute(&mut *tx)
            .await
            .map_err(|e| db_err("Failed to drop resolutions", e))?;

        tx.commit().await.map_err(|e| db_err("Failed to commit reset", e))?;
        self.get(id).await?.ok_or(ContentError::NotFound(id))
    }

    async fn delete(&self, id: Uuid) -> Result<bool, ContentError> {
        let result = sqlx::query("DELETE FROM contents WHERE id = $1")
            .bind(id)
            .execute(&self.pool)
            .await
            .map_err(|e| db_err("Failed to delete content", e))?;

        Ok(result.rows_affected() > 0)
    }
}

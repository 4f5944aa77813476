use std::sync::Arc;
use std::time::Duration;

use anyhow::anyhow;
use bytes::Bytes;
use time::OffsetDateTime;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::chunks::ChunkStore;
use super::ledger::{UploadError, UploadLedger};
use super::model::{is_valid_upload_id, ChunkReceipt, SessionInit, UploadSession, UploadState};
use crate::modules::content::model::{ContentRecord, ContentStatus};
use crate::modules::content::repository::ContentStore;
use crate::modules::jobs::model::{EncodePayload, Job, JobPayload, LadderRung};
use crate::modules::jobs::queue::{JobQueue, QueueError};

/// A finalize that has not reported back within this long is presumed dead
/// and may be taken over by an explicit retry.
const FINALIZE_STALE_AFTER: Duration = Duration::from_secs(10 * 60);

/// One chunk as delivered by the uploader.
#[derive(Debug, Clone)]
pub struct ChunkUpload {
    pub upload_id: String,
    pub chunk_index: u32,
    pub total_chunks: u32,
    pub content_title: Option<String>,
    /// Attach the upload to an existing record instead of creating one.
    pub content_id: Option<Uuid>,
    pub bytes: Bytes,
}

#[derive(Debug, Clone, Copy)]
pub struct UploadLimits {
    pub max_chunk_bytes: usize,
    /// Upper bound on `total_chunks`, which sizes every per-chunk list.
    pub max_total_chunks: u32,
    pub ttl: Duration,
}

#[derive(Clone)]
pub struct UploadCoordinator {
    ledger: Arc<dyn UploadLedger>,
    chunks: ChunkStore,
    contents: Arc<dyn ContentStore>,
    queue: JobQueue,
    ladder: Vec<LadderRung>,
    limits: UploadLimits,
}

impl UploadCoordinator {
    pub fn new(
        ledger: Arc<dyn UploadLedger>,
        chunks: ChunkStore,
        contents: Arc<dyn ContentStore>,
        queue: JobQueue,
        ladder: Vec<LadderRung>,
        limits: UploadLimits,
    ) -> Self {
        Self {
            ledger,
            chunks,
            contents,
            queue,
            ladder,
            limits,
        }
    }

    pub fn max_chunk_bytes(&self) -> usize {
        self.limits.max_chunk_bytes
    }

    pub async fn accept_chunk(&self, chunk: ChunkUpload) -> Result<ChunkReceipt, UploadError> {
        self.validate(&chunk)?;

        let session = self.open_session(&chunk).await?;
        let index = chunk.chunk_index;

        // Past `receiving` every index is already in; nothing to write.
        if session.state != UploadState::Receiving {
            return Ok(receipt(&session, session.chunks_received(), session.state));
        }

        self.chunks.put(&session.upload_id, index, chunk.bytes).await?;

        let mark = self
            .ledger
            .mark_received(&session.upload_id, index, OffsetDateTime::now_utc())
            .await?;

        if !mark.claimed_finalize {
            return Ok(receipt(&session, mark.received, mark.state));
        }

        info!("🧩 Upload {} complete ({} chunks), finalizing", session.upload_id, mark.total);
        self.finalize_claimed(&session).await?;
        Ok(receipt(&session, mark.received, UploadState::Finalized))
    }

    /// Retries a finalize that failed earlier. Already finalized uploads
    /// report success again.
    pub async fn finalize(&self, upload_id: &str) -> Result<ChunkReceipt, UploadError> {
        let session = self.session(upload_id).await?;

        if session.state == UploadState::Finalized {
            return Ok(receipt(&session, session.chunks_received(), session.state));
        }

        if !session.is_complete() {
            return Err(UploadError::Incomplete {
                upload_id: upload_id.to_string(),
                missing: session.missing(),
            });
        }

        let now = OffsetDateTime::now_utc();
        if !self.ledger.claim_finalize(upload_id, now, now - FINALIZE_STALE_AFTER).await? {
            return Err(UploadError::FinalizeInProgress(upload_id.to_string()));
        }

        info!("🔁 Retrying finalize of upload {}", upload_id);
        self.finalize_claimed(&session).await?;
        Ok(receipt(&session, session.chunks_received(), UploadState::Finalized))
    }

    pub async fn status(&self, upload_id: &str) -> Result<UploadSession, UploadError> {
        self.session(upload_id).await
    }

    /// Drops sessions older than the upload TTL together with their
    /// fragments. Unfinished sessions also lose their assembled source.
    pub async fn sweep_expired(&self) -> Result<usize, UploadError> {
        let cutoff = OffsetDateTime::now_utc() - self.limits.ttl;
        let expired = self.ledger.expired(cutoff).await?;
        let mut removed = 0;

        for upload_id in expired {
            if let Some(session) = self.ledger.get(&upload_id).await? {
                if let Err(e) = self.chunks.release(&upload_id).await {
                    warn!("Failed to release fragments of expired upload {}: {}", upload_id, e);
                    continue;
                }
                if session.state != UploadState::Finalized {
                    if let Err(e) = self.chunks.discard_source(&session).await {
                        warn!("Failed to discard source of expired upload {}: {}", upload_id, e);
                    }
                    info!("🗑️ Abandoned upload {} expired with {}/{} chunks", upload_id, session.chunks_received(), session.total_chunks);
                }
            }

            self.ledger.remove(&upload_id).await?;
            removed += 1;
        }

        Ok(removed)
    }

    fn validate(&self, chunk: &ChunkUpload) -> Result<(), UploadError> {
        if !is_valid_upload_id(&chunk.upload_id) {
            return Err(UploadError::InvalidUploadId);
        }
        if chunk.total_chunks == 0 || chunk.total_chunks > self.limits.max_total_chunks {
            return Err(UploadError::InvalidTotal(self.limits.max_total_chunks));
        }
        if chunk.chunk_index >= chunk.total_chunks {
            return Err(UploadError::IndexOutOfRange {
                index: chunk.chunk_index,
                total: chunk.total_chunks,
            });
        }
        if chunk.bytes.is_empty() {
            return Err(UploadError::EmptyChunk);
        }
        if chunk.bytes.len() > self.limits.max_chunk_bytes {
            return Err(UploadError::ChunkTooLarge(self.limits.max_chunk_bytes));
        }
        Ok(())
    }

    async fn session(&self, upload_id: &str) -> Result<UploadSession, UploadError> {
        self.ledger
            .get(upload_id)
            .await?
            .ok_or_else(|| UploadError::NotFound(upload_id.to_string()))
    }

    async fn open_session(&self, chunk: &ChunkUpload) -> Result<UploadSession, UploadError> {
        let now = OffsetDateTime::now_utc();

        if let Some(existing) = self.ledger.get(&chunk.upload_id).await? {
            if existing.total_chunks != chunk.total_chunks {
                return Err(UploadError::TotalMismatch {
                    upload_id: existing.upload_id,
                    expected: existing.total_chunks,
                    got: chunk.total_chunks,
                });
            }
            return Ok(existing);
        }

        let (content_id, title) = match chunk.content_id {
            Some(id) => {
                let record = self
                    .contents
                    .get(id)
                    .await
                    .map_err(|e| UploadError::Storage(e.into()))?
                    .ok_or(UploadError::ContentNotFound(id))?;
                self.ensure_idle(record.id).await?;
                (record.id, record.title)
            }
            None => {
                let title = chunk
                    .content_title
                    .as_deref()
                    .map(str::trim)
                    .filter(|t| !t.is_empty())
                    .ok_or(UploadError::MissingTitle)?;
                (Uuid::new_v4(), title.to_string())
            }
        };

        let init = SessionInit {
            upload_id: chunk.upload_id.clone(),
            title,
            content_id,
            job_id: Uuid::new_v4(),
            total_chunks: chunk.total_chunks,
        };

        // Concurrent first chunks race here; the ledger keeps whichever
        // session landed first and hands it back to everyone.
        self.ledger.open(&init, now).await
    }

    /// Refuses a new source while the content still has an unfinished job.
    async fn ensure_idle(&self, content_id: Uuid) -> Result<(), UploadError> {
        let open = self
            .queue
            .open_for_content(content_id)
            .await
            .map_err(|e| UploadError::Storage(e.into()))?;

        match open {
            Some(job) => Err(UploadError::ContentBusy {
                content_id,
                job_id: job.id,
            }),
            None => Ok(()),
        }
    }

    /// Runs once the caller holds the finalize claim. On failure the claim is
    /// handed back so the upload can be finalized again.
    async fn finalize_claimed(&self, session: &UploadSession) -> Result<Job, UploadError> {
        match self.assemble_and_enqueue(session).await {
            Ok(job) => {
                self.ledger.mark_finalized(&session.upload_id).await?;

                match self.chunks.release(&session.upload_id).await {
                    Ok(n) => info!("✅ Upload {} finalized as job {} ({} fragments released)", session.upload_id, job.id, n),
                    Err(e) => warn!("Upload {} finalized but fragments remain until expiry: {}", session.upload_id, e),
                }

                Ok(job)
            }
            Err(e) => {
                let reason = e.to_string();
                self.ledger.release_finalize(&session.upload_id, &reason).await?;

                if let Some(QueueError::ContentBusy { content_id, job_id }) = e.downcast_ref::<QueueError>() {
                    warn!("⛔ Upload {} refused: content {} already has job {}", session.upload_id, content_id, job_id);
                    return Err(UploadError::ContentBusy {
                        content_id: *content_id,
                        job_id: *job_id,
                    });
                }

                error!("❌ Finalize of upload {} failed: {}", session.upload_id, reason);
                Err(UploadError::FinalizeFailed {
                    upload_id: session.upload_id.clone(),
                    reason,
                })
            }
        }
    }

    async fn assemble_and_enqueue(&self, session: &UploadSession) -> anyhow::Result<Job> {
        // An earlier attempt may have died after enqueueing.
        match self.queue.get(session.job_id).await {
            Ok(job) => return Ok(job),
            Err(QueueError::NotFound(_)) => {}
            Err(e) => return Err(e.into()),
        }

        // Checked before the expensive assembly; the insert below enforces it.
        if let Some(open) = self.queue.open_for_content(session.content_id).await? {
            return Err(QueueError::ContentBusy {
                content_id: session.content_id,
                job_id: open.id,
            }
            .into());
        }

        let size = self.chunks.assemble(session).await?;
        info!("📼 Assembled {} ({} bytes)", session.source_key(), size);

        let record = match self.contents.get(session.content_id).await? {
            Some(record) => record,
            None => {
                let mut record = ContentRecord::new(&session.title);
                record.id = session.content_id;
                self.contents.create(&record).await?;
                record
            }
        };

        match record.status {
            ContentStatus::WaitingForVideo => {
                self.contents.advance(record.id, ContentStatus::Queued).await?;
            }
            ContentStatus::Queued => {}
            other => {
                return Err(anyhow!(
                    "content {} is already {}; reset it before uploading a new source",
                    record.id,
                    other
                ));
            }
        }

        let payload = JobPayload::Encode(EncodePayload {
            content_id: record.id,
            source_path: session.source_key(),
            resolution_ladder: self.ladder.clone(),
        });

        Ok(self.queue.enqueue_with_id(session.job_id, payload).await?)
    }
}

fn receipt(session: &UploadSession, received: u32, state: UploadState) -> ChunkReceipt {
    ChunkReceipt {
        accepted: true,
        chunks_received: received,
        chunks_total: session.total_chunks,
        state,
        content_id: session.content_id,
        job_id: (state == UploadState::Finalized).then_some(session.job_id),
    }
}

use std::collections::HashMap;

use async_trait::async_trait;
use thiserror::Error;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::model::{ChunkMark, SessionInit, UploadSession, UploadState};

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("upload_id must be 1-128 characters of [A-Za-z0-9_-]")]
    InvalidUploadId,
    #[error("total_chunks must be between 1 and {0}")]
    InvalidTotal(u32),
    #[error("chunk_index {index} is outside 0..{total}")]
    IndexOutOfRange { index: u32, total: u32 },
    #[error("upload {upload_id} was opened with {expected} chunks, not {got}")]
    TotalMismatch { upload_id: String, expected: u32, got: u32 },
    #[error("chunk is empty")]
    EmptyChunk,
    #[error("chunk exceeds the {0} byte limit")]
    ChunkTooLarge(usize),
    #[error("content_title is required when no content_id is given")]
    MissingTitle,
    #[error("upload {0} not found")]
    NotFound(String),
    #[error("content {0} not found")]
    ContentNotFound(Uuid),
    #[error("content {content_id} is still being processed by job {job_id}")]
    ContentBusy { content_id: Uuid, job_id: Uuid },
    #[error("upload {upload_id} is missing chunks {missing:?}")]
    Incomplete { upload_id: String, missing: Vec<u32> },
    #[error("upload {0} is already being finalized")]
    FinalizeInProgress(String),
    #[error("finalize of upload {upload_id} failed, retry: {reason}")]
    FinalizeFailed { upload_id: String, reason: String },
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

/// Bookkeeping for in-flight uploads. The completeness check and the
/// transition into `finalizing` happen in one atomic step so only one
/// caller ever assembles a given upload.
#[async_trait]
pub trait UploadLedger: Send + Sync {
    /// Creates the session on first sight, otherwise returns the existing one.
    /// A different `total_chunks` for an existing id is rejected.
    async fn open(&self, init: &SessionInit, now: OffsetDateTime) -> Result<UploadSession, UploadError>;

    async fn get(&self, upload_id: &str) -> Result<Option<UploadSession>, UploadError>;

    /// Adds `index` to the received set. When that completes the set and the
    /// session is `receiving`, it moves to `finalizing` and the caller is told
    /// it won the claim.
    async fn mark_received(
        &self,
        upload_id: &str,
        index: u32,
        now: OffsetDateTime,
    ) -> Result<ChunkMark, UploadError>;

    /// Explicit finalize retry. Succeeds for a complete session that is
    /// `receiving`, or `finalizing` since before `stale_before` (a finalizer
    /// that died).
    async fn claim_finalize(
        &self,
        upload_id: &str,
        now: OffsetDateTime,
        stale_before: OffsetDateTime,
    ) -> Result<bool, UploadError>;

    /// Hands a failed finalize back to `receiving` so it can be retried.
    async fn release_finalize(&self, upload_id: &str, error: &str) -> Result<(), UploadError>;

    async fn mark_finalized(&self, upload_id: &str) -> Result<(), UploadError>;

    async fn remove(&self, upload_id: &str) -> Result<(), UploadError>;

    /// Ids of sessions created before `before`, whatever their state.
    async fn expired(&self, before: OffsetDateTime) -> Result<Vec<String>, UploadError>;
}

#[derive(Default)]
pub struct MemoryUploadLedger {
    sessions: Mutex<HashMap<String, UploadSession>>,
}

impl MemoryUploadLedger {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl UploadLedger for MemoryUploadLedger {
    async fn open(&self, init: &SessionInit, now: OffsetDateTime) -> Result<UploadSession, UploadError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .entry(init.upload_id.clone())
            .or_insert_with(|| UploadSession::new(init, now));

        if session.total_chunks != init.total_chunks {
            return Err(UploadError::TotalMismatch {
                upload_id: init.upload_id.clone(),
                expected: session.total_chunks,
                got: init.total_chunks,
            });
        }

        Ok(session.clone())
    }

    async fn get(&self, upload_id: &str) -> Result<Option<UploadSession>, UploadError> {
        Ok(self.sessions.lock().await.get(upload_id).cloned())
    }

    async fn mark_received(
        &self,
        upload_id: &str,
        index: u32,
        now: OffsetDateTime,
    ) -> Result<ChunkMark, UploadError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(upload_id)
            .ok_or_else(|| UploadError::NotFound(upload_id.to_string()))?;

        let mut claimed_finalize = false;
        if session.state == UploadState::Receiving {
            session.received.insert(index);
            if session.is_complete() {
                session.state = UploadState::Finalizing;
                session.finalize_started_at = Some(now);
                claimed_finalize = true;
            }
        }

        Ok(ChunkMark {
            received: session.chunks_received(),
            total: session.total_chunks,
            state: session.state,
            claimed_finalize,
        })
    }

    async fn claim_finalize(
        &self,
        upload_id: &str,
        now: OffsetDateTime,
        stale_before: OffsetDateTime,
    ) -> Result<bool, UploadError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(upload_id)
            .ok_or_else(|| UploadError::NotFound(upload_id.to_string()))?;

        if !session.is_complete() {
            return Ok(false);
        }

        let claimable = match session.state {
            UploadState::Receiving => true,
            UploadState::Finalizing => session
                .finalize_started_at
                .is_none_or(|started| started < stale_before),
            UploadState::Finalized => false,
        };

        if claimable {
            session.state = UploadState::Finalizing;
            session.finalize_started_at = Some(now);
        }

        Ok(claimable)
    }

    async fn release_finalize(&self, upload_id: &str, error: &str) -> Result<(), UploadError> {
        let mut sessions = self.sessions.lock().await;
        if let Some(session) = sessions.get_mut(upload_id) {
            if session.state == UploadState::Finalizing {
                session.state = UploadState::Receiving;
                session.finalize_started_at = None;
                session.last_error = Some(error.to_string());
            }
        }
        Ok(())
    }

    async fn mark_finalized(&self, upload_id: &str) -> Result<(), UploadError> {
        let mut sessions = self.sessions.lock().await;
        let session = sessions
            .get_mut(upload_id)
            .ok_or_else(|| UploadError::NotFound(upload_id.to_string()))?;

        session.state = UploadState::Finalized;
        session.last_error = None;
        Ok(())
    }

    async fn remove(&self, upload_id: &str) -> Result<(), UploadError> {
        self.sessions.lock().await.remove(upload_id);
        Ok(())
    }

    async fn expired(&self, before: OffsetDateTime) -> Result<Vec<String>, UploadError> {
        Ok(self
            .sessions
            .lock()
            .await
            .values()
            .filter(|s| s.created_at < before)
            .map(|s| s.upload_id.clone())
            .collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::Arc;
    use time::Duration;

    fn init(total: u32) -> SessionInit {
        SessionInit {
            upload_id: "U1".into(),
            title: "Alien".into(),
            content_id: Uuid::new_v4(),
            job_id: Uuid::new_v4(),
            total_chunks: total,
        }
    }

    #[tokio::test]
    async fn reopen_keeps_first_ids_and_rejects_other_totals() {
        let ledger = MemoryUploadLedger::new();
        let now = OffsetDateTime::now_utc();
        let first = ledger.open(&init(3), now).await.unwrap();
        let again = ledger.open(&init(3), now).await.unwrap();

        assert_eq!(first.content_id, again.content_id);
        assert_eq!(first.job_id, again.job_id);
        assert_matches!(
            ledger.open(&init(4), now).await,
            Err(UploadError::TotalMismatch { expected: 3, got: 4, .. })
        );
    }

    #[tokio::test]
    async fn redelivery_does_not_change_count() {
        let ledger = MemoryUploadLedger::new();
        let now = OffsetDateTime::now_utc();
        ledger.open(&init(3), now).await.unwrap();

        let a = ledger.mark_received("U1", 1, now).await.unwrap();
        let b = ledger.mark_received("U1", 1, now).await.unwrap();
        assert_eq!((a.received, b.received), (1, 1));
        assert!(!b.claimed_finalize);
    }

    #[tokio::test]
    async fn only_one_concurrent_final_chunk_claims() {
        let ledger = Arc::new(MemoryUploadLedger::new());
        let now = OffsetDateTime::now_utc();
        ledger.open(&init(3), now).await.unwrap();
        ledger.mark_received("U1", 0, now).await.unwrap();
        ledger.mark_received("U1", 2, now).await.unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let ledger = ledger.clone();
            handles.push(tokio::spawn(async move {
                ledger.mark_received("U1", 1, now).await.unwrap()
            }));
        }

        let mut claims = 0;
        for h in handles {
            let mark = h.await.unwrap();
            assert_eq!(mark.received, 3);
            if mark.claimed_finalize {
                claims += 1;
            }
        }
        assert_eq!(claims, 1);
    }

    #[tokio::test]
    async fn released_finalize_can_be_reclaimed() {
        let ledger = MemoryUploadLedger::new();
        let now = OffsetDateTime::now_utc();
        ledger.open(&init(1), now).await.unwrap();
        assert!(ledger.mark_received("U1", 0, now).await.unwrap().claimed_finalize);

        // A live finalizer blocks the retry.
        assert!(!ledger.claim_finalize("U1", now, now - Duration::minutes(5)).await.unwrap());

        ledger.release_finalize("U1", "disk full").await.unwrap();
        let session = ledger.get("U1").await.unwrap().unwrap();
        assert_eq!(session.state, UploadState::Receiving);
        assert_eq!(session.last_error.as_deref(), Some("disk full"));

        assert!(ledger.claim_finalize("U1", now, now).await.unwrap());
        ledger.mark_finalized("U1").await.unwrap();
        assert!(!ledger.claim_finalize("U1", now, now + Duration::hours(1)).await.unwrap());
    }

    #[tokio::test]
    async fn stale_finalizer_is_taken_over() {
        let ledger = MemoryUploadLedger::new();
        let then = OffsetDateTime::now_utc() - Duration::hours(1);
        ledger.open(&init(1), then).await.unwrap();
        ledger.mark_received("U1", 0, then).await.unwrap();

        let now = OffsetDateTime::now_utc();
        assert!(ledger.claim_finalize("U1", now, now - Duration::minutes(10)).await.unwrap());
        assert_eq!(ledger.expired(now - Duration::minutes(30)).await.unwrap(), vec!["U1".to_string()]);
    }
}

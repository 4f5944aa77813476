use std::collections::HashMap;

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use super::model::{merge_artifacts, ContentRecord, ContentStatus, ResolutionArtifact};
use super::repository::{ContentError, ContentStore};

#[derive(Default)]
pub struct MemoryContentStore {
    records: Mutex<HashMap<Uuid, ContentRecord>>,
}

impl MemoryContentStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl ContentStore for MemoryContentStore {
    async fn create(&self, record: &ContentRecord) -> Result<(), ContentError> {
        let mut records = self.records.lock().await;
        if records.contains_key(&record.id) {
            return Err(ContentError::AlreadyExists(record.id));
        }
        records.insert(record.id, record.clone());
        Ok(())
    }

    async fn get(&self, id: Uuid) -> Result<Option<ContentRecord>, ContentError> {
        Ok(self.records.lock().await.get(&id).cloned())
    }

    async fn list(&self) -> Result<Vec<ContentRecord>, ContentError> {
        let mut out: Vec<_> = self.records.lock().await.values().cloned().collect();
        out.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(out)
    }

    async fn advance(&self, id: Uuid, to: ContentStatus) -> Result<ContentRecord, ContentError> {
        let mut records = self.records.lock().await;
        let record = records.get_mut(&id).ok_or(ContentError::NotFound(id))?;

        if !record.status.can_advance_to(to) {
            return Err(ContentError::InvalidTransition { id, from: record.status, to });
        }

        record.status = to;
        record.updated_at = OffsetDateTime::now_utc();
        Ok(record.clone())
    }

    async fn publish_completed(
        &self,
        id: Uuid,
        artifacts: &[ResolutionArtifact],
    ) -> Result<ContentRecord, ContentError> {
        let mut records = self.records.lock().await;
        let record = records.get_mut(&id).ok_or(ContentError::NotFound(id))?;

        if !record.status.can_advance_to(ContentStatus::Completed) {
            return Err(ContentError::InvalidTransition {
                id,
                from: record.status,
                to: ContentStatus::Completed,
            });
        }

        merge_artifacts(&mut record.resolutions, artifacts);
        record.status = ContentStatus::Completed;
        record.needs_attention = false;
        record.last_error = None;
        record.updated_at = OffsetDateTime::now_utc();
        Ok(record.clone())
    }

    async fn flag_for_operator(
        &self,
        id: Uuid,
        partial: &[ResolutionArtifact],
        error: &str,
    ) -> Result<(), ContentError> {
        let mut records = self.records.lock().await;
        let record = records.get_mut(&id).ok_or(ContentError::NotFound(id))?;

        if record.status == ContentStatus::Completed {
            return Ok(());
        }

        merge_artifacts(&mut record.resolutions, partial);
        record.needs_attention = true;
        record.last_error = Some(error.to_string());
        record.updated_at = OffsetDateTime::now_utc();
        Ok(())
    }

    async fn reset(&self, id: Uuid) -> Result<ContentRecord, ContentError> {
        let mut records = self.records.lock().await;
        let record = records.get_mut(&id).ok_or(ContentError::NotFound(id))?;

        record.status = ContentStatus::WaitingForVideo;
        record.resolutions.clear();
        record.needs_attention = false;
        record.last_error = None;
        record.updated_at = OffsetDateTime::now_utc();
        Ok(record.clone())
    }

    async fn delete(&self, id: Uuid) -> Result<bool, ContentError> {
        Ok(self.records.lock().await.remove(&id).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;

    #[tokio::test]
    async fn completion_requires_processing() {
        let store = MemoryContentStore::new();
        let record = ContentRecord::new("Arrival");
        store.create(&record).await.unwrap();

        assert_matches!(
            store.publish_completed(record.id, &[]).await,
            Err(ContentError::InvalidTransition { from: ContentStatus::WaitingForVideo, .. })
        );

        store.advance(record.id, ContentStatus::Queued).await.unwrap();
        store.advance(record.id, ContentStatus::Processing).await.unwrap();
        store.advance(record.id, ContentStatus::Processing).await.unwrap();

        let done = store.publish_completed(record.id, &[]).await.unwrap();
        assert_eq!(done.status, ContentStatus::Completed);

        assert_matches!(
            store.advance(record.id, ContentStatus::Processing).await,
            Err(ContentError::InvalidTransition { from: ContentStatus::Completed, .. })
        );
    }

    #[tokio::test]
    async fn create_never_overwrites() {
        let store = MemoryContentStore::new();
        let record = ContentRecord::new("Arrival");
        store.create(&record).await.unwrap();
        store.advance(record.id, ContentStatus::Queued).await.unwrap();

        let mut clash = ContentRecord::new("Imposter");
        clash.id = record.id;
        assert_matches!(store.create(&clash).await, Err(ContentError::AlreadyExists(id)) if id == record.id);

        let kept = store.get(record.id).await.unwrap().unwrap();
        assert_eq!(kept.title, "Arrival");
        assert_eq!(kept.status, ContentStatus::Queued);
    }

    #[tokio::test]
    async fn reset_returns_to_waiting_and_clears_flag() {
        let store = MemoryContentStore::new();
        let record = ContentRecord::new("Heat");
        store.create(&record).await.unwrap();
        store.advance(record.id, ContentStatus::Queued).await.unwrap();
        store.advance(record.id, ContentStatus::Processing).await.unwrap();
        store.flag_for_operator(record.id, &[], "encoder crashed").await.unwrap();

        let flagged = store.get(record.id).await.unwrap().unwrap();
        assert!(flagged.needs_attention);
        assert_eq!(flagged.status, ContentStatus::Processing);

        let reset = store.reset(record.id).await.unwrap();
        assert_eq!(reset.status, ContentStatus::WaitingForVideo);
        assert!(!reset.needs_attention);
    }
}

use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use super::model::ContentRecord;
use super::repository::{ContentError, ContentStore};
use crate::infrastructure::storage::object::ObjectStore;
use crate::modules::jobs::cancel::CancellationRegistry;
use crate::modules::jobs::queue::JobQueue;

/// What `delete` and `reset` tore down.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Teardown {
    pub cancelled_jobs: Vec<Uuid>,
    pub removed_objects: usize,
}

/// Administrative operations on content records. Status changes on the
/// normal path belong to the upload coordinator and the transcoder; this
/// service only creates, inspects, deletes and resets.
#[derive(Clone)]
pub struct ContentService {
    store: Arc<dyn ContentStore>,
    queue: JobQueue,
    cancels: CancellationRegistry,
    media: Arc<dyn ObjectStore>,
    keys: Arc<dyn ObjectStore>,
}

impl ContentService {
    pub fn new(
        store: Arc<dyn ContentStore>,
        queue: JobQueue,
        cancels: CancellationRegistry,
        media: Arc<dyn ObjectStore>,
        keys: Arc<dyn ObjectStore>,
    ) -> Self {
        Self {
            store,
            queue,
            cancels,
            media,
            keys,
        }
    }

    pub async fn create(&self, title: &str) -> Result<ContentRecord, ContentError> {
        let record = ContentRecord::new(title.trim());
        self.store.create(&record).await?;
        info!("🎬 Created content {} '{}'", record.id, record.title);
        Ok(record)
    }

    pub async fn get(&self, id: Uuid) -> Result<ContentRecord, ContentError> {
        self.store.get(id).await?.ok_or(ContentError::NotFound(id))
    }

    pub async fn list(&self) -> Result<Vec<ContentRecord>, ContentError> {
        self.store.list().await
    }

    /// Cancels any in-flight encode, removes artifacts and keys, then the
    /// record itself.
    pub async fn delete(&self, id: Uuid) -> Result<Teardown, ContentError> {
        self.get(id).await?;
        let teardown = self.teardown(id).await?;

        if !self.store.delete(id).await? {
            return Err(ContentError::NotFound(id));
        }

        info!(
            "🗑️ Deleted content {} ({} job(s) cancelled, {} object(s) removed)",
            id,
            teardown.cancelled_jobs.len(),
            teardown.removed_objects
        );
        Ok(teardown)
    }

    /// Operator reset back to `waiting_for_video`. Everything produced so far
    /// is discarded and a new upload is expected.
    pub async fn reset(&self, id: Uuid) -> Result<(ContentRecord, Teardown), ContentError> {
        self.get(id).await?;
        let teardown = self.teardown(id).await?;
        let record = self.store.reset(id).await?;

        info!("↩️ Reset content {} to {}", id, record.status);
        Ok((record, teardown))
    }

    async fn teardown(&self, id: Uuid) -> Result<Teardown, ContentError> {
        let cancelled_jobs = self
            .queue
            .cancel_for_content(id)
            .await
            .map_err(|e| ContentError::Storage(e.into()))?;

        let signalled = self.cancels.cancel_content(id).await;
        if signalled > 0 {
            info!("Signalled {} running encode(s) of content {} to stop", signalled, id);
        }

        let mut removed_objects = 0;
        let prefixes: [(&Arc<dyn ObjectStore>, String); 3] = [
            (&self.media, format!("hls/{}/", id)),
            (&self.media, format!("sources/{}/", id)),
            (&self.keys, format!("keys/{}/", id)),
        ];

        for (store, prefix) in prefixes {
            match store.delete_prefix(&prefix).await {
                Ok(n) => removed_objects += n,
                Err(e) => {
                    warn!("Failed to remove objects under {}: {}", prefix, e);
                    return Err(ContentError::Storage(e));
                }
            }
        }

        Ok(Teardown {
            cancelled_jobs,
            removed_objects,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::storage::object::MemoryObjectStore;
    use crate::modules::content::memory::MemoryContentStore;
    use crate::modules::content::model::{key_ref, rendition_prefix, ContentStatus};
    use crate::modules::jobs::memory::MemoryJobStore;
    use crate::modules::jobs::model::{EncodePayload, JobPayload, JobState};
    use assert_matches::assert_matches;
    use bytes::Bytes;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    struct Harness {
        service: ContentService,
        queue: JobQueue,
        cancels: CancellationRegistry,
        media: MemoryObjectStore,
        keys: MemoryObjectStore,
    }

    fn harness() -> Harness {
        let queue = JobQueue::new(Arc::new(MemoryJobStore::new()), Duration::from_secs(60), 3);
        let cancels = CancellationRegistry::new();
        let media = MemoryObjectStore::new();
        let keys = MemoryObjectStore::new();
        let service = ContentService::new(
            Arc::new(MemoryContentStore::new()),
            queue.clone(),
            cancels.clone(),
            Arc::new(media.clone()),
            Arc::new(keys.clone()),
        );
        Harness { service, queue, cancels, media, keys }
    }

    #[tokio::test]
    async fn delete_cancels_work_and_removes_artifacts() {
        let h = harness();
        let record = h.service.create("  Ran  ").await.unwrap();
        assert_eq!(record.title, "Ran");
        assert_eq!(record.status, ContentStatus::WaitingForVideo);

        let job = h
            .queue
            .enqueue(JobPayload::Encode(EncodePayload {
                content_id: record.id,
                source_path: "sources/x.src".into(),
                resolution_ladder: vec![],
            }))
            .await
            .unwrap();
        h.queue.dequeue("w1").await.unwrap();
        let running = h.cancels.register(job.id, record.id, &CancellationToken::new()).await;

        let rid = Uuid::new_v4();
        let manifest = format!("{}index.m3u8", rendition_prefix(record.id, rid, "720p"));
        h.media.put(&manifest, Bytes::from_static(b"#EXTM3U"), "").await.unwrap();
        h.keys.put(&key_ref(record.id, rid, "720p"), Bytes::from_static(&[0; 16]), "").await.unwrap();
        h.media.put("hls/other/720p/index.m3u8", Bytes::from_static(b"#EXTM3U"), "").await.unwrap();

        let teardown = h.service.delete(record.id).await.unwrap();

        assert_eq!(teardown.cancelled_jobs, vec![job.id]);
        assert_eq!(teardown.removed_objects, 2);
        assert!(running.is_cancelled());
        assert_eq!(h.queue.get(job.id).await.unwrap().state, JobState::Failed);
        assert_eq!(h.media.keys().await, vec!["hls/other/720p/index.m3u8".to_string()]);
        assert_matches!(h.service.get(record.id).await, Err(ContentError::NotFound(_)));
        assert_matches!(h.service.delete(record.id).await, Err(ContentError::NotFound(_)));
    }

    #[tokio::test]
    async fn reset_returns_to_waiting() {
        let h = harness();
        let record = h.service.create("Ikiru").await.unwrap();

        let (reset, teardown) = h.service.reset(record.id).await.unwrap();
        assert_eq!(reset.status, ContentStatus::WaitingForVideo);
        assert!(teardown.cancelled_jobs.is_empty());
    }
}

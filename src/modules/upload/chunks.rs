use std::sync::Arc;

use anyhow::Result;
use bytes::Bytes;
use tracing::debug;

use super::model::{fragment_key, fragment_prefix, UploadSession};
use crate::infrastructure::storage::object::ObjectStore;

const FRAGMENT_CONTENT_TYPE: &str = "application/octet-stream";
const SOURCE_CONTENT_TYPE: &str = "video/mp4";

/// Upload fragments in object storage, addressed by `(upload_id, index)`.
#[derive(Clone)]
pub struct ChunkStore {
    objects: Arc<dyn ObjectStore>,
}

impl ChunkStore {
    pub fn new(objects: Arc<dyn ObjectStore>) -> Self {
        Self { objects }
    }

    /// Writes (or overwrites) one fragment. Only called before the index is
    /// recorded in the ledger, so assembly never sees a half-written chunk.
    pub async fn put(&self, upload_id: &str, index: u32, bytes: Bytes) -> Result<()> {
        let key = fragment_key(upload_id, index);
        debug!("Storing fragment {} ({} bytes)", key, bytes.len());
        self.objects.put(&key, bytes, FRAGMENT_CONTENT_TYPE).await
    }

    /// Concatenates all fragments in index order into the session's source
    /// object and returns its size.
    pub async fn assemble(&self, session: &UploadSession) -> Result<u64> {
        self.objects
            .compose(&session.source_key(), &session.fragment_keys(), SOURCE_CONTENT_TYPE)
            .await
    }

    pub async fn release(&self, upload_id: &str) -> Result<usize> {
        self.objects.delete_prefix(&fragment_prefix(upload_id)).await
    }

    pub async fn discard_source(&self, session: &UploadSession) -> Result<()> {
        self.objects.delete(&session.source_key()).await
    }
}

use crate::infrastructure::storage::s3::StorageService;
use anyhow::Result;
use aws_sdk_s3::types::CompletedPart;
use bytes::{Bytes, BytesMut};
use tracing::debug;

// S3 rejects non-final parts under 5MB.
const MIN_PART_SIZE: usize = 6 * 1024 * 1024;

/// Streams sequential writes into one object through S3 multipart upload,
/// holding at most one part in memory.
pub struct MultipartUploader<'a> {
    storage: &'a StorageService,
    key: String,
    upload_id: String,
    parts: Vec<CompletedPart>,
    pending: BytesMut,
    written: u64,
}

impl<'a> MultipartUploader<'a> {
    pub async fn new(storage: &'a StorageService, key: &str, content_type: &str) -> Result<Self> {
        let upload_id = storage.create_multipart_upload(key, content_type).await?;

        Ok(Self {
            storage,
            key: key.to_string(),
            upload_id,
            parts: Vec::new(),
            pending: BytesMut::with_capacity(MIN_PART_SIZE),
            written: 0,
        })
    }

    pub async fn write(&mut self, bytes: Bytes) -> Result<()> {
        self.written += bytes.len() as u64;
        self.pending.extend_from_slice(&bytes);

        if self.pending.len() >= MIN_PART_SIZE {
            self.send_part().await?;
        }

        Ok(())
    }

    async fn send_part(&mut self) -> Result<()> {
        let number = self.parts.len() as i32 + 1;
        let body = self.pending.split().freeze();

        let part = self.storage.upload_part(&self.key, &self.upload_id, number, body).await?;

        debug!("📦 Uploaded part {} of {}", number, self.key);
        self.parts.push(part);
        Ok(())
    }

    /// Sends the short tail part and completes the object. Returns the
    /// number of bytes written.
    pub async fn finish(mut self) -> Result<u64> {
        if !self.pending.is_empty() || self.parts.is_empty() {
            self.send_part().await?;
        }

        self.storage
            .complete_multipart_upload(&self.key, &self.upload_id, self.parts)
            .await?;

        Ok(self.written)
    }

    pub async fn abort(self) -> Result<()> {
        self.storage.abort_multipart_upload(&self.key, &self.upload_id).await
    }
}

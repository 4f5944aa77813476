use std::path::Path;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use aws_sdk_s3::config::Builder;
use aws_sdk_s3::operation::get_object::GetObjectOutput;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart, Delete, ObjectIdentifier};
use aws_sdk_s3::{Client, config::BehaviorVersion, config::Credentials, config::Region};
use bytes::Bytes;
use tracing::{info, warn};

use super::object::ObjectStore;
use crate::common::upload::MultipartUploader;

#[derive(Clone)]
pub struct StorageService {
    pub client: Client,
    pub bucket: String,
}

impl StorageService {
    pub async fn new(
        endpoint: &str,
        bucket: &str,
        access_key: &str,
        secret_key: &str
    ) -> Self {
        let credentials = Credentials::new(access_key, secret_key, None, None, "static");

        let config = Builder::new()
            .behavior_version(BehaviorVersion::latest())
            .region(Region::new("us-east-1"))
            .endpoint_url(endpoint)
            .credentials_provider(credentials)
            .force_path_style(true) // Required for MinIO
            .build();

        let client = Client::from_conf(config);

        info!("✅ Connected to S3 (MinIO) bucket '{}'", bucket);

        Self {
            client,
            bucket: bucket.to_string(),
        }
    }

    /// Same client, different bucket.
    pub fn with_bucket(&self, bucket: &str) -> Self {
        Self {
            client: self.client.clone(),
            bucket: bucket.to_string(),
        }
    }

    pub async fn create_multipart_upload(&self, key: &str, content_type: &str) -> Result<String> {
        let output = self
            .client
            .create_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to initiate upload of {}: {}", key, e))?;

        output
            .upload_id
            .ok_or_else(|| anyhow!("S3 returned no upload id for {}", key))
    }

    pub async fn upload_part(&self, key: &str, upload_id: &str, number: i32, body: Bytes) -> Result<CompletedPart> {
        let output = self
            .client
            .upload_part()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .part_number(number)
            .body(ByteStream::from(body))
            .send()
            .await
            .map_err(|e| anyhow!("Failed to upload part {} of {}: {}", number, key, e))?;

        Ok(CompletedPart::builder().set_e_tag(output.e_tag).part_number(number).build())
    }

    pub async fn complete_multipart_upload(&self, key: &str, upload_id: &str, parts: Vec<CompletedPart>) -> Result<()> {
        let manifest = CompletedMultipartUpload::builder().set_parts(Some(parts)).build();

        self.client
            .complete_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .multipart_upload(manifest)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to complete upload of {}: {}", key, e))?;
        Ok(())
    }

    pub async fn abort_multipart_upload(&self, key: &str, upload_id: &str) -> Result<()> {
        self.client
            .abort_multipart_upload()
            .bucket(&self.bucket)
            .key(key)
            .upload_id(upload_id)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to abort upload of {}: {}", key, e))?;
        Ok(())
    }

    /// Raw GET, optionally ranged, for proxying bodies straight to clients.
    pub async fn get_object_stream(&self, key: &str, range: Option<String>) -> Result<GetObjectOutput> {
        let mut req = self.client.get_object().bucket(&self.bucket).key(key);

        if let Some(r) = range {
            req = req.range(r);
        }

        req.send()
            .await
            .map_err(|e| anyhow!("Failed to fetch {}: {}", key, e))
    }

    async fn fetch(&self, key: &str) -> Result<Option<GetObjectOutput>> {
        match self.client.get_object().bucket(&self.bucket).key(key).send().await {
            Ok(output) => Ok(Some(output)),
            Err(e) => {
                if e.as_service_error().is_some_and(|se| se.is_no_such_key()) {
                    Ok(None)
                } else {
                    Err(anyhow!("Failed to fetch {}: {}", key, e))
                }
            }
        }
    }
}

#[async_trait]
impl ObjectStore for StorageService {
    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<()> {
        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(ByteStream::from(body))
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to upload {}: {}", key, e))?;
        Ok(())
    }

    async fn put_file(&self, key: &str, path: &Path, content_type: &str) -> Result<()> {
        let body = ByteStream::from_path(path)
            .await
            .map_err(|e| anyhow!("Failed to open {}: {}", path.display(), e))?;

        self.client
            .put_object()
            .bucket(&self.bucket)
            .key(key)
            .body(body)
            .content_type(content_type)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to upload {}: {}", key, e))?;
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        let Some(output) = self.fetch(key).await? else {
            return Ok(None);
        };

        let data = output
            .body
            .collect()
            .await
            .map_err(|e| anyhow!("Failed to read body of {}: {}", key, e))?;
        Ok(Some(data.into_bytes()))
    }

    async fn download(&self, key: &str, dest: &Path) -> Result<u64> {
        let output = self
            .fetch(key)
            .await?
            .ok_or_else(|| anyhow!("object {} not found", key))?;

        let mut reader = output.body.into_async_read();
        let mut file = tokio::fs::File::create(dest).await?;
        let written = tokio::io::copy(&mut reader, &mut file).await?;
        Ok(written)
    }

    async fn compose(&self, dest: &str, parts: &[String], content_type: &str) -> Result<u64> {
        let mut uploader = MultipartUploader::new(self, dest, content_type).await?;

        let copied: Result<()> = async {
            for part in parts {
                let body = self.get(part).await?.ok_or_else(|| anyhow!("part {} not found", part))?;
                uploader.write(body).await?;
            }
            Ok(())
        }
        .await;

        if let Err(e) = copied {
            if let Err(abort_err) = uploader.abort().await {
                warn!("Failed to abort multipart upload of {}: {}", dest, abort_err);
            }
            return Err(e);
        }

        uploader.finish().await
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.client
            .delete_object()
            .bucket(&self.bucket)
            .key(key)
            .send()
            .await
            .map_err(|e| anyhow!("Failed to delete {}: {}", key, e))?;
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut removed = 0;
        let mut continuation: Option<String> = None;

        loop {
            let page = self
                .client
                .list_objects_v2()
                .bucket(&self.bucket)
                .prefix(prefix)
                .set_continuation_token(continuation.take())
                .send()
                .await
                .map_err(|e| anyhow!("Failed to list {}: {}", prefix, e))?;

            let ids = page
                .contents()
                .iter()
                .filter_map(|o| o.key())
                .map(|k| ObjectIdentifier::builder().key(k).build())
                .collect::<Result<Vec<_>, _>>()
                .map_err(|e| anyhow!("Invalid object key under {}: {}", prefix, e))?;

            if !ids.is_empty() {
                let count = ids.len();
                let delete = Delete::builder()
                    .set_objects(Some(ids))
                    .quiet(true)
                    .build()
                    .map_err(|e| anyhow!("Failed to build delete request: {}", e))?;

                let result = self
                    .client
                    .delete_objects()
                    .bucket(&self.bucket)
                    .delete(delete)
                    .send()
                    .await
                    .map_err(|e| anyhow!("Failed to delete under {}: {}", prefix, e))?;

                let failed = result.errors().len();
                if failed > 0 {
                    warn!("{} object(s) under {} could not be deleted", failed, prefix);
                }
                removed += count - failed;
            }

            match page.next_continuation_token() {
                Some(token) if page.is_truncated().unwrap_or(false) => {
                    continuation = Some(token.to_string());
                }
                _ => break,
            }
        }

        Ok(removed)
    }
}

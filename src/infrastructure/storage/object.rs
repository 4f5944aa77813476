use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::Mutex;

/// Flat key/value blob storage. The production adapter is S3/MinIO; tests
/// use [`MemoryObjectStore`].
#[async_trait]
pub trait ObjectStore: Send + Sync {
    async fn put(&self, key: &str, body: Bytes, content_type: &str) -> Result<()>;

    async fn put_file(&self, key: &str, path: &Path, content_type: &str) -> Result<()>;

    /// `Ok(None)` when the key does not exist.
    async fn get(&self, key: &str) -> Result<Option<Bytes>>;

    /// Streams an object into a local file. Errors if the key is missing.
    async fn download(&self, key: &str, dest: &Path) -> Result<u64>;

    /// Concatenates `parts` in the given order into a new object at `dest`.
    async fn compose(&self, dest: &str, parts: &[String], content_type: &str) -> Result<u64>;

    async fn delete(&self, key: &str) -> Result<()>;

    /// Removes every object under `prefix`, returning how many went.
    async fn delete_prefix(&self, prefix: &str) -> Result<usize>;
}

#[derive(Clone, Default)]
pub struct MemoryObjectStore {
    objects: Arc<Mutex<BTreeMap<String, Bytes>>>,
}

impl MemoryObjectStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn keys(&self) -> Vec<String> {
        self.objects.lock().await.keys().cloned().collect()
    }

    pub async fn contains(&self, key: &str) -> bool {
        self.objects.lock().await.contains_key(key)
    }
}

#[async_trait]
impl ObjectStore for MemoryObjectStore {
    async fn put(&self, key: &str, body: Bytes, _content_type: &str) -> Result<()> {
        self.objects.lock().await.insert(key.to_string(), body);
        Ok(())
    }

    async fn put_file(&self, key: &str, path: &Path, content_type: &str) -> Result<()> {
        let body = tokio::fs::read(path).await?;
        self.put(key, Bytes::from(body), content_type).await
    }

    async fn get(&self, key: &str) -> Result<Option<Bytes>> {
        Ok(self.objects.lock().await.get(key).cloned())
    }

    async fn download(&self, key: &str, dest: &Path) -> Result<u64> {
        let body = self
            .get(key)
            .await?
            .ok_or_else(|| anyhow!("object {} not found", key))?;
        tokio::fs::write(dest, &body).await?;
        Ok(body.len() as u64)
    }

    async fn compose(&self, dest: &str, parts: &[String], _content_type: &str) -> Result<u64> {
        let mut objects = self.objects.lock().await;
        let mut joined = Vec::new();

        for part in parts {
            let body = objects
                .get(part)
                .ok_or_else(|| anyhow!("part {} not found", part))?;
            joined.extend_from_slice(body);
        }

        let size = joined.len() as u64;
        objects.insert(dest.to_string(), Bytes::from(joined));
        Ok(size)
    }

    async fn delete(&self, key: &str) -> Result<()> {
        self.objects.lock().await.remove(key);
        Ok(())
    }

    async fn delete_prefix(&self, prefix: &str) -> Result<usize> {
        let mut objects = self.objects.lock().await;
        let before = objects.len();
        objects.retain(|k, _| !k.starts_with(prefix));
        Ok(before - objects.len())
    }
}

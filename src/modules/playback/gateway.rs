use std::sync::Arc;

use anyhow::anyhow;
use bytes::Bytes;
use thiserror::Error;
use time::OffsetDateTime;
use tracing::debug;
use uuid::Uuid;

use super::entitlement::EntitlementProvider;
use super::model::{DenialReason, KeyGrant};
use super::registry::{DeviceRegistry, RegistryError};
use crate::infrastructure::storage::object::ObjectStore;
use crate::modules::content::model::ContentStatus;
use crate::modules::content::repository::{ContentError, ContentStore};

#[derive(Debug, Error)]
pub enum GatewayError {
    #[error("{}", .0.message())]
    Denied(DenialReason),
    #[error("content {0} not found")]
    ContentNotFound(Uuid),
    #[error("device_id must be 1-128 characters of [A-Za-z0-9._:-]")]
    InvalidDeviceId,
    #[error("key for {content_id}/{quality} is missing from storage")]
    KeyMissing { content_id: Uuid, quality: String },
    #[error(transparent)]
    Registry(#[from] RegistryError),
    #[error(transparent)]
    Storage(#[from] anyhow::Error),
}

impl From<ContentError> for GatewayError {
    fn from(e: ContentError) -> Self {
        match e {
            ContentError::NotFound(id) => GatewayError::ContentNotFound(id),
            other => GatewayError::Storage(other.into()),
        }
    }
}

/// The playback read path. Hands out key references only to an active,
/// entitled device, and serves key bytes only after repeating the same
/// checks.
#[derive(Clone)]
pub struct KeyGateway {
    registry: Arc<dyn DeviceRegistry>,
    entitlements: Arc<dyn EntitlementProvider>,
    contents: Arc<dyn ContentStore>,
    keys: Arc<dyn ObjectStore>,
    public_base_url: String,
}

impl KeyGateway {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        entitlements: Arc<dyn EntitlementProvider>,
        contents: Arc<dyn ContentStore>,
        keys: Arc<dyn ObjectStore>,
        public_base_url: &str,
    ) -> Self {
        Self {
            registry,
            entitlements,
            contents,
            keys,
            public_base_url: public_base_url.trim_end_matches('/').to_string(),
        }
    }

    pub async fn resolve_key(
        &self,
        account_id: Uuid,
        device_id: &str,
        content_id: Uuid,
        quality: &str,
    ) -> Result<KeyGrant, GatewayError> {
        if !self.registry.is_active(account_id, device_id).await? {
            return Err(GatewayError::Denied(DenialReason::SessionNotActive));
        }

        let entitlement = self.entitlements.entitlement(account_id).await?;
        if !entitlement.active {
            return Err(GatewayError::Denied(DenialReason::NotAuthorized));
        }

        let record = self
            .contents
            .get(content_id)
            .await?
            .ok_or(GatewayError::ContentNotFound(content_id))?;

        // Renditions of a title that is not completed are never served.
        let artifact = record
            .resolution(quality)
            .filter(|_| record.status == ContentStatus::Completed)
            .ok_or(GatewayError::Denied(DenialReason::ResolutionNotFound))?;

        // The session may have been stopped or swept since the first check.
        if !self.registry.touch(account_id, device_id, OffsetDateTime::now_utc()).await? {
            return Err(GatewayError::Denied(DenialReason::SessionNotActive));
        }

        debug!("🔑 Key reference for {}/{} issued to {}:{}", content_id, quality, account_id, device_id);

        Ok(KeyGrant {
            content_id,
            quality: artifact.quality.clone(),
            key_ref: artifact.key_ref.clone(),
            key_url: key_url(&self.public_base_url, content_id, &artifact.quality),
        })
    }

    /// The second, separately authenticated fetch that returns key bytes.
    pub async fn fetch_key(
        &self,
        account_id: Uuid,
        device_id: &str,
        content_id: Uuid,
        quality: &str,
    ) -> Result<Bytes, GatewayError> {
        let grant = self.resolve_key(account_id, device_id, content_id, quality).await?;

        self.keys
            .get(&grant.key_ref)
            .await
            .map_err(|e| GatewayError::Storage(anyhow!("Failed to read key {}: {}", grant.key_ref, e)))?
            .ok_or(GatewayError::KeyMissing {
                content_id,
                quality: grant.quality,
            })
    }
}

/// Public URL players call to fetch a rendition key. Also written into the
/// HLS manifests as the key URI.
pub fn key_url(public_base_url: &str, content_id: Uuid, quality: &str) -> String {
    format!(
        "{}/api/v1/playback/keys/{}/{}",
        public_base_url.trim_end_matches('/'),
        content_id,
        quality
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn key_url_joins_cleanly() {
        let id = Uuid::nil();
        assert_eq!(
            key_url("https://cdn.example.com/", id, "720p"),
            format!("https://cdn.example.com/api/v1/playback/keys/{}/720p", id)
        );
    }
}

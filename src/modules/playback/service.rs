use std::sync::Arc;
use std::time::Duration;

use time::OffsetDateTime;
use tracing::{info, warn};
use uuid::Uuid;

use super::entitlement::EntitlementProvider;
use super::gateway::GatewayError;
use super::model::{is_valid_device_id, Activation, DenialReason, DeviceSession};
use super::registry::DeviceRegistry;
use crate::common::token::{JwtCodec, PLAYBACK_ROLE};

/// A granted playback session and the device-bound token that goes with it.
#[derive(Debug, Clone)]
pub struct StartedSession {
    pub token: String,
    pub device_id: String,
    pub active_devices: u32,
    pub expires_at: usize,
}

#[derive(Clone)]
pub struct PlaybackService {
    registry: Arc<dyn DeviceRegistry>,
    entitlements: Arc<dyn EntitlementProvider>,
    tokens: JwtCodec,
    token_ttl_secs: u64,
}

impl PlaybackService {
    pub fn new(
        registry: Arc<dyn DeviceRegistry>,
        entitlements: Arc<dyn EntitlementProvider>,
        tokens: JwtCodec,
        token_ttl_secs: u64,
    ) -> Self {
        Self {
            registry,
            entitlements,
            tokens,
            token_ttl_secs,
        }
    }

    /// Registers the device against the account's ceiling and, if granted,
    /// issues a playback token bound to it. The token never carries the
    /// caller's own role.
    pub async fn start_session(&self, account_id: Uuid, device_id: &str) -> Result<StartedSession, GatewayError> {
        if !is_valid_device_id(device_id) {
            return Err(GatewayError::InvalidDeviceId);
        }

        let entitlement = self.entitlements.entitlement(account_id).await?;
        if !entitlement.active {
            return Err(GatewayError::Denied(DenialReason::NotAuthorized));
        }

        let activation: Activation = self
            .registry
            .activate(account_id, device_id, entitlement.device_ceiling, OffsetDateTime::now_utc())
            .await?;

        if let Some(reason) = activation.reason.filter(|_| !activation.granted) {
            warn!(
                "⛔ Device {} of account {} denied: {} of {} devices active",
                device_id, account_id, activation.active_devices, entitlement.device_ceiling
            );
            return Err(GatewayError::Denied(reason));
        }

        let (token, claims) = self
            .tokens
            .issue(account_id, PLAYBACK_ROLE, Some(device_id), self.token_ttl_secs)?;

        info!(
            "▶️ Playback session started for account {} on {} ({}/{})",
            account_id, device_id, activation.active_devices, entitlement.device_ceiling
        );

        Ok(StartedSession {
            token,
            device_id: device_id.to_string(),
            active_devices: activation.active_devices,
            expires_at: claims.exp,
        })
    }

    pub async fn stop_session(&self, account_id: Uuid, device_id: &str) -> Result<(), GatewayError> {
        self.registry.deactivate(account_id, device_id).await?;
        info!("⏹️ Playback session stopped for account {} on {}", account_id, device_id);
        Ok(())
    }

    pub async fn list_sessions(&self, account_id: Uuid) -> Result<Vec<DeviceSession>, GatewayError> {
        Ok(self.registry.list(account_id).await?)
    }

    /// One pass of the inactivity sweep.
    pub async fn sweep_inactive(&self, threshold: Duration) -> Result<usize, GatewayError> {
        let cutoff = OffsetDateTime::now_utc() - threshold;
        Ok(self.registry.sweep(cutoff).await?)
    }
}

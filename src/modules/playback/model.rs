use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use utoipa::ToSchema;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct DeviceSession {
    pub account_id: Uuid,
    pub device_id: String,
    pub is_active: bool,
    #[schema(value_type = String, format = DateTime)]
    #[serde(with = "time::serde::rfc3339")]
    pub last_accessed_at: OffsetDateTime,
}

/// Why a playback request was turned down. Serialised in the API as-is so
/// clients can show an actionable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum DenialReason {
    DeviceLimitExceeded,
    SessionNotActive,
    NotAuthorized,
    ResolutionNotFound,
}

impl DenialReason {
    pub fn message(&self) -> &'static str {
        match self {
            DenialReason::DeviceLimitExceeded => "Device limit reached. Stop playback on another device first.",
            DenialReason::SessionNotActive => "This device has no active playback session.",
            DenialReason::NotAuthorized => "Your subscription does not allow playback.",
            DenialReason::ResolutionNotFound => "The requested quality is not available for this title.",
        }
    }
}

/// Outcome of `activate`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct Activation {
    pub granted: bool,
    pub reason: Option<DenialReason>,
    /// Active devices on the account after the call.
    pub active_devices: u32,
}

impl Activation {
    pub fn granted(active_devices: u32) -> Self {
        Self { granted: true, reason: None, active_devices }
    }

    pub fn denied(reason: DenialReason, active_devices: u32) -> Self {
        Self { granted: false, reason: Some(reason), active_devices }
    }
}

/// What the subscription collaborator says about an account.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Entitlement {
    pub active: bool,
    pub device_ceiling: u32,
}

/// Indirect key reference handed out by the gateway. The bytes are only
/// served by the separate key fetch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub struct KeyGrant {
    pub content_id: Uuid,
    pub quality: String,
    pub key_ref: String,
    pub key_url: String,
}

pub fn is_valid_device_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 128
        && id.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.' | ':'))
}

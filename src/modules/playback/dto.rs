use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use validator::Validate;

use super::model::{DenialReason, DeviceSession};

#[derive(Debug, Deserialize, Validate, ToSchema)]
pub struct StartSessionRequest {
    #[validate(length(min = 1, max = 128, message = "device_id must be 1-128 characters"))]
    pub device_id: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SessionResponse {
    /// Device-bound bearer token for key requests.
    pub playback_token: String,
    pub device_id: String,
    pub active_devices: u32,
    /// Unix timestamp.
    pub expires_at: usize,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct SessionListResponse {
    pub sessions: Vec<DeviceSession>,
}

/// `data` of a 403 playback response.
#[derive(Debug, Serialize, ToSchema)]
pub struct DenialResponse {
    pub denied: DenialReason,
}

use super::dto::{DenialResponse, SessionListResponse, SessionResponse, StartSessionRequest};
use super::gateway::GatewayError;
use super::model::KeyGrant;
use crate::common::response::{ApiError, ApiRejection, ApiResponse, ApiSuccess};
use crate::common::token::TokenClaims;
use crate::middleware::role::DeviceIdentity;
use crate::state::AppState;
use axum::{
    extract::{Extension, Path, State},
    http::{header, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use uuid::Uuid;
use validator::Validate;

fn error_response(e: GatewayError) -> Response {
    match e {
        GatewayError::Denied(reason) => ApiRejection(
            reason.message().to_string(),
            DenialResponse { denied: reason },
            StatusCode::FORBIDDEN,
        )
        .into_response(),
        GatewayError::ContentNotFound(_) => ApiError(e.to_string(), StatusCode::NOT_FOUND).into_response(),
        GatewayError::InvalidDeviceId => ApiError(e.to_string(), StatusCode::BAD_REQUEST).into_response(),
        other => ApiError::internal("Playback error", other).into_response(),
    }
}

/// Start a playback session on a device
#[utoipa::path(
    post,
    path = "/api/v1/playback/sessions",
    request_body = StartSessionRequest,
    responses(
        (status = 201, description = "Session granted", body = ApiResponse<SessionResponse>),
        (status = 400, description = "Bad Request"),
        (status = 403, description = "Denied (deviceLimitExceeded, notAuthorized)", body = ApiResponse<DenialResponse>)
    ),
    tag = "Playback",
    security(("bearer_auth" = []))
)]
pub async fn start_session(
    State(state): State<AppState>,
    Extension(claims): Extension<TokenClaims>,
    Json(payload): Json<StartSessionRequest>,
) -> impl IntoResponse {
    if let Err(e) = payload.validate() {
        return ApiError(e.to_string(), StatusCode::BAD_REQUEST).into_response();
    }

    match state.playback.start_session(claims.sub, &payload.device_id).await {
        Ok(session) => {
            let res = SessionResponse {
                playback_token: session.token,
                device_id: session.device_id,
                active_devices: session.active_devices,
                expires_at: session.expires_at,
            };
            ApiSuccess(ApiResponse::success(res, "Playback session started"), StatusCode::CREATED).into_response()
        }
        Err(e) => error_response(e),
    }
}

/// List the caller's playback devices
#[utoipa::path(
    get,
    path = "/api/v1/playback/sessions",
    responses(
        (status = 200, description = "Device sessions", body = ApiResponse<SessionListResponse>)
    ),
    tag = "Playback",
    security(("bearer_auth" = []))
)]
pub async fn list_sessions(
    State(state): State<AppState>,
    Extension(claims): Extension<TokenClaims>,
) -> impl IntoResponse {
    match state.playback.list_sessions(claims.sub).await {
        Ok(sessions) => ApiSuccess(
            ApiResponse::success(SessionListResponse { sessions }, "Sessions retrieved successfully"),
            StatusCode::OK,
        )
        .into_response(),
        Err(e) => error_response(e),
    }
}

/// Stop playback on a device
#[utoipa::path(
    delete,
    path = "/api/v1/playback/sessions/{device_id}",
    params(
        ("device_id" = String, Path, description = "Device ID")
    ),
    responses(
        (status = 200, description = "Session stopped")
    ),
    tag = "Playback",
    security(("bearer_auth" = []))
)]
pub async fn stop_session(
    State(state): State<AppState>,
    Extension(claims): Extension<TokenClaims>,
    Path(device_id): Path<String>,
) -> impl IntoResponse {
    match state.playback.stop_session(claims.sub, &device_id).await {
        Ok(()) => ApiSuccess(ApiResponse::success((), "Playback session stopped"), StatusCode::OK).into_response(),
        Err(e) => error_response(e),
    }
}

/// Resolve the key reference for a rendition
#[utoipa::path(
    get,
    path = "/api/v1/playback/keys/{content_id}/{quality}/ref",
    params(
        ("content_id" = Uuid, Path, description = "Content ID"),
        ("quality" = String, Path, description = "Quality label, e.g. 720p")
    ),
    responses(
        (status = 200, description = "Key reference", body = ApiResponse<KeyGrant>),
        (status = 403, description = "Denied (sessionNotActive, notAuthorized, resolutionNotFound)", body = ApiResponse<DenialResponse>),
        (status = 404, description = "Content Not Found")
    ),
    tag = "Playback",
    security(("bearer_auth" = []))
)]
pub async fn resolve_key(
    State(state): State<AppState>,
    Extension(device): Extension<DeviceIdentity>,
    Path((content_id, quality)): Path<(Uuid, String)>,
) -> impl IntoResponse {
    match state
        .gateway
        .resolve_key(device.account_id, &device.device_id, content_id, &quality)
        .await
    {
        Ok(grant) => {
            let mut res = ApiSuccess(ApiResponse::success(grant, "Key reference resolved"), StatusCode::OK).into_response();
            res.headers_mut()
                .insert(header::CACHE_CONTROL, header::HeaderValue::from_static("private, no-store"));
            res
        }
        Err(e) => error_response(e),
    }
}

/// Fetch the raw key bytes for a rendition
#[utoipa::path(
    get,
    path = "/api/v1/playback/keys/{content_id}/{quality}",
    params(
        ("content_id" = Uuid, Path, description = "Content ID"),
        ("quality" = String, Path, description = "Quality label, e.g. 720p")
    ),
    responses(
        (status = 200, description = "16-byte AES key", content_type = "application/octet-stream"),
        (status = 403, description = "Denied", body = ApiResponse<DenialResponse>),
        (status = 404, description = "Content Not Found")
    ),
    tag = "Playback",
    security(("bearer_auth" = []))
)]
pub async fn fetch_key(
    State(state): State<AppState>,
    Extension(device): Extension<DeviceIdentity>,
    Path((content_id, quality)): Path<(Uuid, String)>,
) -> impl IntoResponse {
    match state
        .gateway
        .fetch_key(device.account_id, &device.device_id, content_id, &quality)
        .await
    {
        Ok(bytes) => (
            StatusCode::OK,
            [
                (header::CONTENT_TYPE, "application/octet-stream"),
                (header::CACHE_CONTROL, "no-store"),
            ],
            bytes,
        )
            .into_response(),
        Err(e) => error_response(e),
    }
}

use crate::common::response::ApiError;
use crate::common::token::TokenClaims;
use axum::{
    extract::{Extension, Request},
    http::StatusCode,
    middleware::Next,
    response::Response,
};
use uuid::Uuid;

/// Caller identity on routes that need a device-bound playback token.
#[derive(Debug, Clone)]
pub struct DeviceIdentity {
    pub account_id: Uuid,
    pub device_id: String,
}

pub async fn admin_guard(
    Extension(claims): Extension<TokenClaims>,
    req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    if !claims.is_admin() {
        return Err(ApiError("Forbidden: Admin access required".to_string(), StatusCode::FORBIDDEN));
    }

    Ok(next.run(req).await)
}

pub async fn device_guard(
    Extension(claims): Extension<TokenClaims>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let device_id = claims.device_id.ok_or_else(|| {
        ApiError(
            "Unauthorized: a device-bound playback token is required".to_string(),
            StatusCode::UNAUTHORIZED,
        )
    })?;

    req.extensions_mut().insert(DeviceIdentity {
        account_id: claims.sub,
        device_id,
    });

    Ok(next.run(req).await)
}

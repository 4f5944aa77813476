use crate::common::response::ApiError;
use crate::state::AppState;
use axum::{
    extract::{Request, State},
    http::{header, StatusCode},
    middleware::Next,
    response::Response,
};

pub async fn auth_middleware(
    State(state): State<AppState>,
    mut req: Request,
    next: Next,
) -> Result<Response, ApiError> {
    let token = req
        .headers()
        .get(header::AUTHORIZATION)
        .and_then(|auth_header| auth_header.to_str().ok())
        .and_then(|auth_value| auth_value.strip_prefix("Bearer "))
        .map(str::to_owned);

    let token = match token {
        Some(t) => t,
        None => return Err(ApiError("Unauthorized: Missing or invalid token".to_string(), StatusCode::UNAUTHORIZED)),
    };

    let claims = state
        .tokens
        .verify(&token)
        .map_err(|_| ApiError("Unauthorized: Invalid token signature".to_string(), StatusCode::UNAUTHORIZED))?;

    req.extensions_mut().insert(claims);

    Ok(next.run(req).await)
}

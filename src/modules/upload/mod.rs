use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{get, post};
use crate::state::AppState;

pub mod chunks;
pub mod dto;
pub mod handler;
pub mod ledger;
pub mod model;
pub mod redis_ledger;
pub mod service;

/// Slack for multipart framing and the small text fields.
const FORM_OVERHEAD_BYTES: usize = 64 * 1024;

pub fn router(state: AppState) -> Router<AppState> {
    let body_limit = state.uploads.max_chunk_bytes() + FORM_OVERHEAD_BYTES;

    Router::new()
        .route(
            "/uploads/chunks",
            post(handler::upload_chunk).layer(DefaultBodyLimit::max(body_limit)),
        )
        .route("/uploads/{upload_id}", get(handler::upload_status))
        .route("/uploads/{upload_id}/finalize", post(handler::finalize_upload))
        .route_layer(middleware::from_fn(crate::middleware::role::admin_guard))
        .route_layer(middleware::from_fn_with_state(
            state,
            crate::middleware::auth::auth_middleware
        ))
}

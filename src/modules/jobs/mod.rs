use axum::Router;
use axum::middleware;
use axum::routing::{get, post};
use crate::state::AppState;

pub mod cancel;
pub mod handler;
pub mod memory;
pub mod model;
pub mod queue;
pub mod repository;

pub fn router(state: AppState) -> Router<AppState> {
    Router::new()
        .route("/jobs", get(handler::list_jobs))
        .route("/jobs/{id}", get(handler::get_job))
        .route("/jobs/{id}/retry", post(handler::retry_job))
        .route_layer(middleware::from_fn(crate::middleware::role::admin_guard))
        .route_layer(middleware::from_fn_with_state(
            state,
            crate::middleware::auth::auth_middleware
        ))
}

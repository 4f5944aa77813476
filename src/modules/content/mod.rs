use axum::Router;
use axum::routing::{get, post};
use crate::state::AppState;
use axum::middleware;

pub mod handler;
pub mod stream_handler;
pub mod dto;
pub mod memory;
pub mod model;
pub mod repository;
pub mod service;

pub fn router(state: AppState) -> Router<AppState> {
    let public_routes = Router::new()
        .route("/stream/{content_id}/{rendition_id}/{quality}/{file}", get(stream_handler::stream_rendition));

    let protected_routes = Router::new()
        .route("/contents", post(handler::create_content).get(handler::list_contents))
        .route("/contents/{id}", get(handler::get_content).delete(handler::delete_content))
        .route("/contents/{id}/reset", post(handler::reset_content))
        .route_layer(middleware::from_fn(crate::middleware::role::admin_guard))
        .route_layer(middleware::from_fn_with_state(
            state,
            crate::middleware::auth::auth_middleware
        ));

    public_routes.merge(protected_routes)
}

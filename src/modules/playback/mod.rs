use axum::Router;
use axum::middleware;
use axum::routing::{delete, get};
use crate::state::AppState;

pub mod dto;
pub mod entitlement;
pub mod gateway;
pub mod handler;
pub mod model;
pub mod redis_registry;
pub mod registry;
pub mod service;

pub fn router(state: AppState) -> Router<AppState> {
    let account_routes = Router::new()
        .route("/sessions", get(handler::list_sessions).post(handler::start_session))
        .route("/sessions/{device_id}", delete(handler::stop_session));

    let device_routes = Router::new()
        .route("/keys/{content_id}/{quality}", get(handler::fetch_key))
        .route("/keys/{content_id}/{quality}/ref", get(handler::resolve_key))
        .route_layer(middleware::from_fn(crate::middleware::role::device_guard));

    account_routes
        .merge(device_routes)
        .route_layer(middleware::from_fn_with_state(
            state,
            crate::middleware::auth::auth_middleware,
        ))
}

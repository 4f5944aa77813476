use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;
use crate::common::response::ApiError;
use crate::docs::ApiDoc;
use crate::state::AppState;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::get;
use tracing::warn;

use tower_http::cors::{Any, CorsLayer};

pub fn configure_routes(state: AppState) -> Router<AppState> {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    Router::new()
        .merge(SwaggerUi::new("/swagger-ui").url("/api-docs/openapi.json", ApiDoc::openapi()))
        .nest("/api/v1", api_routes())
        .nest("/api/v1", crate::modules::content::router(state.clone()))
        .nest("/api/v1", crate::modules::upload::router(state.clone()))
        .nest("/api/v1", crate::modules::jobs::router(state.clone()))
        .nest("/api/v1/playback", crate::modules::playback::router(state))
        .layer(cors)
}

fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(|| async { "ok" }))
        .route("/health/ready", get(readiness))
}

/// Ready once Postgres and Redis both answer.
async fn readiness(State(state): State<AppState>) -> Result<&'static str, ApiError> {
    let unavailable = |what: &str| ApiError(format!("{} unavailable", what), StatusCode::SERVICE_UNAVAILABLE);

    sqlx::query("SELECT 1").execute(&state.db).await.map_err(|e| {
        warn!("Readiness: database check failed: {}", e);
        unavailable("database")
    })?;

    state.redis.ping().await.map_err(|e| {
        warn!("Readiness: redis check failed: {}", e);
        unavailable("redis")
    })?;

    Ok("ready")
}

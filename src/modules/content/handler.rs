use crate::common::response::{ApiError, ApiResponse, ApiSuccess};
use crate::state::AppState;
use crate::modules::content::dto::*;
use crate::modules::content::model::ContentRecord;
use crate::modules::content::repository::ContentError;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use uuid::Uuid;
use validator::Validate;

pub(crate) fn error_response(e: ContentError) -> Response {
    match e {
        ContentError::NotFound(_) => ApiError(e.to_string(), StatusCode::NOT_FOUND).into_response(),
        ContentError::InvalidTransition { .. } | ContentError::AlreadyExists(_) => {
            ApiError(e.to_string(), StatusCode::CONFLICT).into_response()
        }
        ContentError::Storage(e) => ApiError::internal("Content storage error", e).into_response(),
    }
}

/// Create a content record awaiting its video
#[utoipa::path(
    post,
    path = "/api/v1/contents",
    request_body = CreateContentRequest,
    responses(
        (status = 201, description = "Content Created", body = ApiResponse<ContentRecord>),
        (status = 400, description = "Bad Request"),
        (status = 500, description = "Internal Server Error")
    ),
    tag = "Content",
    security(("bearer_auth" = []))
)]
pub async fn create_content(
    State(state): State<AppState>,
    Json(req): Json<CreateContentRequest>,
) -> impl IntoResponse {
    if let Err(e) = req.validate() {
        return ApiError(e.to_string(), StatusCode::BAD_REQUEST).into_response();
    }

    match state.contents.create(&req.title).await {
        Ok(res) => ApiSuccess(ApiResponse::success(res, "Content created successfully"), StatusCode::CREATED).into_response(),
        Err(e) => error_response(e),
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/contents",
    responses(
        (status = 200, description = "List Contents", body = ApiResponse<Vec<ContentRecord>>),
        (status = 500, description = "Internal Server Error")
    ),
    tag = "Content",
    security(("bearer_auth" = []))
)]
pub async fn list_contents(State(state): State<AppState>) -> impl IntoResponse {
    match state.contents.list().await {
        Ok(res) => ApiSuccess(ApiResponse::success(res, "Contents retrieved successfully"), StatusCode::OK).into_response(),
        Err(e) => error_response(e),
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/contents/{id}",
    params(
        ("id" = Uuid, Path, description = "Content ID")
    ),
    responses(
        (status = 200, description = "Get Content", body = ApiResponse<ContentRecord>),
        (status = 404, description = "Content Not Found"),
        (status = 500, description = "Internal Server Error")
    ),
    tag = "Content",
    security(("bearer_auth" = []))
)]
pub async fn get_content(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.contents.get(id).await {
        Ok(res) => ApiSuccess(ApiResponse::success(res, "Content retrieved successfully"), StatusCode::OK).into_response(),
        Err(e) => error_response(e),
    }
}

/// Delete a content, cancelling in-flight encodes and removing artifacts
#[utoipa::path(
    delete,
    path = "/api/v1/contents/{id}",
    params(
        ("id" = Uuid, Path, description = "Content ID")
    ),
    responses(
        (status = 200, description = "Content Deleted", body = ApiResponse<TeardownResponse>),
        (status = 404, description = "Content Not Found"),
        (status = 500, description = "Internal Server Error")
    ),
    tag = "Content",
    security(("bearer_auth" = []))
)]
pub async fn delete_content(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.contents.delete(id).await {
        Ok(teardown) => ApiSuccess(
            ApiResponse::success(TeardownResponse::new(id, teardown), "Content deleted successfully"),
            StatusCode::OK,
        )
        .into_response(),
        Err(e) => error_response(e),
    }
}

/// Operator reset back to waiting_for_video
#[utoipa::path(
    post,
    path = "/api/v1/contents/{id}/reset",
    params(
        ("id" = Uuid, Path, description = "Content ID")
    ),
    responses(
        (status = 200, description = "Content Reset", body = ApiResponse<ResetResponse>),
        (status = 404, description = "Content Not Found"),
        (status = 500, description = "Internal Server Error")
    ),
    tag = "Content",
    security(("bearer_auth" = []))
)]
pub async fn reset_content(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.contents.reset(id).await {
        Ok((content, teardown)) => {
            let res = ResetResponse {
                content,
                cancelled_jobs: teardown.cancelled_jobs,
                removed_objects: teardown.removed_objects,
            };
            ApiSuccess(ApiResponse::success(res, "Content reset successfully"), StatusCode::OK).into_response()
        }
        Err(e) => error_response(e),
    }
}

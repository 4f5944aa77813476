use super::model::{Job, JobState};
use super::queue::QueueError;
use crate::common::response::{ApiError, ApiResponse, ApiSuccess};
use crate::state::AppState;
use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde::Deserialize;
use utoipa::IntoParams;
use uuid::Uuid;

#[derive(Debug, Deserialize, IntoParams)]
pub struct JobListQuery {
    /// pending, active, completed or failed
    pub state: Option<JobState>,
    pub limit: Option<i64>,
}

fn error_response(e: QueueError) -> Response {
    match e {
        QueueError::NotFound(_) => ApiError(e.to_string(), StatusCode::NOT_FOUND).into_response(),
        QueueError::LeaseLost(_) | QueueError::NotFailed(_) | QueueError::ContentBusy { .. } => {
            ApiError(e.to_string(), StatusCode::CONFLICT).into_response()
        }
        QueueError::Storage(e) => ApiError::internal("Job store error", e).into_response(),
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/jobs",
    params(JobListQuery),
    responses(
        (status = 200, description = "List Jobs", body = ApiResponse<Vec<Job>>)
    ),
    tag = "Jobs",
    security(("bearer_auth" = []))
)]
pub async fn list_jobs(
    State(state): State<AppState>,
    Query(query): Query<JobListQuery>,
) -> impl IntoResponse {
    match state.jobs.list(query.state, query.limit.unwrap_or(100)).await {
        Ok(jobs) => ApiSuccess(ApiResponse::success(jobs, "Jobs retrieved successfully"), StatusCode::OK).into_response(),
        Err(e) => error_response(e),
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/jobs/{id}",
    params(
        ("id" = Uuid, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Get Job", body = ApiResponse<Job>),
        (status = 404, description = "Job Not Found")
    ),
    tag = "Jobs",
    security(("bearer_auth" = []))
)]
pub async fn get_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.jobs.get(id).await {
        Ok(job) => ApiSuccess(ApiResponse::success(job, "Job retrieved successfully"), StatusCode::OK).into_response(),
        Err(e) => error_response(e),
    }
}

/// Put a failed job back in the queue with its attempts cleared
#[utoipa::path(
    post,
    path = "/api/v1/jobs/{id}/retry",
    params(
        ("id" = Uuid, Path, description = "Job ID")
    ),
    responses(
        (status = 200, description = "Job Requeued", body = ApiResponse<Job>),
        (status = 404, description = "Job Not Found"),
        (status = 409, description = "Job is not failed")
    ),
    tag = "Jobs",
    security(("bearer_auth" = []))
)]
pub async fn retry_job(
    State(state): State<AppState>,
    Path(id): Path<Uuid>,
) -> impl IntoResponse {
    match state.jobs.retry(id).await {
        Ok(job) => ApiSuccess(ApiResponse::success(job, "Job requeued"), StatusCode::OK).into_response(),
        Err(e) => error_response(e),
    }
}

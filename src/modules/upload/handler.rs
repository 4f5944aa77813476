use super::dto::{ChunkUploadForm, UploadStatusResponse};
use super::ledger::UploadError;
use super::model::ChunkReceipt;
use super::service::ChunkUpload;
use crate::common::response::{ApiError, ApiResponse, ApiSuccess};
use crate::state::AppState;
use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
};
use bytes::Bytes;
use tracing::error;
use uuid::Uuid;

fn error_response(e: UploadError) -> Response {
    let status = match &e {
        UploadError::InvalidUploadId
        | UploadError::InvalidTotal(_)
        | UploadError::IndexOutOfRange { .. }
        | UploadError::TotalMismatch { .. }
        | UploadError::EmptyChunk
        | UploadError::MissingTitle => StatusCode::BAD_REQUEST,
        UploadError::ChunkTooLarge(_) => StatusCode::PAYLOAD_TOO_LARGE,
        UploadError::NotFound(_) | UploadError::ContentNotFound(_) => StatusCode::NOT_FOUND,
        UploadError::Incomplete { .. } | UploadError::FinalizeInProgress(_) | UploadError::ContentBusy { .. } => {
            StatusCode::CONFLICT
        }
        UploadError::FinalizeFailed { .. } => StatusCode::INTERNAL_SERVER_ERROR,
        UploadError::Storage(inner) => {
            error!("Upload storage error: {}", inner);
            return ApiError(
                "Chunk could not be stored, please retry".to_string(),
                StatusCode::INTERNAL_SERVER_ERROR,
            )
            .into_response();
        }
    };

    ApiError(e.to_string(), status).into_response()
}

fn bad_request(message: String) -> Response {
    ApiError(message, StatusCode::BAD_REQUEST).into_response()
}

async fn read_chunk(mut multipart: Multipart) -> Result<ChunkUpload, Response> {
    let mut upload_id = None;
    let mut chunk_index = None;
    let mut total_chunks = None;
    let mut content_title = None;
    let mut content_id = None;
    let mut bytes: Option<Bytes> = None;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| bad_request(format!("Malformed multipart body: {}", e)))?
    {
        let name = field.name().unwrap_or_default().to_string();

        if name == "chunk" {
            bytes = Some(
                field
                    .bytes()
                    .await
                    .map_err(|e| bad_request(format!("Failed to read chunk: {}", e)))?,
            );
            continue;
        }

        let value = field
            .text()
            .await
            .map_err(|e| bad_request(format!("Failed to read field '{}': {}", name, e)))?;

        match name.as_str() {
            "upload_id" => upload_id = Some(value),
            "chunk_index" => {
                chunk_index = Some(value.trim().parse::<u32>().map_err(|_| bad_request("chunk_index must be a non-negative integer".into()))?)
            }
            "total_chunks" => {
                total_chunks = Some(value.trim().parse::<u32>().map_err(|_| bad_request("total_chunks must be a non-negative integer".into()))?)
            }
            "content_title" => content_title = Some(value),
            "content_id" => {
                content_id = Some(value.trim().parse::<Uuid>().map_err(|_| bad_request("content_id must be a UUID".into()))?)
            }
            _ => {}
        }
    }

    Ok(ChunkUpload {
        upload_id: upload_id.ok_or_else(|| bad_request("upload_id is required".into()))?,
        chunk_index: chunk_index.ok_or_else(|| bad_request("chunk_index is required".into()))?,
        total_chunks: total_chunks.ok_or_else(|| bad_request("total_chunks is required".into()))?,
        content_title,
        content_id,
        bytes: bytes.ok_or_else(|| bad_request("chunk is required".into()))?,
    })
}

/// Upload one chunk of a video
/// Chunks may arrive in any order and may be re-sent. The chunk that
/// completes the set triggers assembly and queues the encode job.
#[utoipa::path(
    post,
    path = "/api/v1/uploads/chunks",
    request_body(content = ChunkUploadForm, content_type = "multipart/form-data"),
    responses(
        (status = 200, description = "Chunk accepted", body = ApiResponse<ChunkReceipt>),
        (status = 400, description = "Bad Request"),
        (status = 404, description = "Content Not Found"),
        (status = 413, description = "Chunk Too Large"),
        (status = 500, description = "Chunk not stored or finalize failed; retry")
    ),
    tag = "Upload",
    security(("bearer_auth" = []))
)]
pub async fn upload_chunk(
    State(state): State<AppState>,
    multipart: Multipart,
) -> impl IntoResponse {
    let chunk = match read_chunk(multipart).await {
        Ok(c) => c,
        Err(res) => return res,
    };

    match state.uploads.accept_chunk(chunk).await {
        Ok(receipt) => ApiSuccess(ApiResponse::success(receipt, "Chunk accepted"), StatusCode::OK).into_response(),
        Err(e) => error_response(e),
    }
}

#[utoipa::path(
    get,
    path = "/api/v1/uploads/{upload_id}",
    params(
        ("upload_id" = String, Path, description = "Upload ID")
    ),
    responses(
        (status = 200, description = "Upload progress", body = ApiResponse<UploadStatusResponse>),
        (status = 404, description = "Upload Not Found")
    ),
    tag = "Upload",
    security(("bearer_auth" = []))
)]
pub async fn upload_status(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> impl IntoResponse {
    match state.uploads.status(&upload_id).await {
        Ok(session) => ApiSuccess(
            ApiResponse::success(UploadStatusResponse::from(session), "Upload status retrieved"),
            StatusCode::OK,
        )
        .into_response(),
        Err(e) => error_response(e),
    }
}

/// Retry a finalize that failed
#[utoipa::path(
    post,
    path = "/api/v1/uploads/{upload_id}/finalize",
    params(
        ("upload_id" = String, Path, description = "Upload ID")
    ),
    responses(
        (status = 200, description = "Upload finalized", body = ApiResponse<ChunkReceipt>),
        (status = 404, description = "Upload Not Found"),
        (status = 409, description = "Incomplete or already finalizing"),
        (status = 500, description = "Finalize failed; retry")
    ),
    tag = "Upload",
    security(("bearer_auth" = []))
)]
pub async fn finalize_upload(
    State(state): State<AppState>,
    Path(upload_id): Path<String>,
) -> impl IntoResponse {
    match state.uploads.finalize(&upload_id).await {
        Ok(receipt) => ApiSuccess(ApiResponse::success(receipt, "Upload finalized"), StatusCode::OK).into_response(),
        Err(e) => error_response(e),
    }
}

use std::fmt::Display;

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use serde::Serialize;
use tracing::error;
use utoipa::ToSchema;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum ResponseStatus {
    Success,
    Error,
}

/// JSON envelope shared by every endpoint.
#[derive(Serialize, ToSchema)]
pub struct ApiResponse<T> {
    pub status: ResponseStatus,
    pub message: String,
    pub data: Option<T>,
}

impl<T: Serialize> ApiResponse<T> {
    pub fn success(data: T, message: &str) -> Self {
        Self { status: ResponseStatus::Success, message: message.to_string(), data: Some(data) }
    }

    fn failure(message: String, data: Option<T>) -> Self {
        Self { status: ResponseStatus::Error, message, data }
    }
}

pub struct ApiSuccess<T>(pub T, pub StatusCode);

impl<T: Serialize> IntoResponse for ApiSuccess<ApiResponse<T>> {
    fn into_response(self) -> Response {
        (self.1, Json(self.0)).into_response()
    }
}

pub struct ApiError(pub String, pub StatusCode);

impl ApiError {
    /// Logs `err` and hides it behind a generic 500.
    pub fn internal(context: &str, err: impl Display) -> Self {
        error!("{}: {}", context, err);
        Self("Internal Server Error".to_string(), StatusCode::INTERNAL_SERVER_ERROR)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.1, Json(ApiResponse::<()>::failure(self.0, None))).into_response()
    }
}

/// An error that still carries a payload, such as a playback denial reason.
pub struct ApiRejection<T>(pub String, pub T, pub StatusCode);

impl<T: Serialize> IntoResponse for ApiRejection<T> {
    fn into_response(self) -> Response {
        (self.2, Json(ApiResponse::failure(self.0, Some(self.1)))).into_response()
    }
}

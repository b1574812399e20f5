//! 统一的 API 错误类型与转换。

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::any::Any;
use std::io::ErrorKind;
use tracing::error;

use crate::storage::StorageError;
use crate::upload::UploadError;

pub const INTERNAL_ERROR_MESSAGE: &str = "Internal server error";

#[derive(Debug)]
pub enum ApiError {
    BadRequest(String),
    InvalidFileType(String),
    Unauthorized(String),
    Forbidden(String),
    NotFound(String),
    RouteNotFound,
    PayloadTooLarge(String),
    ServiceUnavailable(String),
    Internal(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::BadRequest(msg) => error_response(StatusCode::BAD_REQUEST, &msg),
            ApiError::InvalidFileType(field) => (
                StatusCode::BAD_REQUEST,
                Json(json!({
                    "error": format!("Invalid file type for {field}"),
                    "field": field,
                })),
            )
                .into_response(),
            ApiError::Unauthorized(msg) => error_response(StatusCode::UNAUTHORIZED, &msg),
            ApiError::Forbidden(msg) => error_response(StatusCode::FORBIDDEN, &msg),
            ApiError::NotFound(msg) => error_response(StatusCode::NOT_FOUND, &msg),
            ApiError::RouteNotFound => error_response(StatusCode::NOT_FOUND, "Route not found"),
            ApiError::PayloadTooLarge(msg) => error_response(StatusCode::PAYLOAD_TOO_LARGE, &msg),
            ApiError::ServiceUnavailable(msg) => {
                error_response(StatusCode::SERVICE_UNAVAILABLE, &msg)
            }
            ApiError::Internal(detail) => {
                error!(error = %detail, "internal server error");
                error_response(StatusCode::INTERNAL_SERVER_ERROR, INTERNAL_ERROR_MESSAGE)
            }
        }
    }
}

fn error_response(status: StatusCode, message: &str) -> Response {
    (status, Json(json!({ "error": message }))).into_response()
}

impl From<StorageError> for ApiError {
    fn from(error: StorageError) -> Self {
        match error {
            StorageError::AccessDenied => ApiError::Forbidden("Access denied".into()),
            StorageError::NotFound => ApiError::NotFound("File not found".into()),
            StorageError::Io(err) => match err.kind() {
                ErrorKind::NotFound => ApiError::NotFound("File not found".into()),
                _ => ApiError::Internal(err.to_string()),
            },
        }
    }
}

impl From<UploadError> for ApiError {
    fn from(error: UploadError) -> Self {
        match error {
            UploadError::UnexpectedField(field) => {
                ApiError::BadRequest(format!("Unexpected field {field}"))
            }
            UploadError::UnrecognizedField(field) => {
                ApiError::BadRequest(format!("Unrecognized upload field {field}"))
            }
            UploadError::InvalidFileType(field) => ApiError::InvalidFileType(field),
            UploadError::FileTooLarge { field, limit } => ApiError::PayloadTooLarge(format!(
                "File too large for {field}, limit is {limit} bytes"
            )),
            UploadError::Multipart(err) => {
                if err.status() == StatusCode::PAYLOAD_TOO_LARGE {
                    ApiError::PayloadTooLarge(err.body_text())
                } else {
                    ApiError::BadRequest(err.body_text())
                }
            }
            UploadError::Io(err) => ApiError::Internal(err.to_string()),
        }
    }
}

/// 处理器 panic 时返回通用 500，细节只写日志。
pub fn panic_response(panic: Box<dyn Any + Send + 'static>) -> Response {
    let detail = if let Some(msg) = panic.downcast_ref::<String>() {
        msg.clone()
    } else if let Some(msg) = panic.downcast_ref::<&str>() {
        (*msg).to_string()
    } else {
        "unknown panic".to_string()
    };
    ApiError::Internal(format!("handler panicked: {detail}")).into_response()
}

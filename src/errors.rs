use crate::services::error::{ServiceError, UploadError, UploadStage};
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;
use tracing::error;

/// An HTTP-facing error. Only `message` reaches the client.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub code: &'static str,
    pub message: String,
    pub stage: Option<UploadStage>,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, code: &'static str, msg: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: msg.into(),
            stage: None,
        }
    }

    /// Shortcut for 400 Bad Request
    pub fn bad_request(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, "validation_error", msg)
    }

    /// Shortcut for 401 Unauthorized
    pub fn unauthorized(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::UNAUTHORIZED, "unauthorized", msg)
    }

    /// Shortcut for 403 Forbidden
    pub fn forbidden(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::FORBIDDEN, "forbidden", msg)
    }

    /// Shortcut for 404 Not Found
    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::NOT_FOUND, "not_found", msg)
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal() -> Self {
        Self::new(
            StatusCode::INTERNAL_SERVER_ERROR,
            "internal_error",
            "internal server error",
        )
    }
}

impl fmt::Display for AppError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for AppError {}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "error": self.message,
            "code": self.code,
            "status": self.status.as_u16()
        });
        if let Some(stage) = self.stage {
            body["stage"] = json!(stage);
        }

        (self.status, Json(body)).into_response()
    }
}

/// Map service errors to responses. Backend and internal detail is logged,
/// never returned.
impl From<ServiceError> for AppError {
    fn from(err: ServiceError) -> Self {
        match err {
            ServiceError::NotFound(msg) => AppError::not_found(msg),
            ServiceError::Validation(msg) => AppError::bad_request(msg),
            ServiceError::QuotaExceeded(quota) => {
                AppError::new(StatusCode::FORBIDDEN, "quota_exceeded", quota.to_string())
            }
            ServiceError::ProviderUnavailable(detail) => {
                error!("storage provider unavailable: {}", detail);
                AppError::new(
                    StatusCode::SERVICE_UNAVAILABLE,
                    "provider_unavailable",
                    "storage backend is unavailable, try again later",
                )
            }
            ServiceError::Configuration(detail) => {
                error!("storage configuration error: {}", detail);
                AppError::new(
                    StatusCode::BAD_REQUEST,
                    "configuration_error",
                    "requested storage provider is not available",
                )
            }
            ServiceError::Internal(detail) => {
                error!("internal error: {}", detail);
                AppError::internal()
            }
        }
    }
}

impl From<UploadError> for AppError {
    fn from(err: UploadError) -> Self {
        let stage = err.stage;
        let mut app = AppError::from(err.error);
        app.stage = Some(stage);
        app
    }
}

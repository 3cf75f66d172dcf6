use crate::middleware::auth::AuthError;
use crate::services::image_service::ImageError;
use axum::{
    Json,
    http::StatusCode,
    response::{IntoResponse, Response},
};
use serde_json::json;
use std::fmt;

/// A lightweight wrapper for general errors that keeps the message local.
#[derive(Debug)]
pub struct AppError {
    pub status: StatusCode,
    pub message: String,
}

impl AppError {
    /// Create a new AppError with a specific status and message.
    pub fn new(status: StatusCode, msg: impl Into<String>) -> Self {
        Self {
            status,
            message: msg.into(),
        }
    }

    /// Shortcut for a 500 Internal Server Error
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::new(StatusCode::INTERNAL_SERVER_ERROR, msg)
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
        let body = Json(json!({
            "error": self.message,
            "status": self.status.as_u16()
        }));

        (self.status, body).into_response()
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::internal(err.to_string())
    }
}

impl From<ImageError> for AppError {
    fn from(err: ImageError) -> Self {
        let status = match &err {
            ImageError::NotFound { .. } => StatusCode::NOT_FOUND,
            ImageError::InvalidPayload(_)
            | ImageError::UnsupportedFormat(_)
            | ImageError::InvalidDimensions(_) => StatusCode::BAD_REQUEST,
            ImageError::PayloadTooLarge { .. } => StatusCode::PAYLOAD_TOO_LARGE,
            ImageError::DecodeFailure(_) => StatusCode::UNPROCESSABLE_ENTITY,
            ImageError::Storage(_) => StatusCode::BAD_GATEWAY,
            ImageError::Sqlx(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        AppError::new(status, err.to_string())
    }
}

impl From<AuthError> for AppError {
    fn from(err: AuthError) -> Self {
        match err {
            AuthError::Unauthorized => AppError::new(StatusCode::UNAUTHORIZED, "Unauthorized"),
            AuthError::JwksUnavailable(_) => AppError::internal("Internal Server Error"),
        }
    }
}

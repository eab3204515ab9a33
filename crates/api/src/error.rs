use axum::{Json, http::StatusCode, response::IntoResponse};
use reverie_domain::error::DomainError;
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ApiError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("unauthorized")]
    Unauthorized,
    #[error("not found")]
    NotFound,
    #[error("a request with the same idempotency key is still in progress")]
    ConcurrentDuplicate,
    #[error("idempotency key was already used with a different request body")]
    KeyConflict,
    #[error("failed to protect journal data")]
    EncryptionFailed,
    #[error("backing store unavailable")]
    StoreUnavailable,
    #[error("internal error")]
    Internal,
}

impl ApiError {
    fn status_code(&self) -> StatusCode {
        match self {
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Unauthorized => StatusCode::UNAUTHORIZED,
            ApiError::NotFound => StatusCode::NOT_FOUND,
            ApiError::ConcurrentDuplicate => StatusCode::CONFLICT,
            ApiError::KeyConflict => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::EncryptionFailed => StatusCode::INTERNAL_SERVER_ERROR,
            ApiError::StoreUnavailable => StatusCode::SERVICE_UNAVAILABLE,
            ApiError::Internal => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    fn error_code(&self) -> &'static str {
        match self {
            ApiError::Validation(_) => "validation_error",
            ApiError::Unauthorized => "unauthorized",
            ApiError::NotFound => "not_found",
            ApiError::ConcurrentDuplicate => "concurrent_duplicate",
            ApiError::KeyConflict => "idempotency_key_conflict",
            ApiError::EncryptionFailed => "encryption_failed",
            ApiError::StoreUnavailable => "store_unavailable",
            ApiError::Internal => "internal_error",
        }
    }
}

/// Internal details stay in the logs; clients only see the stable code.
impl From<DomainError> for ApiError {
    fn from(err: DomainError) -> Self {
        match err {
            DomainError::Validation(message) => ApiError::Validation(message),
            DomainError::NotFound => ApiError::NotFound,
            DomainError::Unauthorized => ApiError::Unauthorized,
            DomainError::ConcurrentDuplicate => ApiError::ConcurrentDuplicate,
            DomainError::KeyConflict => ApiError::KeyConflict,
            DomainError::EncryptionFailed(message) => {
                tracing::error!(error = %message, "encryption boundary failure");
                ApiError::EncryptionFailed
            }
            DomainError::StoreUnavailable(message) => {
                tracing::error!(error = %message, "store unavailable");
                ApiError::StoreUnavailable
            }
            DomainError::Internal(message) => {
                tracing::error!(error = %message, "internal error");
                ApiError::Internal
            }
        }
    }
}

#[derive(Serialize)]
struct ErrorEnvelope {
    error: ErrorBody,
}

#[derive(Serialize)]
struct ErrorBody {
    code: &'static str,
    message: String,
}

impl IntoResponse for ApiError {
    fn into_response(self) -> axum::response::Response {
        let status = self.status_code();
        let message = self.to_string();
        let body = ErrorEnvelope {
            error: ErrorBody {
                code: self.error_code(),
                message,
            },
        };
        (status, Json(body)).into_response()
    }
}

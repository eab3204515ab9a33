use thiserror::Error;

use crate::idempotency::IdempotencyError;
use crate::ports::cipher::EncryptionError;
use crate::ports::kv::KvError;

#[derive(Debug, Error)]
pub enum DomainError {
    #[error("validation failed: {0}")]
    Validation(String),
    #[error("not found")]
    NotFound,
    #[error("unauthorized")]
    Unauthorized,
    #[error("request is already being processed")]
    ConcurrentDuplicate,
    #[error("idempotency key reused for a different request")]
    KeyConflict,
    #[error("{0}")]
    EncryptionFailed(String),
    #[error("store unavailable: {0}")]
    StoreUnavailable(String),
    #[error("internal error: {0}")]
    Internal(String),
}

impl From<IdempotencyError> for DomainError {
    fn from(err: IdempotencyError) -> Self {
        match err {
            IdempotencyError::ConcurrentDuplicate => Self::ConcurrentDuplicate,
            IdempotencyError::KeyConflict => Self::KeyConflict,
            IdempotencyError::Store(err) => Self::StoreUnavailable(err.to_string()),
            IdempotencyError::Serialization(message) => Self::Internal(message),
        }
    }
}

impl From<KvError> for DomainError {
    fn from(err: KvError) -> Self {
        Self::StoreUnavailable(err.to_string())
    }
}

impl From<EncryptionError> for DomainError {
    fn from(err: EncryptionError) -> Self {
        Self::EncryptionFailed(err.to_string())
    }
}

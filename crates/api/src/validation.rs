use crate::error::ApiError;
use validator::Validate;

pub fn validate<T: Validate>(value: &T) -> Result<(), ApiError> {
    value
        .validate()
        .map_err(|err| ApiError::Validation(err.to_string()))
}

const MAX_CORRELATION_ID_LENGTH: usize = 128;

/// Caller-supplied correlation id; it is copied into logs and job envelopes.
pub fn correlation_id(value: &str) -> Result<String, ApiError> {
    let value = value.trim();
    if value.is_empty()
        || value.len() > MAX_CORRELATION_ID_LENGTH
        || !value.bytes().all(|byte| byte.is_ascii_graphic())
    {
        return Err(ApiError::Validation(format!(
            "correlation id must be 1 to {MAX_CORRELATION_ID_LENGTH} printable ascii characters"
        )));
    }
    Ok(value.to_string())
}

/// Client-supplied `Idempotency-Key`: printable ASCII, at most 255 bytes.
pub fn idempotency_key(value: &str) -> Result<String, ApiError> {
    let value = value.trim();
    if value.is_empty() || value.len() > 255 {
        return Err(ApiError::Validation(
            "idempotency key must be 1 to 255 characters".into(),
        ));
    }
    if !value.bytes().all(|byte| byte.is_ascii_graphic()) {
        return Err(ApiError::Validation(
            "idempotency key must be printable ascii".into(),
        ));
    }
    Ok(value.to_string())
}

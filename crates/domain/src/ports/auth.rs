use thiserror::Error;

use super::BoxFuture;

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("missing credential")]
    Missing,
    #[error("invalid credential: {0}")]
    Invalid(String),
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct VerifiedToken {
    pub user_id: String,
}

pub trait TokenVerifier: Send + Sync {
    fn verify(&self, token: &str) -> BoxFuture<'_, Result<VerifiedToken, AuthError>>;
}

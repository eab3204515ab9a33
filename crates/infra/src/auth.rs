use jsonwebtoken::{Algorithm, DecodingKey, Validation, decode};
use reverie_domain::ports::BoxFuture;
use reverie_domain::ports::auth::{AuthError, TokenVerifier, VerifiedToken};
use serde::{Deserialize, Serialize};

#[derive(Debug, Serialize, Deserialize)]
pub struct Claims {
    pub sub: String,
    pub exp: usize,
}

/// HS256 bearer tokens signed with the shared `jwt_secret`.
#[derive(Clone)]
pub struct JwtVerifier {
    key: DecodingKey,
    validation: Validation,
}

impl JwtVerifier {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }

    fn verify_sync(&self, token: &str) -> Result<VerifiedToken, AuthError> {
        if token.trim().is_empty() {
            return Err(AuthError::Missing);
        }
        let data = decode::<Claims>(token, &self.key, &self.validation)
            .map_err(|err| AuthError::Invalid(err.to_string()))?;
        if data.claims.sub.trim().is_empty() {
            return Err(AuthError::Invalid("token subject is empty".into()));
        }
        Ok(VerifiedToken {
            user_id: data.claims.sub,
        })
    }
}

impl TokenVerifier for JwtVerifier {
    fn verify(&self, token: &str) -> BoxFuture<'_, Result<VerifiedToken, AuthError>> {
        let result = self.verify_sync(token);
        Box::pin(async move { result })
    }
}

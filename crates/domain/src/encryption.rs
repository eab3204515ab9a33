use std::sync::Arc;

use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;

use crate::ports::cipher::{EncryptionContext, EncryptionError, EnvelopeCipher};

pub const CONTEXT_PURPOSE_LABEL: &str = "purpose";
pub const CONTEXT_SERVICE_LABEL: &str = "service";
pub const PHI_PURPOSE: &str = "phi-encryption";
pub const PHI_SERVICE: &str = "reverie-backend";

pub fn phi_context() -> EncryptionContext {
    EncryptionContext::new()
        .with(CONTEXT_PURPOSE_LABEL, PHI_PURPOSE)
        .with(CONTEXT_SERVICE_LABEL, PHI_SERVICE)
}

/// Field-level encryption of PHI strings.
///
/// Every call is bound to the fixed PHI context. Ciphertext travels as
/// standard base64; the empty string maps to itself without a cipher call.
#[derive(Clone)]
pub struct EncryptionBoundary {
    cipher: Arc<dyn EnvelopeCipher>,
    context: EncryptionContext,
}

impl EncryptionBoundary {
    pub fn new(cipher: Arc<dyn EnvelopeCipher>) -> Self {
        Self {
            cipher,
            context: phi_context(),
        }
    }

    pub fn key_id(&self) -> &str {
        self.cipher.key_id()
    }

    pub async fn encrypt_field(&self, plaintext: &str) -> Result<String, EncryptionError> {
        if plaintext.is_empty() {
            return Ok(String::new());
        }
        let ciphertext = self
            .cipher
            .encrypt(plaintext.as_bytes(), &self.context)
            .await?;
        Ok(BASE64.encode(ciphertext))
    }

    pub async fn decrypt_field(&self, ciphertext: &str) -> Result<String, EncryptionError> {
        if ciphertext.is_empty() {
            return Ok(String::new());
        }
        let blob = BASE64
            .decode(ciphertext)
            .map_err(|err| EncryptionError::new(format!("decode ciphertext: {err}")))?;
        let plaintext = self.cipher.decrypt(&blob, &self.context).await?;
        String::from_utf8(plaintext)
            .map_err(|err| EncryptionError::new(format!("plaintext is not utf-8: {err}")))
    }

    /// Element-wise encryption. Any failing element fails the whole call.
    pub async fn encrypt_fields(&self, plaintexts: &[String]) -> Result<Vec<String>, EncryptionError> {
        let mut encrypted = Vec::with_capacity(plaintexts.len());
        for (index, plaintext) in plaintexts.iter().enumerate() {
            let value = self.encrypt_field(plaintext).await.map_err(|err| {
                EncryptionError::new(format!("array element {index}: {}", err.0))
            })?;
            encrypted.push(value);
        }
        Ok(encrypted)
    }

    pub async fn decrypt_fields(&self, ciphertexts: &[String]) -> Result<Vec<String>, EncryptionError> {
        let mut decrypted = Vec::with_capacity(ciphertexts.len());
        for (index, ciphertext) in ciphertexts.iter().enumerate() {
            let value = self.decrypt_field(ciphertext).await.map_err(|err| {
                EncryptionError::new(format!("array element {index}: {}", err.0))
            })?;
            decrypted.push(value);
        }
        Ok(decrypted)
    }
}

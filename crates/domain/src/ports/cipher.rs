use std::collections::BTreeMap;

use thiserror::Error;

use super::BoxFuture;

/// Opaque failure from the envelope-encryption service. Network, permission
/// and key-state problems all collapse into this one kind.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("encryption failed: {0}")]
pub struct EncryptionError(pub String);

impl EncryptionError {
    pub fn new(message: impl Into<String>) -> Self {
        Self(message.into())
    }
}

/// Labels bound to every ciphertext. Decryption must present the same labels.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EncryptionContext {
    labels: BTreeMap<String, String>,
}

impl EncryptionContext {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.labels.insert(name.into(), value.into());
        self
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.labels.get(name).map(String::as_str)
    }

    /// Stable byte form, suitable as AEAD associated data.
    pub fn canonical(&self) -> String {
        self.labels
            .iter()
            .map(|(name, value)| format!("{name}={value}"))
            .collect::<Vec<_>>()
            .join(";")
    }
}

pub trait EnvelopeCipher: Send + Sync {
    fn key_id(&self) -> &str;

    fn encrypt(
        &self,
        plaintext: &[u8],
        context: &EncryptionContext,
    ) -> BoxFuture<'_, Result<Vec<u8>, EncryptionError>>;

    fn decrypt(
        &self,
        ciphertext: &[u8],
        context: &EncryptionContext,
    ) -> BoxFuture<'_, Result<Vec<u8>, EncryptionError>>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_is_sorted_by_label_name() {
        let context = EncryptionContext::new()
            .with("service", "reverie-backend")
            .with("purpose", "phi-encryption");
        assert_eq!(
            context.canonical(),
            "purpose=phi-encryption;service=reverie-backend"
        );
        assert_eq!(context.get("purpose"), Some("phi-encryption"));
        assert_eq!(context.get("tenant"), None);
    }
}

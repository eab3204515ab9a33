use aes_gcm::aead::{Aead, Payload};
use aes_gcm::{Aes256Gcm, KeyInit, Nonce};
use base64::Engine;
use base64::engine::general_purpose::STANDARD as BASE64;
use rand::RngCore;
use rand::rngs::OsRng;
use reverie_domain::ports::BoxFuture;
use reverie_domain::ports::cipher::{EncryptionContext, EncryptionError, EnvelopeCipher};

const BLOB_VERSION: u8 = 1;
const KEY_LEN: usize = 32;
const NONCE_LEN: usize = 12;
const TAG_LEN: usize = 16;
const WRAPPED_KEY_LEN: usize = KEY_LEN + TAG_LEN;
const HEADER_LEN: usize = 1 + NONCE_LEN + WRAPPED_KEY_LEN + NONCE_LEN;

/// Envelope encryption with a locally held master key.
///
/// Each call draws a fresh data key, seals the plaintext with it, then wraps
/// the data key under the master key. The canonical encryption context is
/// bound as associated data on both layers, so a blob only opens under the
/// labels it was sealed with.
///
/// Layout: `version | wrap nonce | wrapped data key | data nonce | ciphertext`.
pub struct LocalEnvelopeCipher {
    key_id: String,
    master: Aes256Gcm,
}

impl LocalEnvelopeCipher {
    pub fn new(key_id: impl Into<String>, master_key: &[u8]) -> Result<Self, EncryptionError> {
        if master_key.len() != KEY_LEN {
            return Err(EncryptionError::new(format!(
                "master key must be {KEY_LEN} bytes, got {}",
                master_key.len()
            )));
        }
        let master = Aes256Gcm::new_from_slice(master_key)
            .map_err(|_| EncryptionError::new("invalid master key"))?;
        Ok(Self {
            key_id: key_id.into(),
            master,
        })
    }

    pub fn from_base64(key_id: impl Into<String>, encoded: &str) -> Result<Self, EncryptionError> {
        let master_key = BASE64
            .decode(encoded.trim())
            .map_err(|err| EncryptionError::new(format!("master key is not base64: {err}")))?;
        Self::new(key_id, &master_key)
    }

    /// Fresh random master key, base64 encoded.
    pub fn generate_master_key() -> String {
        let mut key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut key);
        BASE64.encode(key)
    }

    fn seal(&self, plaintext: &[u8], aad: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        let mut data_key = [0u8; KEY_LEN];
        OsRng.fill_bytes(&mut data_key);
        let data_cipher = Aes256Gcm::new_from_slice(&data_key)
            .map_err(|_| EncryptionError::new("invalid data key"))?;

        let mut wrap_nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut wrap_nonce);
        let wrapped_key = self
            .master
            .encrypt(
                Nonce::from_slice(&wrap_nonce),
                Payload {
                    msg: &data_key,
                    aad,
                },
            )
            .map_err(|_| EncryptionError::new("failed to wrap data key"))?;

        let mut data_nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut data_nonce);
        let ciphertext = data_cipher
            .encrypt(
                Nonce::from_slice(&data_nonce),
                Payload {
                    msg: plaintext,
                    aad,
                },
            )
            .map_err(|_| EncryptionError::new("failed to encrypt payload"))?;

        let mut blob = Vec::with_capacity(HEADER_LEN + ciphertext.len());
        blob.push(BLOB_VERSION);
        blob.extend_from_slice(&wrap_nonce);
        blob.extend_from_slice(&wrapped_key);
        blob.extend_from_slice(&data_nonce);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    fn open(&self, blob: &[u8], aad: &[u8]) -> Result<Vec<u8>, EncryptionError> {
        if blob.len() < HEADER_LEN + TAG_LEN {
            return Err(EncryptionError::new("ciphertext too short"));
        }
        if blob[0] != BLOB_VERSION {
            return Err(EncryptionError::new(format!(
                "unsupported ciphertext version {}",
                blob[0]
            )));
        }
        let (wrap_nonce, rest) = blob[1..].split_at(NONCE_LEN);
        let (wrapped_key, rest) = rest.split_at(WRAPPED_KEY_LEN);
        let (data_nonce, ciphertext) = rest.split_at(NONCE_LEN);

        let data_key = self
            .master
            .decrypt(
                Nonce::from_slice(wrap_nonce),
                Payload {
                    msg: wrapped_key,
                    aad,
                },
            )
            .map_err(|_| EncryptionError::new("failed to unwrap data key"))?;
        let data_cipher = Aes256Gcm::new_from_slice(&data_key)
            .map_err(|_| EncryptionError::new("invalid data key"))?;
        data_cipher
            .decrypt(
                Nonce::from_slice(data_nonce),
                Payload {
                    msg: ciphertext,
                    aad,
                },
            )
            .map_err(|_| EncryptionError::new("failed to decrypt payload"))
    }
}

impl EnvelopeCipher for LocalEnvelopeCipher {
    fn key_id(&self) -> &str {
        &self.key_id
    }

    fn encrypt(
        &self,
        plaintext: &[u8],
        context: &EncryptionContext,
    ) -> BoxFuture<'_, Result<Vec<u8>, EncryptionError>> {
        let result = self.seal(plaintext, context.canonical().as_bytes());
        Box::pin(async move { result })
    }

    fn decrypt(
        &self,
        ciphertext: &[u8],
        context: &EncryptionContext,
    ) -> BoxFuture<'_, Result<Vec<u8>, EncryptionError>> {
        let result = self.open(ciphertext, context.canonical().as_bytes());
        Box::pin(async move { result })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reverie_domain::encryption::phi_context;

    fn cipher() -> LocalEnvelopeCipher {
        LocalEnvelopeCipher::from_base64("local-test", &LocalEnvelopeCipher::generate_master_key())
            .unwrap()
    }

    #[tokio::test]
    async fn round_trip_under_same_context() {
        let cipher = cipher();
        let context = phi_context();
        let blob = cipher.encrypt(b"felt anxious", &context).await.unwrap();
        assert_eq!(blob[0], BLOB_VERSION);
        assert_eq!(blob.len(), HEADER_LEN + "felt anxious".len() + TAG_LEN);
        assert_eq!(cipher.decrypt(&blob, &context).await.unwrap(), b"felt anxious");
    }

    #[tokio::test]
    async fn same_plaintext_encrypts_differently() {
        let cipher = cipher();
        let context = phi_context();
        let a = cipher.encrypt(b"same", &context).await.unwrap();
        let b = cipher.encrypt(b"same", &context).await.unwrap();
        assert_ne!(a, b);
    }

    #[tokio::test]
    async fn context_mismatch_fails() {
        let cipher = cipher();
        let blob = cipher.encrypt(b"secret", &phi_context()).await.unwrap();
        let other = phi_context().with("service", "someone-else");
        assert!(cipher.decrypt(&blob, &other).await.is_err());
    }

    #[tokio::test]
    async fn wrong_master_key_fails() {
        let blob = cipher().encrypt(b"secret", &phi_context()).await.unwrap();
        assert!(cipher().decrypt(&blob, &phi_context()).await.is_err());
    }

    #[tokio::test]
    async fn tampered_or_truncated_blobs_fail() {
        let cipher = cipher();
        let mut blob = cipher.encrypt(b"secret", &phi_context()).await.unwrap();
        assert!(cipher.decrypt(&blob[..HEADER_LEN], &phi_context()).await.is_err());
        let last = blob.len() - 1;
        blob[last] ^= 0x01;
        assert!(cipher.decrypt(&blob, &phi_context()).await.is_err());
    }

    #[test]
    fn rejects_short_master_key() {
        assert!(LocalEnvelopeCipher::new("k", &[0u8; 16]).is_err());
        assert!(LocalEnvelopeCipher::from_base64("k", "not base64!").is_err());
    }
}

#![allow(dead_code)]

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use reverie_domain::DomainResult;
use reverie_domain::encryption::phi_context;
use reverie_domain::journal::JournalEntry;
use reverie_domain::kv::InMemoryKvStore;
use reverie_domain::ports::BoxFuture;
use reverie_domain::ports::cipher::{EncryptionContext, EncryptionError, EnvelopeCipher};
use reverie_domain::ports::journal::JournalRepository;
use reverie_domain::ports::kv::{KvError, KvStore, PutOutcome};

const SEAL: &[u8] = b"sealed:";

/// Reversible stand-in for the envelope service. Counts calls, rejects any
/// context other than the PHI one, and fails on demand.
#[derive(Default)]
pub struct FakeCipher {
    encrypts: AtomicUsize,
    decrypts: AtomicUsize,
    failing: AtomicBool,
    poison: Mutex<Option<String>>,
}

impl FakeCipher {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn encrypt_calls(&self) -> usize {
        self.encrypts.load(Ordering::SeqCst)
    }

    pub fn decrypt_calls(&self) -> usize {
        self.decrypts.load(Ordering::SeqCst)
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Fail only when this exact plaintext is encrypted.
    pub fn poison(&self, plaintext: &str) {
        *self.poison.lock().unwrap() = Some(plaintext.to_string());
    }

    fn check(&self, context: &EncryptionContext) -> Result<(), EncryptionError> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(EncryptionError::new("service unavailable"));
        }
        if *context != phi_context() {
            return Err(EncryptionError::new("context mismatch"));
        }
        Ok(())
    }
}

impl EnvelopeCipher for FakeCipher {
    fn key_id(&self) -> &str {
        "fake-key"
    }

    fn encrypt(
        &self,
        plaintext: &[u8],
        context: &EncryptionContext,
    ) -> BoxFuture<'_, Result<Vec<u8>, EncryptionError>> {
        self.encrypts.fetch_add(1, Ordering::SeqCst);
        let poisoned = self
            .poison
            .lock()
            .unwrap()
            .as_deref()
            .is_some_and(|poison| poison.as_bytes() == plaintext);
        let result = self.check(context).and_then(|_| {
            if poisoned {
                return Err(EncryptionError::new("access denied"));
            }
            let mut sealed = SEAL.to_vec();
            sealed.extend_from_slice(plaintext);
            Ok(sealed)
        });
        Box::pin(async move { result })
    }

    fn decrypt(
        &self,
        ciphertext: &[u8],
        context: &EncryptionContext,
    ) -> BoxFuture<'_, Result<Vec<u8>, EncryptionError>> {
        self.decrypts.fetch_add(1, Ordering::SeqCst);
        let result = self.check(context).and_then(|_| {
            ciphertext
                .strip_prefix(SEAL)
                .map(<[u8]>::to_vec)
                .ok_or_else(|| EncryptionError::new("not a sealed blob"))
        });
        Box::pin(async move { result })
    }
}

#[derive(Default)]
pub struct MemoryJournalRepository {
    entries: Mutex<Vec<JournalEntry>>,
}

impl MemoryJournalRepository {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn len(&self) -> usize {
        self.entries.lock().unwrap().len()
    }

    pub fn stored(&self, entry_id: &str) -> Option<JournalEntry> {
        self.entries
            .lock()
            .unwrap()
            .iter()
            .find(|entry| entry.id == entry_id)
            .cloned()
    }
}

impl JournalRepository for MemoryJournalRepository {
    fn create(&self, entry: &JournalEntry) -> BoxFuture<'_, DomainResult<JournalEntry>> {
        self.entries.lock().unwrap().push(entry.clone());
        let entry = entry.clone();
        Box::pin(async move { Ok(entry) })
    }

    fn get(&self, entry_id: &str) -> BoxFuture<'_, DomainResult<Option<JournalEntry>>> {
        let found = self.stored(entry_id);
        Box::pin(async move { Ok(found) })
    }

    fn list_by_user(&self, user_id: &str) -> BoxFuture<'_, DomainResult<Vec<JournalEntry>>> {
        let entries = self
            .entries
            .lock()
            .unwrap()
            .iter()
            .filter(|entry| entry.user_id == user_id)
            .cloned()
            .collect();
        Box::pin(async move { Ok(entries) })
    }
}

/// Store that is down for every call.
pub struct UnavailableKvStore;

impl KvStore for UnavailableKvStore {
    fn get(&self, _key: &str) -> BoxFuture<'_, Result<Option<String>, KvError>> {
        Box::pin(async { Err(KvError::Unavailable("connection refused".into())) })
    }

    fn put_if_absent(
        &self,
        _key: &str,
        _value: &str,
        _ttl: Duration,
    ) -> BoxFuture<'_, Result<PutOutcome, KvError>> {
        Box::pin(async { Err(KvError::Unavailable("connection refused".into())) })
    }

    fn put(&self, _key: &str, _value: &str, _ttl: Duration) -> BoxFuture<'_, Result<(), KvError>> {
        Box::pin(async { Err(KvError::Unavailable("connection refused".into())) })
    }

    fn delete(&self, _key: &str) -> BoxFuture<'_, Result<(), KvError>> {
        Box::pin(async { Err(KvError::Unavailable("connection refused".into())) })
    }

    fn delete_if_equals(
        &self,
        _key: &str,
        _expected: &str,
    ) -> BoxFuture<'_, Result<bool, KvError>> {
        Box::pin(async { Err(KvError::Unavailable("connection refused".into())) })
    }
}

/// Accepts claims but drops the connection on unconditional writes.
pub struct ClaimOnlyKvStore {
    pub inner: InMemoryKvStore,
}

impl KvStore for ClaimOnlyKvStore {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, KvError>> {
        self.inner.get(key)
    }

    fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<PutOutcome, KvError>> {
        self.inner.put_if_absent(key, value, ttl)
    }

    fn put(&self, _key: &str, _value: &str, _ttl: Duration) -> BoxFuture<'_, Result<(), KvError>> {
        Box::pin(async { Err(KvError::Unavailable("connection reset".into())) })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<(), KvError>> {
        self.inner.delete(key)
    }

    fn delete_if_equals(
        &self,
        key: &str,
        expected: &str,
    ) -> BoxFuture<'_, Result<bool, KvError>> {
        self.inner.delete_if_equals(key, expected)
    }
}

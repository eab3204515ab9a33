use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use crate::clock::{Clock, SystemClock};
use crate::ports::BoxFuture;
use crate::ports::kv::{KvError, KvStore, PutOutcome};

/// Process-local [`KvStore`]. Expiry follows the injected clock, so tests can
/// move time forward without sleeping.
#[derive(Clone)]
pub struct InMemoryKvStore {
    clock: Arc<dyn Clock>,
    inner: Arc<Mutex<HashMap<String, MemoryEntry>>>,
}

#[derive(Clone, Debug)]
struct MemoryEntry {
    value: String,
    expires_at_ms: Option<i64>,
}

impl Default for InMemoryKvStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryKvStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    fn deadline(&self, ttl: Duration) -> Option<i64> {
        if ttl.is_zero() {
            None
        } else {
            Some(self.clock.now_ms() + ttl.as_millis() as i64)
        }
    }

    fn lock(
        &self,
    ) -> Result<std::sync::MutexGuard<'_, HashMap<String, MemoryEntry>>, KvError> {
        self.inner
            .lock()
            .map_err(|_| KvError::Operation("kv store lock poisoned".into()))
    }

    fn is_expired(&self, entry: &MemoryEntry) -> bool {
        match entry.expires_at_ms {
            Some(deadline) => self.clock.now_ms() >= deadline,
            None => false,
        }
    }

    fn get_live(&self, key: &str) -> Result<Option<String>, KvError> {
        let mut guard = self.lock()?;
        if let Some(entry) = guard.get(key) {
            if self.is_expired(entry) {
                guard.remove(key);
                return Ok(None);
            }
            return Ok(Some(entry.value.clone()));
        }
        Ok(None)
    }

    fn sweep_expired(&self, entries: &mut HashMap<String, MemoryEntry>) {
        let now = self.clock.now_ms();
        entries.retain(|_, entry| entry.expires_at_ms.is_none_or(|deadline| now < deadline));
    }

    /// Entries currently held, including expired ones not yet swept.
    pub fn len(&self) -> usize {
        self.inner.lock().map(|guard| guard.len()).unwrap_or_default()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn insert_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> Result<PutOutcome, KvError> {
        let mut guard = self.lock()?;
        if let Some(entry) = guard.get(key) {
            if !self.is_expired(entry) {
                return Ok(PutOutcome::Existing(entry.value.clone()));
            }
        }
        self.sweep_expired(&mut guard);
        guard.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at_ms: self.deadline(ttl),
            },
        );
        Ok(PutOutcome::Stored)
    }

    fn insert(&self, key: &str, value: &str, ttl: Duration) -> Result<(), KvError> {
        let expires_at_ms = self.deadline(ttl);
        let mut guard = self.lock()?;
        self.sweep_expired(&mut guard);
        guard.insert(
            key.to_string(),
            MemoryEntry {
                value: value.to_string(),
                expires_at_ms,
            },
        );
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<(), KvError> {
        self.lock()?.remove(key);
        Ok(())
    }

    fn remove_if_equals(&self, key: &str, expected: &str) -> Result<bool, KvError> {
        let mut guard = self.lock()?;
        if guard.get(key).is_some_and(|entry| entry.value == expected) {
            guard.remove(key);
            return Ok(true);
        }
        Ok(false)
    }
}

impl KvStore for InMemoryKvStore {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, KvError>> {
        let result = self.get_live(key);
        Box::pin(async move { result })
    }

    fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<PutOutcome, KvError>> {
        let result = self.insert_if_absent(key, value, ttl);
        Box::pin(async move { result })
    }

    fn put(&self, key: &str, value: &str, ttl: Duration) -> BoxFuture<'_, Result<(), KvError>> {
        let result = self.insert(key, value, ttl);
        Box::pin(async move { result })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<(), KvError>> {
        let result = self.remove(key);
        Box::pin(async move { result })
    }

    fn delete_if_equals(
        &self,
        key: &str,
        expected: &str,
    ) -> BoxFuture<'_, Result<bool, KvError>> {
        let result = self.remove_if_equals(key, expected);
        Box::pin(async move { result })
    }
}

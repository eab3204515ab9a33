use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::clock::{Clock, SystemClock};
use crate::ports::kv::{KvError, KvStore, PutOutcome};
use crate::util::sha256_hex;

pub const DEFAULT_KEY_PREFIX: &str = "reverie";
const KEY_NAMESPACE: &str = "idemp";
const OUTCOME_METRIC: &str = "idempotency_outcomes_total";

fn count_outcome(outcome: &'static str) {
    metrics::counter!(OUTCOME_METRIC, "outcome" => outcome).increment(1);
}

#[derive(Clone, Debug)]
pub struct IdempotencyConfig {
    /// Lifetime of a record, measured from its creation.
    pub record_ttl: Duration,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            record_ttl: Duration::from_secs(60 * 60 * 24),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum IdempotencyStatus {
    Pending,
    Completed,
    Failed,
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct IdempotencyRecord {
    pub key: String,
    pub user_id: String,
    pub request_hash: String,
    pub status: IdempotencyStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    pub created_at_ms: i64,
    pub expires_at_ms: i64,
}

impl IdempotencyRecord {
    pub fn pending(
        key: impl Into<String>,
        user_id: impl Into<String>,
        request_hash: impl Into<String>,
        created_at_ms: i64,
        ttl: Duration,
    ) -> Self {
        Self {
            key: key.into(),
            user_id: user_id.into(),
            request_hash: request_hash.into(),
            status: IdempotencyStatus::Pending,
            response: None,
            error: None,
            created_at_ms,
            expires_at_ms: created_at_ms + ttl.as_millis() as i64,
        }
    }

    pub fn completed(mut self, response: serde_json::Value) -> Self {
        self.status = IdempotencyStatus::Completed;
        self.response = Some(response);
        self.error = None;
        self
    }

    pub fn failed(mut self, marker: impl Into<String>) -> Self {
        self.status = IdempotencyStatus::Failed;
        self.response = None;
        self.error = Some(marker.into());
        self
    }

    pub fn is_expired(&self, now_ms: i64) -> bool {
        now_ms >= self.expires_at_ms
    }
}

#[derive(Debug, Error)]
pub enum IdempotencyError {
    #[error("request with this idempotency key is already being processed")]
    ConcurrentDuplicate,
    #[error("idempotency key reused for a different request")]
    KeyConflict,
    #[error("idempotency store error: {0}")]
    Store(#[from] KvError),
    #[error("idempotency serialization error: {0}")]
    Serialization(String),
}

/// Fingerprint of one logical request. `discriminator` is the client-supplied
/// idempotency key when present, otherwise the raw request body.
pub fn idempotency_key(user_id: &str, operation: &str, discriminator: &str) -> String {
    sha256_hex(format!("{user_id}:{operation}:{discriminator}").as_bytes())
}

pub fn request_hash(raw_body: &str) -> String {
    sha256_hex(raw_body.as_bytes())
}

/// Runs a unit of work at most once per idempotency key.
///
/// Mutual exclusion comes from the store's conditional insert, never from an
/// in-process lock: two callers racing on the same key both reach
/// `put_if_absent`, exactly one gets `Stored`. Expired and failed records are
/// only removed while they still hold the payload that was read. A crash
/// between claim and completion leaves a `pending` record that blocks the key
/// until it expires.
#[derive(Clone)]
pub struct IdempotencyService {
    store: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    config: IdempotencyConfig,
    prefix: String,
}

impl IdempotencyService {
    pub fn new(store: Arc<dyn KvStore>, config: IdempotencyConfig) -> Self {
        Self {
            store,
            clock: Arc::new(SystemClock),
            config,
            prefix: DEFAULT_KEY_PREFIX.to_string(),
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into();
        self
    }

    pub fn config(&self) -> &IdempotencyConfig {
        &self.config
    }

    pub fn storage_key(&self, key: &str) -> String {
        format!("{}:{KEY_NAMESPACE}:{key}", self.prefix)
    }

    /// Reads a live record. Records past `expires_at_ms` are deleted and
    /// reported as absent, whatever the store's own TTL says.
    pub async fn lookup(&self, key: &str) -> Result<Option<IdempotencyRecord>, IdempotencyError> {
        Ok(self.load(key).await?.map(|(record, _)| record))
    }

    /// Live record together with the exact payload it was read from, so a
    /// later removal can be made conditional on nothing having changed.
    async fn load(
        &self,
        key: &str,
    ) -> Result<Option<(IdempotencyRecord, String)>, IdempotencyError> {
        let storage_key = self.storage_key(key);
        let Some(payload) = self.store.get(&storage_key).await? else {
            return Ok(None);
        };
        let record: IdempotencyRecord = serde_json::from_str(&payload)
            .map_err(|err| IdempotencyError::Serialization(err.to_string()))?;

        if record.is_expired(self.clock.now_ms()) {
            tracing::debug!(key, "idempotency record expired; removing");
            self.release(&storage_key, &payload).await?;
            return Ok(None);
        }
        Ok(Some((record, payload)))
    }

    /// Removes a record this caller observed. If another caller replaced it in
    /// the meantime the newer record stays, and the following claim loses.
    async fn release(&self, storage_key: &str, observed: &str) -> Result<(), IdempotencyError> {
        if !self.store.delete_if_equals(storage_key, observed).await? {
            tracing::debug!(storage_key, "idempotency record changed before removal");
        }
        Ok(())
    }

    pub async fn process<T, E, F, Fut>(
        &self,
        user_id: &str,
        operation: &str,
        raw_body: &str,
        work: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<IdempotencyError> + Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        self.process_with_key(user_id, operation, None, raw_body, work)
            .await
    }

    /// Like [`process`](Self::process), but a client-supplied key replaces the
    /// body as the key discriminator. The body hash is still compared, so a
    /// reused key with a different body is a [`IdempotencyError::KeyConflict`].
    pub async fn process_with_key<T, E, F, Fut>(
        &self,
        user_id: &str,
        operation: &str,
        client_key: Option<&str>,
        raw_body: &str,
        work: F,
    ) -> Result<T, E>
    where
        T: Serialize + DeserializeOwned,
        E: From<IdempotencyError> + Display,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, E>>,
    {
        let key = idempotency_key(user_id, operation, client_key.unwrap_or(raw_body));
        let request_hash = request_hash(raw_body);

        if let Some((existing, payload)) = self.load(&key).await? {
            if existing.request_hash != request_hash {
                tracing::warn!(user_id, operation, "idempotency key reused with different body");
                count_outcome("key_conflict");
                return Err(IdempotencyError::KeyConflict.into());
            }
            match existing.status {
                IdempotencyStatus::Completed => {
                    tracing::debug!(user_id, operation, "replaying completed request");
                    count_outcome("replayed");
                    return Self::replay(existing).map_err(E::from);
                }
                IdempotencyStatus::Pending => {
                    count_outcome("concurrent_duplicate");
                    return Err(IdempotencyError::ConcurrentDuplicate.into());
                }
                IdempotencyStatus::Failed => {
                    tracing::debug!(user_id, operation, "previous attempt failed; retrying");
                    self.release(&self.storage_key(&key), &payload).await?;
                }
            }
        }

        let record = IdempotencyRecord::pending(
            key,
            user_id,
            request_hash,
            self.clock.now_ms(),
            self.config.record_ttl,
        );
        if let Err(err) = self.claim(&record).await {
            if matches!(err, IdempotencyError::ConcurrentDuplicate) {
                count_outcome("concurrent_duplicate");
            }
            return Err(err.into());
        }
        count_outcome("executed");

        match work().await {
            Ok(value) => {
                let response = match serde_json::to_value(&value) {
                    Ok(response) => response,
                    Err(err) => {
                        self.finish(record.failed("error: failed to serialize response"))
                            .await;
                        return Err(IdempotencyError::Serialization(err.to_string()).into());
                    }
                };
                self.finish(record.completed(response)).await;
                Ok(value)
            }
            Err(err) => {
                let marker = format!("error: {err}");
                self.finish(record.failed(marker)).await;
                Err(err)
            }
        }
    }

    fn replay<T: DeserializeOwned>(record: IdempotencyRecord) -> Result<T, IdempotencyError> {
        let response = record.response.ok_or_else(|| {
            IdempotencyError::Serialization("completed record missing response".into())
        })?;
        serde_json::from_value(response)
            .map_err(|err| IdempotencyError::Serialization(err.to_string()))
    }

    async fn claim(&self, record: &IdempotencyRecord) -> Result<(), IdempotencyError> {
        let payload = serde_json::to_string(record)
            .map_err(|err| IdempotencyError::Serialization(err.to_string()))?;
        match self
            .store
            .put_if_absent(
                &self.storage_key(&record.key),
                &payload,
                self.config.record_ttl,
            )
            .await?
        {
            PutOutcome::Stored => Ok(()),
            PutOutcome::Existing(_) => {
                tracing::debug!(user_id = %record.user_id, "lost idempotency claim race");
                Err(IdempotencyError::ConcurrentDuplicate)
            }
        }
    }

    /// Writes the terminal state. Failures are logged only: the caller already
    /// has its result, and a record left `pending` keeps blocking duplicates.
    async fn finish(&self, record: IdempotencyRecord) {
        let remaining_ms = (record.expires_at_ms - self.clock.now_ms()).max(1);
        let ttl = Duration::from_millis(remaining_ms as u64);
        let payload = match serde_json::to_string(&record) {
            Ok(payload) => payload,
            Err(err) => {
                tracing::warn!(error = %err, "failed to serialize idempotency record");
                return;
            }
        };
        if let Err(err) = self
            .store
            .put(&self.storage_key(&record.key), &payload, ttl)
            .await
        {
            tracing::warn!(
                error = %err,
                status = ?record.status,
                "failed to update idempotency record"
            );
        }
    }
}

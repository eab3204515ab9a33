use std::time::Duration;

use thiserror::Error;

use super::BoxFuture;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum KvError {
    #[error("kv store unavailable: {0}")]
    Unavailable(String),
    #[error("kv store operation failed: {0}")]
    Operation(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PutOutcome {
    Stored,
    Existing(String),
}

/// Durable key-value store shared by the idempotency coordinator and the
/// spend ledger. A zero `ttl` means the entry never expires.
pub trait KvStore: Send + Sync {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, KvError>>;

    /// Writes `value` only when no live entry exists under `key`.
    fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<PutOutcome, KvError>>;

    fn put(&self, key: &str, value: &str, ttl: Duration) -> BoxFuture<'_, Result<(), KvError>>;

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<(), KvError>>;

    /// Removes `key` only while it still holds `expected`, as one atomic step.
    /// Returns whether the entry was removed.
    fn delete_if_equals(&self, key: &str, expected: &str)
    -> BoxFuture<'_, Result<bool, KvError>>;
}

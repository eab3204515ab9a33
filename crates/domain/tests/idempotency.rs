mod common;

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use reverie_domain::clock::ManualClock;
use reverie_domain::error::DomainError;
use reverie_domain::idempotency::{
    IdempotencyConfig, IdempotencyRecord, IdempotencyService, IdempotencyStatus, idempotency_key,
    request_hash,
};
use reverie_domain::kv::InMemoryKvStore;
use reverie_domain::ports::BoxFuture;
use reverie_domain::ports::kv::{KvError, KvStore, PutOutcome};
use serde_json::{Value, json};
use tokio::sync::Notify;

use common::{ClaimOnlyKvStore, UnavailableKvStore};

const OP: &str = "POST /v1/journal-entries";

fn service_with_clock(clock: &ManualClock) -> (IdempotencyService, InMemoryKvStore) {
    let store = InMemoryKvStore::with_clock(Arc::new(clock.clone()));
    let service = IdempotencyService::new(
        Arc::new(store.clone()),
        IdempotencyConfig {
            record_ttl: Duration::from_secs(60 * 60),
        },
    )
    .with_clock(Arc::new(clock.clone()));
    (service, store)
}

#[tokio::test]
async fn replay_returns_prior_response_without_rerunning() {
    let clock = ManualClock::new(1_700_000_000_000);
    let (service, _) = service_with_clock(&clock);
    let counter = AtomicUsize::new(0);
    let runs = &counter;

    for _ in 0..3 {
        let result: Result<Value, DomainError> = service
            .process("u1", OP, r#"{"content":"hi"}"#, move || async move {
                let n = runs.fetch_add(1, Ordering::SeqCst);
                Ok(json!({ "run": n }))
            })
            .await;
        assert_eq!(result.unwrap(), json!({ "run": 0 }));
    }
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn concurrent_duplicates_execute_once() {
    let service = IdempotencyService::new(
        Arc::new(InMemoryKvStore::new()),
        IdempotencyConfig::default(),
    );
    let runs = Arc::new(AtomicUsize::new(0));

    let mut handles = Vec::new();
    for _ in 0..8 {
        let service = service.clone();
        let runs = runs.clone();
        handles.push(tokio::spawn(async move {
            let result: Result<Value, DomainError> = service
                .process("u1", OP, r#"{"content":"same"}"#, || async move {
                    runs.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(50)).await;
                    Ok(json!({ "id": "entry_1" }))
                })
                .await;
            result
        }));
    }

    let mut successes = 0;
    for handle in handles {
        match handle.await.unwrap() {
            Ok(value) => {
                assert_eq!(value, json!({ "id": "entry_1" }));
                successes += 1;
            }
            Err(DomainError::ConcurrentDuplicate) => {}
            Err(other) => panic!("unexpected error: {other}"),
        }
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert!(successes >= 1);
}

#[tokio::test]
async fn pending_record_rejects_duplicate() {
    let clock = ManualClock::new(0);
    let (service, _) = service_with_clock(&clock);

    let nested = &service;

    let outer: Result<Value, DomainError> = service
        .process("u1", OP, "{}", move || async move {
            let inner: Result<Value, DomainError> = nested
                .process("u1", OP, "{}", || async { Ok(json!("nested")) })
                .await;
            assert!(matches!(inner, Err(DomainError::ConcurrentDuplicate)));
            Ok(json!("outer"))
        })
        .await;
    assert_eq!(outer.unwrap(), json!("outer"));
}

#[tokio::test]
async fn client_key_reused_with_different_body_conflicts() {
    let clock = ManualClock::new(0);
    let (service, _) = service_with_clock(&clock);
    let counter = AtomicUsize::new(0);
    let runs = &counter;

    let first: Result<Value, DomainError> = service
        .process_with_key("u1", OP, Some("client-key-1"), r#"{"content":"a"}"#, move || async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(json!("a"))
        })
        .await;
    assert!(first.is_ok());

    let second: Result<Value, DomainError> = service
        .process_with_key("u1", OP, Some("client-key-1"), r#"{"content":"b"}"#, move || async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(json!("b"))
        })
        .await;
    assert!(matches!(second, Err(DomainError::KeyConflict)));
    assert_eq!(counter.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn different_users_never_share_records() {
    let clock = ManualClock::new(0);
    let (service, _) = service_with_clock(&clock);

    let a: Value = service
        .process::<_, DomainError, _, _>("alice", OP, "{}", || async { Ok(json!("alice")) })
        .await
        .unwrap();
    let b: Value = service
        .process::<_, DomainError, _, _>("bob", OP, "{}", || async { Ok(json!("bob")) })
        .await
        .unwrap();
    assert_eq!(a, json!("alice"));
    assert_eq!(b, json!("bob"));
}

#[tokio::test]
async fn expired_record_allows_fresh_execution() {
    let clock = ManualClock::new(0);
    let (service, _) = service_with_clock(&clock);
    let counter = AtomicUsize::new(0);
    let runs = &counter;
    let run = move || async move {
        Ok::<_, DomainError>(json!(runs.fetch_add(1, Ordering::SeqCst)))
    };

    assert_eq!(service.process("u1", OP, "{}", run).await.unwrap(), json!(0));
    clock.advance(Duration::from_secs(60 * 60 - 1));
    assert_eq!(service.process("u1", OP, "{}", run).await.unwrap(), json!(0));
    clock.advance(Duration::from_secs(1));
    assert_eq!(service.process("u1", OP, "{}", run).await.unwrap(), json!(1));
}

#[tokio::test]
async fn lookup_deletes_records_past_their_expiry() {
    let clock = ManualClock::new(10_000);
    let (service, store) = service_with_clock(&clock);
    let key = idempotency_key("u1", OP, "{}");
    let stale = IdempotencyRecord::pending(key.clone(), "u1", request_hash("{}"), 0, Duration::from_secs(1));
    // No store TTL: only the record's own expiry can retire it.
    store
        .put(
            &service.storage_key(&key),
            &serde_json::to_string(&stale).unwrap(),
            Duration::ZERO,
        )
        .await
        .unwrap();

    assert_eq!(service.lookup(&key).await.unwrap(), None);
    assert_eq!(store.get(&service.storage_key(&key)).await.unwrap(), None);
}

#[tokio::test]
async fn failed_work_is_reported_unchanged_and_can_be_retried() {
    let clock = ManualClock::new(0);
    let (service, _) = service_with_clock(&clock);

    let failed: Result<Value, DomainError> = service
        .process("u1", OP, "{}", || async {
            Err(DomainError::Validation("boom".into()))
        })
        .await;
    match failed {
        Err(DomainError::Validation(message)) => assert_eq!(message, "boom"),
        other => panic!("unexpected result: {other:?}"),
    }

    let key = idempotency_key("u1", OP, "{}");
    let record = service.lookup(&key).await.unwrap().unwrap();
    assert_eq!(record.status, IdempotencyStatus::Failed);
    assert_eq!(record.error.as_deref(), Some("error: validation failed: boom"));

    let retried: Result<Value, DomainError> = service
        .process("u1", OP, "{}", || async { Ok(json!("second try")) })
        .await;
    assert_eq!(retried.unwrap(), json!("second try"));
    let record = service.lookup(&key).await.unwrap().unwrap();
    assert_eq!(record.status, IdempotencyStatus::Completed);
}

#[tokio::test]
async fn unavailable_store_fails_before_running_work() {
    let service = IdempotencyService::new(Arc::new(UnavailableKvStore), IdempotencyConfig::default());
    let counter = AtomicUsize::new(0);
    let runs = &counter;

    let result: Result<Value, DomainError> = service
        .process("u1", OP, "{}", move || async move {
            runs.fetch_add(1, Ordering::SeqCst);
            Ok(json!(null))
        })
        .await;
    assert!(matches!(result, Err(DomainError::StoreUnavailable(_))));
    assert_eq!(counter.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn lost_completion_write_still_returns_result() {
    let store = ClaimOnlyKvStore {
        inner: InMemoryKvStore::new(),
    };
    let service = IdempotencyService::new(Arc::new(store), IdempotencyConfig::default());

    let first: Result<Value, DomainError> = service
        .process("u1", OP, "{}", || async { Ok(json!("done")) })
        .await;
    assert_eq!(first.unwrap(), json!("done"));

    // The record stayed pending, so the duplicate is held off.
    let second: Result<Value, DomainError> = service
        .process("u1", OP, "{}", || async { Ok(json!("again")) })
        .await;
    assert!(matches!(second, Err(DomainError::ConcurrentDuplicate)));
}

/// Interleaves two callers: every read yields, and the second conditional
/// delete is held back until some caller has claimed the key.
struct InterleavingKvStore {
    inner: InMemoryKvStore,
    removals: AtomicUsize,
    claimed: Notify,
}

impl KvStore for InterleavingKvStore {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, KvError>> {
        let key = key.to_string();
        Box::pin(async move {
            tokio::task::yield_now().await;
            self.inner.get(&key).await
        })
    }

    fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<PutOutcome, KvError>> {
        let (key, value) = (key.to_string(), value.to_string());
        Box::pin(async move {
            tokio::task::yield_now().await;
            let outcome = self.inner.put_if_absent(&key, &value, ttl).await?;
            if outcome == PutOutcome::Stored {
                self.claimed.notify_one();
            }
            Ok(outcome)
        })
    }

    fn put(&self, key: &str, value: &str, ttl: Duration) -> BoxFuture<'_, Result<(), KvError>> {
        self.inner.put(key, value, ttl)
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<(), KvError>> {
        self.inner.delete(key)
    }

    fn delete_if_equals(
        &self,
        key: &str,
        expected: &str,
    ) -> BoxFuture<'_, Result<bool, KvError>> {
        let (key, expected) = (key.to_string(), expected.to_string());
        Box::pin(async move {
            let turn = self.removals.fetch_add(1, Ordering::SeqCst);
            tokio::task::yield_now().await;
            if turn == 1 {
                self.claimed.notified().await;
            }
            self.inner.delete_if_equals(&key, &expected).await
        })
    }
}

/// Seeds `record`, then races two identical requests over it.
async fn race_over_seeded_record(
    clock: &ManualClock,
    record: IdempotencyRecord,
) -> (Result<Value, DomainError>, Result<Value, DomainError>, usize) {
    let inner = InMemoryKvStore::with_clock(Arc::new(clock.clone()));
    let store = Arc::new(InterleavingKvStore {
        inner: inner.clone(),
        removals: AtomicUsize::new(0),
        claimed: Notify::new(),
    });
    let service = IdempotencyService::new(
        store,
        IdempotencyConfig {
            record_ttl: Duration::from_secs(60 * 60),
        },
    )
    .with_clock(Arc::new(clock.clone()));
    inner
        .put(
            &service.storage_key(&record.key),
            &serde_json::to_string(&record).unwrap(),
            Duration::ZERO,
        )
        .await
        .unwrap();

    let counter = AtomicUsize::new(0);
    let runs = &counter;
    let work = move || async move {
        runs.fetch_add(1, Ordering::SeqCst);
        tokio::task::yield_now().await;
        Ok::<_, DomainError>(json!("done"))
    };
    let (a, b) = tokio::join!(
        service.process("u1", OP, "{}", work),
        service.process("u1", OP, "{}", work)
    );
    (a, b, counter.load(Ordering::SeqCst))
}

fn assert_single_execution(
    a: Result<Value, DomainError>,
    b: Result<Value, DomainError>,
    runs: usize,
) {
    assert_eq!(runs, 1);
    let (winner, loser) = if a.is_ok() { (a, b) } else { (b, a) };
    assert_eq!(winner.unwrap(), json!("done"));
    assert!(matches!(loser, Err(DomainError::ConcurrentDuplicate)));
}

#[tokio::test]
async fn racing_retries_of_a_failed_request_execute_once() {
    let clock = ManualClock::new(1_000);
    let failed = IdempotencyRecord::pending(
        idempotency_key("u1", OP, "{}"),
        "u1",
        request_hash("{}"),
        0,
        Duration::from_secs(60 * 60),
    )
    .failed("error: validation failed: boom");

    let (a, b, runs) = race_over_seeded_record(&clock, failed).await;
    assert_single_execution(a, b, runs);
}

#[tokio::test]
async fn racing_requests_over_an_expired_record_execute_once() {
    let clock = ManualClock::new(10_000);
    let stale = IdempotencyRecord::pending(
        idempotency_key("u1", OP, "{}"),
        "u1",
        request_hash("{}"),
        0,
        Duration::from_secs(1),
    );

    let (a, b, runs) = race_over_seeded_record(&clock, stale).await;
    assert_single_execution(a, b, runs);
}

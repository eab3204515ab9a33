use std::time::Duration;

use redis::AsyncCommands;
use redis::aio::ConnectionManager;
use reverie_domain::ports::BoxFuture;
use reverie_domain::ports::kv::{KvError, KvStore, PutOutcome};

const PUT_RETRY_LIMIT: usize = 2;

const DELETE_IF_EQUALS_SCRIPT: &str = r#"
if redis.call('GET', KEYS[1]) == ARGV[1] then
    return redis.call('DEL', KEYS[1])
end
return 0
"#;

/// Redis-backed [`KvStore`]. Keys arrive fully namespaced from the services;
/// expiry is delegated to Redis `PX`.
#[derive(Clone)]
pub struct RedisKvStore {
    manager: ConnectionManager,
    compare_delete: redis::Script,
}

impl RedisKvStore {
    pub async fn connect(redis_url: &str) -> Result<Self, KvError> {
        let client =
            redis::Client::open(redis_url).map_err(|err| KvError::Unavailable(err.to_string()))?;
        let manager = ConnectionManager::new(client)
            .await
            .map_err(|err| KvError::Unavailable(err.to_string()))?;
        Ok(Self {
            manager,
            compare_delete: redis::Script::new(DELETE_IF_EQUALS_SCRIPT),
        })
    }

    fn set_command(key: &str, value: &str, ttl: Duration) -> redis::Cmd {
        let mut cmd = redis::cmd("SET");
        cmd.arg(key).arg(value);
        if !ttl.is_zero() {
            cmd.arg("PX").arg(ttl_ms(ttl));
        }
        cmd
    }
}

fn ttl_ms(ttl: Duration) -> u64 {
    let ms = ttl.as_millis() as u64;
    if ms == 0 { 1 } else { ms }
}

fn map_redis_error(err: redis::RedisError) -> KvError {
    if err.is_io_error() || err.is_connection_dropped() || err.is_connection_refusal() || err.is_timeout() {
        KvError::Unavailable(err.to_string())
    } else {
        KvError::Operation(err.to_string())
    }
}

impl KvStore for RedisKvStore {
    fn get(&self, key: &str) -> BoxFuture<'_, Result<Option<String>, KvError>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            conn.get(key).await.map_err(map_redis_error)
        })
    }

    fn put_if_absent(
        &self,
        key: &str,
        value: &str,
        ttl: Duration,
    ) -> BoxFuture<'_, Result<PutOutcome, KvError>> {
        let key = key.to_string();
        let value = value.to_string();
        Box::pin(async move {
            for attempt in 0..PUT_RETRY_LIMIT {
                let mut conn = self.manager.clone();
                let mut cmd = Self::set_command(&key, &value, ttl);
                cmd.arg("NX");
                let result: Option<String> =
                    cmd.query_async(&mut conn).await.map_err(map_redis_error)?;
                if result.is_some() {
                    return Ok(PutOutcome::Stored);
                }

                // Lost the race; the winner may already have expired.
                let existing: Option<String> = conn.get(&key).await.map_err(map_redis_error)?;
                if let Some(existing) = existing {
                    return Ok(PutOutcome::Existing(existing));
                }

                if attempt + 1 >= PUT_RETRY_LIMIT {
                    break;
                }
            }

            Err(KvError::Operation(format!("failed to claim key {key}")))
        })
    }

    fn put(&self, key: &str, value: &str, ttl: Duration) -> BoxFuture<'_, Result<(), KvError>> {
        let cmd = Self::set_command(key, value, ttl);
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let _: () = cmd.query_async(&mut conn).await.map_err(map_redis_error)?;
            Ok(())
        })
    }

    fn delete(&self, key: &str) -> BoxFuture<'_, Result<(), KvError>> {
        let key = key.to_string();
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let _: i64 = conn.del(key).await.map_err(map_redis_error)?;
            Ok(())
        })
    }

    fn delete_if_equals(
        &self,
        key: &str,
        expected: &str,
    ) -> BoxFuture<'_, Result<bool, KvError>> {
        let mut invocation = self.compare_delete.key(key);
        invocation.arg(expected);
        Box::pin(async move {
            let mut conn = self.manager.clone();
            let removed: i64 = invocation
                .invoke_async(&mut conn)
                .await
                .map_err(map_redis_error)?;
            Ok(removed == 1)
        })
    }
}

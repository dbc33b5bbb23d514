// Redis-backed KV gateway

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use redis::AsyncCommands;
use redis::aio::ConnectionManager;

use super::{KvError, KvResult, KvStore};

/// Retries per operation for transient failures.
const RETRY_BUDGET: u32 = 2;

/// Backoff between retries.
const RETRY_BACKOFF_MS: u64 = 50;

/// Deadline for a single Redis round-trip. Expiry surfaces as a transient
/// failure so callers can retry or degrade.
const CALL_DEADLINE_MS: u64 = 2_000;

pub struct RedisKv {
    conn: ConnectionManager,
}

impl RedisKv {
    pub fn new(conn: ConnectionManager) -> Self {
        Self { conn }
    }

    /// Run one Redis command with the per-call deadline applied.
    async fn run<T, F, Fut>(&self, op: F) -> KvResult<T>
    where
        F: Fn(ConnectionManager) -> Fut,
        Fut: Future<Output = Result<T, redis::RedisError>>,
    {
        let mut last_err = None;

        for attempt in 0..=RETRY_BUDGET {
            if attempt > 0 {
                tokio::time::sleep(Duration::from_millis(RETRY_BACKOFF_MS)).await;
            }

            let call = op(self.conn.clone());
            match tokio::time::timeout(Duration::from_millis(CALL_DEADLINE_MS), call).await {
                Ok(Ok(value)) => return Ok(value),
                Ok(Err(err)) => {
                    tracing::debug!(attempt, error = %err, "redis call failed");
                    last_err = Some(err.to_string());
                }
                Err(_) => {
                    tracing::debug!(attempt, "redis call deadline exceeded");
                    last_err = Some("deadline exceeded".to_string());
                }
            }
        }

        Err(KvError::Transient(
            last_err.unwrap_or_else(|| "unknown".to_string()),
        ))
    }
}

#[async_trait]
impl KvStore for RedisKv {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        self.run(|mut conn| {
            let key = key.to_string();
            async move { conn.get(key).await }
        })
        .await
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()> {
        self.run(|mut conn| {
            let key = key.to_string();
            let value = value.to_string();
            async move { conn.set_ex(key, value, ttl.as_secs().max(1)).await }
        })
        .await
    }

    async fn get_del(&self, key: &str) -> KvResult<Option<String>> {
        self.run(|mut conn| {
            let key = key.to_string();
            async move {
                redis::cmd("GETDEL")
                    .arg(&key)
                    .query_async::<Option<String>>(&mut conn)
                    .await
            }
        })
        .await
    }

    async fn delete(&self, keys: &[String]) -> KvResult<u64> {
        if keys.is_empty() {
            return Ok(0);
        }
        self.run(|mut conn| {
            let keys = keys.to_vec();
            async move { conn.del(keys).await }
        })
        .await
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> KvResult<i64> {
        // INCR then EXPIRE-on-create, the same fixed-window pattern the rest
        // of the platform uses. The count is authoritative; the expiry is set
        // exactly once, when this increment created the key.
        let count: i64 = self
            .run(|mut conn| {
                let key = key.to_string();
                async move { conn.incr(key, 1).await }
            })
            .await?;

        if count == 1 {
            self.run(|mut conn| {
                let key = key.to_string();
                async move { conn.expire::<_, ()>(key, ttl.as_secs().max(1) as i64).await }
            })
            .await?;
        }

        Ok(count)
    }

    async fn ttl(&self, key: &str) -> KvResult<Option<Duration>> {
        let ttl: i64 = self
            .run(|mut conn| {
                let key = key.to_string();
                async move { conn.ttl(key).await }
            })
            .await?;

        // -2 = missing key, -1 = no expiry
        if ttl < 0 {
            Ok(None)
        } else {
            Ok(Some(Duration::from_secs(ttl as u64)))
        }
    }

    async fn exists(&self, key: &str) -> KvResult<bool> {
        self.run(|mut conn| {
            let key = key.to_string();
            async move { conn.exists(key).await }
        })
        .await
    }

    async fn set_add(&self, key: &str, member: &str) -> KvResult<()> {
        self.run(|mut conn| {
            let key = key.to_string();
            let member = member.to_string();
            async move { conn.sadd(key, member).await }
        })
        .await
    }

    async fn set_remove(&self, key: &str, member: &str) -> KvResult<()> {
        self.run(|mut conn| {
            let key = key.to_string();
            let member = member.to_string();
            async move { conn.srem(key, member).await }
        })
        .await
    }

    async fn set_members(&self, key: &str) -> KvResult<Vec<String>> {
        self.run(|mut conn| {
            let key = key.to_string();
            async move { conn.smembers(key).await }
        })
        .await
    }

    async fn multi_get(&self, keys: &[String]) -> KvResult<Vec<Option<String>>> {
        if keys.is_empty() {
            return Ok(Vec::new());
        }
        if keys.len() == 1 {
            // redis MGET with one key still works, but `get` avoids the
            // Vec-reply special case in the driver.
            return Ok(vec![self.get(&keys[0]).await?]);
        }
        self.run(|mut conn| {
            let keys = keys.to_vec();
            async move { conn.mget(keys).await }
        })
        .await
    }

    async fn pexpire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        self.run(|mut conn| {
            let key = key.to_string();
            async move {
                redis::cmd("PEXPIRE")
                    .arg(&key)
                    .arg(ttl.as_millis() as i64)
                    .query_async::<i64>(&mut conn)
                    .await
            }
        })
        .await
        .map(|n| n == 1)
    }

    async fn scan_keys(&self, pattern: &str) -> KvResult<Vec<String>> {
        self.run(|mut conn| {
            let pattern = pattern.to_string();
            async move {
                let mut cursor: u64 = 0;
                let mut keys = Vec::new();
                loop {
                    let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                        .arg(cursor)
                        .arg("MATCH")
                        .arg(&pattern)
                        .arg("COUNT")
                        .arg(200)
                        .query_async(&mut conn)
                        .await?;
                    keys.extend(batch);
                    cursor = next;
                    if cursor == 0 {
                        break;
                    }
                }
                Ok(keys)
            }
        })
        .await
    }
}

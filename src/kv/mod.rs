// ============================================
// KV gateway
// ============================================
//
// Minimal interface over the Redis-like store that holds all cross-node
// shared state: sessions, connection tickets, rate-limit buckets and
// timeouts. Every component consumes this trait, never a concrete client,
// so the whole core can run against the in-memory fake in tests.

use std::time::Duration;

use async_trait::async_trait;

pub mod memory;
pub mod redis;

pub use self::memory::MemoryKv;
pub use self::redis::RedisKv;

#[derive(Debug, thiserror::Error)]
pub enum KvError {
    #[error("key not found")]
    NotFound,
    #[error("transient store failure: {0}")]
    Transient(String),
}

pub type KvResult<T> = Result<T, KvError>;

/// Async key-value operations. All TTLs are absolute durations from now.
/// Implementations must be safe to call from concurrent tasks.
#[async_trait]
pub trait KvStore: Send + Sync {
    async fn get(&self, key: &str) -> KvResult<Option<String>>;

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()>;

    /// Atomic get-and-delete. Returns the value only if the key existed,
    /// and guarantees no second caller can observe it.
    async fn get_del(&self, key: &str) -> KvResult<Option<String>>;

    /// Delete any number of keys; returns how many existed.
    async fn delete(&self, keys: &[String]) -> KvResult<u64>;

    /// Increment a counter, creating it with `ttl` if it does not exist.
    /// An existing key keeps its original expiry.
    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> KvResult<i64>;

    /// Remaining time-to-live, `None` if the key is missing or has no expiry.
    async fn ttl(&self, key: &str) -> KvResult<Option<Duration>>;

    async fn exists(&self, key: &str) -> KvResult<bool>;

    async fn set_add(&self, key: &str, member: &str) -> KvResult<()>;

    async fn set_remove(&self, key: &str, member: &str) -> KvResult<()>;

    async fn set_members(&self, key: &str) -> KvResult<Vec<String>>;

    /// Batch get, preserving input order. Missing keys yield `None`.
    async fn multi_get(&self, keys: &[String]) -> KvResult<Vec<Option<String>>>;

    /// Reset a key's expiry. Returns false if the key does not exist.
    async fn pexpire(&self, key: &str, ttl: Duration) -> KvResult<bool>;

    /// Enumerate keys matching a glob pattern. Admin/metrics views only —
    /// never called on the admission path.
    async fn scan_keys(&self, pattern: &str) -> KvResult<Vec<String>>;
}

// ============================================
// Key naming
// ============================================

pub fn session_key(ticket: &str) -> String {
    format!("session:{}", ticket)
}

pub fn user_sessions_key(user_id: &str) -> String {
    format!("user_sessions:{}", user_id)
}

pub fn connection_ticket_key(ticket_id: &str) -> String {
    format!("conn_ticket:{}", ticket_id)
}

pub fn rate_limit_bucket_key(partition: &str, policy: &str, period_secs: u64) -> String {
    format!("rl:bucket:{}:{}:{}", partition, policy, period_secs)
}

pub fn rate_limit_timeout_key(partition: &str, policy: &str) -> String {
    format!("rl:timeout:{}:{}", partition, policy)
}

// In-memory KV store
//
// Implements the same contract as the Redis gateway over process-local maps,
// with expiry driven by the shared clock. Used by tests and by single-node
// development runs without a Redis instance.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::utils::Clock;

use super::{KvResult, KvStore};

struct Entry {
    value: String,
    expires_at: Option<DateTime<Utc>>,
}

struct Inner {
    strings: HashMap<String, Entry>,
    sets: HashMap<String, HashSet<String>>,
}

pub struct MemoryKv {
    inner: Mutex<Inner>,
    clock: Arc<dyn Clock>,
}

impl MemoryKv {
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        Self {
            inner: Mutex::new(Inner {
                strings: HashMap::new(),
                sets: HashMap::new(),
            }),
            clock,
        }
    }

    fn live<'a>(&self, inner: &'a Inner, key: &str, now: DateTime<Utc>) -> Option<&'a Entry> {
        inner
            .strings
            .get(key)
            .filter(|e| e.expires_at.is_none_or(|at| at > now))
    }

    fn purge(&self, inner: &mut Inner, now: DateTime<Utc>) {
        inner
            .strings
            .retain(|_, e| e.expires_at.is_none_or(|at| at > now));
    }

    fn expiry(&self, now: DateTime<Utc>, ttl: Duration) -> DateTime<Utc> {
        now + chrono::Duration::milliseconds(ttl.as_millis() as i64)
    }
}

#[async_trait]
impl KvStore for MemoryKv {
    async fn get(&self, key: &str) -> KvResult<Option<String>> {
        let now = self.clock.now_utc();
        let inner = self.inner.lock().await;
        Ok(self.live(&inner, key, now).map(|e| e.value.clone()))
    }

    async fn set_with_ttl(&self, key: &str, value: &str, ttl: Duration) -> KvResult<()> {
        let now = self.clock.now_utc();
        let mut inner = self.inner.lock().await;
        inner.strings.insert(
            key.to_string(),
            Entry {
                value: value.to_string(),
                expires_at: Some(self.expiry(now, ttl)),
            },
        );
        Ok(())
    }

    async fn get_del(&self, key: &str) -> KvResult<Option<String>> {
        let now = self.clock.now_utc();
        let mut inner = self.inner.lock().await;
        let live = self.live(&inner, key, now).is_some();
        let removed = inner.strings.remove(key);
        Ok(if live {
            removed.map(|e| e.value)
        } else {
            None
        })
    }

    async fn delete(&self, keys: &[String]) -> KvResult<u64> {
        let now = self.clock.now_utc();
        let mut inner = self.inner.lock().await;
        let mut removed = 0;
        for key in keys {
            let live = self.live(&inner, key, now).is_some();
            if inner.strings.remove(key).is_some() && live {
                removed += 1;
            }
            if inner.sets.remove(key).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }

    async fn incr_with_expiry(&self, key: &str, ttl: Duration) -> KvResult<i64> {
        let now = self.clock.now_utc();
        let mut inner = self.inner.lock().await;

        match self.live(&inner, key, now) {
            Some(entry) => {
                let count = entry.value.parse::<i64>().unwrap_or(0) + 1;
                let expires_at = entry.expires_at;
                inner.strings.insert(
                    key.to_string(),
                    Entry {
                        value: count.to_string(),
                        expires_at,
                    },
                );
                Ok(count)
            }
            None => {
                inner.strings.insert(
                    key.to_string(),
                    Entry {
                        value: "1".to_string(),
                        expires_at: Some(self.expiry(now, ttl)),
                    },
                );
                Ok(1)
            }
        }
    }

    async fn ttl(&self, key: &str) -> KvResult<Option<Duration>> {
        let now = self.clock.now_utc();
        let inner = self.inner.lock().await;
        Ok(self
            .live(&inner, key, now)
            .and_then(|e| e.expires_at)
            .map(|at| {
                let millis = (at - now).num_milliseconds().max(0);
                Duration::from_millis(millis as u64)
            }))
    }

    async fn exists(&self, key: &str) -> KvResult<bool> {
        let now = self.clock.now_utc();
        let inner = self.inner.lock().await;
        Ok(self.live(&inner, key, now).is_some() || inner.sets.contains_key(key))
    }

    async fn set_add(&self, key: &str, member: &str) -> KvResult<()> {
        let mut inner = self.inner.lock().await;
        inner
            .sets
            .entry(key.to_string())
            .or_default()
            .insert(member.to_string());
        Ok(())
    }

    async fn set_remove(&self, key: &str, member: &str) -> KvResult<()> {
        let mut inner = self.inner.lock().await;
        if let Some(set) = inner.sets.get_mut(key) {
            set.remove(member);
            if set.is_empty() {
                inner.sets.remove(key);
            }
        }
        Ok(())
    }

    async fn set_members(&self, key: &str) -> KvResult<Vec<String>> {
        let inner = self.inner.lock().await;
        Ok(inner
            .sets
            .get(key)
            .map(|s| s.iter().cloned().collect())
            .unwrap_or_default())
    }

    async fn multi_get(&self, keys: &[String]) -> KvResult<Vec<Option<String>>> {
        let now = self.clock.now_utc();
        let inner = self.inner.lock().await;
        Ok(keys
            .iter()
            .map(|k| self.live(&inner, k, now).map(|e| e.value.clone()))
            .collect())
    }

    async fn pexpire(&self, key: &str, ttl: Duration) -> KvResult<bool> {
        let now = self.clock.now_utc();
        let mut inner = self.inner.lock().await;
        if self.live(&inner, key, now).is_none() {
            return Ok(false);
        }
        let expires_at = Some(self.expiry(now, ttl));
        if let Some(entry) = inner.strings.get_mut(key) {
            entry.expires_at = expires_at;
        }
        Ok(true)
    }

    async fn scan_keys(&self, pattern: &str) -> KvResult<Vec<String>> {
        let now = self.clock.now_utc();
        let mut inner = self.inner.lock().await;
        self.purge(&mut inner, now);

        let prefix = pattern.strip_suffix('*').unwrap_or(pattern);
        let mut keys: Vec<String> = inner
            .strings
            .keys()
            .chain(inner.sets.keys())
            .filter(|k| {
                if pattern.ends_with('*') {
                    k.starts_with(prefix)
                } else {
                    k.as_str() == pattern
                }
            })
            .cloned()
            .collect();
        keys.sort();
        Ok(keys)
    }
}

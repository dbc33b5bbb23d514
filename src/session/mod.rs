// ============================================
// Session store
// ============================================
//
// Opaque bearer tickets backed by the KV store. A session record lives at
// `session:{ticket}` with a TTL equal to the session lifetime; a per-user
// set at `user_sessions:{user}` indexes every live ticket so the cap and
// revoke-all can be enforced without scanning.
//
// Nothing here is cached in memory: every node validates against the store,
// which is what makes tickets revocable across the fleet.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::kv::{KvStore, session_key, user_sessions_key};
use crate::utils::{Clock, generate_session_ticket};

pub mod ticket;

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Full lifetime granted at creation and on each sliding refresh.
    pub lifetime: Duration,
    /// Sessions within this window of expiry are refreshed on validation.
    pub sliding_window: Duration,
    /// Live-session cap per user; the oldest is evicted beyond this.
    pub cap_per_user: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            lifetime: Duration::from_secs(86_400),
            sliding_window: Duration::from_secs(3_600),
            cap_per_user: 5,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionRecord {
    pub ticket: String,
    pub user_id: String,
    pub provider: String,
    pub roles: Vec<String>,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl SessionRecord {
    pub fn has_role(&self, role: &str) -> bool {
        self.is_admin || self.roles.iter().any(|r| r == role)
    }
}

pub struct SessionStore {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    config: SessionConfig,
}

impl SessionStore {
    pub fn new(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>, config: SessionConfig) -> Self {
        Self { kv, clock, config }
    }

    /// Create a fresh session for a resolved identity. Enforces the per-user
    /// cap after the write: with the new ticket counted, any overflow is
    /// evicted oldest-first by `created_at` (ties by ticket byte order).
    pub async fn create(
        &self,
        user_id: &str,
        provider: &str,
        roles: Vec<String>,
        is_admin: bool,
    ) -> Result<SessionRecord, GatewayError> {
        let now = self.clock.now_utc();
        let record = SessionRecord {
            ticket: generate_session_ticket(),
            user_id: user_id.to_string(),
            provider: provider.to_string(),
            roles,
            is_admin,
            created_at: now,
            expires_at: now + chrono::Duration::from_std(self.config.lifetime).unwrap_or_default(),
        };

        self.write_record(&record, self.config.lifetime).await?;
        self.kv
            .set_add(&user_sessions_key(user_id), &record.ticket)
            .await?;

        self.enforce_cap(user_id).await?;

        tracing::debug!(user_id, "session created");
        Ok(record)
    }

    /// Validate a ticket, sliding the expiry forward when it is close enough
    /// to lapsing. Expired or unknown tickets return `None` and any remnants
    /// are removed.
    pub async fn validate(&self, ticket: &str) -> Result<Option<SessionRecord>, GatewayError> {
        let Some(raw) = self.kv.get(&session_key(ticket)).await? else {
            return Ok(None);
        };

        let Ok(mut record) = serde_json::from_str::<SessionRecord>(&raw) else {
            // Unparseable record: drop it rather than serving garbage.
            self.remove(ticket, None).await?;
            return Ok(None);
        };

        let now = self.clock.now_utc();
        if now >= record.expires_at {
            self.remove(ticket, Some(&record.user_id)).await?;
            return Ok(None);
        }

        let sliding =
            chrono::Duration::from_std(self.config.sliding_window).unwrap_or_default();
        if record.expires_at - now < sliding {
            record.expires_at =
                now + chrono::Duration::from_std(self.config.lifetime).unwrap_or_default();
            self.write_record(&record, self.config.lifetime).await?;
        }

        Ok(Some(record))
    }

    /// Destroy one session. Returns whether the ticket existed.
    pub async fn invalidate(&self, ticket: &str) -> Result<bool, GatewayError> {
        let user_id = self
            .kv
            .get(&session_key(ticket))
            .await?
            .and_then(|raw| serde_json::from_str::<SessionRecord>(&raw).ok())
            .map(|r| r.user_id);

        let existed = self.kv.delete(&[session_key(ticket)]).await? > 0;
        if let Some(user_id) = user_id {
            self.kv
                .set_remove(&user_sessions_key(&user_id), ticket)
                .await?;
        }
        Ok(existed)
    }

    /// Destroy every session a user holds. Returns how many were removed.
    pub async fn invalidate_all(&self, user_id: &str) -> Result<u64, GatewayError> {
        let tickets = self.kv.set_members(&user_sessions_key(user_id)).await?;
        let keys: Vec<String> = tickets.iter().map(|t| session_key(t)).collect();
        let removed = self.kv.delete(&keys).await?;
        self.kv.delete(&[user_sessions_key(user_id)]).await?;
        tracing::info!(user_id, removed, "revoked all sessions");
        Ok(removed)
    }

    /// Page through a user's live sessions, newest first.
    pub async fn list(
        &self,
        user_id: &str,
        skip: usize,
        take: usize,
    ) -> Result<Vec<SessionRecord>, GatewayError> {
        let mut records = self.load_user_records(user_id).await?;
        records.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.ticket.cmp(&b.ticket))
        });
        Ok(records.into_iter().skip(skip).take(take).collect())
    }

    pub async fn count(&self, user_id: &str) -> Result<usize, GatewayError> {
        Ok(self.load_user_records(user_id).await?.len())
    }

    async fn write_record(
        &self,
        record: &SessionRecord,
        ttl: Duration,
    ) -> Result<(), GatewayError> {
        let json = serde_json::to_string(record)
            .map_err(|e| GatewayError::TransientFailure(e.to_string()))?;
        self.kv
            .set_with_ttl(&session_key(&record.ticket), &json, ttl)
            .await?;
        Ok(())
    }

    async fn remove(&self, ticket: &str, user_id: Option<&str>) -> Result<(), GatewayError> {
        self.kv.delete(&[session_key(ticket)]).await?;
        if let Some(user_id) = user_id {
            self.kv
                .set_remove(&user_sessions_key(user_id), ticket)
                .await?;
        }
        Ok(())
    }

    /// Load every live record for a user in one multi-get, pruning set
    /// entries whose record has already lapsed in the store.
    async fn load_user_records(&self, user_id: &str) -> Result<Vec<SessionRecord>, GatewayError> {
        let tickets = self.kv.set_members(&user_sessions_key(user_id)).await?;
        if tickets.is_empty() {
            return Ok(Vec::new());
        }

        let keys: Vec<String> = tickets.iter().map(|t| session_key(t)).collect();
        let values = self.kv.multi_get(&keys).await?;

        let mut records = Vec::with_capacity(tickets.len());
        for (ticket, value) in tickets.iter().zip(values) {
            match value.and_then(|raw| serde_json::from_str::<SessionRecord>(&raw).ok()) {
                Some(record) => records.push(record),
                None => {
                    self.kv
                        .set_remove(&user_sessions_key(user_id), ticket)
                        .await?;
                }
            }
        }
        Ok(records)
    }

    async fn enforce_cap(&self, user_id: &str) -> Result<(), GatewayError> {
        let mut records = self.load_user_records(user_id).await?;
        if records.len() <= self.config.cap_per_user {
            return Ok(());
        }

        // Oldest first; ties broken by ticket byte order.
        records.sort_by(|a, b| {
            a.created_at
                .cmp(&b.created_at)
                .then_with(|| a.ticket.cmp(&b.ticket))
        });

        let overflow = records.len() - self.config.cap_per_user;
        let evicted: Vec<&SessionRecord> = records.iter().take(overflow).collect();

        let keys: Vec<String> = evicted.iter().map(|r| session_key(&r.ticket)).collect();
        self.kv.delete(&keys).await?;
        for record in &evicted {
            self.kv
                .set_remove(&user_sessions_key(user_id), &record.ticket)
                .await?;
        }

        tracing::debug!(user_id, evicted = overflow, "session cap enforced");
        Ok(())
    }
}

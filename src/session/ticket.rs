// ============================================
// Connection tickets
// ============================================
//
// Short-lived, single-use tokens that let a client authenticate a hub
// upgrade without putting the long-lived bearer in a URL, where it would
// leak into logs, Referer headers, browser history, and proxy/CDN logs.
//
// Redemption is an atomic get-and-delete: once a ticket has been read it is
// gone, so a replayed `?ticket=` never connects twice.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::GatewayError;
use crate::kv::{KvStore, connection_ticket_key};
use crate::utils::{Clock, generate_connection_ticket_id};

/// Payload stored behind a ticket id.
#[derive(Debug, Serialize, Deserialize)]
struct TicketPayload {
    session_ticket: String,
    issued_at: DateTime<Utc>,
}

pub struct ConnectionTicketService {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    ttl: Duration,
}

impl ConnectionTicketService {
    pub fn new(kv: Arc<dyn KvStore>, clock: Arc<dyn Clock>, ttl: Duration) -> Self {
        Self { kv, clock, ttl }
    }

    /// Issue a ticket bound to an already-validated session ticket.
    pub async fn issue(&self, session_ticket: &str) -> Result<String, GatewayError> {
        let id = generate_connection_ticket_id();
        let payload = TicketPayload {
            session_ticket: session_ticket.to_string(),
            issued_at: self.clock.now_utc(),
        };
        let json = serde_json::to_string(&payload)
            .map_err(|e| GatewayError::TransientFailure(e.to_string()))?;

        self.kv
            .set_with_ttl(&connection_ticket_key(&id), &json, self.ttl)
            .await?;
        Ok(id)
    }

    /// Redeem a ticket exactly once. Returns the bound session ticket, which
    /// the caller must still validate against the session store.
    pub async fn redeem(&self, ticket_id: &str) -> Result<String, GatewayError> {
        let raw = self
            .kv
            .get_del(&connection_ticket_key(ticket_id))
            .await?
            .ok_or(GatewayError::Unauthenticated)?;

        let payload: TicketPayload =
            serde_json::from_str(&raw).map_err(|_| GatewayError::Unauthenticated)?;
        Ok(payload.session_ticket)
    }
}

use axum::{
    extract::{Query, State, WebSocketUpgrade},
    http::{HeaderMap, Uri},
    response::{IntoResponse, Response},
};
use serde::Deserialize;

use super::AppState;
use crate::error::GatewayError;
use crate::hub::HubContext;
use crate::hub::connection::run_connection;
use crate::middleware::auth::{extract_ip, require_session};
use crate::session::SessionRecord;
use crate::utils::fingerprint_token;

/// Hub reserved for admin metric subscribers.
const ADMIN_METRICS_HUB: &str = "/hubs/admin-metrics";

#[derive(Debug, Deserialize, Default)]
pub struct HubAuthQuery {
    /// One-shot connection ticket from `POST /api/auth/connection-ticket`.
    pub ticket: Option<String>,
    /// Long-lived bearer, for non-browser clients that can keep it out of
    /// shared logs.
    pub access_token: Option<String>,
}

/// Accept a hub connection. Authentication happens before the upgrade: a
/// redeemable connection ticket, an `access_token`, or a bearer header.
/// The resolved identity is pinned to the connection for its lifetime.
pub async fn hub_upgrade(
    State(state): State<AppState>,
    ws: WebSocketUpgrade,
    uri: Uri,
    headers: HeaderMap,
    Query(query): Query<HubAuthQuery>,
) -> Response {
    let hub_path = uri.path().to_string();

    let session = match authenticate(&state, &headers, &query).await {
        Ok(session) => session,
        Err(err) => {
            tracing::debug!(hub = %hub_path, error = %err, "hub handshake rejected");
            return err.into_response();
        }
    };

    if hub_path == ADMIN_METRICS_HUB && !session.is_admin {
        return GatewayError::Forbidden.into_response();
    }

    let remote_ip = extract_ip(&headers).unwrap_or("unknown").to_string();
    let ctx = HubContext {
        user_id: session.user_id,
        roles: session.roles,
        is_admin: session.is_admin,
        hub_path,
        remote_ip,
    };

    let pipeline = state.pipeline.clone();
    let connections = state.connections.clone();
    let encryption = state.encryption.clone();

    tracing::info!(user_id = %ctx.user_id, hub = %ctx.hub_path, "hub connection accepted");
    ws.on_upgrade(move |socket| run_connection(socket, ctx, pipeline, connections, encryption))
}

async fn authenticate(
    state: &AppState,
    headers: &HeaderMap,
    query: &HubAuthQuery,
) -> Result<SessionRecord, GatewayError> {
    if let Some(ticket) = &query.ticket {
        let session_ticket = state.tickets.redeem(ticket).await.map_err(|err| {
            tracing::debug!(ticket = %fingerprint_token(ticket), "connection ticket rejected");
            err
        })?;
        return state
            .sessions
            .validate(&session_ticket)
            .await?
            .ok_or(GatewayError::Unauthenticated);
    }

    if let Some(token) = &query.access_token {
        return state
            .sessions
            .validate(token)
            .await?
            .ok_or(GatewayError::Unauthenticated);
    }

    require_session(state, headers).await
}

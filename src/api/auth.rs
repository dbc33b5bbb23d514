use axum::{
    Json,
    extract::State,
    http::{HeaderMap, HeaderValue, header},
    response::{IntoResponse, Response},
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::error::GatewayError;
use crate::middleware::auth::{SESSION_COOKIE, require_admin, require_session};
use crate::session::SessionRecord;

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub token: String,
    pub provider: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginResponse {
    pub success: bool,
    pub session_id: String,
    pub user_id: String,
    pub expires_at: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct ConnectionTicketResponse {
    pub ticket: String,
}

#[derive(Debug, Serialize)]
pub struct LogoutResponse {
    pub success: bool,
}

#[derive(Debug, Serialize)]
pub struct RevokeAllResponse {
    pub revoked: u64,
}

fn login_response(state: &AppState, session: SessionRecord) -> Result<Response, GatewayError> {
    let cookie = format!(
        "{}={}; HttpOnly; Path=/; SameSite=Lax; Max-Age={}",
        SESSION_COOKIE, session.ticket, state.config.session_lifetime_secs
    );

    let body = LoginResponse {
        success: true,
        session_id: session.ticket,
        user_id: session.user_id,
        expires_at: session.expires_at,
    };

    let mut response = Json(body).into_response();
    response.headers_mut().append(
        header::SET_COOKIE,
        HeaderValue::from_str(&cookie).map_err(|e| GatewayError::TransientFailure(e.to_string()))?,
    );
    Ok(response)
}

/// Exchange a third-party login token for an opaque session ticket.
///
/// ## Request
/// ```json
/// { "token": "mock:AAA", "provider": "Mock" }
/// ```
///
/// ## Response
/// ```json
/// { "success": true, "sessionId": "…", "userId": "AAA", "expiresAt": "…" }
/// ```
/// Also sets the httpOnly `session` cookie.
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Response, GatewayError> {
    let identity = state
        .identity
        .resolve(&request.provider, &request.token)
        .await?;

    let session = state
        .sessions
        .create(
            &identity.user_id,
            &request.provider,
            identity.roles.clone(),
            identity.is_admin(),
        )
        .await?;

    tracing::info!(user_id = %session.user_id, provider = %request.provider, "login");
    login_response(&state, session)
}

/// Issue a single-use connection ticket for a hub upgrade.
///
/// **Auth: session required.** The ticket is valid for one redemption
/// within its short TTL and replaces the bearer in WebSocket URLs.
pub async fn connection_ticket(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ConnectionTicketResponse>, GatewayError> {
    let session = require_session(&state, &headers).await?;
    let ticket = state.tickets.issue(&session.ticket).await?;
    Ok(Json(ConnectionTicketResponse { ticket }))
}

// ============================================
// Admin auth
// ============================================

/// Admin login: same flow as `login`, but the resolved identity must carry
/// the admin role.
pub async fn admin_login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> Result<Response, GatewayError> {
    let identity = state
        .identity
        .resolve(&request.provider, &request.token)
        .await?;
    if !identity.is_admin() {
        return Err(GatewayError::Forbidden);
    }

    let session = state
        .sessions
        .create(
            &identity.user_id,
            &request.provider,
            identity.roles.clone(),
            true,
        )
        .await?;

    tracing::info!(user_id = %session.user_id, "admin login");
    login_response(&state, session)
}

/// Invalidate the calling admin's session.
pub async fn admin_logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<LogoutResponse>, GatewayError> {
    let session = require_admin(&state, &headers).await?;
    let success = state.sessions.invalidate(&session.ticket).await?;
    Ok(Json(LogoutResponse { success }))
}

/// Rotate the calling admin's session: a fresh ticket is issued and the
/// presented one is invalidated.
pub async fn admin_refresh(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, GatewayError> {
    let old = require_admin(&state, &headers).await?;

    let fresh = state
        .sessions
        .create(&old.user_id, &old.provider, old.roles.clone(), old.is_admin)
        .await?;
    state.sessions.invalidate(&old.ticket).await?;

    login_response(&state, fresh)
}

/// Revoke every session of the calling admin's user, this one included.
pub async fn admin_revoke_all(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<RevokeAllResponse>, GatewayError> {
    let session = require_admin(&state, &headers).await?;
    let revoked = state.sessions.invalidate_all(&session.user_id).await?;
    Ok(Json(RevokeAllResponse { revoked }))
}

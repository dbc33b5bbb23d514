use axum::http::{HeaderMap, header};

use crate::api::AppState;
use crate::error::GatewayError;
use crate::session::SessionRecord;

/// Name of the httpOnly cookie carrying the session ticket.
pub const SESSION_COOKIE: &str = "session";

/// Try to extract the session ticket from (in priority order):
/// 1. `Authorization: Bearer <ticket>` header
/// 2. `session` cookie
///
/// Query parameters are intentionally excluded: bearer tickets must never
/// appear in URLs. Hub upgrades use the one-shot `?ticket=` mechanism
/// instead.
pub fn extract_bearer_or_cookie(headers: &HeaderMap) -> Option<&str> {
    if let Some(token) = headers
        .get(header::AUTHORIZATION)
        .and_then(|v| v.to_str().ok())
        .and_then(|s| s.strip_prefix("Bearer "))
    {
        if !token.is_empty() {
            return Some(token);
        }
    }

    if let Some(cookie_header) = headers.get(header::COOKIE).and_then(|v| v.to_str().ok()) {
        for part in cookie_header.split(';') {
            let part = part.trim();
            if let Some(value) = part.strip_prefix("session=") {
                let value = value.trim();
                if !value.is_empty() {
                    return Some(value);
                }
            }
        }
    }

    None
}

/// Extract client IP from headers (X-Forwarded-For or X-Real-IP).
pub fn extract_ip(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("x-forwarded-for")
        .or_else(|| headers.get("x-real-ip"))
        .and_then(|v| v.to_str().ok())
        .map(|s| s.split(',').next().unwrap_or(s).trim())
}

/// Validate the request's bearer session or fail `Unauthenticated`.
pub async fn require_session(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<SessionRecord, GatewayError> {
    let ticket = extract_bearer_or_cookie(headers).ok_or(GatewayError::Unauthenticated)?;
    state
        .sessions
        .validate(ticket)
        .await?
        .ok_or(GatewayError::Unauthenticated)
}

/// Like `require_session`, but the session must carry the admin flag.
pub async fn require_admin(
    state: &AppState,
    headers: &HeaderMap,
) -> Result<SessionRecord, GatewayError> {
    let session = require_session(state, headers).await?;
    if !session.is_admin {
        return Err(GatewayError::Forbidden);
    }
    Ok(session)
}

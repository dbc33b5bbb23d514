use axum::{
    Json,
    extract::{Path, Query, State},
    http::HeaderMap,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::error::GatewayError;
use crate::middleware::auth::require_admin;
use crate::session::SessionRecord;

const DEFAULT_PAGE_SIZE: usize = 50;

#[derive(Debug, Deserialize, Default)]
pub struct SessionListQuery {
    /// Restrict to one user; omitted means every user.
    pub user: Option<String>,
    pub skip: Option<usize>,
    pub take: Option<usize>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionView {
    pub ticket: String,
    pub user_id: String,
    pub provider: String,
    pub roles: Vec<String>,
    pub is_admin: bool,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

impl From<SessionRecord> for SessionView {
    fn from(record: SessionRecord) -> Self {
        Self {
            ticket: record.ticket,
            user_id: record.user_id,
            provider: record.provider,
            roles: record.roles,
            is_admin: record.is_admin,
            created_at: record.created_at,
            expires_at: record.expires_at,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct SessionCountResponse {
    pub count: usize,
}

#[derive(Debug, Serialize)]
pub struct InvalidateResponse {
    pub success: bool,
}

async fn load_all_sessions(state: &AppState) -> Result<Vec<SessionRecord>, GatewayError> {
    let keys = state.kv.scan_keys("session:*").await?;
    let values = state.kv.multi_get(&keys).await?;
    let mut records: Vec<SessionRecord> = values
        .into_iter()
        .flatten()
        .filter_map(|raw| serde_json::from_str(&raw).ok())
        .collect();
    records.sort_by(|a: &SessionRecord, b: &SessionRecord| {
        b.created_at
            .cmp(&a.created_at)
            .then_with(|| a.ticket.cmp(&b.ticket))
    });
    Ok(records)
}

/// List live sessions, newest first.
pub async fn list_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionListQuery>,
) -> Result<Json<Vec<SessionView>>, GatewayError> {
    require_admin(&state, &headers).await?;

    let skip = query.skip.unwrap_or(0);
    let take = query.take.unwrap_or(DEFAULT_PAGE_SIZE);

    let records = match &query.user {
        Some(user) => state.sessions.list(user, skip, take).await?,
        None => load_all_sessions(&state)
            .await?
            .into_iter()
            .skip(skip)
            .take(take)
            .collect(),
    };

    Ok(Json(records.into_iter().map(SessionView::from).collect()))
}

pub async fn count_sessions(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SessionListQuery>,
) -> Result<Json<SessionCountResponse>, GatewayError> {
    require_admin(&state, &headers).await?;

    let count = match &query.user {
        Some(user) => state.sessions.count(user).await?,
        None => load_all_sessions(&state).await?.len(),
    };
    Ok(Json(SessionCountResponse { count }))
}

/// Invalidate one session by ticket. 404 when it does not exist.
pub async fn invalidate_session(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(ticket): Path<String>,
) -> Result<Json<InvalidateResponse>, GatewayError> {
    require_admin(&state, &headers).await?;

    if !state.sessions.invalidate(&ticket).await? {
        return Err(GatewayError::NotFound);
    }
    Ok(Json(InvalidateResponse { success: true }))
}

use axum::{
    Json,
    extract::{Path, State},
    http::HeaderMap,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::AppState;
use crate::crypto::service::ConnectionCryptoStats;
use crate::crypto::{CryptoMetricsSnapshot, EncryptionConfig};
use crate::error::GatewayError;
use crate::middleware::auth::require_admin;

const CONFIG_KIND: &str = "encryption";

/// Hub push method used for rotation requests.
const KEY_ROTATION_PUSH: &str = "KeyRotation";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnabledRequest {
    #[serde(alias = "Enabled")]
    pub enabled: bool,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RequiredRequest {
    #[serde(alias = "Required")]
    pub required: bool,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RotateResponse {
    pub key_id: String,
    /// Live connections of the user that received the rotation push.
    pub notified_connections: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RotateAllResponse {
    pub initiated: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionMetricsResponse {
    #[serde(flatten)]
    pub counters: CryptoMetricsSnapshot,
    pub active_users: usize,
    pub live_connections: usize,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct NeedsRotationResponse {
    pub users: Vec<String>,
}

#[derive(Debug, Serialize)]
pub struct RemoveResponse {
    pub success: bool,
}

pub async fn get_config(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<EncryptionConfig>, GatewayError> {
    require_admin(&state, &headers).await?;
    Ok(Json((*state.encryption.settings().load()).clone()))
}

pub async fn set_enabled(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<EnabledRequest>,
) -> Result<Json<EncryptionConfig>, GatewayError> {
    require_admin(&state, &headers).await?;
    state
        .encryption
        .settings()
        .update(|config| config.enabled = body.enabled);
    state.notifier.notify(CONFIG_KIND);
    tracing::info!(enabled = body.enabled, "payload encryption toggled");
    Ok(Json((*state.encryption.settings().load()).clone()))
}

pub async fn set_required(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<RequiredRequest>,
) -> Result<Json<EncryptionConfig>, GatewayError> {
    require_admin(&state, &headers).await?;
    state
        .encryption
        .settings()
        .update(|config| config.required = body.required);
    state.notifier.notify(CONFIG_KIND);
    tracing::info!(required = body.required, "encryption required-mode toggled");
    Ok(Json((*state.encryption.settings().load()).clone()))
}

pub async fn needs_rotation(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<NeedsRotationResponse>, GatewayError> {
    require_admin(&state, &headers).await?;
    Ok(Json(NeedsRotationResponse {
        users: state.encryption.list_needing_rotation().await,
    }))
}

async fn rotate_user(state: &AppState, user_id: &str) -> Result<RotateResponse, GatewayError> {
    let request = state.encryption.initiate_rotation(user_id).await?;
    let request_value =
        serde_json::to_value(&request).map_err(|e| GatewayError::TransientFailure(e.to_string()))?;

    let notified = state
        .connections
        .push_to_user(user_id, KEY_ROTATION_PUSH, vec![request_value])
        .await;

    Ok(RotateResponse {
        key_id: request.key_id,
        notified_connections: notified,
    })
}

/// Force a key rotation for one user. Every live connection of that user
/// receives the `KeyRotation` push; the swap lands when any of them
/// acknowledges via `CompleteKeyRotation`.
pub async fn rotate_connection(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Json<RotateResponse>, GatewayError> {
    require_admin(&state, &headers).await?;
    let response = rotate_user(&state, &user_id).await?;
    Ok(Json(response))
}

/// Initiate rotation for every user holding encryption state on this node.
/// Never blocks admissions: each initiation is a short state mutation and
/// a push.
pub async fn rotate_all(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<RotateAllResponse>, GatewayError> {
    require_admin(&state, &headers).await?;

    let mut initiated = 0;
    for user_id in state.encryption.active_users().await {
        match rotate_user(&state, &user_id).await {
            Ok(_) => initiated += 1,
            Err(err) => {
                tracing::warn!(%user_id, error = %err, "rotate-all skipped user")
            }
        }
    }
    Ok(Json(RotateAllResponse { initiated }))
}

/// Tear down a user's encryption state. Their next sealed call requires a
/// fresh key exchange.
pub async fn remove_connection(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Json<RemoveResponse>, GatewayError> {
    require_admin(&state, &headers).await?;
    if !state.encryption.remove(&user_id).await {
        return Err(GatewayError::NotFound);
    }
    Ok(Json(RemoveResponse { success: true }))
}

pub async fn get_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<EncryptionMetricsResponse>, GatewayError> {
    require_admin(&state, &headers).await?;
    Ok(Json(EncryptionMetricsResponse {
        counters: state.encryption.metrics_snapshot(),
        active_users: state.encryption.active_users().await.len(),
        live_connections: state.connections.connection_count().await,
    }))
}

pub async fn connection_stats(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(user_id): Path<String>,
) -> Result<Json<Value>, GatewayError> {
    require_admin(&state, &headers).await?;
    let stats: ConnectionCryptoStats = state
        .encryption
        .stats(&user_id)
        .await
        .ok_or(GatewayError::NotFound)?;
    serde_json::to_value(stats)
        .map(Json)
        .map_err(|e| GatewayError::TransientFailure(e.to_string()))
}

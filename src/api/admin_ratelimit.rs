use axum::{
    Json,
    extract::{Path, Query, State},
    http::HeaderMap,
};
use serde::{Deserialize, Serialize};

use super::AppState;
use crate::error::GatewayError;
use crate::middleware::auth::require_admin;
use crate::ratelimit::config::{RateLimitConfig, RateLimitPolicy, RateLimitRule};
use crate::ratelimit::engine::RateLimitMetrics;

/// Notification kind pushed to admin-metrics subscribers on every mutation.
const CONFIG_KIND: &str = "rate-limiting";

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigResponse {
    pub version: u64,
    #[serde(flatten)]
    pub config: RateLimitConfig,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PolicyUpsert {
    pub name: String,
    pub rules: Vec<RateLimitRule>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MappingUpsert {
    pub pattern: String,
    pub policy: String,
}

#[derive(Debug, Deserialize)]
pub struct MappingSelector {
    pub pattern: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DefaultPolicyRequest {
    pub name: String,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EnabledRequest {
    #[serde(alias = "Enabled")]
    pub enabled: bool,
}

#[derive(Debug, Deserialize, Default)]
pub struct ResetQuery {
    /// Optional partition key (`ip:…` or `account:…`) to clear selectively.
    pub partition: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ResetResponse {
    pub cleared: u64,
}

fn config_response(state: &AppState) -> ConfigResponse {
    let settings = state.rate_limiter.settings();
    ConfigResponse {
        version: settings.version(),
        config: (*settings.load()).clone(),
    }
}

pub async fn get_config(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<ConfigResponse>, GatewayError> {
    require_admin(&state, &headers).await?;
    Ok(Json(config_response(&state)))
}

/// Replace the whole config atomically. Invalid configs are rejected and
/// the active snapshot is untouched.
pub async fn put_config(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(config): Json<RateLimitConfig>,
) -> Result<Json<ConfigResponse>, GatewayError> {
    require_admin(&state, &headers).await?;
    state.rate_limiter.settings().replace(config)?;
    state.notifier.notify(CONFIG_KIND);
    Ok(Json(config_response(&state)))
}

pub async fn upsert_policy(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<PolicyUpsert>,
) -> Result<Json<ConfigResponse>, GatewayError> {
    require_admin(&state, &headers).await?;
    state.rate_limiter.settings().update(|config| {
        config
            .policies
            .insert(body.name.clone(), RateLimitPolicy { rules: body.rules.clone() });
    })?;
    state.notifier.notify(CONFIG_KIND);
    Ok(Json(config_response(&state)))
}

pub async fn delete_policy(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(name): Path<String>,
) -> Result<Json<ConfigResponse>, GatewayError> {
    require_admin(&state, &headers).await?;

    if !state.rate_limiter.settings().load().policies.contains_key(&name) {
        return Err(GatewayError::NotFound);
    }

    // Deleting the default policy or a mapped one fails validation inside
    // the update; surface that as a conflict rather than a config change.
    state
        .rate_limiter
        .settings()
        .update(|config| {
            config.policies.remove(&name);
        })
        .map_err(|_| GatewayError::Conflict(format!("policy '{}' is still referenced", name)))?;

    state.notifier.notify(CONFIG_KIND);
    Ok(Json(config_response(&state)))
}

pub async fn upsert_mapping(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<MappingUpsert>,
) -> Result<Json<ConfigResponse>, GatewayError> {
    require_admin(&state, &headers).await?;
    state.rate_limiter.settings().update(|config| {
        config
            .endpoint_mappings
            .insert(body.pattern.clone(), body.policy.clone());
    })?;
    state.notifier.notify(CONFIG_KIND);
    Ok(Json(config_response(&state)))
}

/// Patterns contain slashes and wildcards, so the selector travels as a
/// query parameter rather than a path segment.
pub async fn delete_mapping(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(selector): Query<MappingSelector>,
) -> Result<Json<ConfigResponse>, GatewayError> {
    require_admin(&state, &headers).await?;

    if !state
        .rate_limiter
        .settings()
        .load()
        .endpoint_mappings
        .contains_key(&selector.pattern)
    {
        return Err(GatewayError::NotFound);
    }

    state.rate_limiter.settings().update(|config| {
        config.endpoint_mappings.remove(&selector.pattern);
    })?;
    state.notifier.notify(CONFIG_KIND);
    Ok(Json(config_response(&state)))
}

pub async fn set_default_policy(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<DefaultPolicyRequest>,
) -> Result<Json<ConfigResponse>, GatewayError> {
    require_admin(&state, &headers).await?;
    state.rate_limiter.settings().update(|config| {
        config.default_policy = body.name.clone();
    })?;
    state.notifier.notify(CONFIG_KIND);
    Ok(Json(config_response(&state)))
}

pub async fn set_enabled(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<EnabledRequest>,
) -> Result<Json<ConfigResponse>, GatewayError> {
    require_admin(&state, &headers).await?;
    state.rate_limiter.settings().update(|config| {
        config.enabled = body.enabled;
    })?;
    state.notifier.notify(CONFIG_KIND);
    tracing::info!(enabled = body.enabled, "rate limiting toggled");
    Ok(Json(config_response(&state)))
}

pub async fn get_metrics(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<RateLimitMetrics>, GatewayError> {
    require_admin(&state, &headers).await?;
    Ok(Json(state.rate_limiter.metrics().await?))
}

/// Clear buckets and timeouts — all of them, or one partition's.
pub async fn reset(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<ResetQuery>,
) -> Result<Json<ResetResponse>, GatewayError> {
    require_admin(&state, &headers).await?;
    let cleared = state.rate_limiter.reset(query.partition.as_deref()).await?;
    Ok(Json(ResetResponse { cleared }))
}

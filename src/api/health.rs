use axum::{Json, extract::State};
use serde::Serialize;

use super::AppState;

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub version: String,
    pub services: ServiceStatus,
}

#[derive(Serialize)]
pub struct ServiceStatus {
    pub kv: bool,
    pub encryption_enabled: bool,
    pub rate_limiting_enabled: bool,
    pub live_connections: usize,
}

#[derive(Serialize)]
pub struct PingResponse {
    pub status: &'static str,
}

/// Lightweight liveness probe for container healthchecks.
/// Returns 200 immediately — no store calls.
pub async fn ping() -> Json<PingResponse> {
    Json(PingResponse { status: "ok" })
}

/// Full health check — probes the KV store and reports gateway state.
pub async fn health_check(State(state): State<AppState>) -> Json<HealthResponse> {
    let kv_healthy = state.kv.exists("health:probe").await.is_ok();

    Json(HealthResponse {
        status: if kv_healthy {
            "healthy".to_string()
        } else {
            "degraded".to_string()
        },
        version: env!("CARGO_PKG_VERSION").to_string(),
        services: ServiceStatus {
            kv: kv_healthy,
            encryption_enabled: state.encryption.settings().load().enabled,
            rate_limiting_enabled: state.rate_limiter.settings().load().enabled,
            live_connections: state.connections.connection_count().await,
        },
    })
}

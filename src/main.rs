use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use axum::http::{Method, header};
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod api;
mod config;
mod crypto;
mod error;
mod hub;
mod identity;
mod kv;
mod middleware;
mod ratelimit;
mod session;
mod utils;

use api::AppState;
use identity::{JwtIdentityResolver, MockIdentityResolver, ProviderRegistry};
use kv::RedisKv;
use utils::SystemClock;

/// How often lapsed previous-key slots and abandoned rotations are purged.
const KEY_CLEANUP_INTERVAL_SECS: u64 = 15;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(tracing_subscriber::EnvFilter::new(
            std::env::var("RUST_LOG")
                .unwrap_or_else(|_| "titan_gateway=info,tower_http=info".into()),
        ))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load environment variables
    dotenvy::dotenv().ok();

    let config = config::Config::from_env().unwrap_or_else(|err| {
        tracing::warn!(error = %err, "falling back to default configuration");
        config::Config::default()
    });

    // Redis connection — the only cross-node shared state
    let redis_client = redis::Client::open(config.redis_url.clone())?;
    let redis_conn = redis::aio::ConnectionManager::new(redis_client).await?;
    tracing::info!("Connected to Redis");

    let clock = Arc::new(SystemClock);
    let kv = Arc::new(RedisKv::new(redis_conn));

    let identity = ProviderRegistry::new(vec![
        Box::new(MockIdentityResolver),
        Box::new(JwtIdentityResolver::new(&config.jwt_secret)),
    ]);

    let host = config.server_host.clone();
    let port = config.server_port;

    // Domain services (accounts, inventory, seasons, trades) register
    // their hub methods here at startup.
    let state = AppState::new(config, kv, clock, identity, |_handlers| {});

    // Background purge of expired previous-key slots
    {
        let encryption = state.encryption.clone();
        tokio::spawn(async move {
            let mut ticker =
                tokio::time::interval(Duration::from_secs(KEY_CLEANUP_INTERVAL_SECS));
            loop {
                ticker.tick().await;
                let purged = encryption.cleanup_expired().await;
                if purged > 0 {
                    tracing::debug!(purged, "expired key slots purged");
                }
            }
        });
    }

    // Configure CORS for the web client origins (comma-separated list)
    let frontend_url =
        std::env::var("FRONTEND_URL").unwrap_or_else(|_| "http://localhost:3000".into());
    let origins: Vec<header::HeaderValue> = frontend_url
        .split(',')
        .filter_map(|s| s.trim().parse::<header::HeaderValue>().ok())
        .collect();

    let cors = CorsLayer::new()
        .allow_origin(origins)
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE, header::ACCEPT])
        .allow_credentials(true)
        .max_age(Duration::from_secs(3600));

    tracing::info!("CORS configured for origins: {}", frontend_url);

    // Build router
    let app = api::routes::router(state)
        .layer(TraceLayer::new_for_http())
        .layer(cors);

    let addr: SocketAddr = format!("{}:{}", host, port).parse()?;
    tracing::info!("Starting gateway on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("Gateway shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("Failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            tracing::info!("Received Ctrl+C, starting graceful shutdown");
        },
        _ = terminate => {
            tracing::info!("Received SIGTERM, starting graceful shutdown");
        },
    }
}

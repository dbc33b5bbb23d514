use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

use crate::config::Config;
use crate::crypto::{EncryptionService, EncryptionSettings, KeyExchangeRequest, KeyRotationAck};
use crate::hub::HandlerRegistry;
use crate::hub::connection::{ConfigNotifier, HubConnections};
use crate::hub::pipeline::HubPipeline;
use crate::identity::ProviderRegistry;
use crate::kv::KvStore;
use crate::ratelimit::{RateLimitEngine, RateLimitSettings};
use crate::session::ticket::ConnectionTicketService;
use crate::session::{SessionConfig, SessionStore};
use crate::utils::Clock;

pub mod admin_encryption;
pub mod admin_ratelimit;
pub mod admin_sessions;
pub mod auth;
pub mod health;
pub mod hubs;
pub mod routes;

// ============================================
// Application State
// ============================================

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub kv: Arc<dyn KvStore>,
    pub clock: Arc<dyn Clock>,
    pub sessions: Arc<SessionStore>,
    pub tickets: Arc<ConnectionTicketService>,
    pub rate_limiter: Arc<RateLimitEngine>,
    pub encryption: Arc<EncryptionService>,
    pub identity: Arc<ProviderRegistry>,
    pub connections: Arc<HubConnections>,
    pub pipeline: Arc<HubPipeline>,
    pub notifier: ConfigNotifier,
}

impl AppState {
    /// Wire every service over one KV store and clock. Domain services
    /// register their hub methods through `configure_handlers`; the
    /// encryption-hub builtins are always present.
    pub fn new<F>(
        config: Config,
        kv: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        identity: ProviderRegistry,
        configure_handlers: F,
    ) -> Self
    where
        F: FnOnce(&mut HandlerRegistry),
    {
        let sessions = Arc::new(SessionStore::new(
            kv.clone(),
            clock.clone(),
            SessionConfig {
                lifetime: Duration::from_secs(config.session_lifetime_secs),
                sliding_window: Duration::from_secs(config.session_sliding_window_secs),
                cap_per_user: config.session_cap_per_user,
            },
        ));
        let tickets = Arc::new(ConnectionTicketService::new(
            kv.clone(),
            clock.clone(),
            Duration::from_secs(config.connection_ticket_ttl_secs),
        ));

        let rate_limiter = Arc::new(RateLimitEngine::new(
            kv.clone(),
            clock.clone(),
            Arc::new(RateLimitSettings::default()),
        ));

        let encryption = Arc::new(EncryptionService::new(
            clock.clone(),
            Arc::new(EncryptionSettings::default()),
        ));

        let mut handlers = HandlerRegistry::new();
        register_encryption_methods(&mut handlers, encryption.clone());
        configure_handlers(&mut handlers);
        let handlers = Arc::new(handlers);

        let connections = Arc::new(HubConnections::new());
        let pipeline = Arc::new(HubPipeline::new(
            handlers,
            rate_limiter.clone(),
            encryption.clone(),
        ));
        let notifier = ConfigNotifier::spawn(connections.clone());

        Self {
            config: Arc::new(config),
            kv,
            clock,
            sessions,
            tickets,
            rate_limiter,
            encryption,
            identity: Arc::new(identity),
            connections,
            pipeline,
            notifier,
        }
    }
}

// ============================================
// Encryption-hub builtins
// ============================================

/// Reserved methods on the encryption hub. Registered like any other
/// handler so the pipeline needs no special cases beyond the encrypted
/// gateway itself.
fn register_encryption_methods(registry: &mut HandlerRegistry, encryption: Arc<EncryptionService>) {
    let service = encryption.clone();
    registry.register("KeyExchange", None, move |ctx, args| {
        let service = service.clone();
        async move {
            let request: KeyExchangeRequest = parse_arg(&args)?;
            let response = service.key_exchange(&ctx.user_id, &request).await?;
            Ok(serde_json::to_value(response)?)
        }
    });

    let service = encryption.clone();
    registry.register("GetConfig", None, move |_ctx, _args| {
        let service = service.clone();
        async move {
            let config = service.settings().load();
            Ok(serde_json::to_value(&*config)?)
        }
    });

    let service = encryption;
    registry.register("CompleteKeyRotation", None, move |ctx, args| {
        let service = service.clone();
        async move {
            let ack: KeyRotationAck = parse_arg(&args)?;
            service.complete_rotation(&ctx.user_id, &ack).await?;
            Ok(Value::Bool(true))
        }
    });
}

fn parse_arg<T: serde::de::DeserializeOwned>(args: &[Value]) -> Result<T, anyhow::Error> {
    let first = args
        .first()
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("missing argument"))?;
    Ok(serde_json::from_value(first)?)
}

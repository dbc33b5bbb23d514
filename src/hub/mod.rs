// ============================================
// Hub RPC
// ============================================
//
// Bidirectional RPC over persistent WebSocket connections. Frames are JSON
// text messages:
//
//   client → server   {"id": "…", "method": "…", "args": […]}
//   server → client   {"id": "…", "result": …} | {"id": "…", "error": {…}}
//   server push       {"method": "…", "args": […]}
//
// Method dispatch is a map populated at registration. Game-domain handlers
// (accounts, inventory, seasons, trades) register here; the pipeline treats
// them as opaque.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::GatewayError;
use crate::ratelimit::RateLimitDecision;

pub mod connection;
pub mod pipeline;

/// Reserved method name: one `SecureEnvelope` argument whose plaintext is a
/// `{method, args}` call. Lets every hub method travel encrypted without
/// per-method wiring.
pub const ENCRYPTED_GATEWAY_METHOD: &str = "__encrypted__";

/// Control methods that must stay callable in plaintext even when
/// encryption is required: without them a client could never negotiate or
/// rotate keys.
pub const CONTROL_METHODS: [&str; 3] = ["KeyExchange", "GetConfig", "CompleteKeyRotation"];

// ============================================
// Wire frames
// ============================================

#[derive(Debug, Clone, Deserialize)]
pub struct HubInvocation {
    pub id: String,
    pub method: String,
    #[serde(default)]
    pub args: Vec<Value>,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubError {
    pub message: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub retry_after_seconds: Option<u64>,
}

impl HubError {
    pub fn from_gateway(err: &GatewayError) -> Self {
        let retry_after_seconds = match err {
            GatewayError::RateLimited { retry_after_secs } => Some(*retry_after_secs),
            _ => None,
        };
        Self {
            message: err.public_message(),
            code: err.code().to_string(),
            retry_after_seconds,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct HubCompletion {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<HubError>,
    /// Advisory rate-limit metadata, mirroring the HTTP header contract.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rate_limit: Option<Value>,
}

impl HubCompletion {
    pub fn ok(id: String, result: Value, decision: Option<&RateLimitDecision>) -> Self {
        Self {
            id,
            result: Some(result),
            error: None,
            rate_limit: decision.map(rate_limit_metadata),
        }
    }

    pub fn err(id: String, err: &GatewayError, decision: Option<&RateLimitDecision>) -> Self {
        Self {
            id,
            result: None,
            error: Some(HubError::from_gateway(err)),
            rate_limit: decision.map(rate_limit_metadata),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HubPush {
    pub method: String,
    pub args: Vec<Value>,
}

fn rate_limit_metadata(decision: &RateLimitDecision) -> Value {
    let headers: serde_json::Map<String, Value> = decision
        .headers()
        .into_iter()
        .map(|(name, value)| (name, Value::String(value)))
        .collect();
    Value::Object(headers)
}

// ============================================
// Connection identity
// ============================================

/// Identity pinned to a hub connection at accept time, for its lifetime.
#[derive(Debug, Clone)]
pub struct HubContext {
    pub user_id: String,
    pub roles: Vec<String>,
    pub is_admin: bool,
    pub hub_path: String,
    pub remote_ip: String,
}

impl HubContext {
    pub fn has_role(&self, role: &str) -> bool {
        self.is_admin || self.roles.iter().any(|r| r == role)
    }
}

// ============================================
// Handler registry
// ============================================

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, anyhow::Error>> + Send>>;

pub type HandlerFn = Arc<dyn Fn(HubContext, Vec<Value>) -> HandlerFuture + Send + Sync>;

pub struct RegisteredHandler {
    pub handler: HandlerFn,
    pub required_role: Option<String>,
}

/// The handler-dispatcher seam: hub methods resolve through this map, never
/// through reflection.
#[derive(Default)]
pub struct HandlerRegistry {
    handlers: HashMap<String, RegisteredHandler>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<F, Fut>(&mut self, method: &str, required_role: Option<&str>, handler: F)
    where
        F: Fn(HubContext, Vec<Value>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Value, anyhow::Error>> + Send + 'static,
    {
        self.handlers.insert(
            method.to_string(),
            RegisteredHandler {
                handler: Arc::new(move |ctx, args| Box::pin(handler(ctx, args))),
                required_role: required_role.map(str::to_string),
            },
        );
    }

    pub fn get(&self, method: &str) -> Option<&RegisteredHandler> {
        self.handlers.get(method)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invocation_frames_parse_with_defaulted_args() {
        let invocation: HubInvocation =
            serde_json::from_str(r#"{"id":"1","method":"GetInventory"}"#).unwrap();
        assert_eq!(invocation.method, "GetInventory");
        assert!(invocation.args.is_empty());
    }

    #[test]
    fn completion_frames_omit_empty_fields() {
        let frame = HubCompletion::ok("1".into(), Value::from(42), None);
        let json = serde_json::to_string(&frame).unwrap();
        assert!(!json.contains("error"));
        assert!(!json.contains("rateLimit"));
    }

    #[test]
    fn error_frames_carry_retry_seconds() {
        let frame = HubCompletion::err(
            "1".into(),
            &GatewayError::RateLimited {
                retry_after_secs: 30,
            },
            None,
        );
        let json = serde_json::to_value(&frame).unwrap();
        assert_eq!(json["error"]["code"], "RATE_LIMITED");
        assert_eq!(json["error"]["retryAfterSeconds"], 30);
    }

    #[tokio::test]
    async fn registry_dispatches_registered_methods() {
        let mut registry = HandlerRegistry::new();
        registry.register("Echo", None, |_ctx, args| async move {
            Ok(args.into_iter().next().unwrap_or(Value::Null))
        });

        let registered = registry.get("Echo").unwrap();
        let ctx = HubContext {
            user_id: "u1".into(),
            roles: vec![],
            is_admin: false,
            hub_path: "/accountHub".into(),
            remote_ip: "127.0.0.1".into(),
        };
        let result = (registered.handler)(ctx, vec![Value::from("hi")])
            .await
            .unwrap();
        assert_eq!(result, Value::from("hi"));
        assert!(registry.get("Missing").is_none());
    }
}

// ============================================
// Per-call hub pipeline
// ============================================
//
// Every hub invocation passes through a fixed chain: authorisation, rate
// limiting, the decryption gate, dispatch, response sealing. The chain is
// plain functions over the connection's pinned identity — no dynamic
// middleware.

use std::sync::Arc;
use std::time::Duration;

use serde::Deserialize;
use serde_json::Value;

use crate::crypto::{EncryptionService, SecureEnvelope};
use crate::error::{GatewayError, ViolationKind};
use crate::ratelimit::{Partition, RateLimitEngine};

use super::{
    CONTROL_METHODS, ENCRYPTED_GATEWAY_METHOD, HandlerRegistry, HubCompletion, HubContext,
    HubError, HubInvocation,
};

/// A method that has not produced a result by now returns an error frame;
/// the connection itself stays open.
const METHOD_TIMEOUT: Duration = Duration::from_secs(30);

/// Plaintext of an encrypted-gateway envelope.
#[derive(Debug, Deserialize)]
struct GatewayCall {
    method: String,
    #[serde(default)]
    args: Vec<Value>,
}

pub struct HubPipeline {
    handlers: Arc<HandlerRegistry>,
    rate_limiter: Arc<RateLimitEngine>,
    encryption: Arc<EncryptionService>,
}

impl HubPipeline {
    pub fn new(
        handlers: Arc<HandlerRegistry>,
        rate_limiter: Arc<RateLimitEngine>,
        encryption: Arc<EncryptionService>,
    ) -> Self {
        Self {
            handlers,
            rate_limiter,
            encryption,
        }
    }

    pub async fn handle(&self, ctx: &HubContext, invocation: HubInvocation) -> HubCompletion {
        let id = invocation.id.clone();
        let is_gateway = invocation.method == ENCRYPTED_GATEWAY_METHOD;

        // 1. Authorisation. Encrypted calls re-check once the inner method
        // is known; the gateway method itself carries no role.
        if !is_gateway {
            match self.handlers.get(&invocation.method) {
                None => return HubCompletion::err(id, &GatewayError::NotFound, None),
                Some(registered) => {
                    if let Some(role) = &registered.required_role {
                        if !ctx.has_role(role) {
                            return HubCompletion::err(id, &GatewayError::Forbidden, None);
                        }
                    }
                }
            }
        }

        // 2. Rate limit on the connection's partition key.
        let partition = Partition::account(&ctx.user_id);
        let limit_path = format!("{}/{}", ctx.hub_path, invocation.method);
        let decision = match self.rate_limiter.check(&partition, &limit_path).await {
            Ok(decision) => decision,
            Err(err) => return HubCompletion::err(id, &err, None),
        };
        if !decision.allowed {
            let err = GatewayError::RateLimited {
                retry_after_secs: decision.retry_after_secs.unwrap_or(0),
            };
            return HubCompletion::err(id, &err, Some(&decision));
        }

        // 3. Decryption gate.
        let has_state = self.encryption.has_state(&ctx.user_id).await;
        let required = self.encryption.settings().load().required;

        let (method, args, key_hint) = if is_gateway {
            match self.open_gateway_call(ctx, &invocation).await {
                Ok(opened) => opened,
                Err(err) => return HubCompletion::err(id, &err, Some(&decision)),
            }
        } else {
            if required && has_state && !CONTROL_METHODS.contains(&invocation.method.as_str()) {
                return HubCompletion::err(
                    id,
                    &GatewayError::EncryptionRequired,
                    Some(&decision),
                );
            }
            (invocation.method, invocation.args, None)
        };

        let registered = match self.handlers.get(&method) {
            Some(registered) => registered,
            None => return HubCompletion::err(id, &GatewayError::NotFound, Some(&decision)),
        };
        if let Some(role) = &registered.required_role {
            if !ctx.has_role(role) {
                return HubCompletion::err(id, &GatewayError::Forbidden, Some(&decision));
            }
        }

        // 4. Dispatch.
        let call = (registered.handler)(ctx.clone(), args);
        let result = match tokio::time::timeout(METHOD_TIMEOUT, call).await {
            Err(_) => {
                tracing::warn!(%method, user_id = %ctx.user_id, "hub method timed out");
                return HubCompletion::err(id, &GatewayError::Cancelled, Some(&decision));
            }
            Ok(Err(err)) => {
                return match err.downcast::<GatewayError>() {
                    Ok(gateway_err) => HubCompletion::err(id, &gateway_err, Some(&decision)),
                    Err(other) => {
                        // Internals never reach the frame.
                        tracing::error!(%method, error = %other, "hub handler failed");
                        HubCompletion {
                            id,
                            result: None,
                            error: Some(HubError {
                                message: "Handler failed".to_string(),
                                code: "HANDLER_ERROR".to_string(),
                                retry_after_seconds: None,
                            }),
                            rate_limit: None,
                        }
                    }
                };
            }
            Ok(Ok(value)) => value,
        };

        // 5. Response sealing. RPC results travel as compact binary inside
        // the envelope; the inbound key-id (or current, for plaintext calls)
        // seals the reply.
        if has_state {
            match self.seal_result(ctx, &result, key_hint.as_deref()).await {
                Ok(sealed) => HubCompletion::ok(id, sealed, Some(&decision)),
                Err(err) => HubCompletion::err(id, &err, Some(&decision)),
            }
        } else {
            HubCompletion::ok(id, result, Some(&decision))
        }
    }

    async fn open_gateway_call(
        &self,
        ctx: &HubContext,
        invocation: &HubInvocation,
    ) -> Result<(String, Vec<Value>, Option<String>), GatewayError> {
        let envelope: SecureEnvelope = invocation
            .args
            .first()
            .cloned()
            .and_then(|arg| serde_json::from_value(arg).ok())
            .ok_or(GatewayError::SecurityViolation(
                ViolationKind::MalformedEnvelope,
            ))?;

        let plaintext = self
            .encryption
            .decrypt_and_verify(&ctx.user_id, &envelope)
            .await?;
        let call: GatewayCall = serde_json::from_slice(&plaintext).map_err(|_| {
            GatewayError::SecurityViolation(ViolationKind::MalformedEnvelope)
        })?;

        Ok((call.method, call.args, Some(envelope.key_id)))
    }

    async fn seal_result(
        &self,
        ctx: &HubContext,
        result: &Value,
        key_hint: Option<&str>,
    ) -> Result<Value, GatewayError> {
        let bytes = rmp_serde::to_vec_named(result)
            .map_err(|e| GatewayError::TransientFailure(e.to_string()))?;
        let envelope = self
            .encryption
            .encrypt_and_sign(&ctx.user_id, &bytes, key_hint)
            .await?;
        serde_json::to_value(envelope).map_err(|e| GatewayError::TransientFailure(e.to_string()))
    }
}

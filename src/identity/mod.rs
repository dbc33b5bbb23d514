// ============================================
// Identity resolution
// ============================================
//
// The gateway never checks passwords. Third-party login tokens are handed
// to a provider-specific resolver that yields a user id and role set; the
// session store takes it from there.

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, DecodingKey, Validation};
use serde::Deserialize;

use crate::error::GatewayError;

pub const ADMIN_ROLE: &str = "admin";

#[derive(Debug, Clone)]
pub struct ResolvedIdentity {
    pub user_id: String,
    pub roles: Vec<String>,
}

impl ResolvedIdentity {
    pub fn is_admin(&self) -> bool {
        self.roles.iter().any(|r| r == ADMIN_ROLE)
    }
}

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    /// Provider names this resolver answers for.
    fn provider(&self) -> &str;

    /// Validate a third-party token into an identity, or fail
    /// `Unauthenticated`.
    async fn resolve(&self, token: &str) -> Result<ResolvedIdentity, GatewayError>;
}

/// Dispatches to the resolver registered for a provider name.
pub struct ProviderRegistry {
    resolvers: Vec<Box<dyn IdentityResolver>>,
}

impl ProviderRegistry {
    pub fn new(resolvers: Vec<Box<dyn IdentityResolver>>) -> Self {
        Self { resolvers }
    }

    pub async fn resolve(
        &self,
        provider: &str,
        token: &str,
    ) -> Result<ResolvedIdentity, GatewayError> {
        let resolver = self
            .resolvers
            .iter()
            .find(|r| r.provider().eq_ignore_ascii_case(provider))
            .ok_or(GatewayError::Unauthenticated)?;
        resolver.resolve(token).await
    }
}

// ============================================
// Mock provider
// ============================================

/// Accepts `mock:{user}` tokens; `mock-admin:{user}` grants the admin role.
/// Development and test environments only.
pub struct MockIdentityResolver;

#[async_trait]
impl IdentityResolver for MockIdentityResolver {
    fn provider(&self) -> &str {
        "Mock"
    }

    async fn resolve(&self, token: &str) -> Result<ResolvedIdentity, GatewayError> {
        if let Some(user_id) = token.strip_prefix("mock-admin:") {
            if !user_id.is_empty() {
                return Ok(ResolvedIdentity {
                    user_id: user_id.to_string(),
                    roles: vec!["player".to_string(), ADMIN_ROLE.to_string()],
                });
            }
        }
        if let Some(user_id) = token.strip_prefix("mock:") {
            if !user_id.is_empty() {
                return Ok(ResolvedIdentity {
                    user_id: user_id.to_string(),
                    roles: vec!["player".to_string()],
                });
            }
        }
        Err(GatewayError::Unauthenticated)
    }
}

// ============================================
// JWT provider
// ============================================

#[derive(Debug, Deserialize)]
struct JwtClaims {
    sub: String,
    #[serde(default)]
    roles: Vec<String>,
}

/// Validates HS256 tokens issued by the platform's auth service.
pub struct JwtIdentityResolver {
    key: DecodingKey,
    validation: Validation,
}

impl JwtIdentityResolver {
    pub fn new(secret: &str) -> Self {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        Self {
            key: DecodingKey::from_secret(secret.as_bytes()),
            validation,
        }
    }
}

#[async_trait]
impl IdentityResolver for JwtIdentityResolver {
    fn provider(&self) -> &str {
        "Jwt"
    }

    async fn resolve(&self, token: &str) -> Result<ResolvedIdentity, GatewayError> {
        let data = jsonwebtoken::decode::<JwtClaims>(token, &self.key, &self.validation)
            .map_err(|_| GatewayError::Unauthenticated)?;

        Ok(ResolvedIdentity {
            user_id: data.claims.sub,
            roles: data.claims.roles,
        })
    }
}

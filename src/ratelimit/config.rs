// ============================================
// Rate-limit configuration snapshots
// ============================================
//
// The full config is an immutable snapshot published behind an atomic
// pointer. Admin mutations validate a copy and swap it in; in-flight
// admissions keep reading whichever snapshot they loaded. No restart, no
// locks on the admission path.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use validator::Validate;

use crate::error::GatewayError;

#[derive(Debug, Clone, Serialize, Deserialize, Validate)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitRule {
    #[validate(range(min = 1))]
    pub max_hits: u32,
    #[validate(range(min = 1))]
    pub period_seconds: u64,
    #[validate(range(min = 1))]
    pub timeout_seconds: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RateLimitPolicy {
    /// Ordered: every rule must admit before the request passes.
    pub rules: Vec<RateLimitRule>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitConfig {
    pub enabled: bool,
    pub default_policy: String,
    pub policies: HashMap<String, RateLimitPolicy>,
    /// Endpoint pattern → policy name. Patterns are exact paths or prefixes
    /// with a trailing `*`.
    pub endpoint_mappings: HashMap<String, String>,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        let mut policies = HashMap::new();
        policies.insert(
            "Auth".to_string(),
            RateLimitPolicy {
                rules: vec![RateLimitRule {
                    max_hits: 10,
                    period_seconds: 60,
                    timeout_seconds: 600,
                }],
            },
        );
        policies.insert(
            "Default".to_string(),
            RateLimitPolicy {
                rules: vec![RateLimitRule {
                    max_hits: 100,
                    period_seconds: 60,
                    timeout_seconds: 300,
                }],
            },
        );

        let mut endpoint_mappings = HashMap::new();
        endpoint_mappings.insert("/api/auth/*".to_string(), "Auth".to_string());

        Self {
            enabled: true,
            default_policy: "Default".to_string(),
            policies,
            endpoint_mappings,
        }
    }
}

impl RateLimitConfig {
    /// Structural validation run before any snapshot swap.
    pub fn check(&self) -> Result<(), GatewayError> {
        if !self.policies.contains_key(&self.default_policy) {
            return Err(GatewayError::ValidationFailed(format!(
                "default policy '{}' does not resolve",
                self.default_policy
            )));
        }

        for (name, policy) in &self.policies {
            if name.trim().is_empty() {
                return Err(GatewayError::ValidationFailed(
                    "policy name must not be empty".to_string(),
                ));
            }
            if policy.rules.is_empty() {
                return Err(GatewayError::ValidationFailed(format!(
                    "policy '{}' has no rules",
                    name
                )));
            }
            for rule in &policy.rules {
                rule.validate().map_err(|e| {
                    GatewayError::ValidationFailed(format!("policy '{}': {}", name, e))
                })?;
            }
        }

        for (pattern, target) in &self.endpoint_mappings {
            if pattern.trim().is_empty() {
                return Err(GatewayError::ValidationFailed(
                    "endpoint pattern must not be empty".to_string(),
                ));
            }
            if !self.policies.contains_key(target) {
                return Err(GatewayError::ValidationFailed(format!(
                    "mapping '{}' targets unknown policy '{}'",
                    pattern, target
                )));
            }
        }

        Ok(())
    }

    /// Resolve a request path to a policy: exact match first, then longest
    /// `prefix*` match, then the default policy.
    pub fn resolve_policy(&self, path: &str) -> (String, &RateLimitPolicy) {
        if let Some(name) = self.endpoint_mappings.get(path) {
            if let Some(policy) = self.policies.get(name) {
                return (name.clone(), policy);
            }
        }

        let mut best: Option<(&str, &str)> = None;
        for (pattern, name) in &self.endpoint_mappings {
            if let Some(prefix) = pattern.strip_suffix('*') {
                if path.starts_with(prefix)
                    && best.is_none_or(|(current, _)| prefix.len() > current.len())
                {
                    best = Some((prefix, name));
                }
            }
        }
        if let Some((_, name)) = best {
            if let Some(policy) = self.policies.get(name) {
                return (name.to_string(), policy);
            }
        }

        let policy = self
            .policies
            .get(&self.default_policy)
            .expect("default policy validated at swap time");
        (self.default_policy.clone(), policy)
    }
}

/// Versioned holder for the active config. Loads are wait-free; updates
/// validate and swap the whole snapshot.
pub struct RateLimitSettings {
    snapshot: ArcSwap<RateLimitConfig>,
    version: AtomicU64,
}

impl RateLimitSettings {
    pub fn new(config: RateLimitConfig) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(config),
            version: AtomicU64::new(1),
        }
    }

    pub fn load(&self) -> Arc<RateLimitConfig> {
        self.snapshot.load_full()
    }

    pub fn version(&self) -> u64 {
        self.version.load(Ordering::Acquire)
    }

    /// Replace the snapshot wholesale.
    pub fn replace(&self, config: RateLimitConfig) -> Result<u64, GatewayError> {
        config.check()?;
        self.snapshot.store(Arc::new(config));
        Ok(self.version.fetch_add(1, Ordering::AcqRel) + 1)
    }

    /// Copy-on-write mutation: clone the current snapshot, apply `mutate`,
    /// validate, swap.
    pub fn update<F>(&self, mutate: F) -> Result<u64, GatewayError>
    where
        F: FnOnce(&mut RateLimitConfig),
    {
        let mut next = (*self.load()).clone();
        mutate(&mut next);
        self.replace(next)
    }
}

impl Default for RateLimitSettings {
    fn default() -> Self {
        Self::new(RateLimitConfig::default())
    }
}

// ============================================
// Rate-limit admission engine
// ============================================
//
// Fixed-window counters and deny timeouts live in the KV store so every
// node sees the same state. Admission never writes a response itself: it
// returns a structured decision the HTTP middleware or hub pipeline turns
// into headers or an error frame.

use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;

use crate::error::GatewayError;
use crate::kv::{KvStore, rate_limit_bucket_key, rate_limit_timeout_key};
use crate::utils::Clock;

use super::config::{RateLimitRule, RateLimitSettings};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionMode {
    Ip,
    Account,
}

impl PartitionMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            PartitionMode::Ip => "ip",
            PartitionMode::Account => "account",
        }
    }

    /// Header name segment: `Ip` or `Account`.
    fn header_segment(&self) -> &'static str {
        match self {
            PartitionMode::Ip => "Ip",
            PartitionMode::Account => "Account",
        }
    }
}

/// The string all rate-limit state for one caller is grouped under.
#[derive(Debug, Clone)]
pub struct Partition {
    pub key: String,
    pub mode: PartitionMode,
}

impl Partition {
    pub fn ip(remote_ip: &str) -> Self {
        Self {
            key: format!("ip:{}", remote_ip),
            mode: PartitionMode::Ip,
        }
    }

    pub fn account(user_id: &str) -> Self {
        Self {
            key: format!("account:{}", user_id),
            mode: PartitionMode::Account,
        }
    }
}

/// Per-rule view attached to an admission result.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RuleState {
    pub max_hits: u32,
    pub period_seconds: u64,
    pub timeout_seconds: u64,
    /// Hits observed in the current window, including this request.
    pub count: i64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitDecision {
    pub allowed: bool,
    pub policy: String,
    pub mode: PartitionMode,
    pub rules: Vec<RuleState>,
    pub retry_after_secs: Option<u64>,
}

impl RateLimitDecision {
    fn admitted(policy: String, mode: PartitionMode, rules: Vec<RuleState>) -> Self {
        Self {
            allowed: true,
            policy,
            mode,
            rules,
            retry_after_secs: None,
        }
    }

    fn denied(
        policy: String,
        mode: PartitionMode,
        rules: Vec<RuleState>,
        retry_after_secs: u64,
    ) -> Self {
        Self {
            allowed: false,
            policy,
            mode,
            rules,
            retry_after_secs: Some(retry_after_secs),
        }
    }

    /// Advisory metadata for the response. Rendered on every admitted
    /// request and on denials (alongside `Retry-After`).
    pub fn headers(&self) -> Vec<(String, String)> {
        let mut headers = vec![
            ("X-Rate-Limit-Policy".to_string(), self.policy.clone()),
            (
                "X-Rate-Limit-Rules".to_string(),
                self.mode.as_str().to_string(),
            ),
        ];

        if self.rules.is_empty() {
            return headers;
        }

        let segment = self.mode.header_segment();
        let rules = self
            .rules
            .iter()
            .map(|r| format!("{}:{}:{}", r.max_hits, r.period_seconds, r.timeout_seconds))
            .collect::<Vec<_>>()
            .join(",");
        headers.push((format!("X-Rate-Limit-{}", segment), rules));

        // State reflects the rule that denied, or the first rule when all
        // admitted (and during a standing timeout, where no bucket moved).
        let state_rule = self
            .rules
            .iter()
            .find(|r| r.count > r.max_hits as i64)
            .unwrap_or(&self.rules[0]);
        let mut state = format!("{}:{}", state_rule.count, state_rule.period_seconds);
        if let Some(retry) = self.retry_after_secs {
            state.push_str(&format!(":{}", retry));
        }
        headers.push((format!("X-Rate-Limit-{}-State", segment), state));

        headers
    }
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct BucketInfo {
    pub key: String,
    pub count: i64,
    pub ttl_secs: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TimeoutInfo {
    pub key: String,
    pub ttl_secs: u64,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct RateLimitMetrics {
    pub active_buckets: usize,
    pub active_timeouts: usize,
    pub buckets: Vec<BucketInfo>,
    pub timeouts: Vec<TimeoutInfo>,
}

pub struct RateLimitEngine {
    kv: Arc<dyn KvStore>,
    clock: Arc<dyn Clock>,
    settings: Arc<RateLimitSettings>,
}

impl RateLimitEngine {
    pub fn new(
        kv: Arc<dyn KvStore>,
        clock: Arc<dyn Clock>,
        settings: Arc<RateLimitSettings>,
    ) -> Self {
        Self {
            kv,
            clock,
            settings,
        }
    }

    pub fn settings(&self) -> &Arc<RateLimitSettings> {
        &self.settings
    }

    /// Admit or deny one request for `partition` against the policy the
    /// path resolves to.
    pub async fn check(
        &self,
        partition: &Partition,
        path: &str,
    ) -> Result<RateLimitDecision, GatewayError> {
        let snapshot = self.settings.load();
        let (policy_name, policy) = snapshot.resolve_policy(path);

        if !snapshot.enabled {
            return Ok(RateLimitDecision::admitted(
                policy_name,
                partition.mode,
                Vec::new(),
            ));
        }

        // Standing timeout: deny without touching any bucket.
        let timeout_key = rate_limit_timeout_key(&partition.key, &policy_name);
        if let Some(remaining) = self.kv.ttl(&timeout_key).await? {
            let retry = remaining.as_secs().max(1);
            let rules = rule_states(&policy.rules, &[]);
            return Ok(RateLimitDecision::denied(
                policy_name,
                partition.mode,
                rules,
                retry,
            ));
        }

        let mut counts: Vec<i64> = Vec::with_capacity(policy.rules.len());
        for rule in &policy.rules {
            let bucket_key =
                rate_limit_bucket_key(&partition.key, &policy_name, rule.period_seconds);
            let count = self
                .kv
                .incr_with_expiry(&bucket_key, Duration::from_secs(rule.period_seconds))
                .await?;
            counts.push(count);

            if count > rule.max_hits as i64 {
                let leaves_at = self.clock.now_utc()
                    + chrono::Duration::seconds(rule.timeout_seconds as i64);
                self.kv
                    .set_with_ttl(
                        &timeout_key,
                        &leaves_at.timestamp().to_string(),
                        Duration::from_secs(rule.timeout_seconds),
                    )
                    .await?;

                tracing::info!(
                    partition = %partition.key,
                    policy = %policy_name,
                    period = rule.period_seconds,
                    timeout = rule.timeout_seconds,
                    "rate limit tripped"
                );

                let rules = rule_states(&policy.rules, &counts);
                return Ok(RateLimitDecision::denied(
                    policy_name,
                    partition.mode,
                    rules,
                    rule.timeout_seconds,
                ));
            }
        }

        let rules = rule_states(&policy.rules, &counts);
        Ok(RateLimitDecision::admitted(
            policy_name,
            partition.mode,
            rules,
        ))
    }

    /// Admin view over live buckets and timeouts. Scan-based; runs off the
    /// admission path entirely.
    pub async fn metrics(&self) -> Result<RateLimitMetrics, GatewayError> {
        let bucket_keys = self.kv.scan_keys("rl:bucket:*").await?;
        let timeout_keys = self.kv.scan_keys("rl:timeout:*").await?;

        let counts = self.kv.multi_get(&bucket_keys).await?;
        let mut buckets = Vec::with_capacity(bucket_keys.len());
        for (key, value) in bucket_keys.into_iter().zip(counts) {
            let ttl_secs = self
                .kv
                .ttl(&key)
                .await?
                .map(|d| d.as_secs())
                .unwrap_or(0);
            buckets.push(BucketInfo {
                count: value.and_then(|v| v.parse().ok()).unwrap_or(0),
                key,
                ttl_secs,
            });
        }

        let mut timeouts = Vec::with_capacity(timeout_keys.len());
        for key in timeout_keys {
            let ttl_secs = self
                .kv
                .ttl(&key)
                .await?
                .map(|d| d.as_secs())
                .unwrap_or(0);
            timeouts.push(TimeoutInfo { key, ttl_secs });
        }

        Ok(RateLimitMetrics {
            active_buckets: buckets.len(),
            active_timeouts: timeouts.len(),
            buckets,
            timeouts,
        })
    }

    /// Clear rate-limit state: everything, or just one partition's keys.
    pub async fn reset(&self, partition: Option<&str>) -> Result<u64, GatewayError> {
        let (bucket_pattern, timeout_pattern) = match partition {
            Some(p) => (format!("rl:bucket:{}:*", p), format!("rl:timeout:{}:*", p)),
            None => ("rl:bucket:*".to_string(), "rl:timeout:*".to_string()),
        };

        let mut keys = self.kv.scan_keys(&bucket_pattern).await?;
        keys.extend(self.kv.scan_keys(&timeout_pattern).await?);
        let removed = self.kv.delete(&keys).await?;
        tracing::info!(removed, partition = ?partition, "rate-limit state reset");
        Ok(removed)
    }
}

fn rule_states(rules: &[RateLimitRule], counts: &[i64]) -> Vec<RuleState> {
    rules
        .iter()
        .enumerate()
        .map(|(i, rule)| RuleState {
            max_hits: rule.max_hits,
            period_seconds: rule.period_seconds,
            timeout_seconds: rule.timeout_seconds,
            count: counts.get(i).copied().unwrap_or(0),
        })
        .collect()
}

// Distributed rate limiting
//
// Policy-driven fixed-window counters and timeouts persisted in the KV
// store, shared by the HTTP middleware and the hub pipeline.

pub mod config;
pub mod engine;

pub use config::{RateLimitConfig, RateLimitPolicy, RateLimitRule, RateLimitSettings};
pub use engine::{Partition, PartitionMode, RateLimitDecision, RateLimitEngine, RuleState};

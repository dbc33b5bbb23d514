// ============================================
// Per-connection payload encryption
// ============================================
//
// ECDH key exchange, AES-GCM sealed envelopes with ECDSA signatures,
// replay protection, and scheduled key rotation. State is keyed by user
// id, not by socket: a client with several hub connections shares one key
// schedule, so a rotation completed on one connection covers them all.

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use arc_swap::ArcSwap;
use serde::{Deserialize, Serialize};

pub mod envelope;
pub mod replay;
pub mod service;

#[cfg(test)]
pub mod testutil;

pub use envelope::SecureEnvelope;
pub use service::{
    EncryptionService, KeyExchangeRequest, KeyExchangeResponse, KeyRotationAck,
    KeyRotationRequest,
};

/// HKDF info string baked into every key derivation.
pub const HKDF_INFO: &[u8] = b"titan-encryption-key";

/// How far in the past an envelope timestamp may lie.
pub const MAX_TIMESTAMP_AGE_SECS: i64 = 60;

/// Forward clock-skew tolerance for envelope timestamps.
pub const MAX_FORWARD_SKEW_SECS: i64 = 5;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionConfig {
    pub enabled: bool,
    /// When set, plaintext hub calls from connections that hold encryption
    /// state are rejected.
    pub required: bool,
    pub rotation_interval_secs: u64,
    pub max_messages_per_key: u64,
    pub previous_key_grace_secs: u64,
    pub replay_window_secs: u64,
}

impl Default for EncryptionConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            required: false,
            rotation_interval_secs: 3_600,
            max_messages_per_key: 10_000,
            previous_key_grace_secs: 30,
            replay_window_secs: 60,
        }
    }
}

/// Runtime encryption toggles behind an atomic snapshot, mutated by the
/// admin control plane.
pub struct EncryptionSettings {
    snapshot: ArcSwap<EncryptionConfig>,
}

impl EncryptionSettings {
    pub fn new(config: EncryptionConfig) -> Self {
        Self {
            snapshot: ArcSwap::from_pointee(config),
        }
    }

    pub fn load(&self) -> Arc<EncryptionConfig> {
        self.snapshot.load_full()
    }

    pub fn update<F>(&self, mutate: F)
    where
        F: FnOnce(&mut EncryptionConfig),
    {
        let mut next = (*self.load()).clone();
        mutate(&mut next);
        self.snapshot.store(Arc::new(next));
    }
}

impl Default for EncryptionSettings {
    fn default() -> Self {
        Self::new(EncryptionConfig::default())
    }
}

// ============================================
// Metrics
// ============================================

#[derive(Default)]
pub struct CryptoMetrics {
    pub key_exchanges: AtomicU64,
    pub messages_sealed: AtomicU64,
    pub messages_opened: AtomicU64,
    pub rotations_initiated: AtomicU64,
    pub rotations_completed: AtomicU64,
    pub decrypt_failures: AtomicU64,
    pub expired_keys_cleaned: AtomicU64,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CryptoMetricsSnapshot {
    pub key_exchanges: u64,
    pub messages_sealed: u64,
    pub messages_opened: u64,
    pub rotations_initiated: u64,
    pub rotations_completed: u64,
    pub decrypt_failures: u64,
    pub expired_keys_cleaned: u64,
}

impl CryptoMetrics {
    pub fn snapshot(&self) -> CryptoMetricsSnapshot {
        CryptoMetricsSnapshot {
            key_exchanges: self.key_exchanges.load(Ordering::Relaxed),
            messages_sealed: self.messages_sealed.load(Ordering::Relaxed),
            messages_opened: self.messages_opened.load(Ordering::Relaxed),
            rotations_initiated: self.rotations_initiated.load(Ordering::Relaxed),
            rotations_completed: self.rotations_completed.load(Ordering::Relaxed),
            decrypt_failures: self.decrypt_failures.load(Ordering::Relaxed),
            expired_keys_cleaned: self.expired_keys_cleaned.load(Ordering::Relaxed),
        }
    }
}

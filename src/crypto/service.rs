// ============================================
// Encryption service
// ============================================
//
// Owns every user's key schedule on this node: ECDH key exchange, sealing
// and opening of envelopes, and the rotation lifecycle. Two slots exist per
// user — *current* (seals and opens) and *previous* (opens only, for a
// bounded grace after rotation) — plus a *pending* keypair between
// initiate and complete of a rotation.
//
// Encryption state never leaves this node. A reconnect that lands on a
// different node performs a fresh key exchange.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::Ordering;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};
use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use chrono::{DateTime, Utc};
use hkdf::Hkdf;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
use rand::RngCore;
use rand::rngs::OsRng;
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use tokio::sync::{Mutex, RwLock};
use uuid::Uuid;

use crate::error::{GatewayError, ViolationKind};
use crate::utils::Clock;

use super::envelope::{NONCE_LEN, SecureEnvelope, signing_transcript};
use super::replay::ReplayWindow;
use super::{
    CryptoMetrics, CryptoMetricsSnapshot, EncryptionSettings, HKDF_INFO, MAX_FORWARD_SKEW_SECS,
    MAX_TIMESTAMP_AGE_SECS,
};

/// Replay ring capacity per user. Sized well above the expected number of
/// in-flight messages inside the replay window.
const REPLAY_CAPACITY: usize = 1_024;

/// Pending rotations the client never acknowledged are dropped after this
/// many seconds.
const STALE_PENDING_SECS: i64 = 60;

// ============================================
// Wire messages
// ============================================

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyExchangeRequest {
    /// Client ECDH public key, SPKI DER, base64.
    pub client_public_key: String,
    /// Client ECDSA verify key, SPKI DER, base64.
    pub client_signing_public_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyExchangeResponse {
    pub key_id: String,
    pub server_public_key: String,
    pub server_signing_public_key: String,
    pub hkdf_salt: String,
}

/// Pushed to the client when the server wants new keys.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRotationRequest {
    pub key_id: String,
    pub server_public_key: String,
    pub hkdf_salt: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct KeyRotationAck {
    pub key_id: String,
    pub client_public_key: String,
    pub client_signing_public_key: String,
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionCryptoStats {
    pub key_id: String,
    pub message_count: u64,
    pub send_sequence: i64,
    pub created_at: DateTime<Utc>,
    pub has_previous_key: bool,
    pub rotation_pending: bool,
    pub needs_rotation: bool,
}

// ============================================
// Per-user state
// ============================================

struct KeySlot {
    key_id: String,
    aead_key: [u8; 32],
    /// Kept so the slot is self-contained; the shared secret is never
    /// re-derived after creation.
    #[allow(dead_code)]
    server_ecdh: p256::SecretKey,
    server_signing: SigningKey,
    client_verify: VerifyingKey,
    message_count: u64,
    created_at: DateTime<Utc>,
    /// Set on demotion to *previous*; the slot only decrypts until then.
    expires_at: Option<DateTime<Utc>>,
}

/// Tentative keypair between initiate and complete of a rotation. Only the
/// ECDH pair rotates; the rotation request carries no new verify key, so
/// the server's ECDSA key persists across rotations.
struct PendingRotation {
    key_id: String,
    server_ecdh: p256::SecretKey,
    hkdf_salt: [u8; 32],
    started_at: DateTime<Utc>,
}

struct UserCryptoState {
    current: Option<KeySlot>,
    previous: Option<KeySlot>,
    pending: Option<PendingRotation>,
    send_sequence: i64,
    replay: ReplayWindow,
}

impl UserCryptoState {
    fn new(replay_window_secs: u64) -> Self {
        Self {
            current: None,
            previous: None,
            pending: None,
            send_sequence: 0,
            replay: ReplayWindow::new(replay_window_secs as i64 * 1_000, REPLAY_CAPACITY),
        }
    }
}

// ============================================
// Service
// ============================================

pub struct EncryptionService {
    states: RwLock<HashMap<String, Arc<Mutex<UserCryptoState>>>>,
    settings: Arc<EncryptionSettings>,
    metrics: CryptoMetrics,
    clock: Arc<dyn Clock>,
}

impl EncryptionService {
    pub fn new(clock: Arc<dyn Clock>, settings: Arc<EncryptionSettings>) -> Self {
        Self {
            states: RwLock::new(HashMap::new()),
            settings,
            metrics: CryptoMetrics::default(),
            clock,
        }
    }

    pub fn settings(&self) -> &Arc<EncryptionSettings> {
        &self.settings
    }

    pub fn metrics_snapshot(&self) -> CryptoMetricsSnapshot {
        self.metrics.snapshot()
    }

    async fn state_of(&self, user_id: &str) -> Option<Arc<Mutex<UserCryptoState>>> {
        self.states.read().await.get(user_id).cloned()
    }

    async fn state_or_create(&self, user_id: &str) -> Arc<Mutex<UserCryptoState>> {
        if let Some(state) = self.state_of(user_id).await {
            return state;
        }
        let replay_window = self.settings.load().replay_window_secs;
        let mut states = self.states.write().await;
        states
            .entry(user_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(UserCryptoState::new(replay_window))))
            .clone()
    }

    /// Whether the user currently holds a negotiated key on this node.
    pub async fn has_state(&self, user_id: &str) -> bool {
        match self.state_of(user_id).await {
            Some(state) => state.lock().await.current.is_some(),
            None => false,
        }
    }

    // ============================================
    // Key exchange
    // ============================================

    pub async fn key_exchange(
        &self,
        user_id: &str,
        request: &KeyExchangeRequest,
    ) -> Result<KeyExchangeResponse, GatewayError> {
        let client_public = decode_ecdh_public(&request.client_public_key)?;
        let client_verify = decode_verifying_key(&request.client_signing_public_key)?;

        let server_ecdh = p256::SecretKey::random(&mut OsRng);
        let server_signing = SigningKey::random(&mut OsRng);
        let mut salt = [0u8; 32];
        OsRng.fill_bytes(&mut salt);

        let aead_key = derive_aead_key(&server_ecdh, &client_public, &salt)?;
        let key_id = Uuid::new_v4().to_string();
        let now = self.clock.now_utc();

        let response = KeyExchangeResponse {
            key_id: key_id.clone(),
            server_public_key: encode_ecdh_public(&server_ecdh.public_key())?,
            server_signing_public_key: encode_verifying_key(server_signing.verifying_key())?,
            hkdf_salt: BASE64.encode(salt),
        };

        let slot = KeySlot {
            key_id: key_id.clone(),
            aead_key,
            server_ecdh,
            server_signing,
            client_verify,
            message_count: 0,
            created_at: now,
            expires_at: None,
        };

        let grace = self.settings.load().previous_key_grace_secs;
        let state = self.state_or_create(user_id).await;
        let mut state = state.lock().await;

        // A duplicate handshake (client remount, racing tabs) demotes the
        // old key instead of breaking messages already in flight with it.
        if let Some(mut old) = state.current.take() {
            old.expires_at = Some(now + chrono::Duration::seconds(grace as i64));
            state.previous = Some(old);
        }
        state.current = Some(slot);

        self.metrics.key_exchanges.fetch_add(1, Ordering::Relaxed);
        tracing::info!(user_id, %key_id, "key exchange completed");
        Ok(response)
    }

    // ============================================
    // Seal / open
    // ============================================

    /// Seal a payload for `user_id`. The hint selects the slot whose key-id
    /// matched the inbound envelope; absent a hint the current slot seals.
    pub async fn encrypt_and_sign(
        &self,
        user_id: &str,
        payload: &[u8],
        key_id_hint: Option<&str>,
    ) -> Result<SecureEnvelope, GatewayError> {
        let state = self
            .state_of(user_id)
            .await
            .ok_or(GatewayError::SecurityViolation(ViolationKind::UnknownKeyId))?;
        let mut state = state.lock().await;

        let now_millis = self.clock.now_millis();
        state.send_sequence += 1;
        let sequence = state.send_sequence;

        let slot = match key_id_hint {
            Some(hint) => {
                if state.current.as_ref().is_some_and(|s| s.key_id == hint) {
                    state.current.as_mut()
                } else if state.previous.as_ref().is_some_and(|s| s.key_id == hint) {
                    state.previous.as_mut()
                } else {
                    state.current.as_mut()
                }
            }
            None => state.current.as_mut(),
        }
        .ok_or(GatewayError::SecurityViolation(ViolationKind::UnknownKeyId))?;

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);

        let cipher = Aes256Gcm::new_from_slice(&slot.aead_key)
            .map_err(|_| GatewayError::SecurityViolation(ViolationKind::DecryptFailed))?;
        let sealed = cipher
            .encrypt(Nonce::from_slice(&nonce), payload)
            .map_err(|_| GatewayError::SecurityViolation(ViolationKind::DecryptFailed))?;

        // aes-gcm appends the 16-byte tag to the ciphertext.
        let split = sealed.len() - 16;
        let (ciphertext, tag) = sealed.split_at(split);

        let transcript =
            signing_transcript(&slot.key_id, &nonce, ciphertext, tag, now_millis, sequence);
        let signature: Signature = slot.server_signing.sign(&transcript);

        slot.message_count += 1;
        self.metrics.messages_sealed.fetch_add(1, Ordering::Relaxed);

        Ok(SecureEnvelope {
            key_id: slot.key_id.clone(),
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ciphertext),
            tag: BASE64.encode(tag),
            signature: BASE64.encode(signature.to_bytes()),
            timestamp: now_millis,
            sequence_number: sequence,
        })
    }

    /// Open an inbound envelope. No state advances on failure; on success
    /// the sequence is recorded in the replay window.
    pub async fn decrypt_and_verify(
        &self,
        user_id: &str,
        envelope: &SecureEnvelope,
    ) -> Result<Vec<u8>, GatewayError> {
        let result = self.open_inner(user_id, envelope).await;
        if let Err(GatewayError::SecurityViolation(kind)) = &result {
            self.metrics.decrypt_failures.fetch_add(1, Ordering::Relaxed);
            tracing::warn!(
                user_id,
                key_id = %envelope.key_id,
                reason = kind.as_str(),
                "envelope rejected"
            );
        }
        result
    }

    async fn open_inner(
        &self,
        user_id: &str,
        envelope: &SecureEnvelope,
    ) -> Result<Vec<u8>, GatewayError> {
        let bytes = envelope.decode_bytes()?;

        let state = self
            .state_of(user_id)
            .await
            .ok_or(GatewayError::SecurityViolation(ViolationKind::UnknownKeyId))?;
        let mut state = state.lock().await;

        let now = self.clock.now_utc();
        let now_millis = self.clock.now_millis();

        // Timestamp window: bounded past age, small forward skew.
        let age_millis = now_millis - envelope.timestamp;
        if age_millis > MAX_TIMESTAMP_AGE_SECS * 1_000
            || -age_millis > MAX_FORWARD_SKEW_SECS * 1_000
        {
            return Err(GatewayError::SecurityViolation(ViolationKind::TimestampSkew));
        }

        if !state
            .replay
            .is_fresh(envelope.sequence_number, now_millis)
        {
            return Err(GatewayError::SecurityViolation(ViolationKind::Replay));
        }

        let slot = resolve_slot(&state, &envelope.key_id, now)?;

        let transcript = signing_transcript(
            &envelope.key_id,
            &bytes.nonce,
            &bytes.ciphertext,
            &bytes.tag,
            envelope.timestamp,
            envelope.sequence_number,
        );
        let signature = Signature::from_slice(&bytes.signature)
            .map_err(|_| GatewayError::SecurityViolation(ViolationKind::BadSignature))?;
        slot.client_verify
            .verify(&transcript, &signature)
            .map_err(|_| GatewayError::SecurityViolation(ViolationKind::BadSignature))?;

        let cipher = Aes256Gcm::new_from_slice(&slot.aead_key)
            .map_err(|_| GatewayError::SecurityViolation(ViolationKind::DecryptFailed))?;
        let mut combined = Vec::with_capacity(bytes.ciphertext.len() + bytes.tag.len());
        combined.extend_from_slice(&bytes.ciphertext);
        combined.extend_from_slice(&bytes.tag);
        let plaintext = cipher
            .decrypt(Nonce::from_slice(&bytes.nonce), combined.as_ref())
            .map_err(|_| GatewayError::SecurityViolation(ViolationKind::DecryptFailed))?;

        state.replay.record(envelope.sequence_number, now_millis);
        self.metrics.messages_opened.fetch_add(1, Ordering::Relaxed);
        Ok(plaintext)
    }

    // ============================================
    // Rotation lifecycle
    // ============================================

    pub async fn needs_rotation(&self, user_id: &str) -> bool {
        let Some(state) = self.state_of(user_id).await else {
            return false;
        };
        let state = state.lock().await;
        let config = self.settings.load();
        let now = self.clock.now_utc();

        state.current.as_ref().is_some_and(|slot| {
            slot.message_count >= config.max_messages_per_key
                || (now - slot.created_at).num_seconds() >= config.rotation_interval_secs as i64
        })
    }

    /// Generate a fresh tentative keypair and the rotation request the
    /// client must acknowledge. Repeated initiations replace the tentative
    /// pair.
    pub async fn initiate_rotation(
        &self,
        user_id: &str,
    ) -> Result<KeyRotationRequest, GatewayError> {
        let state = self
            .state_of(user_id)
            .await
            .ok_or(GatewayError::NotFound)?;
        let mut state = state.lock().await;
        if state.current.is_none() {
            return Err(GatewayError::NotFound);
        }

        let server_ecdh = p256::SecretKey::random(&mut OsRng);
        let mut salt = [0u8; 32];
        OsRng.fill_bytes(&mut salt);
        let key_id = Uuid::new_v4().to_string();

        let request = KeyRotationRequest {
            key_id: key_id.clone(),
            server_public_key: encode_ecdh_public(&server_ecdh.public_key())?,
            hkdf_salt: BASE64.encode(salt),
        };

        state.pending = Some(PendingRotation {
            key_id: key_id.clone(),
            server_ecdh,
            hkdf_salt: salt,
            started_at: self.clock.now_utc(),
        });

        self.metrics
            .rotations_initiated
            .fetch_add(1, Ordering::Relaxed);
        tracing::info!(user_id, %key_id, "key rotation initiated");
        Ok(request)
    }

    /// Promote the tentative keypair once the client acknowledges with its
    /// fresh keys. The displaced current slot keeps decrypting for a
    /// bounded grace.
    pub async fn complete_rotation(
        &self,
        user_id: &str,
        ack: &KeyRotationAck,
    ) -> Result<(), GatewayError> {
        let client_public = decode_ecdh_public(&ack.client_public_key)?;
        let client_verify = decode_verifying_key(&ack.client_signing_public_key)?;

        let state = self
            .state_of(user_id)
            .await
            .ok_or(GatewayError::NotFound)?;
        let mut state = state.lock().await;

        let pending = state
            .pending
            .take()
            .ok_or_else(|| GatewayError::Conflict("no rotation in progress".to_string()))?;
        if pending.key_id != ack.key_id {
            state.pending = Some(pending);
            return Err(GatewayError::Conflict(
                "acknowledgement does not match the pending rotation".to_string(),
            ));
        }

        let aead_key = derive_aead_key(&pending.server_ecdh, &client_public, &pending.hkdf_salt)?;
        let now = self.clock.now_utc();
        let grace = self.settings.load().previous_key_grace_secs;

        let old = state
            .current
            .take()
            .ok_or_else(|| GatewayError::Conflict("no active key to rotate".to_string()))?;
        let server_signing = old.server_signing.clone();
        let mut old = old;
        old.expires_at = Some(now + chrono::Duration::seconds(grace as i64));
        state.previous = Some(old);

        state.current = Some(KeySlot {
            key_id: pending.key_id.clone(),
            aead_key,
            server_ecdh: pending.server_ecdh,
            server_signing,
            client_verify,
            message_count: 0,
            created_at: now,
            expires_at: None,
        });

        self.metrics
            .rotations_completed
            .fetch_add(1, Ordering::Relaxed);
        tracing::info!(user_id, key_id = %pending.key_id, "key rotation completed");
        Ok(())
    }

    /// Drop previous slots past their grace and pending rotations the
    /// client abandoned. Returns how many slots were purged.
    pub async fn cleanup_expired(&self) -> usize {
        let now = self.clock.now_utc();
        let states: Vec<Arc<Mutex<UserCryptoState>>> =
            self.states.read().await.values().cloned().collect();

        let mut purged = 0;
        for state in states {
            let mut state = state.lock().await;
            if state
                .previous
                .as_ref()
                .and_then(|s| s.expires_at)
                .is_some_and(|at| now >= at)
            {
                state.previous = None;
                purged += 1;
            }
            if state
                .pending
                .as_ref()
                .is_some_and(|p| (now - p.started_at).num_seconds() >= STALE_PENDING_SECS)
            {
                state.pending = None;
            }
        }

        if purged > 0 {
            self.metrics
                .expired_keys_cleaned
                .fetch_add(purged as u64, Ordering::Relaxed);
        }
        purged
    }

    /// Tear down a user's encryption state entirely.
    pub async fn remove(&self, user_id: &str) -> bool {
        self.states.write().await.remove(user_id).is_some()
    }

    pub async fn stats(&self, user_id: &str) -> Option<ConnectionCryptoStats> {
        let state = self.state_of(user_id).await?;
        let needs = self.needs_rotation(user_id).await;
        let state = state.lock().await;
        let slot = state.current.as_ref()?;
        Some(ConnectionCryptoStats {
            key_id: slot.key_id.clone(),
            message_count: slot.message_count,
            send_sequence: state.send_sequence,
            created_at: slot.created_at,
            has_previous_key: state.previous.is_some(),
            rotation_pending: state.pending.is_some(),
            needs_rotation: needs,
        })
    }

    /// Users whose current key has crossed a rotation threshold.
    pub async fn list_needing_rotation(&self) -> Vec<String> {
        let users: Vec<String> = self.states.read().await.keys().cloned().collect();
        let mut due = Vec::new();
        for user in users {
            if self.needs_rotation(&user).await {
                due.push(user);
            }
        }
        due
    }

    /// Every user holding encryption state on this node.
    pub async fn active_users(&self) -> Vec<String> {
        self.states.read().await.keys().cloned().collect()
    }
}

/// Resolve the slot an envelope's key-id addresses. Previous only counts
/// while its grace has not lapsed.
fn resolve_slot<'a>(
    state: &'a UserCryptoState,
    key_id: &str,
    now: DateTime<Utc>,
) -> Result<&'a KeySlot, GatewayError> {
    if let Some(slot) = state.current.as_ref().filter(|s| s.key_id == key_id) {
        return Ok(slot);
    }
    if let Some(slot) = state.previous.as_ref().filter(|s| s.key_id == key_id) {
        if slot.expires_at.is_none_or(|at| now < at) {
            return Ok(slot);
        }
    }
    Err(GatewayError::SecurityViolation(ViolationKind::UnknownKeyId))
}

// ============================================
// Key material helpers
// ============================================

fn derive_aead_key(
    server_secret: &p256::SecretKey,
    client_public: &p256::PublicKey,
    salt: &[u8],
) -> Result<[u8; 32], GatewayError> {
    let shared = p256::ecdh::diffie_hellman(
        server_secret.to_nonzero_scalar(),
        client_public.as_affine(),
    );
    let hkdf = Hkdf::<Sha256>::new(Some(salt), shared.raw_secret_bytes());
    let mut key = [0u8; 32];
    hkdf.expand(HKDF_INFO, &mut key)
        .map_err(|_| GatewayError::SecurityViolation(ViolationKind::DecryptFailed))?;
    Ok(key)
}

fn encode_ecdh_public(key: &p256::PublicKey) -> Result<String, GatewayError> {
    let der = key
        .to_public_key_der()
        .map_err(|e| GatewayError::TransientFailure(e.to_string()))?;
    Ok(BASE64.encode(der.as_bytes()))
}

fn decode_ecdh_public(encoded: &str) -> Result<p256::PublicKey, GatewayError> {
    let der = BASE64
        .decode(encoded)
        .map_err(|_| GatewayError::ValidationFailed("malformed public key".to_string()))?;
    p256::PublicKey::from_public_key_der(&der)
        .map_err(|_| GatewayError::ValidationFailed("malformed public key".to_string()))
}

fn encode_verifying_key(key: &VerifyingKey) -> Result<String, GatewayError> {
    let der = key
        .to_public_key_der()
        .map_err(|e| GatewayError::TransientFailure(e.to_string()))?;
    Ok(BASE64.encode(der.as_bytes()))
}

fn decode_verifying_key(encoded: &str) -> Result<VerifyingKey, GatewayError> {
    let der = BASE64
        .decode(encoded)
        .map_err(|_| GatewayError::ValidationFailed("malformed signing key".to_string()))?;
    VerifyingKey::from_public_key_der(&der)
        .map_err(|_| GatewayError::ValidationFailed("malformed signing key".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::testutil::TestClient;
    use crate::utils::test_clock::ManualClock;

    fn service() -> (Arc<ManualClock>, Arc<EncryptionSettings>, EncryptionService) {
        let clock = Arc::new(ManualClock::at_epoch());
        let settings = Arc::new(EncryptionSettings::default());
        (
            clock.clone(),
            settings.clone(),
            EncryptionService::new(clock, settings),
        )
    }

    async fn exchanged(
        service: &EncryptionService,
        user: &str,
    ) -> (TestClient, KeyExchangeResponse) {
        let mut client = TestClient::new();
        let response = service
            .key_exchange(user, &client.exchange_request())
            .await
            .unwrap();
        client.complete_exchange(&response);
        (client, response)
    }

    #[tokio::test]
    async fn client_to_server_round_trip() {
        let (clock, _settings, service) = service();
        let (mut client, response) = exchanged(&service, "u1").await;

        let envelope = client.seal(&response.key_id, b"hello", clock.now_millis());
        let opened = service.decrypt_and_verify("u1", &envelope).await.unwrap();
        assert_eq!(opened, b"hello");
    }

    #[tokio::test]
    async fn server_to_client_round_trip() {
        let (_clock, _settings, service) = service();
        let (client, response) = exchanged(&service, "u1").await;

        let envelope = service
            .encrypt_and_sign("u1", b"state-update", None)
            .await
            .unwrap();
        assert_eq!(envelope.key_id, response.key_id);
        assert_eq!(envelope.sequence_number, 1);
        let opened = client.open(&envelope).unwrap();
        assert_eq!(opened, b"state-update");
    }

    #[tokio::test]
    async fn replayed_envelope_is_rejected() {
        let (clock, _settings, service) = service();
        let (mut client, response) = exchanged(&service, "u1").await;

        let envelope = client.seal(&response.key_id, b"hello", clock.now_millis());
        service.decrypt_and_verify("u1", &envelope).await.unwrap();

        let err = service
            .decrypt_and_verify("u1", &envelope)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::SecurityViolation(ViolationKind::Replay)
        ));
        assert_eq!(service.metrics_snapshot().decrypt_failures, 1);
    }

    #[tokio::test]
    async fn stale_timestamp_is_rejected() {
        let (clock, _settings, service) = service();
        let (mut client, response) = exchanged(&service, "u1").await;

        let envelope = client.seal(&response.key_id, b"old", clock.now_millis() - 120_000);
        let err = service
            .decrypt_and_verify("u1", &envelope)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::SecurityViolation(ViolationKind::TimestampSkew)
        ));
    }

    #[tokio::test]
    async fn future_timestamp_beyond_skew_is_rejected() {
        let (clock, _settings, service) = service();
        let (mut client, response) = exchanged(&service, "u1").await;

        let envelope = client.seal(&response.key_id, b"soon", clock.now_millis() + 10_000);
        assert!(service.decrypt_and_verify("u1", &envelope).await.is_err());

        // Within the 5 s forward allowance it passes.
        let envelope = client.seal(&response.key_id, b"soon", clock.now_millis() + 3_000);
        assert!(service.decrypt_and_verify("u1", &envelope).await.is_ok());
    }

    #[tokio::test]
    async fn tampered_ciphertext_fails_signature() {
        let (clock, _settings, service) = service();
        let (mut client, response) = exchanged(&service, "u1").await;

        let mut envelope = client.seal(&response.key_id, b"hello", clock.now_millis());
        let mut bytes = BASE64.decode(&envelope.ciphertext).unwrap();
        bytes[0] ^= 0x01;
        envelope.ciphertext = BASE64.encode(bytes);

        let err = service
            .decrypt_and_verify("u1", &envelope)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::SecurityViolation(ViolationKind::BadSignature)
        ));
    }

    #[tokio::test]
    async fn unknown_key_id_is_rejected() {
        let (clock, _settings, service) = service();
        let (mut client, _response) = exchanged(&service, "u1").await;

        let envelope = client.seal("no-such-key", b"hello", clock.now_millis());
        let err = service
            .decrypt_and_verify("u1", &envelope)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::SecurityViolation(ViolationKind::UnknownKeyId)
        ));
    }

    #[tokio::test]
    async fn rotation_switches_sealing_to_the_new_key() {
        let (clock, _settings, service) = service();
        let (mut client, first) = exchanged(&service, "u1").await;

        let request = service.initiate_rotation("u1").await.unwrap();
        assert_ne!(request.key_id, first.key_id);

        let mut rotated = TestClient::new();
        service
            .complete_rotation("u1", &rotated.rotation_ack(&request))
            .await
            .unwrap();
        rotated.complete_rotation(&request, &first);

        // Outbound now uses the new key id.
        let envelope = service.encrypt_and_sign("u1", b"fresh", None).await.unwrap();
        assert_eq!(envelope.key_id, request.key_id);

        // Old-key envelopes still open during the grace…
        let old = client.seal(&first.key_id, b"late", clock.now_millis());
        assert!(service.decrypt_and_verify("u1", &old).await.is_ok());

        // …and fail once it lapses.
        clock.advance_secs(31);
        let too_late = client.seal(&first.key_id, b"too-late", clock.now_millis());
        let err = service
            .decrypt_and_verify("u1", &too_late)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            GatewayError::SecurityViolation(ViolationKind::UnknownKeyId)
        ));
    }

    #[tokio::test]
    async fn rotation_ack_with_wrong_key_id_conflicts() {
        let (_clock, _settings, service) = service();
        let (_client, _response) = exchanged(&service, "u1").await;

        let request = service.initiate_rotation("u1").await.unwrap();
        let rotated = TestClient::new();
        let mut ack = rotated.rotation_ack(&request);
        ack.key_id = "different".to_string();

        assert!(matches!(
            service.complete_rotation("u1", &ack).await,
            Err(GatewayError::Conflict(_))
        ));
        // The pending rotation survives a bad ack.
        let good_ack = rotated.rotation_ack(&request);
        service.complete_rotation("u1", &good_ack).await.unwrap();
    }

    #[tokio::test]
    async fn needs_rotation_by_message_count() {
        let (_clock, settings, service) = service();
        settings.update(|c| c.max_messages_per_key = 3);
        let (_client, _response) = exchanged(&service, "u1").await;

        assert!(!service.needs_rotation("u1").await);
        for _ in 0..3 {
            service.encrypt_and_sign("u1", b"m", None).await.unwrap();
        }
        assert!(service.needs_rotation("u1").await);
        assert_eq!(service.list_needing_rotation().await, vec!["u1".to_string()]);
    }

    #[tokio::test]
    async fn needs_rotation_by_age() {
        let (clock, _settings, service) = service();
        let (_client, _response) = exchanged(&service, "u1").await;

        assert!(!service.needs_rotation("u1").await);
        clock.advance_secs(3_601);
        assert!(service.needs_rotation("u1").await);
    }

    #[tokio::test]
    async fn cleanup_purges_lapsed_previous_slots() {
        let (clock, _settings, service) = service();
        let (_client, _first) = exchanged(&service, "u1").await;
        // Second exchange demotes the first key to previous.
        let (_client2, _second) = exchanged(&service, "u1").await;

        assert_eq!(service.cleanup_expired().await, 0);
        clock.advance_secs(31);
        assert_eq!(service.cleanup_expired().await, 1);
        assert_eq!(service.metrics_snapshot().expired_keys_cleaned, 1);
    }

    #[tokio::test]
    async fn remove_clears_all_state() {
        let (_clock, _settings, service) = service();
        let (_client, _response) = exchanged(&service, "u1").await;

        assert!(service.has_state("u1").await);
        assert!(service.remove("u1").await);
        assert!(!service.has_state("u1").await);
        assert!(!service.remove("u1").await);
    }

    #[tokio::test]
    async fn stats_reflect_the_current_slot() {
        let (_clock, _settings, service) = service();
        let (_client, response) = exchanged(&service, "u1").await;
        service.encrypt_and_sign("u1", b"m", None).await.unwrap();

        let stats = service.stats("u1").await.unwrap();
        assert_eq!(stats.key_id, response.key_id);
        assert_eq!(stats.message_count, 1);
        assert_eq!(stats.send_sequence, 1);
        assert!(!stats.has_previous_key);
    }
}

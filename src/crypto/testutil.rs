// Client-side crypto harness for tests: holds the client's ECDH and ECDSA
// keys, mirrors the server's key derivation, and seals/opens envelopes the
// way a real client would.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use hkdf::Hkdf;
use p256::ecdsa::signature::{Signer, Verifier};
use p256::ecdsa::{Signature, SigningKey, VerifyingKey};
use p256::pkcs8::{DecodePublicKey, EncodePublicKey};
use rand::RngCore;
use rand::rngs::OsRng;
use sha2::Sha256;

use aes_gcm::aead::{Aead, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce};

use super::envelope::{NONCE_LEN, SecureEnvelope, signing_transcript};
use super::service::{
    KeyExchangeRequest, KeyExchangeResponse, KeyRotationAck, KeyRotationRequest,
};
use super::HKDF_INFO;

pub struct TestClient {
    ecdh: p256::SecretKey,
    signing: SigningKey,
    aead_key: Option<[u8; 32]>,
    server_verify: Option<VerifyingKey>,
    send_seq: i64,
}

impl TestClient {
    pub fn new() -> Self {
        Self {
            ecdh: p256::SecretKey::random(&mut OsRng),
            signing: SigningKey::random(&mut OsRng),
            aead_key: None,
            server_verify: None,
            send_seq: 0,
        }
    }

    fn public_der_b64(&self) -> String {
        BASE64.encode(self.ecdh.public_key().to_public_key_der().unwrap().as_bytes())
    }

    fn signing_public_der_b64(&self) -> String {
        BASE64.encode(
            self.signing
                .verifying_key()
                .to_public_key_der()
                .unwrap()
                .as_bytes(),
        )
    }

    pub fn exchange_request(&self) -> KeyExchangeRequest {
        KeyExchangeRequest {
            client_public_key: self.public_der_b64(),
            client_signing_public_key: self.signing_public_der_b64(),
        }
    }

    fn derive(&self, server_public_b64: &str, salt_b64: &str) -> [u8; 32] {
        let server_der = BASE64.decode(server_public_b64).unwrap();
        let server_public = p256::PublicKey::from_public_key_der(&server_der).unwrap();
        let salt = BASE64.decode(salt_b64).unwrap();

        let shared = p256::ecdh::diffie_hellman(
            self.ecdh.to_nonzero_scalar(),
            server_public.as_affine(),
        );
        let hkdf = Hkdf::<Sha256>::new(Some(&salt), shared.raw_secret_bytes());
        let mut key = [0u8; 32];
        hkdf.expand(HKDF_INFO, &mut key).unwrap();
        key
    }

    /// Derive the shared AEAD key from a key-exchange response.
    pub fn complete_exchange(&mut self, response: &KeyExchangeResponse) {
        self.aead_key = Some(self.derive(&response.server_public_key, &response.hkdf_salt));
        let der = BASE64.decode(&response.server_signing_public_key).unwrap();
        self.server_verify = Some(VerifyingKey::from_public_key_der(&der).unwrap());
    }

    /// Acknowledge a rotation request with this client's keys.
    pub fn rotation_ack(&self, request: &KeyRotationRequest) -> KeyRotationAck {
        KeyRotationAck {
            key_id: request.key_id.clone(),
            client_public_key: self.public_der_b64(),
            client_signing_public_key: self.signing_public_der_b64(),
        }
    }

    /// Derive the rotated AEAD key. The server's verify key is unchanged by
    /// rotation and comes from the original exchange.
    pub fn complete_rotation(
        &mut self,
        request: &KeyRotationRequest,
        exchange: &KeyExchangeResponse,
    ) {
        self.aead_key = Some(self.derive(&request.server_public_key, &request.hkdf_salt));
        let der = BASE64.decode(&exchange.server_signing_public_key).unwrap();
        self.server_verify = Some(VerifyingKey::from_public_key_der(&der).unwrap());
    }

    /// Seal a payload under `key_id` with an explicit timestamp.
    pub fn seal(&mut self, key_id: &str, payload: &[u8], timestamp_millis: i64) -> SecureEnvelope {
        self.send_seq += 1;
        self.seal_with_sequence(key_id, payload, timestamp_millis, self.send_seq)
    }

    pub fn seal_with_sequence(
        &self,
        key_id: &str,
        payload: &[u8],
        timestamp_millis: i64,
        sequence: i64,
    ) -> SecureEnvelope {
        let key = self.aead_key.expect("exchange not completed");
        let cipher = Aes256Gcm::new_from_slice(&key).unwrap();

        let mut nonce = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce);
        let sealed = cipher.encrypt(Nonce::from_slice(&nonce), payload).unwrap();
        let (ciphertext, tag) = sealed.split_at(sealed.len() - 16);

        let transcript =
            signing_transcript(key_id, &nonce, ciphertext, tag, timestamp_millis, sequence);
        let signature: Signature = self.signing.sign(&transcript);

        SecureEnvelope {
            key_id: key_id.to_string(),
            nonce: BASE64.encode(nonce),
            ciphertext: BASE64.encode(ciphertext),
            tag: BASE64.encode(tag),
            signature: BASE64.encode(signature.to_bytes()),
            timestamp: timestamp_millis,
            sequence_number: sequence,
        }
    }

    /// Open a server-sealed envelope, verifying the server's signature.
    pub fn open(&self, envelope: &SecureEnvelope) -> Option<Vec<u8>> {
        let key = self.aead_key?;
        let verify = self.server_verify.as_ref()?;

        let nonce = BASE64.decode(&envelope.nonce).ok()?;
        let ciphertext = BASE64.decode(&envelope.ciphertext).ok()?;
        let tag = BASE64.decode(&envelope.tag).ok()?;
        let signature = BASE64.decode(&envelope.signature).ok()?;

        let transcript = signing_transcript(
            &envelope.key_id,
            &nonce,
            &ciphertext,
            &tag,
            envelope.timestamp,
            envelope.sequence_number,
        );
        let signature = Signature::from_slice(&signature).ok()?;
        verify.verify(&transcript, &signature).ok()?;

        let cipher = Aes256Gcm::new_from_slice(&key).unwrap();
        let mut combined = ciphertext;
        combined.extend_from_slice(&tag);
        cipher.decrypt(Nonce::from_slice(&nonce), combined.as_ref()).ok()
    }
}

// ============================================
// Secure envelope wire format
// ============================================
//
// A sealed message plus its authenticity metadata. Binary fields travel as
// base64 in JSON. The signature covers a transcript built from the other
// six fields: variable-length fields are u32 little-endian length-prefixed,
// timestamp and sequence are raw little-endian i64.

use base64::{Engine, engine::general_purpose::STANDARD as BASE64};
use serde::{Deserialize, Serialize};

use crate::error::{GatewayError, ViolationKind};

pub const NONCE_LEN: usize = 12;
pub const TAG_LEN: usize = 16;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SecureEnvelope {
    pub key_id: String,
    /// 12-byte AES-GCM nonce, base64.
    pub nonce: String,
    pub ciphertext: String,
    /// 16-byte GCM auth tag, base64.
    pub tag: String,
    /// 64-byte P-256 ECDSA signature (r || s), base64.
    pub signature: String,
    /// Milliseconds since the Unix epoch at sealing time.
    pub timestamp: i64,
    pub sequence_number: i64,
}

/// Decoded binary view of an envelope, validated for field lengths.
pub struct EnvelopeBytes {
    pub nonce: Vec<u8>,
    pub ciphertext: Vec<u8>,
    pub tag: Vec<u8>,
    pub signature: Vec<u8>,
}

impl SecureEnvelope {
    pub fn decode_bytes(&self) -> Result<EnvelopeBytes, GatewayError> {
        let malformed = || GatewayError::SecurityViolation(ViolationKind::MalformedEnvelope);

        let nonce = BASE64.decode(&self.nonce).map_err(|_| malformed())?;
        let ciphertext = BASE64.decode(&self.ciphertext).map_err(|_| malformed())?;
        let tag = BASE64.decode(&self.tag).map_err(|_| malformed())?;
        let signature = BASE64.decode(&self.signature).map_err(|_| malformed())?;

        if nonce.len() != NONCE_LEN || tag.len() != TAG_LEN {
            return Err(malformed());
        }

        Ok(EnvelopeBytes {
            nonce,
            ciphertext,
            tag,
            signature,
        })
    }
}

/// Signing transcript: key-id, nonce, ciphertext, tag (each length-prefixed),
/// then timestamp and sequence as little-endian i64.
pub fn signing_transcript(
    key_id: &str,
    nonce: &[u8],
    ciphertext: &[u8],
    tag: &[u8],
    timestamp: i64,
    sequence: i64,
) -> Vec<u8> {
    let key_bytes = key_id.as_bytes();
    let mut transcript = Vec::with_capacity(
        4 * 4 + key_bytes.len() + nonce.len() + ciphertext.len() + tag.len() + 16,
    );

    for field in [key_bytes, nonce, ciphertext, tag] {
        transcript.extend_from_slice(&(field.len() as u32).to_le_bytes());
        transcript.extend_from_slice(field);
    }
    transcript.extend_from_slice(&timestamp.to_le_bytes());
    transcript.extend_from_slice(&sequence.to_le_bytes());

    transcript
}

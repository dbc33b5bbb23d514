use axum::{
    Json,
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use serde::Serialize;

use crate::kv::KvError;

/// Reason classes for security violations. These are logged with the
/// connection and key-id but never serialised into a response — the wire
/// only ever sees one opaque message per class.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ViolationKind {
    UnknownKeyId,
    TimestampSkew,
    Replay,
    BadSignature,
    DecryptFailed,
    MalformedEnvelope,
}

impl ViolationKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            ViolationKind::UnknownKeyId => "unknown_key_id",
            ViolationKind::TimestampSkew => "timestamp_skew",
            ViolationKind::Replay => "replay",
            ViolationKind::BadSignature => "bad_signature",
            ViolationKind::DecryptFailed => "decrypt_failed",
            ViolationKind::MalformedEnvelope => "malformed_envelope",
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("Authentication required")]
    Unauthenticated,

    #[error("Insufficient permissions")]
    Forbidden,

    #[error("Rate limit exceeded")]
    RateLimited { retry_after_secs: u64 },

    #[error("Encryption is required on this connection")]
    EncryptionRequired,

    #[error("Security violation")]
    SecurityViolation(ViolationKind),

    #[error("Validation failed: {0}")]
    ValidationFailed(String),

    #[error("Not found")]
    NotFound,

    #[error("Conflict")]
    Conflict(String),

    #[error("Transient backend failure")]
    TransientFailure(String),

    #[error("Operation cancelled")]
    Cancelled,
}

impl GatewayError {
    /// Machine-readable code used in HTTP bodies and hub error frames.
    pub fn code(&self) -> &'static str {
        match self {
            GatewayError::Unauthenticated => "UNAUTHENTICATED",
            GatewayError::Forbidden => "FORBIDDEN",
            GatewayError::RateLimited { .. } => "RATE_LIMITED",
            GatewayError::EncryptionRequired => "ENCRYPTION_REQUIRED",
            GatewayError::SecurityViolation(_) => "SECURITY_VIOLATION",
            GatewayError::ValidationFailed(_) => "VALIDATION_FAILED",
            GatewayError::NotFound => "NOT_FOUND",
            GatewayError::Conflict(_) => "CONFLICT",
            GatewayError::TransientFailure(_) => "TRANSIENT_FAILURE",
            GatewayError::Cancelled => "CANCELLED",
        }
    }

    /// Public-facing message. Security violations deliberately collapse to a
    /// single opaque string regardless of the underlying reason class.
    pub fn public_message(&self) -> String {
        match self {
            GatewayError::SecurityViolation(_) => "Message rejected".to_string(),
            GatewayError::Conflict(msg) => msg.clone(),
            GatewayError::ValidationFailed(msg) => format!("Validation failed: {}", msg),
            other => other.to_string(),
        }
    }
}

impl From<KvError> for GatewayError {
    fn from(err: KvError) -> Self {
        match err {
            KvError::NotFound => GatewayError::NotFound,
            KvError::Transient(msg) => GatewayError::TransientFailure(msg),
        }
    }
}

#[derive(Serialize, Clone)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: impl Into<String>) -> Self {
        self.details = Some(details.into());
        self
    }
}

impl IntoResponse for GatewayError {
    fn into_response(self) -> Response {
        let status = match &self {
            GatewayError::Unauthenticated => StatusCode::UNAUTHORIZED,
            GatewayError::Forbidden => StatusCode::FORBIDDEN,
            GatewayError::RateLimited { .. } => StatusCode::TOO_MANY_REQUESTS,
            GatewayError::EncryptionRequired => StatusCode::BAD_REQUEST,
            GatewayError::SecurityViolation(_) => StatusCode::BAD_REQUEST,
            GatewayError::ValidationFailed(_) => StatusCode::BAD_REQUEST,
            GatewayError::NotFound => StatusCode::NOT_FOUND,
            GatewayError::Conflict(_) => StatusCode::CONFLICT,
            GatewayError::TransientFailure(_) => StatusCode::SERVICE_UNAVAILABLE,
            GatewayError::Cancelled => StatusCode::REQUEST_TIMEOUT,
        };

        let body = Json(ErrorResponse::new(self.public_message(), self.code()));

        let mut response = (status, body).into_response();

        if let GatewayError::RateLimited { retry_after_secs } = self {
            if let Ok(value) = retry_after_secs.to_string().parse() {
                response.headers_mut().insert(header::RETRY_AFTER, value);
            }
        }

        response
    }
}

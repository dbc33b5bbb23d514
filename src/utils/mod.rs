// Utility functions

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::{DateTime, Utc};
use rand::RngCore;
use sha2::{Digest, Sha256};

/// Generate an opaque session ticket: 24 random bytes, URL-safe base64
/// without padding (32 characters, no `+` `/` `=`).
pub fn generate_session_ticket() -> String {
    let mut bytes = [0u8; 24];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    URL_SAFE_NO_PAD.encode(bytes)
}

/// Generate a connection-ticket id: 16 random bytes, hex-encoded
/// (32 URL-safe characters).
pub fn generate_connection_ticket_id() -> String {
    let mut bytes = [0u8; 16];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    hex::encode(bytes)
}

/// Hash a bearer token for logging. Raw tickets never appear in logs.
pub fn fingerprint_token(token: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(token.as_bytes());
    hex::encode(&hasher.finalize()[..8])
}

// ============================================
// Clock abstraction
// ============================================
//
// Every component that reasons about expiry (sessions, rate-limit windows,
// envelope timestamps, key rotation) reads time through this trait so tests
// can drive it manually.

pub trait Clock: Send + Sync {
    fn now_utc(&self) -> DateTime<Utc>;

    fn now_millis(&self) -> i64 {
        self.now_utc().timestamp_millis()
    }
}

pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

#[cfg(test)]
pub mod test_clock {
    use std::sync::Mutex;

    use chrono::Duration;

    use super::*;

    /// A clock tests can set and advance.
    pub struct ManualClock {
        now: Mutex<DateTime<Utc>>,
    }

    impl ManualClock {
        pub fn new(start: DateTime<Utc>) -> Self {
            Self {
                now: Mutex::new(start),
            }
        }

        pub fn at_epoch() -> Self {
            Self::new(DateTime::from_timestamp(1_700_000_000, 0).unwrap())
        }

        pub fn advance_secs(&self, secs: i64) {
            let mut now = self.now.lock().unwrap();
            *now += Duration::seconds(secs);
        }

        pub fn advance_millis(&self, millis: i64) {
            let mut now = self.now.lock().unwrap();
            *now += Duration::milliseconds(millis);
        }
    }

    impl Clock for ManualClock {
        fn now_utc(&self) -> DateTime<Utc> {
            *self.now.lock().unwrap()
        }
    }
}

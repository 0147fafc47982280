//! Request signing for the billboard API.
//!
//! Every authenticated request carries three headers derived from the device
//! identity: the device id, a Unix timestamp, and an HMAC-SHA256 signature
//! over `"<timestamp>.<sha256(body)>"`. The signed bytes must be the exact
//! bytes sent on the wire.

use std::time::{SystemTime, UNIX_EPOCH};

use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};

use crate::identity::DeviceIdentity;

pub const HEADER_DEVICE_ID: &str = "x-device-id";
pub const HEADER_TIMESTAMP: &str = "x-timestamp";
pub const HEADER_SIGNATURE: &str = "x-signature";

type HmacSha256 = Hmac<Sha256>;

/// The three header values for one request.
#[derive(Debug, Clone)]
pub struct AuthHeaders {
    pub device_id: String,
    pub timestamp: String,
    pub signature: String,
}

/// Signs request bodies with the device secret.
#[derive(Debug, Clone)]
pub struct Signer {
    device_id: String,
    secret: String,
}

impl Signer {
    pub fn new(identity: &DeviceIdentity) -> Self {
        Self {
            device_id: identity.device_id.clone(),
            secret: identity.secret.clone(),
        }
    }

    /// Produce headers for `body` at the current time.
    pub fn headers(&self, body: &[u8]) -> AuthHeaders {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        self.headers_at(now, body)
    }

    fn headers_at(&self, unix_seconds: u64, body: &[u8]) -> AuthHeaders {
        let timestamp = unix_seconds.to_string();
        let canonical = format!("{}.{}", timestamp, sha256_hex(body));
        AuthHeaders {
            device_id: self.device_id.clone(),
            timestamp,
            signature: hmac_sha256_hex(self.secret.as_bytes(), canonical.as_bytes()),
        }
    }
}

pub fn sha256_hex(data: &[u8]) -> String {
    hex::encode(Sha256::digest(data))
}

pub fn hmac_sha256_hex(secret: &[u8], msg: &[u8]) -> String {
    let mut mac = HmacSha256::new_from_slice(secret).expect("HMAC accepts any key length");
    mac.update(msg);
    hex::encode(mac.finalize().into_bytes())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn signer() -> Signer {
        Signer::new(&DeviceIdentity {
            device_id: "kiosk-3".into(),
            secret: "8f1c2a9e7b3d4c5f".into(),
        })
    }

    #[test]
    fn sha256_of_empty_body_matches_known_digest() {
        assert_eq!(
            sha256_hex(b""),
            "e3b0c44298fc1c149afbf4c8996fb92427ae41e4649b934ca495991b7852b855"
        );
    }

    #[test]
    fn hmac_matches_rfc4231_vector() {
        // RFC 4231 test case 2.
        assert_eq!(
            hmac_sha256_hex(b"Jefe", b"what do ya want for nothing?"),
            "5bdcc146bf60754e6a042426089575c75a003f089d2739839dec58b964ec3843"
        );
    }

    #[test]
    fn signature_covers_timestamp_and_body_hash() {
        let s = signer();
        let headers = s.headers_at(1_700_000_000, b"{}");

        let canonical = format!("1700000000.{}", sha256_hex(b"{}"));
        let expected = hmac_sha256_hex(b"8f1c2a9e7b3d4c5f", canonical.as_bytes());

        assert_eq!(headers.device_id, "kiosk-3");
        assert_eq!(headers.timestamp, "1700000000");
        assert_eq!(headers.signature, expected);
    }

    #[test]
    fn signature_is_lowercase_hex() {
        let headers = signer().headers_at(1_700_000_000, b"payload");
        assert_eq!(headers.signature.len(), 64);
        assert!(headers
            .signature
            .chars()
            .all(|c| c.is_ascii_hexdigit() && !c.is_ascii_uppercase()));
    }

    #[test]
    fn signature_depends_on_timestamp_body_and_secret() {
        let s = signer();
        let base = s.headers_at(1_700_000_000, b"{}").signature;

        assert_ne!(base, s.headers_at(1_700_000_001, b"{}").signature);
        assert_ne!(base, s.headers_at(1_700_000_000, b"[]").signature);

        let other = Signer::new(&DeviceIdentity {
            device_id: "kiosk-3".into(),
            secret: "different".into(),
        });
        assert_ne!(base, other.headers_at(1_700_000_000, b"{}").signature);
    }

    #[test]
    fn signing_is_stable_across_calls() {
        let s = signer();
        assert_eq!(
            s.headers_at(1_700_000_000, b"{}").signature,
            s.headers_at(1_700_000_000, b"{}").signature
        );
    }
}

//! Signed, time-boxed resume tokens.
//!
//! A resume token is the capability a parent presents to resume a suspended
//! registration after completing a human-verification challenge. It encodes
//! (request id, interrupt id, expiry, nonce) as URL-safe base64 JSON claims,
//! authenticated with HMAC-SHA256 under a server-held secret:
//!
//! ```text
//! token := base64url(claims_json) "." hex(hmac_sha256(secret, domain || payload))
//! ```
//!
//! Verification recomputes the MAC (constant-time compare), then checks
//! expiry. The service is stateless and side-effect free: single-use
//! enforcement lives in the interrupt store, which atomically flips the
//! referenced record out of `pending` on the first successful resume.

mod error;

pub use error::TokenError;

use base64::Engine as _;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use chrono::{DateTime, TimeZone, Utc};
use hmac::{Hmac, Mac};
use rand::RngCore;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

type HmacSha256 = Hmac<Sha256>;

/// Domain separator mixed into every MAC preimage, preventing cross-protocol
/// reuse of the token secret.
const TOKEN_DOMAIN_SEPARATOR: &[u8] = b"enrolld:resume_token:v1\0";

/// Minimum accepted secret length in bytes (256-bit).
pub const MIN_SECRET_BYTES: usize = 32;

/// Maximum accepted token length (defense-in-depth before any decoding).
pub const MAX_TOKEN_LEN: usize = 1024;

/// Nonce length in bytes.
const NONCE_BYTES: usize = 16;

/// The authenticated claims carried by a resume token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResumeClaims {
    /// The suspended registration request.
    pub request_id: String,

    /// The interrupt record the token was issued for.
    pub interrupt_id: String,

    /// Expiry as Unix milliseconds.
    pub expires_at_ms: i64,

    /// Random per-token nonce; makes reissued tokens distinct.
    pub nonce: String,
}

impl ResumeClaims {
    /// Expiry as a UTC timestamp.
    #[must_use]
    pub fn expires_at(&self) -> DateTime<Utc> {
        Utc.timestamp_millis_opt(self.expires_at_ms)
            .single()
            .unwrap_or(DateTime::<Utc>::MIN_UTC)
    }
}

/// Stateless issuer/verifier for resume tokens.
#[derive(Clone)]
pub struct TokenService {
    key: Vec<u8>,
}

impl std::fmt::Debug for TokenService {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        // Never print key material.
        f.debug_struct("TokenService").finish_non_exhaustive()
    }
}

impl TokenService {
    /// Builds the service from the hex-encoded server secret.
    ///
    /// # Errors
    ///
    /// Returns [`TokenError::InvalidSecret`] if the secret is not valid hex
    /// or is shorter than [`MIN_SECRET_BYTES`].
    pub fn new(secret_hex: &SecretString) -> Result<Self, TokenError> {
        let key = hex::decode(secret_hex.expose_secret()).map_err(|_| TokenError::InvalidSecret {
            reason: "token secret is not valid hex",
        })?;
        if key.len() < MIN_SECRET_BYTES {
            return Err(TokenError::InvalidSecret {
                reason: "token secret is shorter than 32 bytes",
            });
        }
        Ok(Self { key })
    }

    /// Issues a token for (request, interrupt) expiring at `expires_at`.
    #[must_use]
    pub fn issue(
        &self,
        request_id: &str,
        interrupt_id: &str,
        expires_at: DateTime<Utc>,
    ) -> String {
        let mut nonce = [0u8; NONCE_BYTES];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        let claims = ResumeClaims {
            request_id: request_id.to_string(),
            interrupt_id: interrupt_id.to_string(),
            expires_at_ms: expires_at.timestamp_millis(),
            nonce: hex::encode(nonce),
        };

        // Claims are a flat struct of strings and an integer; serialization
        // cannot fail.
        let payload = URL_SAFE_NO_PAD
            .encode(serde_json::to_vec(&claims).unwrap_or_default());
        let mac = self.compute_mac(payload.as_bytes());
        format!("{payload}.{}", hex::encode(mac))
    }

    /// Verifies a token and returns its claims.
    ///
    /// Validity = signature matches ∧ not expired at `now`. Whether the
    /// referenced interrupt record is still `pending` (single-use) is the
    /// caller's check, made atomically against storage.
    ///
    /// # Errors
    ///
    /// - [`TokenError::Malformed`] for structural problems
    /// - [`TokenError::SignatureMismatch`] if the MAC does not verify
    /// - [`TokenError::Expired`] if the expiry has passed
    pub fn verify(&self, token: &str, now: DateTime<Utc>) -> Result<ResumeClaims, TokenError> {
        if token.len() > MAX_TOKEN_LEN {
            return Err(TokenError::Malformed);
        }
        let (payload, mac_hex) = token.split_once('.').ok_or(TokenError::Malformed)?;
        let presented = hex::decode(mac_hex).map_err(|_| TokenError::Malformed)?;

        // MAC check comes first so nothing attacker-controlled is parsed
        // before authentication.
        let expected = self.compute_mac(payload.as_bytes());
        if expected.len() != presented.len()
            || !bool::from(expected.ct_eq(presented.as_slice()))
        {
            return Err(TokenError::SignatureMismatch);
        }

        let claims_json = URL_SAFE_NO_PAD
            .decode(payload)
            .map_err(|_| TokenError::Malformed)?;
        let claims: ResumeClaims =
            serde_json::from_slice(&claims_json).map_err(|_| TokenError::Malformed)?;

        if now.timestamp_millis() >= claims.expires_at_ms {
            return Err(TokenError::Expired {
                expired_at: claims.expires_at(),
            });
        }
        Ok(claims)
    }

    fn compute_mac(&self, payload: &[u8]) -> Vec<u8> {
        // Key length was validated in the constructor; HMAC accepts any
        // length, so this cannot fail.
        let mut mac = HmacSha256::new_from_slice(&self.key)
            .unwrap_or_else(|_| unreachable!("HMAC accepts any key length"));
        mac.update(TOKEN_DOMAIN_SEPARATOR);
        mac.update(payload);
        mac.finalize().into_bytes().to_vec()
    }
}

#[cfg(test)]
mod tests {
    use chrono::TimeZone;

    use super::*;

    fn service() -> TokenService {
        TokenService::new(&SecretString::new(hex::encode([0x42u8; 32]))).unwrap()
    }

    fn t0() -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2025, 6, 1, 9, 0, 0).unwrap()
    }

    #[test]
    fn test_round_trip() {
        let service = service();
        let expires = t0() + chrono::Duration::minutes(30);
        let token = service.issue("req-1", "int-1", expires);

        let claims = service.verify(&token, t0()).unwrap();
        assert_eq!(claims.request_id, "req-1");
        assert_eq!(claims.interrupt_id, "int-1");
        assert_eq!(claims.expires_at(), expires);
    }

    #[test]
    fn test_reissued_tokens_differ() {
        let service = service();
        let expires = t0() + chrono::Duration::minutes(30);
        let a = service.issue("req-1", "int-1", expires);
        let b = service.issue("req-1", "int-1", expires);
        assert_ne!(a, b);
    }

    #[test]
    fn test_tampered_payload_rejected() {
        let service = service();
        let token = service.issue("req-1", "int-1", t0() + chrono::Duration::minutes(30));

        let (payload, mac) = token.split_once('.').unwrap();
        let other = URL_SAFE_NO_PAD.encode(
            serde_json::to_vec(&ResumeClaims {
                request_id: "req-2".to_string(),
                interrupt_id: "int-1".to_string(),
                expires_at_ms: (t0() + chrono::Duration::minutes(30)).timestamp_millis(),
                nonce: "00".repeat(16),
            })
            .unwrap(),
        );
        assert_ne!(payload, other);

        let forged = format!("{other}.{mac}");
        assert!(matches!(
            service.verify(&forged, t0()),
            Err(TokenError::SignatureMismatch)
        ));
    }

    #[test]
    fn test_wrong_key_rejected() {
        let issuer = service();
        let verifier = TokenService::new(&SecretString::new(hex::encode([0x43u8; 32]))).unwrap();
        let token = issuer.issue("req-1", "int-1", t0() + chrono::Duration::minutes(30));
        assert!(matches!(
            verifier.verify(&token, t0()),
            Err(TokenError::SignatureMismatch)
        ));
    }

    #[test]
    fn test_expired_rejected() {
        let service = service();
        let expires = t0() + chrono::Duration::minutes(30);
        let token = service.issue("req-1", "int-1", expires);

        assert!(service.verify(&token, expires - chrono::Duration::seconds(1)).is_ok());
        assert!(matches!(
            service.verify(&token, expires),
            Err(TokenError::Expired { .. })
        ));
    }

    #[test]
    fn test_malformed_rejected() {
        let service = service();
        for bad in ["", "no-dot", "a.b.c", "!!!.00", "YWJj.zz"] {
            assert!(matches!(
                service.verify(bad, t0()),
                Err(TokenError::Malformed) | Err(TokenError::SignatureMismatch)
            ));
        }

        let oversized = format!("{}.{}", "A".repeat(MAX_TOKEN_LEN), "00");
        assert!(matches!(
            service.verify(&oversized, t0()),
            Err(TokenError::Malformed)
        ));
    }

    #[test]
    fn test_secret_validation() {
        assert!(TokenService::new(&SecretString::new("zz".to_string())).is_err());
        assert!(TokenService::new(&SecretString::new(hex::encode([1u8; 16]))).is_err());
        assert!(TokenService::new(&SecretString::new(hex::encode([1u8; 32]))).is_ok());
    }
}

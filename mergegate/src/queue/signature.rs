//! Verification of webhook deliveries from the queue provider.
//!
//! Every delivery carries an `Upstash-Signature` header: a compact JWT signed with HMAC-SHA256
//! using one of two signing keys. The claims bind the token to the request:
//!
//! - `iss` is always `Upstash`
//! - `sub` is the destination URL
//! - `exp` / `nbf` bound the token's validity window
//! - `body` is the unpadded base64url SHA-256 digest of the raw request body
//!
//! The provider rotates keys by promoting `next` to `current`, so a delivery signed by either key
//! is accepted. The MAC check happens inside `jsonwebtoken`; the body digest is compared here in
//! constant time.

use base64::{Engine, engine::general_purpose::URL_SAFE_NO_PAD};
use chrono::Utc;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation, decode, encode};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, trace};
use uuid::Uuid;

use crate::config::SigningKeys;

/// Header carrying the delivery signature
pub const SIGNATURE_HEADER: &str = "upstash-signature";

const ISSUER: &str = "Upstash";

#[derive(Error, Debug, PartialEq, Eq)]
pub enum SignatureError {
    #[error("signature header missing")]
    MissingHeader,
    #[error("no signing keys configured")]
    NoKeys,
    #[error("invalid token: {0}")]
    InvalidToken(String),
    #[error("body digest does not match signed digest")]
    BodyMismatch,
}

/// Claims carried by a delivery signature.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeliveryClaims {
    pub iss: String,
    pub sub: String,
    pub exp: i64,
    pub nbf: i64,
    pub iat: i64,
    pub jti: String,
    pub body: String,
}

#[derive(Clone)]
pub struct SignatureVerifier {
    current_key: Option<String>,
    next_key: Option<String>,
}

impl std::fmt::Debug for SignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SignatureVerifier")
            .field("current_key", &self.current_key.as_ref().map(|_| "<redacted>"))
            .field("next_key", &self.next_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

impl SignatureVerifier {
    pub fn new(keys: &SigningKeys) -> Self {
        Self {
            current_key: keys.current_key.clone().filter(|k| !k.is_empty()),
            next_key: keys.next_key.clone().filter(|k| !k.is_empty()),
        }
    }

    /// Verify a delivery. `signature` is the raw header value, `body` the raw request body.
    ///
    /// Tries the current key, then the next key; acceptance by either is enough. When one key's MAC
    /// matches but the body digest does not, that mismatch is the error reported.
    pub fn verify(&self, signature: Option<&str>, body: &[u8]) -> Result<DeliveryClaims, SignatureError> {
        let token = signature.map(str::trim).filter(|s| !s.is_empty()).ok_or(SignatureError::MissingHeader)?;

        let keys: Vec<(&str, &str)> = [("current", &self.current_key), ("next", &self.next_key)]
            .into_iter()
            .filter_map(|(name, key)| key.as_deref().map(|k| (name, k)))
            .collect();

        let mut last_err = SignatureError::NoKeys;
        for (name, key) in keys {
            match verify_with_key(token, key, body) {
                Ok(claims) => {
                    debug!(key = name, jti = %claims.jti, "Webhook signature verified");
                    return Ok(claims);
                }
                Err(e) => {
                    trace!(key = name, error = %e, "Signature rejected by key");
                    if last_err != SignatureError::BodyMismatch {
                        last_err = e;
                    }
                }
            }
        }
        Err(last_err)
    }
}

fn verify_with_key(token: &str, key: &str, body: &[u8]) -> Result<DeliveryClaims, SignatureError> {
    let mut validation = Validation::new(Algorithm::HS256);
    validation.set_issuer(&[ISSUER]);
    validation.set_required_spec_claims(&["exp", "nbf", "iss"]);
    validation.validate_nbf = true;

    let data = decode::<DeliveryClaims>(token, &DecodingKey::from_secret(key.as_bytes()), &validation)
        .map_err(|e| SignatureError::InvalidToken(e.to_string()))?;

    let expected = body_digest(body);
    let signed = data.claims.body.trim_end_matches('=');
    if !constant_time_eq(signed.as_bytes(), expected.as_bytes()) {
        return Err(SignatureError::BodyMismatch);
    }

    Ok(data.claims)
}

/// Unpadded base64url SHA-256 of `body`.
pub fn body_digest(body: &[u8]) -> String {
    URL_SAFE_NO_PAD.encode(Sha256::digest(body))
}

/// Produce a provider-compatible signature for `body` delivered to `url`, valid for five minutes.
pub fn sign(key: &str, url: &str, body: &[u8]) -> Result<String, SignatureError> {
    let now = Utc::now().timestamp();
    let claims = DeliveryClaims {
        iss: ISSUER.to_string(),
        sub: url.to_string(),
        exp: now + 300,
        nbf: now,
        iat: now,
        jti: Uuid::new_v4().to_string(),
        body: body_digest(body),
    };

    encode(&Header::new(Algorithm::HS256), &claims, &EncodingKey::from_secret(key.as_bytes()))
        .map_err(|e| SignatureError::InvalidToken(e.to_string()))
}

/// Constant-time byte comparison to prevent timing attacks.
fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }

    let mut result = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        result |= x ^ y;
    }
    result == 0
}

#[cfg(test)]
mod tests {
    use super::*;

    const URL: &str = "https://gate.example.com/webhooks/email";
    const BODY: &[u8] = br#"{"to":"dev@example.com","subject":"hi","body":"hello"}"#;

    fn verifier() -> SignatureVerifier {
        SignatureVerifier::new(&SigningKeys {
            current_key: Some("sig_current".to_string()),
            next_key: Some("sig_next".to_string()),
        })
    }

    fn flip_first_signature_char(token: &str) -> String {
        let (head, sig) = token.rsplit_once('.').unwrap();
        let mut chars: Vec<char> = sig.chars().collect();
        chars[0] = if chars[0] == 'A' { 'B' } else { 'A' };
        format!("{head}.{}", chars.into_iter().collect::<String>())
    }

    #[test]
    fn test_current_key_accepted() {
        let token = sign("sig_current", URL, BODY).unwrap();
        let claims = verifier().verify(Some(&token), BODY).unwrap();
        assert_eq!(claims.iss, "Upstash");
        assert_eq!(claims.sub, URL);
    }

    #[test]
    fn test_next_key_accepted() {
        let token = sign("sig_next", URL, BODY).unwrap();
        assert!(verifier().verify(Some(&token), BODY).is_ok());
    }

    #[test]
    fn test_unknown_key_rejected() {
        let token = sign("some_other_key", URL, BODY).unwrap();
        assert!(matches!(
            verifier().verify(Some(&token), BODY),
            Err(SignatureError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_flipped_signature_byte_rejected() {
        let token = sign("sig_current", URL, BODY).unwrap();
        let tampered = flip_first_signature_char(&token);
        assert_ne!(token, tampered);
        assert!(verifier().verify(Some(&tampered), BODY).is_err());
    }

    #[test]
    fn test_modified_body_rejected() {
        let token = sign("sig_current", URL, BODY).unwrap();
        assert_eq!(
            verifier().verify(Some(&token), br#"{"to":"attacker@example.com"}"#),
            Err(SignatureError::BodyMismatch)
        );
    }

    #[test]
    fn test_modified_body_rejected_under_next_key() {
        let token = sign("sig_next", URL, BODY).unwrap();
        assert_eq!(
            verifier().verify(Some(&token), b"{}"),
            Err(SignatureError::BodyMismatch)
        );
    }

    #[test]
    fn test_verified_claims_match_signed_claims() {
        let token = sign("sig_current", URL, BODY).unwrap();
        let first = verifier().verify(Some(&token), BODY);
        assert!(first.is_ok());
        assert_eq!(first, verifier().verify(Some(&token), BODY));
    }

    #[test]
    fn test_missing_header_rejected() {
        assert_eq!(verifier().verify(None, BODY), Err(SignatureError::MissingHeader));
        assert_eq!(verifier().verify(Some("  "), BODY), Err(SignatureError::MissingHeader));
    }

    #[test]
    fn test_no_keys_rejects_everything() {
        let verifier = SignatureVerifier::new(&SigningKeys::default());
        let token = sign("sig_current", URL, BODY).unwrap();
        assert_eq!(verifier.verify(Some(&token), BODY), Err(SignatureError::NoKeys));
    }

    #[test]
    fn test_expired_token_rejected() {
        let now = Utc::now().timestamp();
        let claims = DeliveryClaims {
            iss: ISSUER.to_string(),
            sub: URL.to_string(),
            exp: now - 3600,
            nbf: now - 7200,
            iat: now - 7200,
            jti: "jti".to_string(),
            body: body_digest(BODY),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"sig_current"),
        )
        .unwrap();

        assert!(matches!(
            verifier().verify(Some(&token), BODY),
            Err(SignatureError::InvalidToken(_))
        ));
    }

    #[test]
    fn test_wrong_issuer_rejected() {
        let now = Utc::now().timestamp();
        let claims = DeliveryClaims {
            iss: "someone-else".to_string(),
            sub: URL.to_string(),
            exp: now + 300,
            nbf: now,
            iat: now,
            jti: "jti".to_string(),
            body: body_digest(BODY),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"sig_current"),
        )
        .unwrap();

        assert!(verifier().verify(Some(&token), BODY).is_err());
    }

    #[test]
    fn test_padded_body_claim_accepted() {
        let now = Utc::now().timestamp();
        let claims = DeliveryClaims {
            iss: ISSUER.to_string(),
            sub: URL.to_string(),
            exp: now + 300,
            nbf: now,
            iat: now,
            jti: "jti".to_string(),
            body: format!("{}=", body_digest(BODY)),
        };
        let token = encode(
            &Header::new(Algorithm::HS256),
            &claims,
            &EncodingKey::from_secret(b"sig_next"),
        )
        .unwrap();

        assert!(verifier().verify(Some(&token), BODY).is_ok());
    }

    #[test]
    fn test_constant_time_eq() {
        assert!(constant_time_eq(b"abc", b"abc"));
        assert!(!constant_time_eq(b"abc", b"abd"));
        assert!(!constant_time_eq(b"abc", b"ab"));
    }

    #[test]
    fn test_debug_redacts_keys() {
        let rendered = format!("{:?}", verifier());
        assert!(!rendered.contains("sig_current"));
        assert!(rendered.contains("redacted"));
    }
}

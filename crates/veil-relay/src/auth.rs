//! Token verification for room admission
//!
//! Admission tokens are compact JWTs signed with Ed25519: three URL-safe
//! base64 segments (no padding) separated by dots. The relay never mints
//! tokens — the room host signs them client-side and uploads its public key
//! on first connect, so the relay only verifies.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub const ROLE_HOST: &str = "host";
pub const ROLE_GUEST: &str = "guest";

/// The only accepted JOSE header. Tokens carrying anything else — even a
/// reordered or re-spaced encoding of the same JSON — are rejected.
const TOKEN_HEADER: &[u8] = br#"{"alg":"EdDSA","typ":"JWT"}"#;

fn header_segment() -> String {
    URL_SAFE_NO_PAD.encode(TOKEN_HEADER)
}

/// Claims carried in a token payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    #[serde(default)]
    pub room_id: String,
    #[serde(default)]
    pub peer_id: String,
    /// "host" or "guest"
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub name: String,
    #[serde(default, rename = "iat")]
    pub issued_at: i64,
    /// Unix seconds; 0 means the token never expires.
    #[serde(default, rename = "exp")]
    pub expires_at: i64,
}

/// Token validation failures, one variant per diagnostic.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum AuthError {
    #[error("malformed token")]
    Malformed,
    #[error("unsupported token algorithm")]
    UnsupportedAlgorithm,
    #[error("invalid signature")]
    BadSignature,
    #[error("invalid claims encoding")]
    BadClaims,
    #[error("token expired")]
    Expired,
    #[error("missing {0}")]
    MissingField(&'static str),
    #[error("invalid role")]
    InvalidRole,
}

/// Verify `token` against the 32-byte Ed25519 verification key and return its
/// claims.
///
/// The signature covers the raw ASCII of `header "." payload`. Expiry is
/// checked against wall-clock seconds; `exp == 0` disables it.
pub fn validate_token(token: &str, key: &[u8; 32]) -> Result<Claims, AuthError> {
    let parts: Vec<&str> = token.split('.').collect();
    if parts.len() != 3 {
        return Err(AuthError::Malformed);
    }

    if parts[0] != header_segment() {
        return Err(AuthError::UnsupportedAlgorithm);
    }

    let sig_bytes = URL_SAFE_NO_PAD
        .decode(parts[2])
        .map_err(|_| AuthError::BadSignature)?;
    let signature = Signature::from_slice(&sig_bytes).map_err(|_| AuthError::BadSignature)?;
    let verifying_key = VerifyingKey::from_bytes(key).map_err(|_| AuthError::BadSignature)?;

    let signing_input = format!("{}.{}", parts[0], parts[1]);
    verifying_key
        .verify(signing_input.as_bytes(), &signature)
        .map_err(|_| AuthError::BadSignature)?;

    let payload = URL_SAFE_NO_PAD
        .decode(parts[1])
        .map_err(|_| AuthError::BadClaims)?;
    let claims: Claims = serde_json::from_slice(&payload).map_err(|_| AuthError::BadClaims)?;

    if claims.expires_at > 0 && chrono::Utc::now().timestamp() > claims.expires_at {
        return Err(AuthError::Expired);
    }

    if claims.room_id.is_empty() {
        return Err(AuthError::MissingField("room_id"));
    }
    if claims.peer_id.is_empty() {
        return Err(AuthError::MissingField("peer_id"));
    }
    if claims.role != ROLE_HOST && claims.role != ROLE_GUEST {
        return Err(AuthError::InvalidRole);
    }

    Ok(claims)
}

/// Sign a token the way clients do. Test-only: the relay itself never signs.
#[cfg(test)]
pub fn sign_token(claims: &Claims, key: &ed25519_dalek::SigningKey) -> String {
    use ed25519_dalek::Signer;

    let payload = URL_SAFE_NO_PAD.encode(serde_json::to_vec(claims).expect("claims serialize"));
    let signing_input = format!("{}.{}", header_segment(), payload);
    let signature = key.sign(signing_input.as_bytes());
    format!(
        "{}.{}",
        signing_input,
        URL_SAFE_NO_PAD.encode(signature.to_bytes())
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use ed25519_dalek::SigningKey;
    use rand::rngs::OsRng;

    fn claims(role: &str, expires_at: i64) -> Claims {
        Claims {
            room_id: "test-room".to_string(),
            peer_id: "test-peer".to_string(),
            role: role.to_string(),
            name: "Alice".to_string(),
            issued_at: chrono::Utc::now().timestamp(),
            expires_at,
        }
    }

    fn in_one_hour() -> i64 {
        chrono::Utc::now().timestamp() + 3600
    }

    #[test]
    fn test_validate_token_valid() {
        let key = SigningKey::generate(&mut OsRng);
        let token = sign_token(&claims(ROLE_HOST, in_one_hour()), &key);

        let got = validate_token(&token, &key.verifying_key().to_bytes()).unwrap();
        assert_eq!(got.room_id, "test-room");
        assert_eq!(got.peer_id, "test-peer");
        assert_eq!(got.role, ROLE_HOST);
        assert_eq!(got.name, "Alice");
    }

    #[test]
    fn test_validate_token_never_expires() {
        let key = SigningKey::generate(&mut OsRng);
        let token = sign_token(&claims(ROLE_GUEST, 0), &key);

        assert!(validate_token(&token, &key.verifying_key().to_bytes()).is_ok());
    }

    #[test]
    fn test_validate_token_expired() {
        let key = SigningKey::generate(&mut OsRng);
        let expired = chrono::Utc::now().timestamp() - 60;
        let token = sign_token(&claims(ROLE_HOST, expired), &key);

        let err = validate_token(&token, &key.verifying_key().to_bytes()).unwrap_err();
        assert_eq!(err, AuthError::Expired);
    }

    #[test]
    fn test_validate_token_wrong_key() {
        let key = SigningKey::generate(&mut OsRng);
        let other = SigningKey::generate(&mut OsRng);
        let token = sign_token(&claims(ROLE_GUEST, in_one_hour()), &key);

        let err = validate_token(&token, &other.verifying_key().to_bytes()).unwrap_err();
        assert_eq!(err, AuthError::BadSignature);
    }

    #[test]
    fn test_validate_token_invalid_role() {
        let key = SigningKey::generate(&mut OsRng);
        let token = sign_token(&claims("admin", in_one_hour()), &key);

        let err = validate_token(&token, &key.verifying_key().to_bytes()).unwrap_err();
        assert_eq!(err, AuthError::InvalidRole);
    }

    #[test]
    fn test_validate_token_missing_fields() {
        let key = SigningKey::generate(&mut OsRng);

        let mut no_room = claims(ROLE_HOST, in_one_hour());
        no_room.room_id.clear();
        let token = sign_token(&no_room, &key);
        assert_eq!(
            validate_token(&token, &key.verifying_key().to_bytes()).unwrap_err(),
            AuthError::MissingField("room_id")
        );

        let mut no_peer = claims(ROLE_HOST, in_one_hour());
        no_peer.peer_id.clear();
        let token = sign_token(&no_peer, &key);
        assert_eq!(
            validate_token(&token, &key.verifying_key().to_bytes()).unwrap_err(),
            AuthError::MissingField("peer_id")
        );
    }

    #[test]
    fn test_validate_token_malformed() {
        let key = [0u8; 32];
        assert_eq!(
            validate_token("not.a.valid.token", &key).unwrap_err(),
            AuthError::Malformed
        );
        assert_eq!(validate_token("", &key).unwrap_err(), AuthError::Malformed);
        assert_eq!(
            validate_token("one.two", &key).unwrap_err(),
            AuthError::Malformed
        );
    }

    #[test]
    fn test_validate_token_wrong_header() {
        let key = SigningKey::generate(&mut OsRng);
        let token = sign_token(&claims(ROLE_HOST, in_one_hour()), &key);

        // Swap in a header for a different algorithm; same segment count.
        let hs256 = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
        let mut parts: Vec<&str> = token.split('.').collect();
        parts[0] = &hs256;
        let forged = parts.join(".");

        assert_eq!(
            validate_token(&forged, &key.verifying_key().to_bytes()).unwrap_err(),
            AuthError::UnsupportedAlgorithm
        );
    }

    #[test]
    fn test_validate_token_tampered_payload() {
        let key = SigningKey::generate(&mut OsRng);
        let token = sign_token(&claims(ROLE_GUEST, in_one_hour()), &key);

        let mut forged_claims = claims(ROLE_GUEST, in_one_hour());
        forged_claims.room_id = "other-room".to_string();
        let forged_payload =
            URL_SAFE_NO_PAD.encode(serde_json::to_vec(&forged_claims).unwrap());

        let parts: Vec<&str> = token.split('.').collect();
        let forged = format!("{}.{}.{}", parts[0], forged_payload, parts[2]);

        assert_eq!(
            validate_token(&forged, &key.verifying_key().to_bytes()).unwrap_err(),
            AuthError::BadSignature
        );
    }

    #[test]
    fn test_validate_token_tampered_signature() {
        let key = SigningKey::generate(&mut OsRng);
        let token = sign_token(&claims(ROLE_GUEST, in_one_hour()), &key);

        let parts: Vec<&str> = token.split('.').collect();
        let forged = format!("{}.{}.{}", parts[0], parts[1], URL_SAFE_NO_PAD.encode([7u8; 64]));

        assert_eq!(
            validate_token(&forged, &key.verifying_key().to_bytes()).unwrap_err(),
            AuthError::BadSignature
        );
    }

    #[test]
    fn test_host_signs_for_guest() {
        // The host keypair signs guest tokens; the relay verifies them
        // against the host's public key.
        let host_key = SigningKey::generate(&mut OsRng);

        let guest_claims = Claims {
            room_id: "shared-room".to_string(),
            peer_id: "guest-1".to_string(),
            role: ROLE_GUEST.to_string(),
            name: "Bob".to_string(),
            issued_at: chrono::Utc::now().timestamp(),
            expires_at: in_one_hour(),
        };
        let token = sign_token(&guest_claims, &host_key);

        let got = validate_token(&token, &host_key.verifying_key().to_bytes()).unwrap();
        assert_eq!(got.role, ROLE_GUEST);
        assert_eq!(got.peer_id, "guest-1");
    }

    #[test]
    fn test_round_trip_preserves_claims() {
        let key = SigningKey::generate(&mut OsRng);
        let original = claims(ROLE_HOST, in_one_hour());
        let token = sign_token(&original, &key);
        let got = validate_token(&token, &key.verifying_key().to_bytes()).unwrap();

        assert_eq!(got.room_id, original.room_id);
        assert_eq!(got.peer_id, original.peer_id);
        assert_eq!(got.role, original.role);
        assert_eq!(got.name, original.name);
        assert_eq!(got.issued_at, original.issued_at);
        assert_eq!(got.expires_at, original.expires_at);
    }
}

//! Session management
//!
//! Uses HMAC-signed tokens stored in cookies.
//! No server-side session storage needed.

use base64::{Engine as _, engine::general_purpose};
use chrono::{DateTime, Duration, Utc};
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::AppError;

type HmacSha256 = Hmac<Sha256>;

/// Name of the session cookie
pub const SESSION_COOKIE: &str = "session";

/// Owner session, carried in a signed token.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    pub username: String,
    /// When session was created
    pub created_at: DateTime<Utc>,
    /// When session expires
    pub expires_at: DateTime<Utc>,
}

impl Session {
    /// A session for `username` valid for `max_age_secs`.
    pub fn new(username: &str, max_age_secs: i64) -> Self {
        let now = Utc::now();
        Self {
            username: username.to_string(),
            created_at: now,
            expires_at: now + Duration::seconds(max_age_secs),
        }
    }

    /// Check if session is expired
    pub fn is_expired(&self) -> bool {
        self.expires_at < Utc::now()
    }
}

fn mac(secret: &str) -> Result<HmacSha256, AppError> {
    HmacSha256::new_from_slice(secret.as_bytes()).map_err(|e| AppError::Encryption(e.to_string()))
}

/// Create a signed session token
///
/// Token format: base64(payload).base64(hmac_sha256(payload))
pub fn create_session_token(session: &Session, secret: &str) -> Result<String, AppError> {
    let payload = serde_json::to_string(session).map_err(|e| AppError::Internal(e.into()))?;
    let payload_b64 = general_purpose::URL_SAFE_NO_PAD.encode(payload.as_bytes());

    let mut mac = mac(secret)?;
    mac.update(payload_b64.as_bytes());
    let signature_b64 = general_purpose::URL_SAFE_NO_PAD.encode(mac.finalize().into_bytes());

    Ok(format!("{}.{}", payload_b64, signature_b64))
}

/// Verify and decode a session token
///
/// # Errors
/// `Unauthorized` if the signature is invalid, the token is malformed
/// or the session has expired.
pub fn verify_session_token(token: &str, secret: &str) -> Result<Session, AppError> {
    let (payload_b64, signature_b64) = token.split_once('.').ok_or(AppError::Unauthorized)?;

    let mut mac = mac(secret)?;
    mac.update(payload_b64.as_bytes());

    let signature = general_purpose::URL_SAFE_NO_PAD
        .decode(signature_b64)
        .map_err(|_| AppError::Unauthorized)?;
    mac.verify_slice(&signature)
        .map_err(|_| AppError::Unauthorized)?;

    let payload = general_purpose::URL_SAFE_NO_PAD
        .decode(payload_b64)
        .map_err(|_| AppError::Unauthorized)?;
    let session: Session =
        serde_json::from_slice(&payload).map_err(|_| AppError::Unauthorized)?;

    if session.is_expired() {
        return Err(AppError::Unauthorized);
    }

    Ok(session)
}

/// Compare a submitted secret with the configured one without leaking
/// the position of the first mismatch.
pub fn credentials_match(given: &str, expected: &str, key: &str) -> bool {
    let (Ok(mut given_mac), Ok(mut expected_mac)) = (mac(key), mac(key)) else {
        return false;
    };
    given_mac.update(given.as_bytes());
    expected_mac.update(expected.as_bytes());
    expected_mac
        .verify_slice(&given_mac.finalize().into_bytes())
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "0123456789abcdef0123456789abcdef";

    #[test]
    fn token_roundtrip() {
        let session = Session::new("admin", 60);
        let token = create_session_token(&session, SECRET).unwrap();

        assert_eq!(verify_session_token(&token, SECRET).unwrap(), session);
    }

    #[test]
    fn token_with_other_secret_is_rejected() {
        let token = create_session_token(&Session::new("admin", 60), SECRET).unwrap();
        assert!(matches!(
            verify_session_token(&token, "another-secret-another-secret-xx"),
            Err(AppError::Unauthorized)
        ));
        assert!(verify_session_token("garbage", SECRET).is_err());
    }

    #[test]
    fn expired_token_is_rejected() {
        let token = create_session_token(&Session::new("admin", -1), SECRET).unwrap();
        assert!(matches!(
            verify_session_token(&token, SECRET),
            Err(AppError::Unauthorized)
        ));
    }

    #[test]
    fn credentials_compare() {
        assert!(credentials_match("hunter2", "hunter2", SECRET));
        assert!(!credentials_match("hunter3", "hunter2", SECRET));
        assert!(!credentials_match("", "hunter2", SECRET));
    }
}

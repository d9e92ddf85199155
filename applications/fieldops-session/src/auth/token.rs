//! Local JWT inspection.
//!
//! Only the payload is read; signatures are not verified. The backend stays the
//! authority on validity, the client just needs `exp` to schedule refreshes. Anything
//! that cannot be decoded counts as expired.

use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
use chrono::Utc;
use serde::Deserialize;
use serde_json::Value;
use std::time::Duration;

/// Default head start before expiry at which a token is refreshed
pub const DEFAULT_REFRESH_BUFFER: Duration = Duration::from_secs(300);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedToken {
    pub expires_at: i64,
    pub issued_at: Option<i64>,
    pub subject_id: Option<i64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenStatus {
    Valid { remaining_secs: i64 },
    ExpiringSoon { remaining_secs: i64 },
    Expired,
}

#[derive(Debug, Deserialize)]
struct RawClaims {
    exp: Option<Value>,
    iat: Option<Value>,
    sub: Option<Value>,
    user_id: Option<Value>,
}

/// Decode the payload segment of a JWT. Malformed input yields `None`.
pub fn decode(token: &str) -> Option<DecodedToken> {
    let payload = token.split('.').nth(1)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload.trim_end_matches('=')).ok()?;
    let claims: RawClaims = serde_json::from_slice(&bytes).ok()?;

    Some(DecodedToken {
        expires_at: claims.exp.as_ref().and_then(epoch_seconds)?,
        issued_at: claims.iat.as_ref().and_then(epoch_seconds),
        subject_id: claims
            .user_id
            .as_ref()
            .and_then(integer_claim)
            .or_else(|| claims.sub.as_ref().and_then(integer_claim)),
    })
}

fn epoch_seconds(value: &Value) -> Option<i64> {
    value.as_i64().or_else(|| value.as_f64().map(|f| f as i64))
}

fn integer_claim(value: &Value) -> Option<i64> {
    match value {
        Value::String(s) => s.parse().ok(),
        other => other.as_i64(),
    }
}

fn now() -> i64 {
    Utc::now().timestamp()
}

/// Seconds until expiry, negative once expired
pub fn remaining_seconds(token: &str) -> Option<i64> {
    remaining_seconds_at(token, now())
}

pub fn remaining_seconds_at(token: &str, now: i64) -> Option<i64> {
    decode(token).map(|decoded| decoded.expires_at - now)
}

/// True when the token is absent, undecodable or expires within `buffer`
pub fn is_expired_or_expiring_soon(token: Option<&str>, buffer: Duration) -> bool {
    is_expired_or_expiring_soon_at(token, buffer, now())
}

pub fn is_expired_or_expiring_soon_at(token: Option<&str>, buffer: Duration, now: i64) -> bool {
    match token.and_then(|t| remaining_seconds_at(t, now)) {
        Some(remaining) => remaining <= buffer.as_secs() as i64,
        None => true,
    }
}

pub fn status(token: &str, buffer: Duration) -> TokenStatus {
    status_at(token, buffer, now())
}

pub fn status_at(token: &str, buffer: Duration, now: i64) -> TokenStatus {
    match remaining_seconds_at(token, now) {
        Some(remaining) if remaining <= 0 => TokenStatus::Expired,
        Some(remaining) if remaining <= buffer.as_secs() as i64 => TokenStatus::ExpiringSoon {
            remaining_secs: remaining,
        },
        Some(remaining) => TokenStatus::Valid {
            remaining_secs: remaining,
        },
        None => TokenStatus::Expired,
    }
}

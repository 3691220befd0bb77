//! Session token shape checks and claim decoding
//!
//! A session token is `header.payload.signature`, each segment unpadded
//! base64url, with the payload decoding to a JSON object of identity claims.
//! The signature is never verified client-side; the shape check only keeps
//! garbage out of storage and out of `Authorization` headers.

use super::types::Identity;
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{Duration, Utc};

fn is_segment(segment: &str) -> bool {
    !segment.is_empty()
        && segment
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b == b'-' || b == b'_')
}

fn payload_segment(token: &str) -> Option<&str> {
    let mut parts = token.split('.');
    let (header, payload, signature) = (parts.next()?, parts.next()?, parts.next()?);
    if parts.next().is_some() {
        return None;
    }
    if is_segment(header) && is_segment(payload) && is_segment(signature) {
        Some(payload)
    } else {
        None
    }
}

fn payload_json(token: &str) -> Option<serde_json::Value> {
    let payload = payload_segment(token)?;
    let bytes = URL_SAFE_NO_PAD.decode(payload).ok()?;
    match serde_json::from_slice::<serde_json::Value>(&bytes) {
        Ok(value) if value.is_object() => Some(value),
        _ => None,
    }
}

/// Whether `token` has the structure of a session token
pub fn is_well_formed(token: &str) -> bool {
    payload_json(token).is_some()
}

/// Decode the identity claims of a well-formed token
pub fn decode_identity(token: &str) -> Option<Identity> {
    serde_json::from_value(payload_json(token)?).ok()
}

/// Expiry claim of the token, in seconds since the Unix epoch
pub fn expiry(token: &str) -> Option<i64> {
    payload_json(token)?.get("exp")?.as_i64()
}

/// A token is expired when it is unreadable, has no expiry claim, or its
/// expiry falls within `leeway` of now.
pub fn is_expired(token: Option<&str>, leeway: Duration) -> bool {
    let Some(exp) = token.and_then(expiry) else {
        return true;
    };
    match Utc::now().checked_add_signed(leeway) {
        Some(deadline) => deadline.timestamp() >= exp,
        None => true,
    }
}

/// Short, log-safe rendering of a credential
pub(crate) fn redact(token: &str) -> String {
    format!("{}... ({} chars)", &token[..token.len().min(8)], token.len())
}

#[cfg(test)]
pub(crate) fn encode_for_test(claims: &serde_json::Value) -> String {
    let header = URL_SAFE_NO_PAD.encode(br#"{"alg":"HS256","typ":"JWT"}"#);
    let payload = URL_SAFE_NO_PAD.encode(claims.to_string());
    format!("{}.{}.c2lnbmF0dXJl", header, payload)
}

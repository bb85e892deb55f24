// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-request HMAC signature derivation.
//!
//! The upstream accepts a completion only when it carries a signature over
//! (prompt, user id, timestamp, request id).  The signing key is not the
//! static frontend key directly: a *subkey* is derived from a five-minute
//! rolling window id, so a captured signature replays only within its window
//! and rotates automatically across windows.

use hmac::{Hmac, Mac};
use sha2::Sha256;
use uuid::Uuid;

use crate::error::UpstreamError;

type HmacSha256 = Hmac<Sha256>;

/// Static key embedded in the upstream's web frontend.
const STATIC_KEY: &[u8] = b"junjie";

/// Width of the rolling subkey window in milliseconds (5 minutes).
const WINDOW_MS: i64 = 300_000;

/// The signed triple sent with every completion request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestSignature {
    /// Millisecond timestamp the signature covers.
    pub timestamp: i64,
    pub request_id: String,
    /// Lowercase hex HMAC-SHA256 digest.
    pub signature: String,
}

/// Derive the request signature.
///
/// 1. `sorted_payload` — the `{requestId, timestamp, user_id}` pairs in key
///    order, flattened as `k1,v1,k2,v2,…`.
/// 2. `window_id = timestamp_ms / 300_000`.
/// 3. `subkey = hex(HMAC-SHA256(STATIC_KEY, window_id))`, then
///    `signature = hex(HMAC-SHA256(subkey, sorted_payload + "|" + base64(prompt) + "|" + timestamp))`.
///
/// `request_id` defaults to a fresh UUID when not supplied.
pub fn sign_request(
    prompt: &str,
    user_id: &str,
    timestamp_ms: i64,
    request_id: Option<String>,
) -> Result<RequestSignature, UpstreamError> {
    let request_id = request_id.unwrap_or_else(|| Uuid::new_v4().to_string());

    // Key order: requestId < timestamp < user_id (lexicographic).
    let sorted_payload = format!("requestId,{request_id},timestamp,{timestamp_ms},user_id,{user_id}");

    let window_id = timestamp_ms / WINDOW_MS;
    let subkey = hex_hmac(STATIC_KEY, window_id.to_string().as_bytes())?;

    let prompt_b64 = {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(prompt.as_bytes())
    };
    let message = format!("{sorted_payload}|{prompt_b64}|{timestamp_ms}");
    let signature = hex_hmac(subkey.as_bytes(), message.as_bytes())?;

    Ok(RequestSignature {
        timestamp: timestamp_ms,
        request_id,
        signature,
    })
}

fn hex_hmac(key: &[u8], message: &[u8]) -> Result<String, UpstreamError> {
    let mut mac =
        HmacSha256::new_from_slice(key).map_err(|_| UpstreamError::SignatureFailed)?;
    mac.update(message);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

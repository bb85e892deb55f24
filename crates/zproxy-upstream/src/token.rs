// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Best-effort extraction of the user id from the opaque bearer token.
//!
//! The upstream issues JWT-shaped tokens (`header.payload.signature`).  The
//! proxy only needs `payload.id` to build the request signature; no
//! cryptographic verification is performed — the upstream does that itself.

use serde_json::Value;

/// Return `payload.id` from a JWT-shaped token, or the empty string when the
/// token does not decode.  Never fails: an undecodable token simply signs
/// with an empty user id and the upstream rejects it.
pub fn user_id_from_token(token: &str) -> String {
    let mut parts = token.split('.');
    let (Some(_header), Some(payload), Some(_sig)) =
        (parts.next(), parts.next(), parts.next())
    else {
        return String::new();
    };
    if parts.next().is_some() {
        return String::new();
    }

    let Some(bytes) = decode_b64_padded(payload) else {
        return String::new();
    };
    let Ok(json) = serde_json::from_slice::<Value>(&bytes) else {
        return String::new();
    };
    match &json["id"] {
        Value::String(s) => s.clone(),
        Value::Number(n) => n.to_string(),
        _ => String::new(),
    }
}

/// Base64-decode with padding repair, trying URL-safe first (the JWT
/// alphabet) and falling back to the standard alphabet.
fn decode_b64_padded(input: &str) -> Option<Vec<u8>> {
    use base64::engine::general_purpose::{STANDARD, URL_SAFE};
    use base64::Engine;

    let mut padded = input.trim_end_matches('=').to_string();
    while padded.len() % 4 != 0 {
        padded.push('=');
    }
    URL_SAFE
        .decode(&padded)
        .or_else(|_| STANDARD.decode(&padded))
        .ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

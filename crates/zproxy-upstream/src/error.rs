// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

/// Failures from the upstream client.
///
/// Stream-internal failures are reported in-band as
/// [`crate::StreamChunk::Error`] so a consumer never has to juggle two error
/// channels while draining a completion; this enum covers the request/response
/// operations that return whole values.
#[derive(Debug, Error)]
pub enum UpstreamError {
    /// Signature derivation failed.
    #[error("signature_failed")]
    SignatureFailed,

    /// The upstream returned a non-2xx status for `{operation}`.
    #[error("{operation} failed: {status}")]
    RequestFailed { operation: &'static str, status: u16 },

    /// A response body did not have the expected shape.
    #[error("unexpected {operation} response: {detail}")]
    BadResponse {
        operation: &'static str,
        detail: String,
    },

    /// No bearer token is configured.
    #[error("no upstream token configured; set GLM_TOKEN or run `zproxy config --token`")]
    MissingToken,

    #[error(transparent)]
    Http(#[from] reqwest::Error),
}

impl UpstreamError {
    /// The wire-level reason string carried in an in-band error chunk.
    pub fn chunk_reason(&self) -> String {
        match self {
            Self::SignatureFailed => "signature_failed".into(),
            Self::RequestFailed { status, .. } => format!("request_failed:{status}"),
            other => other.to_string(),
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-process session state.
//!
//! Everything the handler remembers between requests lives in this one
//! record behind a single mutex: the cached upstream chat id, the mirror
//! of the caller's conversation (for the session-delta check), the last
//! raw-dispatch signature, and the pending-confirmation table.  Critical
//! sections are short string comparisons; the lock is never held across
//! upstream I/O.

use serde_json::Value;

use zproxy_guard::PendingConfirmations;
use zproxy_planner::ParsedCall;

/// Role + text of one caller message, as remembered from the previous
/// request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MirrorMessage {
    pub role: String,
    pub text: String,
}

/// How the current conversation relates to the mirrored one.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionDelta {
    /// Same prefix, possibly extended — the cached chat can continue.
    Extension,
    /// The caller rewrote or shrank history — the cached chat is stale.
    Divergent,
}

/// Record of the last raw tool-call dispatch, used to suppress the
/// tool-result → identical-call loop some models fall into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatchRecord {
    pub signature: String,
    pub last_user: String,
}

#[derive(Debug, Default)]
pub struct SessionState {
    /// The upstream chat the handler currently appends to.
    pub active_chat_id: Option<String>,
    /// Mirror of the caller's conversation from the previous request.
    pub last_messages: Vec<MirrorMessage>,
    /// Signature over serialized tools + system text; a change reseeds the
    /// upstream chat.
    pub last_signature: Option<String>,
    pub last_dispatch: Option<DispatchRecord>,
    pub pending: PendingConfirmations,
}

impl SessionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reset the cached chat; idempotent.
    pub fn reset_chat(&mut self) {
        self.active_chat_id = None;
    }

    /// Compare the caller's conversation against the mirror.
    ///
    /// Divergent when the mirror is not a prefix of the current list (a
    /// message changed, or history shrank).
    pub fn session_delta(&self, current: &[MirrorMessage]) -> SessionDelta {
        if current.len() < self.last_messages.len() {
            return SessionDelta::Divergent;
        }
        let matches = self
            .last_messages
            .iter()
            .zip(current.iter())
            .all(|(a, b)| a == b);
        if matches {
            SessionDelta::Extension
        } else {
            SessionDelta::Divergent
        }
    }

    /// Index of the first message the mirror has not seen (valid only
    /// after an `Extension` verdict).
    pub fn common_prefix_len(&self, current: &[MirrorMessage]) -> usize {
        self.last_messages
            .iter()
            .zip(current.iter())
            .take_while(|(a, b)| a == b)
            .count()
    }

    /// Replace the mirror, applying the configured cap (0 = unbounded).
    pub fn remember_messages(&mut self, current: Vec<MirrorMessage>, max: usize) {
        self.last_messages = if max > 0 && current.len() > max {
            current[current.len() - max..].to_vec()
        } else {
            current
        };
    }
}

/// Stable signature of a raw-dispatch batch: `tool|args` joined with `;`.
/// serde_json serializes object keys in sorted order, so byte-identical
/// args always produce the same signature.
pub fn raw_dispatch_signature(calls: &[ParsedCall]) -> String {
    calls
        .iter()
        .map(|c| format!("{}|{}", c.tool, c.args))
        .collect::<Vec<_>>()
        .join(";")
}

/// Signature over the serialized tool declarations and system text; a
/// change means the planner contract changed mid-session.
pub fn tools_signature(tools: &[Value], system_text: &str) -> String {
    use std::collections::hash_map::DefaultHasher;
    use std::hash::{Hash, Hasher};
    let mut hasher = DefaultHasher::new();
    for t in tools {
        t.to_string().hash(&mut hasher);
    }
    system_text.hash(&mut hasher);
    format!("{:016x}", hasher.finish())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The pending-confirmation table and the affirmative-reply grammar.
//!
//! When the guard demands confirmation, the original batch is parked here
//! keyed by the synthesized `question` tool-call id.  The next request
//! whose tool message answers that id either replays the batch verbatim
//! (affirmative) or cancels it.  Entries expire after ten minutes and are
//! collected at the start of each request.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::debug;

use zproxy_planner::ParsedCall;

/// How long a parked batch stays answerable.
pub const CONFIRMATION_TTL: Duration = Duration::from_secs(600);

/// Replies the confirmation drain recognizes as "go ahead".
const AFFIRMATIVE_WORDS: &[&str] = &[
    "y", "yes", "ok", "proceed", "continue", "confirm", "approved", "allow", "1", "true",
];

/// One parked batch awaiting the user's answer.
#[derive(Debug, Clone)]
pub struct PendingConfirmation {
    pub calls: Vec<ParsedCall>,
    pub blocked_reason: String,
    pub created_at: Instant,
}

/// Per-process table of parked batches, TTL-collected.
#[derive(Debug, Default)]
pub struct PendingConfirmations {
    entries: HashMap<String, PendingConfirmation>,
}

impl PendingConfirmations {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, tool_call_id: String, calls: Vec<ParsedCall>, reason: String) {
        debug!(%tool_call_id, reason = %reason, "parked tool-call batch for confirmation");
        self.entries.insert(
            tool_call_id,
            PendingConfirmation {
                calls,
                blocked_reason: reason,
                created_at: Instant::now(),
            },
        );
    }

    /// Remove and return a live entry; expired entries are discarded.
    pub fn take(&mut self, tool_call_id: &str) -> Option<PendingConfirmation> {
        let entry = self.entries.remove(tool_call_id)?;
        if entry.created_at.elapsed() > CONFIRMATION_TTL {
            debug!(%tool_call_id, "pending confirmation expired");
            return None;
        }
        Some(entry)
    }

    /// Drop every expired entry.  Called at the start of each request.
    pub fn collect_expired(&mut self) {
        self.entries
            .retain(|_, e| e.created_at.elapsed() <= CONFIRMATION_TTL);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// What the user's reply to a confirmation question means.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConfirmationReply {
    Affirmative,
    Declined,
}

/// Interpret the tool-message content answering a confirmation question.
///
/// Recognized affirmative forms:
/// - a bare word from the whitelist (`yes`, `ok`, `proceed`, …);
/// - JSON `{"ok"|"confirmed"|"confirm": true}` or `{"answer": "<affirm>"}`;
/// - the upstream UI's `user has answered your questions:` envelope when it
///   contains `proceed (recommended)`.
///
/// Everything else — including unrecognized phrasings — declines.  A
/// confirmation must never be assumed.
pub fn parse_confirmation_reply(content: &str) -> ConfirmationReply {
    let trimmed = content.trim();

    if is_affirmative_word(trimmed) {
        return ConfirmationReply::Affirmative;
    }

    if let Ok(v) = serde_json::from_str::<Value>(trimmed) {
        for key in ["ok", "confirmed", "confirm"] {
            if v[key] == Value::Bool(true) {
                return ConfirmationReply::Affirmative;
            }
        }
        if let Some(answer) = v["answer"].as_str() {
            if is_affirmative_word(answer.trim()) {
                return ConfirmationReply::Affirmative;
            }
        }
    }

    let lower = trimmed.to_ascii_lowercase();
    if lower.contains("user has answered your questions:") && lower.contains("proceed (recommended)")
    {
        return ConfirmationReply::Affirmative;
    }

    ConfirmationReply::Declined
}

fn is_affirmative_word(word: &str) -> bool {
    let cleaned = word
        .trim_matches(|c: char| c.is_ascii_punctuation() && c != '1')
        .to_ascii_lowercase();
    AFFIRMATIVE_WORDS.contains(&cleaned.as_str())
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

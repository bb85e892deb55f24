// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! Token-bounding of the conversation before it is sent upstream.
//!
//! Two independent mechanisms: per-tool-result truncation (head/tail with
//! an explicit notice) applied always, and whole-history compaction
//! (pin systems, keep a recent tail, summarize the dropped middle) applied
//! only when the estimate crosses the budget threshold.

use zproxy_config::ContextConfig;

use crate::openai::ChatMessage;

/// Per-message snippet length inside the auto summary.
const SUMMARY_SNIPPET_CHARS: usize = 180;

/// What compaction did to the message list.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CompactionReport {
    /// Messages summarized away.
    pub dropped: usize,
    /// Estimate after compaction.
    pub used_tokens: usize,
}

#[derive(Debug, Clone)]
pub struct Compactor {
    cfg: ContextConfig,
}

impl Compactor {
    pub fn new(cfg: ContextConfig) -> Self {
        Self { cfg }
    }

    /// Budget available to conversation content.
    pub fn budget(&self) -> usize {
        self.cfg.max_tokens.saturating_sub(self.cfg.reserve_tokens)
    }

    fn threshold(&self) -> usize {
        self.budget().saturating_sub(self.cfg.safety_margin)
    }

    /// Estimate tokens for one message (role overhead included).
    pub fn estimate_message(msg: &ChatMessage) -> usize {
        estimate_text_tokens(&msg.text()) + 4
    }

    /// Estimate tokens for a whole conversation.
    pub fn estimate_conversation(messages: &[ChatMessage]) -> usize {
        messages.iter().map(Self::estimate_message).sum()
    }

    /// Bound the conversation to the budget.
    ///
    /// Tool-result payloads are truncated first; if the total still
    /// exceeds the threshold, leading system messages are pinned, the last
    /// `max(min_recent_messages, recent_messages)` messages are kept, and
    /// everything between is folded into a single summary system message.
    /// If even that is over budget the retained tail is shaved down to the
    /// floor one message at a time.
    pub fn compact(&self, messages: Vec<ChatMessage>) -> (Vec<ChatMessage>, CompactionReport) {
        let mut messages = messages;
        for msg in &mut messages {
            if msg.is_role("tool") {
                let text = msg.text();
                let truncated = self.truncate_tool_payload(&text);
                if truncated.len() < text.len() {
                    msg.content = Some(serde_json::Value::String(truncated));
                }
            }
        }

        let total = Self::estimate_conversation(&messages);
        if total <= self.threshold() {
            return (
                messages,
                CompactionReport {
                    dropped: 0,
                    used_tokens: total,
                },
            );
        }

        // Pin the leading system run.
        let pinned = messages.iter().take_while(|m| m.is_role("system")).count();
        let rest = &messages[pinned..];

        let keep = self
            .cfg
            .recent_messages
            .max(self.cfg.min_recent_messages)
            .min(rest.len());
        let split = rest.len() - keep;
        let (older, recent) = rest.split_at(split);

        let mut out: Vec<ChatMessage> = messages[..pinned].to_vec();
        if !older.is_empty() {
            out.push(ChatMessage::system(self.summarize(older)));
        }
        let mut recent: Vec<ChatMessage> = recent.to_vec();

        // Shave the oldest retained message while over budget, never going
        // below the floor.
        let floor = self.cfg.min_recent_messages.max(1);
        loop {
            let candidate: usize = Self::estimate_conversation(&out)
                + Self::estimate_conversation(&recent);
            if candidate <= self.budget() || recent.len() <= floor {
                break;
            }
            recent.remove(0);
        }

        let dropped = older.len() + (keep - recent.len());
        out.extend(recent);
        let used = Self::estimate_conversation(&out);
        (
            out,
            CompactionReport {
                dropped,
                used_tokens: used,
            },
        )
    }

    fn summarize(&self, older: &[ChatMessage]) -> String {
        let mut summary =
            String::from("Context summary (auto, older messages truncated):");
        for msg in older {
            let text = msg.text();
            let snippet: String = text.chars().take(SUMMARY_SNIPPET_CHARS).collect();
            let ellipsis = if text.chars().count() > SUMMARY_SNIPPET_CHARS {
                "…"
            } else {
                ""
            };
            let line = format!("\n- {}: {}{}", msg.role, snippet.trim(), ellipsis);
            if summary.len() + line.len() > self.cfg.summary_max_chars {
                break;
            }
            summary.push_str(&line);
        }
        summary
    }

    /// Truncate one tool-result payload to the configured line and
    /// character caps, keeping 60% head / 40% tail around a notice.
    pub fn truncate_tool_payload(&self, text: &str) -> String {
        let text = self.truncate_lines(text);
        self.truncate_chars(&text)
    }

    fn truncate_lines(&self, text: &str) -> String {
        let max = self.cfg.tool_max_lines;
        if max == 0 {
            return text.to_string();
        }
        let lines: Vec<&str> = text.lines().collect();
        if lines.len() <= max {
            return text.to_string();
        }
        let head = max * 6 / 10;
        let tail = max.saturating_sub(head);
        let omitted = lines.len() - head - tail;
        let mut out: Vec<String> = lines[..head].iter().map(|l| l.to_string()).collect();
        out.push(format!("[... {omitted} lines truncated ...]"));
        out.extend(lines[lines.len() - tail..].iter().map(|l| l.to_string()));
        out.join("\n")
    }

    fn truncate_chars(&self, text: &str) -> String {
        let max = self.cfg.tool_max_chars;
        if max == 0 || text.len() <= max {
            return text.to_string();
        }
        let head_budget = max * 6 / 10;
        let tail_budget = max.saturating_sub(head_budget);
        let head_end = floor_char_boundary(text, head_budget);
        let tail_start = ceil_char_boundary(text, text.len() - tail_budget);
        let omitted = tail_start - head_end;
        format!(
            "{}\n[... {omitted} bytes truncated ...]\n{}",
            &text[..head_end],
            &text[tail_start..]
        )
    }
}

/// `ceil(len/4)` for prose, `ceil(len/3)` for code-like text (denser token
/// mapping).  Code is detected by the density of brace/paren/bracket
/// characters.
pub fn estimate_text_tokens(text: &str) -> usize {
    if text.is_empty() {
        return 0;
    }
    let divisor = if looks_like_code(text) { 3 } else { 4 };
    text.len().div_ceil(divisor)
}

fn looks_like_code(text: &str) -> bool {
    let structural = text
        .bytes()
        .filter(|b| matches!(b, b'{' | b'}' | b'(' | b')' | b'[' | b']' | b';'))
        .count();
    // 2% structural characters is already far above typical prose.
    structural * 50 > text.len()
}

fn floor_char_boundary(s: &str, mut i: usize) -> usize {
    i = i.min(s.len());
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}

fn ceil_char_boundary(s: &str, mut i: usize) -> usize {
    i = i.min(s.len());
    while i < s.len() && !s.is_char_boundary(i) {
        i += 1;
    }
    i
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    fn cfg() -> ContextConfig {
        ContextConfig {
            max_tokens: 1000,
            reserve_tokens: 100,
            safety_margin: 50,
            recent_messages: 4,
            min_recent_messages: 2,
            summary_max_chars: 2000,
            tool_max_lines: 10,
            tool_max_chars: 400,
        }
    }

    fn compactor() -> Compactor {
        Compactor::new(cfg())
    }

    // ── Token estimation ─────────────────────────────────────────────────────

    #[test]
    fn prose_estimates_at_len_over_four() {
        assert_eq!(estimate_text_tokens("12345678"), 2);
        assert_eq!(estimate_text_tokens("123456789"), 3); // ceil
    }

    #[test]
    fn code_estimates_at_len_over_three() {
        let code = "fn f(){let x=[1,2];g(x);}";
        assert_eq!(estimate_text_tokens(code), code.len().div_ceil(3));
    }

    #[test]
    fn empty_text_is_zero_tokens() {
        assert_eq!(estimate_text_tokens(""), 0);
    }

    #[test]
    fn prose_with_a_parenthesis_is_still_prose() {
        let text = "This is a long sentence with one aside (like this) in the middle of it.";
        assert_eq!(estimate_text_tokens(text), text.len().div_ceil(4));
    }

    // ── Pass-through ─────────────────────────────────────────────────────────

    #[test]
    fn small_conversation_passes_through() {
        let msgs = vec![ChatMessage::system("s"), ChatMessage::user("hello")];
        let (out, report) = compactor().compact(msgs.clone());
        assert_eq!(out.len(), 2);
        assert_eq!(report.dropped, 0);
    }

    // ── Compaction ───────────────────────────────────────────────────────────

    fn big_conversation(n: usize) -> Vec<ChatMessage> {
        let mut msgs = vec![ChatMessage::system("you are a helpful proxy")];
        for i in 0..n {
            msgs.push(ChatMessage::user(format!(
                "user message {i} {}",
                "lorem ipsum dolor sit amet ".repeat(10)
            )));
            msgs.push(ChatMessage::new(
                "assistant",
                format!("assistant reply {i} {}", "consectetur adipiscing ".repeat(10)),
            ));
        }
        msgs
    }

    #[test]
    fn oversized_conversation_is_compacted_with_summary() {
        let msgs = big_conversation(20);
        let (out, report) = compactor().compact(msgs);
        assert!(report.dropped > 0);
        assert!(out[0].is_role("system"));
        let summary = &out[1];
        assert!(summary.is_role("system"));
        assert!(summary.text().starts_with("Context summary (auto"));
        assert!(report.used_tokens <= compactor().budget());
    }

    #[test]
    fn leading_system_messages_are_pinned() {
        let mut msgs = vec![
            ChatMessage::system("first system"),
            ChatMessage::system("second system"),
        ];
        msgs.extend(big_conversation(20).into_iter().skip(1));
        let (out, _) = compactor().compact(msgs);
        assert_eq!(out[0].text(), "first system");
        assert_eq!(out[1].text(), "second system");
    }

    #[test]
    fn recent_tail_is_preserved_verbatim() {
        let msgs = big_conversation(20);
        let last = msgs.last().unwrap().text();
        let (out, _) = compactor().compact(msgs);
        assert_eq!(out.last().unwrap().text(), last);
    }

    #[test]
    fn summary_lines_carry_role_and_snippet() {
        let msgs = big_conversation(20);
        let (out, _) = compactor().compact(msgs);
        let summary = out[1].text();
        assert!(summary.contains("- user: user message 0"));
        assert!(summary.contains("…"), "long snippets end with ellipsis");
    }

    #[test]
    fn summary_respects_max_chars() {
        let mut c = cfg();
        c.summary_max_chars = 120;
        let (out, _) = Compactor::new(c).compact(big_conversation(20));
        assert!(out[1].text().len() <= 120 + SUMMARY_SNIPPET_CHARS);
    }

    #[test]
    fn shaving_never_goes_below_the_floor() {
        let mut c = cfg();
        c.max_tokens = 120; // brutally small
        c.reserve_tokens = 10;
        c.safety_margin = 5;
        let (out, _) = Compactor::new(c.clone()).compact(big_conversation(20));
        let non_system = out.iter().filter(|m| !m.is_role("system")).count();
        assert!(non_system >= c.min_recent_messages.min(2));
    }

    // ── Tool-payload truncation ──────────────────────────────────────────────

    #[test]
    fn short_tool_payload_is_untouched() {
        let text = "line1\nline2";
        assert_eq!(compactor().truncate_tool_payload(text), text);
    }

    #[test]
    fn long_tool_payload_keeps_head_and_tail_lines() {
        let text: Vec<String> = (0..100).map(|i| format!("line{i}")).collect();
        let out = compactor().truncate_tool_payload(&text.join("\n"));
        assert!(out.contains("line0"), "head preserved");
        assert!(out.contains("line99"), "tail preserved");
        assert!(out.contains("lines truncated"), "notice present");
        assert!(!out.contains("line50"), "middle dropped");
    }

    #[test]
    fn head_tail_split_is_60_40() {
        let text: Vec<String> = (0..100).map(|i| format!("line{i}")).collect();
        let out = compactor().truncate_tool_payload(&text.join("\n"));
        // 10-line cap → 6 head + 4 tail.
        assert!(out.contains("line5"));
        assert!(!out.contains("line6\n"));
        assert!(out.contains("line96"));
    }

    #[test]
    fn char_cap_applies_after_line_cap() {
        let text = "x".repeat(2000); // single line, over the 400-char cap
        let out = compactor().truncate_tool_payload(&text);
        assert!(out.len() < 2000);
        assert!(out.contains("bytes truncated"));
    }

    #[test]
    fn tool_messages_are_truncated_during_compaction() {
        let mut msgs = vec![ChatMessage::system("s"), ChatMessage::user("u")];
        let mut tool = ChatMessage::new("tool", "y".repeat(5000));
        tool.tool_call_id = Some("call_1".into());
        msgs.push(tool);
        let (out, _) = compactor().compact(msgs);
        assert!(out[2].text().len() < 5000);
    }

    #[test]
    fn zero_caps_disable_truncation() {
        let mut c = cfg();
        c.tool_max_lines = 0;
        c.tool_max_chars = 0;
        let text = "z".repeat(100_000);
        assert_eq!(Compactor::new(c).truncate_tool_payload(&text).len(), 100_000);
    }
}

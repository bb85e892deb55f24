// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Incremental decoder for the upstream completion stream.
//!
//! The upstream speaks SSE with two payload dialects on the same wire:
//! OpenAI-style `choices[0].delta.content` fragments, and the native
//! `{type:"chat:completion", data:{delta_content, phase}}` events where
//! `phase` switches between thinking and answer prose.  OpenAI-style
//! payloads carry the same transitions in-band as `<think>` / `<details>`
//! tags instead of phases.
//!
//! SSE events can be split across TCP packets at any byte.  A persistent
//! line buffer holds the incomplete tail; only complete `\n`-terminated
//! lines are parsed.  A second pending buffer holds a `<…` tag fragment
//! that straddles a frame boundary.
//!
//! The parser additionally cleans up two upstream quirks: a completed
//! thinking segment is sometimes *replayed* at the start of the next one,
//! and sometimes echoed verbatim (or as a `> `-quoted "Thought Process"
//! block) at the start of the answer.  Both are suppressed here so
//! consumers see each piece of reasoning exactly once.

use serde_json::Value;

use crate::chunk::StreamChunk;

/// Minimum length before a re-played thinking prefix counts as a duplicate.
const DEDUP_MIN_CHARS: usize = 50;
/// Upper bound on the answer-leak lookahead buffer.
const GUARD_MAX_CHARS: usize = 4096;
/// Longest run treated as a potential markup tag; anything longer is text.
const TAG_MAX_CHARS: usize = 64;

/// Residual artifact left by the upstream's collapsible-details markup.
const DETAILS_SENTINEL: &str = "true\">";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Seg {
    /// Holding back the start of a new segment until it is known to be
    /// fresh text rather than a replay of the previous segment.
    Probe,
    /// Emitting thinking text normally.
    Streaming,
    /// Suppressing a replayed segment; `cursor` indexes into the previous
    /// segment's text.
    Skip { cursor: usize },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    Content,
    Thinking(Seg),
}

/// Streaming SSE → [`StreamChunk`] decoder.  Feed raw body bytes with
/// [`StreamParser::feed`]; call [`StreamParser::finish`] at EOF.
#[derive(Debug)]
pub struct StreamParser {
    line_buf: String,
    mode: Mode,
    terminated: bool,
    /// Partial `<…` sequence awaiting its closing `>`.
    tag_buf: String,
    /// Held-back text while probing a possibly-replayed segment.
    probe_buf: String,
    /// Full sanitized text of the in-flight thinking segment.
    current_thinking: String,
    /// Text of the last completed thinking segment.
    last_thinking: Option<String>,
    /// Whether the in-flight segment emitted at least one Thinking chunk.
    emitted_in_segment: bool,
    /// Lookahead buffer for answer text that may echo the thinking.
    guard: Option<String>,
}

impl Default for StreamParser {
    fn default() -> Self {
        Self::new()
    }
}

impl StreamParser {
    pub fn new() -> Self {
        Self {
            line_buf: String::new(),
            mode: Mode::Content,
            terminated: false,
            tag_buf: String::new(),
            probe_buf: String::new(),
            current_thinking: String::new(),
            last_thinking: None,
            emitted_in_segment: false,
            guard: None,
        }
    }

    /// `true` once a `[DONE]` sentinel or `phase: done` event was seen.
    pub fn is_terminated(&self) -> bool {
        self.terminated
    }

    /// Feed a raw byte chunk; returns the chunks decoded from every line
    /// completed by it.
    pub fn feed(&mut self, bytes: &[u8]) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        if self.terminated {
            return out;
        }
        self.line_buf.push_str(&String::from_utf8_lossy(bytes));
        while let Some(nl) = self.line_buf.find('\n') {
            let line = self.line_buf[..nl].trim_end_matches('\r').to_string();
            self.line_buf = self.line_buf[nl + 1..].to_string();
            self.handle_line(&line, &mut out);
            if self.terminated {
                break;
            }
        }
        out
    }

    /// Flush all pending state at end of input.  Does not emit a
    /// terminator — the caller appends `Done` when the upstream closed the
    /// body without a `[DONE]` sentinel.
    pub fn finish(&mut self) -> Vec<StreamChunk> {
        let mut out = Vec::new();
        if self.terminated {
            return out;
        }
        // A final line without a trailing newline is still a complete event
        // once the body has ended.
        if !self.line_buf.is_empty() {
            let line = std::mem::take(&mut self.line_buf);
            self.handle_line(line.trim_end_matches('\r'), &mut out);
        }
        if !self.tag_buf.is_empty() {
            // Unclosed tag fragment: it was text after all.
            let buf = std::mem::take(&mut self.tag_buf);
            self.route_text(&buf, &mut out);
        }
        if matches!(self.mode, Mode::Thinking(_)) {
            self.leave_thinking(&mut out);
        }
        self.flush_guard(true, &mut out);
        out
    }

    // ── Line / payload dispatch ──────────────────────────────────────────────

    fn handle_line(&mut self, line: &str, out: &mut Vec<StreamChunk>) {
        let Some(data) = line.strip_prefix("data: ") else {
            return;
        };
        let data = data.trim();
        if data.is_empty() {
            return;
        }
        if data == "[DONE]" {
            self.terminate(out);
            return;
        }
        let Ok(v) = serde_json::from_str::<Value>(data) else {
            // Malformed frame — skip rather than poison the stream.
            return;
        };

        if v["type"].as_str() == Some("chat:completion") {
            self.handle_native(&v["data"], out);
        } else if let Some(text) = v["choices"][0]["delta"]["content"].as_str() {
            self.scan_text(text, out);
        }
    }

    fn handle_native(&mut self, data: &Value, out: &mut Vec<StreamChunk>) {
        let text = data["delta_content"]
            .as_str()
            .or_else(|| data["content"].as_str())
            .or_else(|| data["edit_content"].as_str())
            .unwrap_or("");
        match data["phase"].as_str() {
            Some("thinking") => {
                self.enter_thinking(out);
                self.scan_text(text, out);
            }
            Some("answer") | Some("other") => {
                self.leave_thinking(out);
                self.scan_text(text, out);
            }
            Some("done") => {
                self.leave_thinking(out);
                self.scan_text(text, out);
                self.terminate(out);
            }
            // No phase: in-band tags drive the transitions, as in the
            // OpenAI-style dialect.
            _ => self.scan_text(text, out),
        }
    }

    fn terminate(&mut self, out: &mut Vec<StreamChunk>) {
        if matches!(self.mode, Mode::Thinking(_)) {
            self.leave_thinking(out);
        }
        self.flush_guard(true, out);
        out.push(StreamChunk::Done);
        self.terminated = true;
    }

    // ── Tag scanning ─────────────────────────────────────────────────────────

    /// Split `text` into literal runs and `<…>` markers, buffering a marker
    /// that is cut off by the end of the fragment.
    fn scan_text(&mut self, text: &str, out: &mut Vec<StreamChunk>) {
        let mut plain = String::new();
        for ch in text.chars() {
            if !self.tag_buf.is_empty() {
                if ch == '>' {
                    self.tag_buf.push('>');
                    let tag = std::mem::take(&mut self.tag_buf);
                    if !plain.is_empty() {
                        let run = std::mem::take(&mut plain);
                        self.route_text(&run, out);
                    }
                    self.handle_tag(&tag, out);
                } else if ch == '<' {
                    // A bare '<' followed by another '<': the first was text.
                    let stale = std::mem::take(&mut self.tag_buf);
                    plain.push_str(&stale);
                    self.tag_buf.push('<');
                } else {
                    self.tag_buf.push(ch);
                    if self.tag_buf.len() > TAG_MAX_CHARS {
                        let stale = std::mem::take(&mut self.tag_buf);
                        plain.push_str(&stale);
                    }
                }
            } else if ch == '<' {
                self.tag_buf.push('<');
            } else {
                plain.push(ch);
            }
        }
        if !plain.is_empty() {
            self.route_text(&plain, out);
        }
    }

    fn handle_tag(&mut self, tag: &str, out: &mut Vec<StreamChunk>) {
        let inner = &tag[1..tag.len() - 1];
        let closing = inner.starts_with('/');
        let name = inner
            .trim_start_matches('/')
            .split(|c: char| c.is_whitespace() || c == '/')
            .next()
            .unwrap_or("")
            .to_ascii_lowercase();
        match (name.as_str(), closing) {
            ("think", false) | ("details", false) => self.enter_thinking(out),
            ("think", true) | ("details", true) => self.leave_thinking(out),
            // Anything else is ordinary markup in the current mode.
            _ => self.route_text(tag, out),
        }
    }

    // ── Mode transitions ─────────────────────────────────────────────────────

    fn enter_thinking(&mut self, out: &mut Vec<StreamChunk>) {
        if matches!(self.mode, Mode::Thinking(_)) {
            return;
        }
        // Entering a new thinking segment means the buffered answer text was
        // not a leak of the previous one.
        self.flush_guard(false, out);
        let probe_needed = self
            .last_thinking
            .as_ref()
            .is_some_and(|t| t.len() > DEDUP_MIN_CHARS);
        self.mode = Mode::Thinking(if probe_needed { Seg::Probe } else { Seg::Streaming });
        self.probe_buf.clear();
        self.current_thinking.clear();
        self.emitted_in_segment = false;
    }

    fn leave_thinking(&mut self, out: &mut Vec<StreamChunk>) {
        if !matches!(self.mode, Mode::Thinking(_)) {
            return;
        }
        // A probe that never resolved was real (short) thinking text.
        if !self.probe_buf.is_empty() {
            let buf = std::mem::take(&mut self.probe_buf);
            out.push(StreamChunk::Thinking(buf));
            self.emitted_in_segment = true;
        }
        // A fully suppressed replay emits neither Thinking nor ThinkingEnd,
        // so the consumer sees the segment exactly once.
        if self.emitted_in_segment {
            out.push(StreamChunk::ThinkingEnd);
        }
        if !self.current_thinking.trim().is_empty() {
            self.last_thinking = Some(std::mem::take(&mut self.current_thinking));
        } else {
            self.current_thinking.clear();
        }
        self.mode = Mode::Content;
        if self.last_thinking.is_some() {
            self.guard = Some(String::new());
        }
    }

    // ── Routing ──────────────────────────────────────────────────────────────

    fn route_text(&mut self, text: &str, out: &mut Vec<StreamChunk>) {
        match self.mode {
            Mode::Thinking(_) => self.push_thinking(text, out),
            Mode::Content => self.push_content(text, out),
        }
    }

    fn push_thinking(&mut self, text: &str, out: &mut Vec<StreamChunk>) {
        let text = sanitize_thinking(text);
        if text.is_empty() {
            return;
        }
        self.current_thinking.push_str(&text);

        let Mode::Thinking(seg) = self.mode else {
            return;
        };
        match seg {
            Seg::Streaming => {
                out.push(StreamChunk::Thinking(text));
                self.emitted_in_segment = true;
            }
            Seg::Probe => {
                self.probe_buf.push_str(&text);
                // Probe only exists when a previous segment is recorded.
                let last = self.last_thinking.clone().unwrap_or_default();
                if last.starts_with(self.probe_buf.as_str()) {
                    if self.probe_buf.len() > DEDUP_MIN_CHARS {
                        // Long shared prefix: this is a replay.  Drop the
                        // held-back text and swallow the rest as it arrives.
                        let cursor = self.probe_buf.len();
                        self.probe_buf.clear();
                        self.mode = Mode::Thinking(Seg::Skip { cursor });
                    }
                    // Short prefix: keep probing.
                } else if self.probe_buf.starts_with(last.as_str()) {
                    // Replayed the whole previous segment and continued with
                    // fresh text — emit only the continuation.
                    let rest = self.probe_buf[last.len()..].to_string();
                    self.probe_buf.clear();
                    self.mode = Mode::Thinking(Seg::Streaming);
                    if !rest.is_empty() {
                        out.push(StreamChunk::Thinking(rest));
                        self.emitted_in_segment = true;
                    }
                } else {
                    // Diverged before the threshold: genuine new thinking.
                    let buf = std::mem::take(&mut self.probe_buf);
                    self.mode = Mode::Thinking(Seg::Streaming);
                    out.push(StreamChunk::Thinking(buf));
                    self.emitted_in_segment = true;
                }
            }
            Seg::Skip { cursor } => {
                let last = self.last_thinking.clone().unwrap_or_default();
                let remaining = &last[cursor.min(last.len())..];
                if text.len() <= remaining.len() && remaining.starts_with(text.as_str()) {
                    let cursor = cursor + text.len();
                    self.mode = Mode::Thinking(if cursor >= last.len() {
                        Seg::Streaming
                    } else {
                        Seg::Skip { cursor }
                    });
                } else if text.starts_with(remaining) {
                    // Consumed the rest of the replay plus fresh text.
                    let extra = text[remaining.len()..].to_string();
                    self.mode = Mode::Thinking(Seg::Streaming);
                    if !extra.is_empty() {
                        out.push(StreamChunk::Thinking(extra));
                        self.emitted_in_segment = true;
                    }
                } else {
                    // Diverged mid-replay: emit from the divergence point on.
                    self.mode = Mode::Thinking(Seg::Streaming);
                    out.push(StreamChunk::Thinking(text));
                    self.emitted_in_segment = true;
                }
            }
        }
    }

    fn push_content(&mut self, text: &str, out: &mut Vec<StreamChunk>) {
        let Some(buf) = self.guard.as_mut() else {
            if !text.is_empty() {
                out.push(StreamChunk::Content(text.to_string()));
            }
            return;
        };
        buf.push_str(text);

        // Complete leak found: strip it and stream the remainder normally.
        if let Some(stripped) =
            try_strip_leak(self.guard.as_deref().unwrap_or(""), self.last_thinking.as_deref(), false)
        {
            self.guard = None;
            if !stripped.is_empty() {
                out.push(StreamChunk::Content(stripped));
            }
            return;
        }
        let buf = self.guard.as_ref().map(String::as_str).unwrap_or("");
        let overflow = buf.len() >= GUARD_MAX_CHARS;
        if overflow || !could_be_leak(buf, self.last_thinking.as_deref()) {
            // Verbatim flush — the lookahead found nothing to suppress.
            let buf = self.guard.take().unwrap_or_default();
            if !buf.is_empty() {
                out.push(StreamChunk::Content(buf));
            }
        }
    }

    fn flush_guard(&mut self, at_eof: bool, out: &mut Vec<StreamChunk>) {
        let Some(buf) = self.guard.take() else { return };
        let text = try_strip_leak(&buf, self.last_thinking.as_deref(), at_eof).unwrap_or(buf);
        if !text.is_empty() {
            out.push(StreamChunk::Content(text));
        }
    }
}

// ─── Thinking sanitization ───────────────────────────────────────────────────

/// Strip residual collapsible-details markup and the `true">` artifact the
/// upstream leaves inside thinking payloads.
fn sanitize_thinking(text: &str) -> String {
    let mut s = text.replace(DETAILS_SENTINEL, "");
    for marker in ["<think>", "</think>", "</details>"] {
        if s.contains(marker) {
            s = s.replace(marker, "");
        }
    }
    // `<details …>` carries attributes, so a plain replace cannot match it.
    while let Some(start) = s.find("<details") {
        match s[start..].find('>') {
            Some(rel) => s.replace_range(start..start + rel + 1, ""),
            None => break,
        }
    }
    s
}

// ─── Answer-leak detection ───────────────────────────────────────────────────

/// Could `buf` still grow into a leaked copy of the thinking text?
fn could_be_leak(buf: &str, last_thinking: Option<&str>) -> bool {
    let t = buf.trim_start();
    if t.is_empty() {
        return true;
    }
    if let Some(last) = last_thinking {
        let last = last.trim();
        if !last.is_empty() && (last.starts_with(t) || t.starts_with(last)) {
            return true;
        }
    }
    // Heading form: optional `#`s, then "Thought Process" / "Thinking".
    let head = t.trim_start_matches('#').trim_start();
    for title in ["Thought Process", "Thinking"] {
        if title.starts_with(head) || head.starts_with(title) {
            return true;
        }
    }
    t.starts_with('>')
}

/// Strip a completed leak block from the front of `buf`.
///
/// Two recognized forms:
/// 1. A `Thought Process` / `Thinking` heading followed by `>`-quoted lines.
///    Complete once a non-quoted, non-empty line follows (or at EOF).
/// 2. A verbatim repetition of the completed thinking segment.
///
/// Returns `None` when no complete leak is present yet.
fn try_strip_leak(buf: &str, last_thinking: Option<&str>, at_eof: bool) -> Option<String> {
    let trimmed = buf.trim_start();
    let lead = buf.len() - trimmed.len();

    // Form 2: verbatim echo of the thinking segment.
    if let Some(last) = last_thinking {
        let last = last.trim();
        if !last.is_empty() && trimmed.starts_with(last) {
            return Some(trimmed[last.len()..].trim_start().to_string());
        }
    }

    // Form 1: quoted "Thought Process" block.
    let mut lines = trimmed.split_inclusive('\n');
    let first = lines.next()?;
    let head = first.trim().trim_start_matches('#').trim();
    let head = head.strip_suffix(':').unwrap_or(head);
    if head != "Thought Process" && head != "Thinking" {
        return None;
    }
    let mut consumed = lead + first.len();
    let mut saw_quote = false;
    for line in lines {
        let t = line.trim_start();
        if t.starts_with('>') || t.trim().is_empty() {
            saw_quote |= t.starts_with('>');
            consumed += line.len();
        } else {
            // Block ended before this line.
            if saw_quote {
                return Some(buf[consumed..].trim_start().to_string());
            }
            return None;
        }
    }
    // Ran out of buffered lines; only complete if the stream itself ended.
    if at_eof && saw_quote {
        return Some(String::new());
    }
    None
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Intent inference for turns where the model produced no structured
//! output — or where the user's text is so unambiguous that a round-trip
//! to the model is wasted.
//!
//! Three families: explicit `% tool` directives, read/list intent over a
//! named file or directory, and search intent mapped onto `rg`/`grep`.
//! Everything inferred here still passes through the guard; the checks in
//! this module only decide whether to *fire*, not whether it is safe.

use std::sync::OnceLock;

use regex::Regex;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::output::ParsedCall;
use crate::registry::{ToolInfo, ToolRegistry};
use crate::sensitive::is_sensitive_path;

fn explicit_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"(?m)^\s*%\s*([A-Za-z0-9_\-]+)(?::[ \t]*(.*))?$").unwrap())
}

fn file_token_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"[A-Za-z0-9_./\\-]+\.[A-Za-z0-9]{1,10}\b").unwrap())
}

fn read_intent_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(read|open|show|cat|print|display)\b").unwrap())
}

fn search_intent_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"\b(search|find)\b").unwrap())
}

fn list_intent_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"\b(list|ls)\b.*\b(files?|director(?:y|ies)|folders?|dirs?|contents)\b")
            .unwrap()
    })
}

fn search_for_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"search\s+for\s+["']?([^"\n]+?)["']?\s+in\s+([\w./\\-]+)"#).unwrap()
    })
}

fn grep_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r#"\b(?:rg|ripgrep|grep)\s+["']?([^"\n]+?)["']?\s*$"#).unwrap()
    })
}

/// Does the user message embed a tool result (agent frameworks inline them
/// as text)?  Heuristics must never fire on such turns — the text quotes
/// output, it does not state intent.
pub fn has_tool_result_marker(text: &str) -> bool {
    let lower = text.to_ascii_lowercase();
    lower.contains("tool_result")
        || lower.contains("[tool result")
        || lower.contains("tool result:")
        || lower.contains("<tool_response")
}

// ─── Explicit `% tool` directives ────────────────────────────────────────────

/// Parse an explicit `% tool[: rest]` line into a call.
///
/// `rest` is tried as JSON, then as `key=value` pairs, and finally placed
/// whole into a best-guess argument slot.
pub fn explicit_tool_call(text: &str, registry: &ToolRegistry) -> Option<ParsedCall> {
    let caps = explicit_re().captures(text)?;
    let name = caps.get(1)?.as_str();
    let info = registry.lookup(name)?;
    let rest = caps.get(2).map(|m| m.as_str().trim()).unwrap_or("");

    let args = if rest.is_empty() {
        Value::Object(Map::new())
    } else if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(rest) {
        v
    } else if let Some(pairs) = parse_key_value_pairs(rest) {
        pairs
    } else {
        let key = best_guess_key(info);
        json!({ key: rest })
    };

    debug!(tool = %info.name, "explicit tool directive");
    Some(ParsedCall {
        tool: info.name.clone(),
        args: registry.normalize_args_for_tool(info, args),
    })
}

/// `k=v k2="v two"` → object.  Every token must contain `=` to qualify.
fn parse_key_value_pairs(rest: &str) -> Option<Value> {
    let tokens: Vec<&str> = rest.split_whitespace().collect();
    if tokens.is_empty() || !tokens.iter().all(|t| t.contains('=')) {
        return None;
    }
    let mut map = Map::new();
    for token in tokens {
        let (k, v) = token.split_once('=')?;
        if k.is_empty() {
            return None;
        }
        let v = v.trim_matches(|c| c == '"' || c == '\'');
        map.insert(k.to_string(), json!(v));
    }
    Some(Value::Object(map))
}

/// Pick the argument slot for a free-form directive payload.
fn best_guess_key(info: &ToolInfo) -> String {
    const PREFERRED: &[&str] = &["url", "path", "query", "input", "text", "command", "pattern"];
    for pref in PREFERRED {
        if let Some(k) = info
            .arg_keys
            .iter()
            .find(|k| k.to_ascii_lowercase() == *pref)
        {
            return k.clone();
        }
    }
    info.arg_keys.first().cloned().unwrap_or_else(|| "input".into())
}

// ─── Free-text inference ─────────────────────────────────────────────────────

/// Infer a single tool call from free-form user text.
///
/// Search intent wins over read intent; list fires only without a file
/// token.  Returns `None` whenever the text is ambiguous — a model turn is
/// always the safer fallback.
pub fn infer_tool_call(text: &str, registry: &ToolRegistry) -> Option<ParsedCall> {
    if has_tool_result_marker(text) {
        return None;
    }
    let lower = text.to_ascii_lowercase();

    if let Some(call) = infer_search(&lower, registry) {
        return Some(call);
    }
    if let Some(call) = infer_read(text, &lower, registry) {
        return Some(call);
    }
    infer_list(&lower, registry)
}

fn infer_read(original: &str, lower: &str, registry: &ToolRegistry) -> Option<ParsedCall> {
    if !read_intent_re().is_match(lower) {
        return None;
    }
    // Search wins when a shell tool could run rg/grep.
    if search_intent_re().is_match(lower) && registry.lookup("run_shell").is_some() {
        return None;
    }
    // Take the file token from the original text to preserve case.  Pure
    // directory wording never matches here: a token must carry an extension.
    let file = file_token_re().find(original)?.as_str();
    if is_sensitive_path(file) {
        debug!(path = %file, "read heuristic refused sensitive path");
        return None;
    }
    let info = registry.lookup("read")?;
    debug!(tool = %info.name, path = %file, "inferred read call");
    Some(ParsedCall {
        tool: info.name.clone(),
        args: registry.normalize_args_for_tool(info, json!({ "path": file })),
    })
}

fn infer_list(lower: &str, registry: &ToolRegistry) -> Option<ParsedCall> {
    if !list_intent_re().is_match(lower) {
        return None;
    }
    let info = registry.lookup("list")?;
    let dir_re = {
        static RE: OnceLock<Regex> = OnceLock::new();
        RE.get_or_init(|| Regex::new(r"\bin\s+([\w./\\-]+)").unwrap())
    };
    let pattern = match dir_re.captures(lower) {
        Some(caps) => format!("{}/**/*", caps[1].trim_end_matches('/')),
        None => "**/*".to_string(),
    };
    let key = choose_key(info, &["pattern", "glob", "path", "dir"], "pattern");
    debug!(tool = %info.name, pattern = %pattern, "inferred list call");
    Some(ParsedCall {
        tool: info.name.clone(),
        args: registry.normalize_args_for_tool(info, json!({ key: pattern })),
    })
}

fn infer_search(lower: &str, registry: &ToolRegistry) -> Option<ParsedCall> {
    let info = registry.lookup("run_shell")?;
    let command = if let Some(caps) = search_for_re().captures(lower) {
        format!("rg {} {}", shell_quote(caps[1].trim()), shell_quote(&caps[2]))
    } else if let Some(caps) = grep_re().captures(lower) {
        format!("rg {}", shell_quote(caps[1].trim()))
    } else {
        return None;
    };
    debug!(tool = %info.name, command = %command, "inferred search call");
    Some(ParsedCall {
        tool: info.name.clone(),
        args: registry.normalize_args_for_tool(info, json!({ "command": command })),
    })
}

fn choose_key(info: &ToolInfo, preferred: &[&str], fallback: &str) -> String {
    for pref in preferred {
        if let Some(k) = info
            .arg_keys
            .iter()
            .find(|k| k.to_ascii_lowercase() == *pref)
        {
            return k.clone();
        }
    }
    fallback.to_string()
}

/// Single-quote a shell argument, escaping embedded single quotes.
fn shell_quote(s: &str) -> String {
    format!("'{}'", s.replace('\'', r"'\''"))
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

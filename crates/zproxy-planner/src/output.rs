// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Interpretation of the model's reply.
//!
//! The contract asks for exactly one planner JSON object, but models also
//! emit raw OpenAI-style tool-call arrays, JSON wrapped in prose, and
//! plain prose.  Parsing cascades strict → repaired → balanced-block →
//! whole-text scan, and can finally coerce prose into an answer-only plan.
//! Malformed tool arguments are *preserved* (as the raw string) so the
//! guard can reject them with the original in hand rather than a silently
//! substituted `{}`.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::debug;

use crate::jsonfix::{
    extract_first_object, extract_objects, parse_lenient, repair_planner_json,
};
use crate::registry::{ToolInfo, ToolRegistry};

// ─── Planner output model ────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum Risk {
    #[default]
    Low,
    Medium,
    High,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct Safety {
    #[serde(default)]
    pub risk: Risk,
    #[serde(default)]
    pub notes: String,
}

/// One desired tool invocation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Action {
    pub tool: String,
    #[serde(default)]
    pub args: Value,
    #[serde(default)]
    pub why: String,
    #[serde(default)]
    pub expect: String,
    #[serde(default)]
    pub safety: Safety,
}

/// The planner contract: `final` is present exactly when `actions` is empty.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PlannerOutput {
    #[serde(default)]
    pub plan: Vec<String>,
    #[serde(default)]
    pub actions: Vec<Action>,
    #[serde(rename = "final", default, skip_serializing_if = "Option::is_none")]
    pub final_text: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub thought: Option<String>,
}

impl PlannerOutput {
    /// Enforce the `actions == [] ⇔ final` invariant.  Returns `false` when
    /// the output has neither actions nor a final answer.
    fn enforce_invariant(&mut self) -> bool {
        if !self.actions.is_empty() {
            self.final_text = None;
            true
        } else {
            self.final_text.is_some()
        }
    }

    /// An answer-only plan wrapping free prose.
    pub fn from_prose(text: &str) -> Self {
        Self {
            plan: vec!["answer directly".into()],
            actions: Vec::new(),
            final_text: Some(text.to_string()),
            thought: None,
        }
    }
}

/// A tool call resolved against the registry and ready for the guard.
///
/// `args` is a JSON object in the happy path; when the model's argument
/// string could not be parsed it is the raw `Value::String` so the guard
/// sees the malformed original.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedCall {
    /// Declared tool name (the registry's canonical spelling).
    pub tool: String,
    pub args: Value,
}

// ─── Planner JSON parsing ────────────────────────────────────────────────────

/// Parse the model's reply into a [`PlannerOutput`].
///
/// Cascade: strict serde → repaired text → first balanced object with
/// field coercion → every balanced object in the text (last valid wins)
/// → optional prose coercion.
pub fn parse_planner_output(text: &str, coerce_prose: bool) -> Option<PlannerOutput> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(mut out) = serde_json::from_str::<PlannerOutput>(trimmed) {
        if out.enforce_invariant() {
            return Some(out);
        }
    }

    let repaired = repair_planner_json(trimmed);
    if let Ok(mut out) = serde_json::from_str::<PlannerOutput>(&repaired) {
        if out.enforce_invariant() {
            return Some(out);
        }
    }

    if let Some(block) = extract_first_object(&repaired) {
        if let Ok(v) = serde_json::from_str::<Value>(block) {
            if let Some(out) = coerce_planner_value(&v) {
                return Some(out);
            }
        }
    }

    // Whole-text scan: some replies wrap the valid object in partial prose
    // or emit several candidate objects; the last coercible one wins.
    let mut recovered = None;
    for block in extract_objects(&repaired) {
        if let Ok(v) = serde_json::from_str::<Value>(block) {
            if let Some(out) = coerce_planner_value(&v) {
                recovered = Some(out);
            }
        }
    }
    if recovered.is_some() {
        return recovered;
    }

    if coerce_prose {
        debug!("planner output was prose; coercing to answer-only plan");
        return Some(PlannerOutput::from_prose(trimmed));
    }
    None
}

/// Coerce a loosely-shaped JSON object into a valid planner output.
///
/// `plan` accepts a bare string; actions are filled with defaults; the
/// result must satisfy the actions/final invariant to count.
fn coerce_planner_value(v: &Value) -> Option<PlannerOutput> {
    let obj = v.as_object()?;
    // An object with none of the planner keys is not a planner reply at all
    // (it might be a raw tool call, handled elsewhere).
    if !obj.contains_key("plan") && !obj.contains_key("actions") && !obj.contains_key("final") {
        return None;
    }

    let plan = match obj.get("plan") {
        Some(Value::String(s)) => vec![s.clone()],
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(|i| i.as_str().map(str::to_string))
            .collect(),
        _ => Vec::new(),
    };

    let actions = match obj.get("actions") {
        Some(Value::Array(items)) => items
            .iter()
            .filter_map(coerce_action)
            .collect(),
        _ => Vec::new(),
    };

    let mut out = PlannerOutput {
        plan,
        actions,
        final_text: obj.get("final").and_then(Value::as_str).map(str::to_string),
        thought: obj
            .get("thought")
            .and_then(Value::as_str)
            .map(str::to_string),
    };
    out.enforce_invariant().then_some(out)
}

fn coerce_action(v: &Value) -> Option<Action> {
    let obj = v.as_object()?;
    let tool = obj.get("tool").or_else(|| obj.get("name"))?.as_str()?;
    let risk = match v["safety"]["risk"].as_str() {
        Some("medium") => Risk::Medium,
        Some("high") => Risk::High,
        _ => Risk::Low,
    };
    Some(Action {
        tool: tool.to_string(),
        args: obj.get("args").cloned().unwrap_or_else(|| Value::Object(Map::new())),
        why: obj.get("why").and_then(Value::as_str).unwrap_or("").into(),
        expect: obj.get("expect").and_then(Value::as_str).unwrap_or("").into(),
        safety: Safety {
            risk,
            notes: v["safety"]["notes"].as_str().unwrap_or("").into(),
        },
    })
}

// ─── Raw tool-call parsing ───────────────────────────────────────────────────

/// Detect an OpenAI-style raw tool-call array (or single object) in the
/// reply and resolve it against the registry.
///
/// Returns `None` when the text carries no recognizable call, or when no
/// referenced tool resolves.  Calls naming unknown tools are skipped.
pub fn parse_raw_tool_calls(text: &str, registry: &ToolRegistry) -> Option<Vec<ParsedCall>> {
    let candidate = repair_planner_json(text);

    let items: Vec<Value> = if let Some(v) = parse_array_candidate(&candidate) {
        v
    } else if let Some(v) = parse_lenient(&candidate) {
        if looks_like_tool_call(&v) {
            vec![v]
        } else {
            return None;
        }
    } else {
        return None;
    };

    let mut calls = Vec::new();
    for item in &items {
        let Some((name, raw_args)) = call_parts(item) else {
            continue;
        };
        let Some(info) = registry.lookup(&name) else {
            debug!(tool = %name, "raw tool call names unknown tool; skipping");
            continue;
        };
        let args = parse_call_arguments(raw_args);
        calls.push(ParsedCall {
            tool: info.name.clone(),
            args: registry.normalize_args_for_tool(info, args),
        });
    }
    if calls.is_empty() {
        None
    } else {
        Some(calls)
    }
}

/// Find a balanced top-level `[…]` that parses as an array of call-shaped
/// objects.
fn parse_array_candidate(text: &str) -> Option<Vec<Value>> {
    let start = text.find('[')?;
    let tail = &text[start..];
    let end = balanced_array_end(tail)?;
    let v: Value = serde_json::from_str(&tail[..=end]).ok()?;
    let items = v.as_array()?.clone();
    if !items.is_empty() && items.iter().all(looks_like_tool_call) {
        Some(items)
    } else {
        None
    }
}

fn balanced_array_end(text: &str) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut i = 0;
    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            match b {
                b'\\' => i += 1,
                b'"' => in_string = false,
                _ => {}
            }
        } else {
            match b {
                b'"' => in_string = true,
                b'[' => depth += 1,
                b']' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }
    None
}

fn looks_like_tool_call(v: &Value) -> bool {
    v["function"]["name"].is_string() || (v["name"].is_string() && !v["arguments"].is_null())
        || (v["name"].is_string() && !v["args"].is_null())
}

/// Extract `(name, arguments)` from either wire shape.
fn call_parts(v: &Value) -> Option<(String, Value)> {
    if let Some(name) = v["function"]["name"].as_str() {
        return Some((name.to_string(), v["function"]["arguments"].clone()));
    }
    let name = v["name"].as_str()?;
    let args = if !v["arguments"].is_null() {
        v["arguments"].clone()
    } else {
        v["args"].clone()
    };
    Some((name.to_string(), args))
}

/// Parse a tool-call argument payload.
///
/// Objects pass through.  Strings go through strict parse, a repaired
/// retry, then balanced-object extraction; an unparseable string is kept
/// verbatim so the guard can reject it as `invalid_tool_args`.
fn parse_call_arguments(raw: Value) -> Value {
    match raw {
        Value::Object(_) => raw,
        Value::Null => Value::Object(Map::new()),
        Value::String(s) => {
            if s.trim().is_empty() {
                return Value::Object(Map::new());
            }
            if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(&s) {
                return v;
            }
            let repaired = repair_planner_json(&s);
            if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(&repaired) {
                return v;
            }
            if let Some(block) = extract_first_object(&repaired) {
                if let Ok(v @ Value::Object(_)) = serde_json::from_str::<Value>(block) {
                    return v;
                }
            }
            Value::String(s)
        }
        other => other,
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

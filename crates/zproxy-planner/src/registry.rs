// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Per-request index of the tools declared by the client.
//!
//! Clients name the same tool many ways (`read`, `read_file`, `readFile`,
//! `open_file`…) and models invent more.  The registry normalizes every
//! declared name, expands a table of canonical aliases, and maps caller
//! argument keys onto the declared parameter set so the rest of the
//! pipeline works with one spelling per tool.

use std::collections::HashMap;

use serde_json::{json, Map, Value};
use sha2::{Digest, Sha256};
use tracing::debug;

/// Canonical alias groups: declaring any member registers all of them.
const ALIAS_GROUPS: &[&[&str]] = &[
    &["read", "read_file", "readfile", "open_file"],
    &["write", "write_file", "writefile", "save_file", "create_file"],
    &["list", "list_dir", "listdir"],
    &["run", "run_shell", "shell", "bash"],
];

/// Caller argument keys mapped onto a declared key.  Groups are symmetric:
/// a caller `filePath` satisfies a declared `path` and vice versa.
const ARG_SYNONYM_GROUPS: &[&[&str]] = &[
    &["path", "filepath", "file_path", "filename", "file"],
    &["command", "cmd"],
];

/// Metadata keys models attach to shell calls that are not part of any
/// declared schema and would otherwise trip the unexpected-argument guard.
const SHELL_METADATA_KEYS: &[&str] = &[
    "description",
    "workdir",
    "cwd",
    "directory",
    "timeout",
    "shell",
    "tty",
    "login",
    "background",
    "env",
];

/// One declared tool plus its parameter names.
#[derive(Debug, Clone)]
pub struct ToolInfo {
    /// The name the client declared (first of the recognized name fields).
    pub name: String,
    /// Full declared tool JSON, forwarded verbatim in responses.
    pub tool: Value,
    /// Declared parameter names from `function.parameters.properties`.
    pub arg_keys: Vec<String>,
}

/// Normalize a tool name for lookup: lowercase, `_` and `-` removed.
pub fn normalize_name(name: &str) -> String {
    name.chars()
        .filter(|c| *c != '_' && *c != '-')
        .flat_map(char::to_lowercase)
        .collect()
}

#[derive(Debug, Default)]
pub struct ToolRegistry {
    infos: Vec<ToolInfo>,
    /// Normalized name → index into `infos`.  First registration wins.
    by_name: HashMap<String, usize>,
    /// Registration-ordered normalized names for deterministic prefix scans.
    ordered_names: Vec<String>,
}

impl ToolRegistry {
    /// Build a registry from the client's declared tool list.
    pub fn build(tools: &[Value]) -> Self {
        let mut reg = Self::default();
        for tool in tools {
            reg.register(tool);
        }
        reg.expand_aliases();
        reg
    }

    fn register(&mut self, tool: &Value) {
        let names = declared_names(tool);
        if names.is_empty() {
            return;
        }
        let info = ToolInfo {
            name: names[0].clone(),
            tool: tool.clone(),
            arg_keys: declared_arg_keys(tool),
        };
        let idx = self.infos.len();
        self.infos.push(info);
        for name in names {
            self.register_name(&name, idx);
        }
    }

    fn register_name(&mut self, name: &str, idx: usize) {
        let norm = normalize_name(name);
        if norm.is_empty() {
            return;
        }
        match self.by_name.entry(norm.clone()) {
            std::collections::hash_map::Entry::Vacant(e) => {
                e.insert(idx);
                self.ordered_names.push(norm);
            }
            std::collections::hash_map::Entry::Occupied(e) => {
                if *e.get() != idx {
                    debug!(name = %name, "tool name collision; first registration wins");
                }
            }
        }
    }

    /// After the first pass, make every member of an alias group resolve as
    /// soon as any member was declared.
    fn expand_aliases(&mut self) {
        for group in ALIAS_GROUPS {
            let existing = group
                .iter()
                .find_map(|alias| self.by_name.get(&normalize_name(alias)).copied());
            let Some(idx) = existing else { continue };
            for alias in *group {
                let norm = normalize_name(alias);
                if !self.by_name.contains_key(&norm) {
                    self.by_name.insert(norm.clone(), idx);
                    self.ordered_names.push(norm);
                }
            }
        }
    }

    /// Inject the default `question` confirmation tool unless the client
    /// already ships one.
    pub fn ensure_question_tool(&mut self) {
        if self.lookup("question").is_some() {
            return;
        }
        let tool = default_question_tool();
        self.register(&tool);
    }

    /// Resolve a (possibly misspelled) tool name.
    ///
    /// Exact normalized match wins; otherwise the registration-ordered scan
    /// accepts a candidate that starts with the query or equals the query
    /// plus a `file` / `dir` suffix.
    pub fn lookup(&self, name: &str) -> Option<&ToolInfo> {
        let target = normalize_name(name);
        if target.is_empty() {
            return None;
        }
        if let Some(idx) = self.by_name.get(&target) {
            return self.infos.get(*idx);
        }
        let with_file = format!("{target}file");
        let with_dir = format!("{target}dir");
        for cand in &self.ordered_names {
            if cand.starts_with(&target) || *cand == with_file || *cand == with_dir {
                return self.infos.get(self.by_name[cand]);
            }
        }
        None
    }

    pub fn is_empty(&self) -> bool {
        self.infos.is_empty()
    }

    /// Declared tools in registration order.
    pub fn infos(&self) -> &[ToolInfo] {
        &self.infos
    }

    /// Map caller argument keys onto the declared parameter set and apply
    /// per-tool coercions.  Non-object `args` pass through untouched so the
    /// guard can reject them with the malformed original in hand.
    pub fn normalize_args_for_tool(&self, info: &ToolInfo, args: Value) -> Value {
        if info.arg_keys.is_empty() {
            return args;
        }
        let input = match args {
            Value::Object(o) => o,
            other => return other,
        };

        let shell = is_shell_tool(&info.name);
        let mut out = Map::new();
        for (key, value) in input {
            if let Some(declared) = resolve_arg_key(&key, &info.arg_keys) {
                out.insert(declared, value);
            } else if shell && SHELL_METADATA_KEYS.contains(&key.as_str()) {
                // Model-invented metadata; harmless, drop it.
                continue;
            } else {
                out.insert(key, value);
            }
        }

        if shell {
            synthesize_shell_description(&mut out, &info.arg_keys);
        }
        if normalize_name(&info.name) == "webfetch" {
            coerce_webfetch_format(&mut out);
        }
        if normalize_name(&info.name) == "todowrite" {
            materialize_todos(&mut out);
        }
        Value::Object(out)
    }
}

/// All recognized name fields on a declared tool, in preference order.
fn declared_names(tool: &Value) -> Vec<String> {
    let mut names = Vec::new();
    for candidate in [
        &tool["function"]["name"],
        &tool["function"]["tool"]["name"],
        &tool["name"],
    ] {
        if let Some(s) = candidate.as_str() {
            if !s.is_empty() && !names.iter().any(|n| n == s) {
                names.push(s.to_string());
            }
        }
    }
    names
}

fn declared_arg_keys(tool: &Value) -> Vec<String> {
    tool["function"]["parameters"]["properties"]
        .as_object()
        .map(|props| props.keys().cloned().collect())
        .unwrap_or_default()
}

fn is_shell_tool(name: &str) -> bool {
    matches!(
        normalize_name(name).as_str(),
        "run" | "runshell" | "shell" | "bash"
    )
}

/// Match a caller key against the declared keys directly, then through the
/// synonym groups.
fn resolve_arg_key(key: &str, declared: &[String]) -> Option<String> {
    let norm = normalize_name(key);
    if let Some(d) = declared.iter().find(|d| normalize_name(d) == norm) {
        return Some(d.clone());
    }
    let group = ARG_SYNONYM_GROUPS
        .iter()
        .find(|g| g.contains(&norm.as_str()))?;
    declared
        .iter()
        .find(|d| group.contains(&normalize_name(d).as_str()))
        .cloned()
}

fn synthesize_shell_description(args: &mut Map<String, Value>, declared: &[String]) {
    let declares_description = declared.iter().any(|k| normalize_name(k) == "description");
    if !declares_description || args.contains_key("description") {
        return;
    }
    let command = args
        .get("command")
        .and_then(Value::as_str)
        .unwrap_or("")
        .to_string();
    args.insert(
        "description".into(),
        json!(format!("run shell command: {command}")),
    );
}

fn coerce_webfetch_format(args: &mut Map<String, Value>) {
    let format = args
        .get("format")
        .and_then(Value::as_str)
        .map(str::to_ascii_lowercase);
    let coerced = match format.as_deref() {
        Some("text") | Some("markdown") | Some("html") => format.unwrap(),
        _ => "text".to_string(),
    };
    args.insert("format".into(), json!(coerced));
}

/// Fill each todo with the id/title/text/content/status/priority slots the
/// client UI expects; a bare string becomes a full todo object.
fn materialize_todos(args: &mut Map<String, Value>) {
    let Some(Value::Array(todos)) = args.get("todos").cloned() else {
        return;
    };
    let materialized: Vec<Value> = todos
        .into_iter()
        .map(|t| {
            let mut obj = match t {
                Value::Object(o) => o,
                Value::String(s) => {
                    let mut o = Map::new();
                    o.insert("content".into(), json!(s));
                    o
                }
                other => {
                    let mut o = Map::new();
                    o.insert("content".into(), json!(other.to_string()));
                    o
                }
            };
            let content = obj
                .get("content")
                .or_else(|| obj.get("title"))
                .or_else(|| obj.get("text"))
                .and_then(Value::as_str)
                .unwrap_or("")
                .to_string();
            obj.entry("content".to_string()).or_insert(json!(content));
            obj.entry("title".to_string()).or_insert(json!(content));
            obj.entry("text".to_string()).or_insert(json!(content));
            obj.entry("status".to_string()).or_insert(json!("todo"));
            obj.entry("priority".to_string()).or_insert(json!("medium"));
            obj.entry("id".to_string()).or_insert(json!(todo_id(&content)));
            Value::Object(obj)
        })
        .collect();
    args.insert("todos".into(), Value::Array(materialized));
}

/// Stable short id derived from the todo content.
fn todo_id(content: &str) -> String {
    let digest = Sha256::digest(content.as_bytes());
    hex::encode(&digest[..4])
}

fn default_question_tool() -> Value {
    json!({
        "type": "function",
        "function": {
            "name": "question",
            "description": "Ask the user one or more questions and wait for their reply before continuing.",
            "parameters": {
                "type": "object",
                "properties": {
                    "questions": {
                        "type": "array",
                        "items": { "type": "string" },
                        "description": "Questions to put to the user."
                    },
                    "question": {
                        "type": "string",
                        "description": "A single question to put to the user."
                    }
                }
            }
        }
    })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

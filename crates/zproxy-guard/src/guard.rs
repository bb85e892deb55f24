// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The guard proper: ordered validation of a tool-call batch.

use std::collections::HashSet;
use std::path::PathBuf;

use serde_json::{Map, Value};
use tracing::{debug, warn};

use zproxy_config::{ProxyConfig, WorkspaceConfig};
use zproxy_planner::jsonfix::parse_lenient;
use zproxy_planner::{normalize_name, ParsedCall, ToolRegistry};

use crate::command::{classify_command, is_search_command, CommandClass};
use crate::error::GuardReason;
use crate::paths::{check_glob, check_path, resolve_workdir};

/// Hard ceiling on `content` for write-family tools.
pub const MAX_WRITE_CHARS: usize = 200_000;

/// Where a batch came from; mutation policy depends on it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallSource {
    /// Parsed from planner JSON — the trusted path.
    Planner,
    /// Raw OpenAI-style tool-call array in the model's prose.
    Raw,
    /// A `% tool` directive typed by the user.
    Explicit,
    /// Inferred from free-form user text.
    Heuristic,
}

/// Result of validating a batch.
#[derive(Debug, Clone, PartialEq)]
pub enum GuardOutcome {
    /// Batch accepted; paths and workdirs may have been rewritten.
    Ok(Vec<ParsedCall>),
    /// Batch refused outright.
    Blocked(GuardReason),
    /// Batch parked: the user must answer `question` affirmatively and the
    /// stored `calls` replay verbatim.
    ConfirmationRequired {
        reason: GuardReason,
        question: String,
        calls: Vec<ParsedCall>,
    },
}

/// Is this tool capable of changing state (files, processes, paths)?
pub fn is_mutation_tool(name: &str) -> bool {
    let n = normalize_name(name);
    n.starts_with("write")
        || n.starts_with("save")
        || n.starts_with("create")
        || n.starts_with("edit")
        || n.starts_with("applypatch")
        || n == "patch"
        || n.starts_with("run")
        || n == "shell"
        || n == "bash"
        || n.starts_with("delete")
        || n.starts_with("remove")
        || n == "mkdir"
        || n == "move"
        || n == "mv"
}

fn is_shell_tool(norm: &str) -> bool {
    norm == "shell" || norm == "bash" || norm.starts_with("run")
}

fn is_write_tool(norm: &str) -> bool {
    norm.starts_with("write") || norm.starts_with("save") || norm.starts_with("createfile")
}

fn is_delete_tool(norm: &str) -> bool {
    norm.starts_with("delete") || norm.starts_with("remove") || norm == "move" || norm == "mv"
}

/// Tools whose arguments name a filesystem path.
fn is_path_tool(norm: &str) -> bool {
    norm.starts_with("read")
        || norm.starts_with("open")
        || is_write_tool(norm)
        || norm.starts_with("edit")
        || norm.starts_with("applypatch")
        || norm == "patch"
        || norm.starts_with("list")
        || is_delete_tool(norm)
}

/// Path tools that cannot operate without a path argument.
fn path_is_required(norm: &str) -> bool {
    is_path_tool(norm) && !norm.starts_with("list")
}

const PATH_KEYS: &[&str] = &["path", "filePath", "file_path", "file", "filename"];
const GLOB_KEYS: &[&str] = &["pattern", "glob"];
const WORKDIR_KEYS: &[&str] = &["workdir", "cwd"];

#[derive(Debug)]
pub struct Guard {
    policy: ProxyConfig,
    roots: Vec<PathBuf>,
}

impl Guard {
    pub fn new(policy: &ProxyConfig, workspace: &WorkspaceConfig) -> Self {
        // Canonicalize roots where possible so absolute-path prefix checks
        // agree with what the client sends; fall back to the declared form
        // for roots that do not exist (tests, dry runs).
        let roots = workspace
            .roots
            .iter()
            .map(|r| std::fs::canonicalize(r).unwrap_or_else(|_| r.clone()))
            .collect();
        Self {
            policy: policy.clone(),
            roots,
        }
    }

    /// Validate a batch in guard order.  See the module docs for the
    /// outcome semantics.
    pub fn validate(
        &self,
        calls: &[ParsedCall],
        source: CallSource,
        registry: &ToolRegistry,
    ) -> GuardOutcome {
        if calls.is_empty() {
            return GuardOutcome::Ok(Vec::new());
        }

        // 1. Batch size.  Confirmation offers the truncated slice.
        if calls.len() > self.policy.max_actions_per_turn {
            let truncated: Vec<ParsedCall> =
                calls[..self.policy.max_actions_per_turn].to_vec();
            return self.confirm(GuardReason::TooManyActions(calls.len()), truncated);
        }

        // 2. Duplicate actions (same tool + args).
        let mut seen: HashSet<String> = HashSet::new();
        let mut deduped: Vec<ParsedCall> = Vec::new();
        for call in calls {
            let sig = format!("{}|{}", normalize_name(&call.tool), call.args);
            if seen.insert(sig) {
                deduped.push(call.clone());
            }
        }
        if deduped.len() != calls.len() {
            return self.confirm(GuardReason::DuplicateActions, deduped);
        }

        // 3. Per-call checks, accumulating rewrites.
        let mut rewritten: Vec<ParsedCall> = Vec::with_capacity(calls.len());
        for call in calls {
            match self.check_call(call, source, registry) {
                Ok(call) => rewritten.push(call),
                Err(reason) if reason.is_confirmable() => {
                    return self.confirm(reason, calls.to_vec());
                }
                Err(reason) => {
                    warn!(tool = %call.tool, %reason, "blocked tool call");
                    return GuardOutcome::Blocked(reason);
                }
            }
        }

        // 4. Mutation boundary: a batch containing a mutation collapses to
        // its first action.
        if rewritten.iter().any(|c| is_mutation_tool(&c.tool)) && rewritten.len() > 1 {
            debug!("mutation in batch; truncating to the first action");
            rewritten.truncate(1);
        }

        GuardOutcome::Ok(rewritten)
    }

    fn confirm(&self, reason: GuardReason, calls: Vec<ParsedCall>) -> GuardOutcome {
        let question = confirmation_question(&reason, &calls);
        GuardOutcome::ConfirmationRequired {
            reason,
            question,
            calls,
        }
    }

    fn check_call(
        &self,
        call: &ParsedCall,
        source: CallSource,
        registry: &ToolRegistry,
    ) -> Result<ParsedCall, GuardReason> {
        let norm = normalize_name(&call.tool);

        // Network tools.
        if (norm == "webfetch" || norm == "websearch") && !self.policy.allow_web_search {
            return Err(GuardReason::WebToolsDisabled);
        }

        // Argument shape: must end up an object.  A malformed string gets
        // one lenient re-parse before the batch is refused.
        let mut args: Map<String, Value> = match &call.args {
            Value::Object(o) => o.clone(),
            Value::Null => Map::new(),
            Value::String(s) => match parse_lenient(s) {
                Some(Value::Object(o)) => o,
                _ => return Err(GuardReason::InvalidToolArgs),
            },
            _ => return Err(GuardReason::InvalidToolArgs),
        };

        // Unknown argument keys (only when the tool declares a schema).
        if let Some(info) = registry.lookup(&call.tool) {
            if !info.arg_keys.is_empty() {
                let declared: HashSet<String> =
                    info.arg_keys.iter().map(|k| normalize_name(k)).collect();
                for key in args.keys() {
                    if !declared.contains(&normalize_name(key)) {
                        return Err(GuardReason::UnexpectedArg(key.clone()));
                    }
                }
            }
        }

        let shell = is_shell_tool(&norm);

        // Mutation source policy.  Shell tools are governed by the command
        // rules below instead, where pure search commands stay allowed.
        if !shell && is_mutation_tool(&call.tool) && !self.mutations_allowed_from(source) {
            return Err(GuardReason::MutationRequiresPlannerJson(call.tool.clone()));
        }

        // Glob safety.
        for key in GLOB_KEYS {
            if let Some(pattern) = args.get(*key).and_then(Value::as_str) {
                check_glob(pattern, &self.roots)?;
            }
        }

        // Path safety and canonical rewriting.
        if is_path_tool(&norm) {
            let present = PATH_KEYS
                .iter()
                .find(|k| args.get(**k).map_or(false, Value::is_string));
            match present {
                Some(key) => {
                    let raw = args[*key].as_str().unwrap_or("").to_string();
                    let canonical = check_path(&raw, &self.roots)?;
                    if canonical != raw {
                        debug!(tool = %call.tool, from = %raw, to = %canonical, "rewrote path");
                    }
                    args.insert((*key).to_string(), Value::String(canonical));
                }
                None if path_is_required(&norm) && !args.keys().any(|k| GLOB_KEYS.contains(&k.as_str())) => {
                    return Err(GuardReason::MissingPath);
                }
                None => {}
            }
        }

        // Write bounds.
        if is_write_tool(&norm) {
            match args.get("content") {
                Some(Value::String(content)) if content.is_empty() => {
                    return Err(GuardReason::MissingContent)
                }
                Some(Value::String(content)) if content.chars().count() > MAX_WRITE_CHARS => {
                    return Err(GuardReason::ContentTooLarge)
                }
                Some(Value::String(_)) => {}
                Some(_) => return Err(GuardReason::InvalidContentType),
                None => return Err(GuardReason::MissingContent),
            }
        }

        // Shell-specific rules.
        if shell {
            for key in WORKDIR_KEYS {
                if let Some(dir) = args.get(*key).and_then(Value::as_str) {
                    match resolve_workdir(dir, &self.roots) {
                        Some(abs) => {
                            args.insert((*key).to_string(), Value::String(abs));
                        }
                        None => {
                            // Silently dropped; the tool runs in its default cwd.
                            args.remove(*key);
                        }
                    }
                }
            }

            let command = args
                .get("command")
                .and_then(Value::as_str)
                .map(str::trim)
                .unwrap_or("")
                .to_string();
            if command.is_empty() {
                return Err(GuardReason::MissingCommand);
            }

            // Non-planner sources may only run search commands unless the
            // matching mutation override is set.
            if source != CallSource::Planner
                && !is_search_command(&command)
                && !self.mutations_allowed_from(source)
            {
                return Err(GuardReason::CommandBlocked(command));
            }

            match classify_command(&command) {
                CommandClass::Dangerous(fragment) => {
                    return Err(GuardReason::DangerousCommand(fragment));
                }
                CommandClass::Network if !self.policy.allow_network => {
                    return Err(GuardReason::NetworkDisabled);
                }
                CommandClass::Network => {}
                CommandClass::NotAllowlisted(token) if !self.policy.allow_any_command => {
                    return Err(GuardReason::CommandBlocked(token));
                }
                CommandClass::NotAllowlisted(_) | CommandClass::Allowed => {}
            }
        }

        // Delete family always confirms while dangerous-command
        // confirmation is on.
        if is_delete_tool(&norm) && self.policy.confirm_dangerous_commands {
            return Err(GuardReason::DeleteConfirm);
        }

        Ok(ParsedCall {
            tool: call.tool.clone(),
            args: Value::Object(args),
        })
    }

    fn mutations_allowed_from(&self, source: CallSource) -> bool {
        match source {
            CallSource::Planner => true,
            CallSource::Explicit => self.policy.allow_explicit_mutations,
            CallSource::Raw => self.policy.allow_raw_mutations,
            CallSource::Heuristic => false,
        }
    }
}

/// The question text shown to the user for a parked batch.
fn confirmation_question(reason: &GuardReason, calls: &[ParsedCall]) -> String {
    let summary: Vec<String> = calls
        .iter()
        .map(|c| {
            let detail = c.args["command"]
                .as_str()
                .or_else(|| c.args["path"].as_str())
                .or_else(|| c.args["filePath"].as_str())
                .unwrap_or("");
            if detail.is_empty() {
                c.tool.clone()
            } else {
                format!("{} ({detail})", c.tool)
            }
        })
        .collect();
    format!(
        "The following action was held for safety review ({reason}): {}. Proceed?",
        summary.join(", ")
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Construction of the planner system prompt.
//!
//! The upstream model has no native tool-call protocol, so the proxy
//! teaches it one: a single JSON object per reply, with the declared tools
//! enumerated and two worked examples.  The prompt is rebuilt per request
//! because the tool set is per-request.

use serde_json::Value;

use crate::registry::ToolRegistry;

/// Options shaping the generated system prompt.
#[derive(Debug, Clone, Default)]
pub struct PromptOptions<'a> {
    /// Include each tool's JSON parameter schema (truncated).
    pub include_schema: bool,
    pub schema_max_chars: usize,
    /// Runtime context appended near the end (workspace cwd, path policy).
    pub extra_system: Option<&'a str>,
    pub extra_system_max_chars: usize,
    /// Absolute workspace directory reported to the model.
    pub workspace_cwd: Option<&'a str>,
}

const PREAMBLE: &str = "\
You are a tool-planning assistant behind an OpenAI-compatible proxy. \
On every turn you respond with EXACTLY ONE JSON object and nothing else:

{
  \"plan\": [\"short step descriptions\"],
  \"actions\": [{\"tool\": \"<name>\", \"args\": {…}, \"why\": \"…\", \"expect\": \"…\", \"safety\": {\"risk\": \"low|medium|high\", \"notes\": \"…\"}}],
  \"final\": \"present ONLY when actions is empty — the answer for the user\",
  \"thought\": \"optional brief reasoning\"
}";

const RULES: &str = "\
Rules:
- Output exactly one JSON object. No prose, no code fences, no commentary.
- \"args\" must be a valid JSON object matching the tool's declared parameters.
- Do not include chain-of-thought in the response; use \"thought\" sparingly.
- File-writing, patching, and shell tools MUST be requested through this JSON schema.
- At most one mutating action (write/edit/patch/shell/delete) per response.
- \"final\" is present exactly when \"actions\" is empty.";

const EXAMPLE_TOOL: &str = "\
Example (tool use):
{\"plan\": [\"inspect the build manifest\"], \"actions\": [{\"tool\": \"read\", \"args\": {\"path\": \"Cargo.toml\"}, \"why\": \"need the dependency list\", \"expect\": \"file contents\", \"safety\": {\"risk\": \"low\", \"notes\": \"\"}}]}";

const EXAMPLE_ANSWER: &str = "\
Example (direct answer):
{\"plan\": [\"answer directly\"], \"actions\": [], \"final\": \"The build uses edition 2021.\"}";

/// Build the planner system message for the given tool set.
pub fn build_system_prompt(registry: &ToolRegistry, opts: &PromptOptions) -> String {
    let mut prompt = String::with_capacity(2048);
    prompt.push_str(PREAMBLE);
    prompt.push_str("\n\nAllowed tools:\n");

    for info in registry.infos() {
        let description = info.tool["function"]["description"]
            .as_str()
            .or_else(|| info.tool["description"].as_str())
            .unwrap_or("");
        let args = if info.arg_keys.is_empty() {
            "(no args)".to_string()
        } else {
            format!("args: {}", info.arg_keys.join(", "))
        };
        prompt.push_str(&format!("- {} — {} [{}]\n", info.name, description, args));
        if opts.include_schema {
            if let Some(schema) = schema_snippet(&info.tool, opts.schema_max_chars) {
                prompt.push_str("  schema: ");
                prompt.push_str(&schema);
                prompt.push('\n');
            }
        }
    }

    if let Some(cwd) = opts.workspace_cwd {
        prompt.push_str(&format!(
            "\nWorkspace directory: {cwd}\n\
             All file paths must stay inside the workspace; use relative paths.\n"
        ));
    }
    if let Some(extra) = opts.extra_system.filter(|s| !s.trim().is_empty()) {
        prompt.push('\n');
        prompt.push_str(&truncate_chars(extra, opts.extra_system_max_chars));
        prompt.push('\n');
    }

    prompt.push('\n');
    prompt.push_str(RULES);
    prompt.push_str("\n\n");
    prompt.push_str(EXAMPLE_TOOL);
    prompt.push_str("\n\n");
    prompt.push_str(EXAMPLE_ANSWER);
    prompt
}

/// Corrective follow-up injected on a planner retry; stricter each attempt.
pub fn retry_system_prompt(attempt: usize) -> String {
    match attempt {
        0 | 1 => "Your previous reply was not a single valid planner JSON object. \
                  Respond again with exactly one JSON object in the documented schema."
            .to_string(),
        _ => "FINAL ATTEMPT: reply with ONLY the JSON object — no text before or after, \
              no code fences. An empty \"actions\" list requires a \"final\" string."
            .to_string(),
    }
}

/// Reminder appended when the request carries fresh tool results.
pub const POST_TOOL_SYSTEM: &str = "\
The previous tool calls have completed and their results are in the \
conversation. Continue the task: reply with the next planner JSON object, \
either further actions or an empty actions list with a \"final\" answer.";

fn schema_snippet(tool: &Value, max_chars: usize) -> Option<String> {
    let params = tool["function"]["parameters"].as_object()?;
    let text = serde_json::to_string(params).ok()?;
    Some(truncate_chars(&text, max_chars))
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    if max_chars == 0 || text.chars().count() <= max_chars {
        return text.to_string();
    }
    let cut: String = text.chars().take(max_chars).collect();
    format!("{cut}…")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

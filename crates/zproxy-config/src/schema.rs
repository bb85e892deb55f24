// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Serde default helper — returns `true`.
///
/// `#[serde(default)]` on a `bool` always falls back to `false`, so fields
/// that should be enabled unless explicitly disabled need a named function.
fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub proxy: ProxyConfig,
    #[serde(default)]
    pub context: ContextConfig,
    #[serde(default)]
    pub workspace: WorkspaceConfig,
}

fn default_host() -> String {
    "127.0.0.1".into()
}
fn default_port() -> u16 {
    8976
}

/// HTTP bind address for the proxy itself.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_base_url() -> String {
    "https://chat.z.ai".into()
}
fn default_model() -> String {
    "glm-4.7".into()
}
fn default_fe_version() -> String {
    // Mirrors the web frontend build the upstream currently serves; sent as
    // X-FE-Version on every completion request.
    "prod-fe-1.0.70".into()
}

/// Where and how to reach the upstream chat service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    /// API origin without a trailing slash, e.g. `https://chat.z.ai`.
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Bearer token.  Resolved from `GLM_TOKEN` or the saved config file;
    /// `None` means unauthenticated (every upstream call will fail).
    #[serde(default)]
    pub token: Option<String>,
    /// Model id forwarded to the upstream and reported by `/v1/models`.
    #[serde(default = "default_model")]
    pub model: String,
    #[serde(default = "default_fe_version")]
    pub fe_version: String,
}

impl Default for UpstreamConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            token: None,
            model: default_model(),
            fe_version: default_fe_version(),
        }
    }
}

fn default_max_actions() -> usize {
    3
}
fn default_tool_loop_limit() -> usize {
    25
}
fn default_planner_retries() -> usize {
    2
}

/// Proxy behaviour and guard policy.
///
/// Every field maps 1:1 to a `PROXY_*` environment variable; see
/// `from_env` for the parsing rules.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    /// Create a fresh upstream chat for every request instead of reusing
    /// the cached one.
    #[serde(default)]
    pub new_chat_per_request: bool,
    /// Send only the delta versus the history the upstream already holds.
    #[serde(default)]
    pub use_upstream_history: bool,
    /// Cap on the mirrored client conversation (0 = unbounded).
    #[serde(default)]
    pub history_max_messages: usize,
    /// Inject the system text even on requests that offer no tools.
    #[serde(default)]
    pub always_send_system: bool,
    /// Reset the upstream chat whenever compaction dropped older turns.
    #[serde(default)]
    pub compact_reset: bool,
    /// On user-only turns, send only the system + last-user pair.
    #[serde(default)]
    pub strip_history: bool,
    /// Enable upstream thinking unless a `/thinking off` directive overrides.
    #[serde(default = "default_true")]
    pub default_thinking: bool,

    // ── Guard policy ─────────────────────────────────────────────────────────
    #[serde(default)]
    pub allow_web_search: bool,
    #[serde(default)]
    pub allow_network: bool,
    /// Allow shell commands whose first token is not on the allowlist.
    #[serde(default)]
    pub allow_any_command: bool,
    /// Permit mutation tools originating from explicit `%tool` directives.
    #[serde(default)]
    pub allow_explicit_mutations: bool,
    /// Permit mutation tools originating from raw tool-call arrays.
    #[serde(default)]
    pub allow_raw_mutations: bool,
    /// Dangerous shell commands ask for confirmation instead of blocking.
    #[serde(default = "default_true")]
    pub confirm_dangerous_commands: bool,
    /// Infer read/list/search tool calls from free-form user text.
    #[serde(default = "default_true")]
    pub allow_user_heuristics: bool,

    // ── Planner loop ─────────────────────────────────────────────────────────
    #[serde(default = "default_max_actions")]
    pub max_actions_per_turn: usize,
    /// Maximum tool-result→completion round-trips before the model is forced
    /// to produce a final answer.
    #[serde(default = "default_tool_loop_limit")]
    pub tool_loop_limit: usize,
    #[serde(default = "default_planner_retries")]
    pub planner_max_retries: usize,
    /// Wrap non-JSON prose replies as an answer-only plan instead of failing.
    #[serde(default = "default_true")]
    pub planner_coerce: bool,

    // ── Observability ────────────────────────────────────────────────────────
    #[serde(default)]
    pub include_usage: bool,
    #[serde(default)]
    pub debug: bool,
    /// When set, debug events are written as one JSON file per event here.
    #[serde(default)]
    pub debug_dump_dir: Option<PathBuf>,
    /// Enables the `/system` and `/test …` request directives.
    #[serde(default)]
    pub test_mode: bool,

    // ── Prompt shaping ───────────────────────────────────────────────────────
    #[serde(default)]
    pub tool_prompt_include_schema: bool,
    #[serde(default = "default_schema_max_chars")]
    pub tool_prompt_schema_max_chars: usize,
    #[serde(default = "default_extra_system_max_chars")]
    pub tool_prompt_extra_system_max_chars: usize,
}

fn default_schema_max_chars() -> usize {
    4000
}
fn default_extra_system_max_chars() -> usize {
    2000
}

impl Default for ProxyConfig {
    fn default() -> Self {
        Self {
            new_chat_per_request: false,
            use_upstream_history: false,
            history_max_messages: 0,
            always_send_system: false,
            compact_reset: false,
            strip_history: false,
            default_thinking: true,
            allow_web_search: false,
            allow_network: false,
            allow_any_command: false,
            allow_explicit_mutations: false,
            allow_raw_mutations: false,
            confirm_dangerous_commands: true,
            allow_user_heuristics: true,
            max_actions_per_turn: default_max_actions(),
            tool_loop_limit: default_tool_loop_limit(),
            planner_max_retries: default_planner_retries(),
            planner_coerce: true,
            include_usage: false,
            debug: false,
            debug_dump_dir: None,
            test_mode: false,
            tool_prompt_include_schema: false,
            tool_prompt_schema_max_chars: default_schema_max_chars(),
            tool_prompt_extra_system_max_chars: default_extra_system_max_chars(),
        }
    }
}

fn default_max_tokens() -> usize {
    128_000
}
fn default_reserve_tokens() -> usize {
    8_000
}
fn default_safety_margin() -> usize {
    2_000
}
fn default_recent_messages() -> usize {
    12
}
fn default_min_recent_messages() -> usize {
    4
}
fn default_summary_max_chars() -> usize {
    4_000
}
fn default_tool_max_lines() -> usize {
    400
}
fn default_tool_max_chars() -> usize {
    24_000
}

/// Token-budget tuning for the context compactor.
///
/// Budget = `max_tokens - reserve_tokens`; compaction triggers when the
/// estimate exceeds `budget - safety_margin`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContextConfig {
    #[serde(default = "default_max_tokens")]
    pub max_tokens: usize,
    #[serde(default = "default_reserve_tokens")]
    pub reserve_tokens: usize,
    #[serde(default = "default_safety_margin")]
    pub safety_margin: usize,
    /// Recent non-system messages kept verbatim when compacting.
    #[serde(default = "default_recent_messages")]
    pub recent_messages: usize,
    /// Hard floor for the retained tail; shaving never goes below this.
    #[serde(default = "default_min_recent_messages")]
    pub min_recent_messages: usize,
    #[serde(default = "default_summary_max_chars")]
    pub summary_max_chars: usize,
    /// Per-tool-result line cap (head 60% / tail 40% around a notice).
    #[serde(default = "default_tool_max_lines")]
    pub tool_max_lines: usize,
    #[serde(default = "default_tool_max_chars")]
    pub tool_max_chars: usize,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            max_tokens: default_max_tokens(),
            reserve_tokens: default_reserve_tokens(),
            safety_margin: default_safety_margin(),
            recent_messages: default_recent_messages(),
            min_recent_messages: default_min_recent_messages(),
            summary_max_chars: default_summary_max_chars(),
            tool_max_lines: default_tool_max_lines(),
            tool_max_chars: default_tool_max_chars(),
        }
    }
}

/// Filesystem roots the path guard accepts.  All file-tool paths must
/// resolve under one of these.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct WorkspaceConfig {
    #[serde(default)]
    pub roots: Vec<PathBuf>,
}

impl Config {
    /// Effective budget available to conversation content.
    pub fn context_budget(&self) -> usize {
        self.context
            .max_tokens
            .saturating_sub(self.context.reserve_tokens)
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_server_binds_loopback() {
        let c = Config::default();
        assert_eq!(c.server.host, "127.0.0.1");
        assert_eq!(c.server.port, 8976);
    }

    #[test]
    fn default_policy_is_restrictive() {
        let p = ProxyConfig::default();
        assert!(!p.allow_web_search);
        assert!(!p.allow_network);
        assert!(!p.allow_any_command);
        assert!(!p.allow_explicit_mutations);
        assert!(!p.allow_raw_mutations);
    }

    #[test]
    fn default_policy_confirms_and_infers() {
        let p = ProxyConfig::default();
        assert!(p.confirm_dangerous_commands);
        assert!(p.allow_user_heuristics);
        assert!(p.planner_coerce);
        assert!(p.default_thinking);
    }

    #[test]
    fn context_budget_subtracts_reserve() {
        let c = Config::default();
        assert_eq!(c.context_budget(), 120_000);
    }

    #[test]
    fn context_budget_saturates_at_zero() {
        let mut c = Config::default();
        c.context.max_tokens = 100;
        c.context.reserve_tokens = 500;
        assert_eq!(c.context_budget(), 0);
    }

    #[test]
    fn config_round_trips_through_json() {
        let c = Config::default();
        let json = serde_json::to_string(&c).unwrap();
        let back: Config = serde_json::from_str(&json).unwrap();
        assert_eq!(back.upstream.model, c.upstream.model);
        assert_eq!(back.proxy.max_actions_per_turn, c.proxy.max_actions_per_turn);
    }

    #[test]
    fn empty_json_yields_defaults() {
        let c: Config = serde_json::from_str("{}").unwrap();
        assert_eq!(c.upstream.base_url, "https://chat.z.ai");
        assert_eq!(c.proxy.tool_loop_limit, 25);
    }
}

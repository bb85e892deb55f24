// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Environment-variable resolution for [`Config`].
//!
//! The proxy is configured entirely through the environment (container /
//! systemd friendly); the only persistent state is the saved token file
//! handled by `token_store`.  Boolean variables accept `1`, `true`, `yes`,
//! and `on` (case-insensitive); anything else — including empty — is false.

use std::path::PathBuf;

use tracing::debug;

use crate::schema::{Config, ContextConfig, ProxyConfig, ServerConfig, UpstreamConfig, WorkspaceConfig};
use crate::token_store;

fn env_str(name: &str) -> Option<String> {
    std::env::var(name).ok().filter(|v| !v.trim().is_empty())
}

fn env_bool(name: &str, default: bool) -> bool {
    match env_str(name) {
        Some(v) => matches!(
            v.trim().to_ascii_lowercase().as_str(),
            "1" | "true" | "yes" | "on"
        ),
        None => default,
    }
}

fn env_usize(name: &str, default: usize) -> usize {
    env_str(name)
        .and_then(|v| v.trim().parse().ok())
        .unwrap_or(default)
}

/// Build the full configuration from the process environment.
///
/// Unset variables fall back to the serde defaults in [`crate::schema`].
/// The bearer token resolves `GLM_TOKEN` first, then the saved config file.
pub fn from_env() -> Config {
    let defaults = Config::default();

    let server = ServerConfig {
        host: env_str("HOST").unwrap_or(defaults.server.host),
        port: env_str("PORT")
            .and_then(|v| v.trim().parse().ok())
            .unwrap_or(defaults.server.port),
    };

    let token = env_str("GLM_TOKEN").or_else(|| {
        let saved = token_store::load_saved_token();
        if saved.is_some() {
            debug!("using saved token from config file");
        }
        saved
    });

    let upstream = UpstreamConfig {
        base_url: env_str("GLM_BASE_URL")
            .map(|u| u.trim_end_matches('/').to_string())
            .unwrap_or(defaults.upstream.base_url),
        token,
        model: env_str("GLM_MODEL").unwrap_or(defaults.upstream.model),
        fe_version: env_str("GLM_FE_VERSION").unwrap_or(defaults.upstream.fe_version),
    };

    let d = defaults.proxy;
    let proxy = ProxyConfig {
        new_chat_per_request: env_bool("PROXY_NEW_CHAT_PER_REQUEST", d.new_chat_per_request),
        use_upstream_history: env_bool("PROXY_USE_GLM_HISTORY", d.use_upstream_history),
        history_max_messages: env_usize("PROXY_HISTORY_MAX_MESSAGES", d.history_max_messages),
        always_send_system: env_bool("PROXY_ALWAYS_SEND_SYSTEM", d.always_send_system),
        compact_reset: env_bool("PROXY_COMPACT_RESET", d.compact_reset),
        strip_history: env_bool("PROXY_STRIP_HISTORY", d.strip_history),
        default_thinking: env_bool("PROXY_DEFAULT_THINKING", d.default_thinking),
        allow_web_search: env_bool("PROXY_ALLOW_WEB_SEARCH", d.allow_web_search),
        allow_network: env_bool("PROXY_ALLOW_NETWORK", d.allow_network),
        allow_any_command: env_bool("PROXY_ALLOW_ANY_COMMAND", d.allow_any_command),
        allow_explicit_mutations: env_bool(
            "PROXY_ALLOW_EXPLICIT_MUTATIONS",
            d.allow_explicit_mutations,
        ),
        allow_raw_mutations: env_bool("PROXY_ALLOW_RAW_MUTATIONS", d.allow_raw_mutations),
        confirm_dangerous_commands: env_bool(
            "PROXY_CONFIRM_DANGEROUS_COMMANDS",
            d.confirm_dangerous_commands,
        ),
        allow_user_heuristics: env_bool("PROXY_ALLOW_USER_HEURISTICS", d.allow_user_heuristics),
        max_actions_per_turn: env_usize("PROXY_MAX_ACTIONS_PER_TURN", d.max_actions_per_turn)
            .max(1),
        tool_loop_limit: env_usize("PROXY_TOOL_LOOP_LIMIT", d.tool_loop_limit).max(1),
        planner_max_retries: env_usize("PROXY_PLANNER_MAX_RETRIES", d.planner_max_retries),
        planner_coerce: env_bool("PROXY_PLANNER_COERCE", d.planner_coerce),
        include_usage: env_bool("PROXY_INCLUDE_USAGE", d.include_usage),
        debug: env_bool("PROXY_DEBUG", d.debug),
        debug_dump_dir: env_str("PROXY_DEBUG_DUMP_DIR").map(PathBuf::from),
        test_mode: env_bool("PROXY_TEST_MODE", d.test_mode),
        tool_prompt_include_schema: env_bool(
            "PROXY_TOOL_PROMPT_INCLUDE_SCHEMA",
            d.tool_prompt_include_schema,
        ),
        tool_prompt_schema_max_chars: env_usize(
            "PROXY_TOOL_PROMPT_SCHEMA_MAX_CHARS",
            d.tool_prompt_schema_max_chars,
        ),
        tool_prompt_extra_system_max_chars: env_usize(
            "PROXY_TOOL_PROMPT_EXTRA_SYSTEM_MAX_CHARS",
            d.tool_prompt_extra_system_max_chars,
        ),
    };

    let dc = defaults.context;
    let context = ContextConfig {
        max_tokens: env_usize("CONTEXT_MAX_TOKENS", dc.max_tokens),
        reserve_tokens: env_usize("CONTEXT_RESERVE_TOKENS", dc.reserve_tokens),
        safety_margin: env_usize("CONTEXT_SAFETY_MARGIN", dc.safety_margin),
        recent_messages: env_usize("CONTEXT_RECENT_MESSAGES", dc.recent_messages),
        min_recent_messages: env_usize("CONTEXT_MIN_RECENT_MESSAGES", dc.min_recent_messages),
        summary_max_chars: env_usize("CONTEXT_SUMMARY_MAX_CHARS", dc.summary_max_chars),
        tool_max_lines: env_usize("CONTEXT_TOOL_MAX_LINES", dc.tool_max_lines),
        tool_max_chars: env_usize("CONTEXT_TOOL_MAX_CHARS", dc.tool_max_chars),
    };

    let workspace = WorkspaceConfig {
        roots: workspace_roots_from_env(),
    };

    Config {
        server,
        upstream,
        proxy,
        context,
        workspace,
    }
}

/// Parse `PROXY_WORKSPACE_ROOT` as a PATH-style list; fall back to the
/// current directory so file tools work out of the box.
fn workspace_roots_from_env() -> Vec<PathBuf> {
    let sep = if cfg!(windows) { ';' } else { ':' };
    match env_str("PROXY_WORKSPACE_ROOT") {
        Some(v) => v
            .split(sep)
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(PathBuf::from)
            .collect(),
        None => std::env::current_dir().map(|d| vec![d]).unwrap_or_default(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────
//
// Env-var tests mutate process state, so each test uses a variable name
// unique to itself rather than the real config names.

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use thiserror::Error;

/// Why the guard refused (or paused) a tool-call batch.
///
/// The `Display` form is the wire-level reason string quoted back to the
/// client in `"Blocked unsafe tool call (<reason>)."` messages, so the
/// spellings here are stable.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum GuardReason {
    // ── Non-confirmable: the call itself is malformed ────────────────────────
    #[error("unknown_tool: {0}")]
    UnknownTool(String),
    #[error("invalid_tool_args")]
    InvalidToolArgs,
    #[error("unexpected_arg: {0}")]
    UnexpectedArg(String),
    #[error("missing_path")]
    MissingPath,
    #[error("missing_content")]
    MissingContent,
    #[error("missing_command")]
    MissingCommand,
    #[error("invalid_content_type")]
    InvalidContentType,

    // ── Path guard ───────────────────────────────────────────────────────────
    #[error("path_outside_workspace: {0}")]
    PathOutsideWorkspace(String),
    #[error("sensitive_path: {0}")]
    SensitivePath(String),

    // ── Shell guard (confirmable) ────────────────────────────────────────────
    #[error("command_blocked: {0}")]
    CommandBlocked(String),
    #[error("network_disabled")]
    NetworkDisabled,
    #[error("dangerous_command: {0}")]
    DangerousCommand(String),
    #[error("delete_confirm")]
    DeleteConfirm,

    // ── Policy guard (confirmable) ───────────────────────────────────────────
    #[error("mutation_requires_planner_json: {0}")]
    MutationRequiresPlannerJson(String),
    #[error("web_tools_disabled")]
    WebToolsDisabled,
    #[error("too_many_actions: {0}")]
    TooManyActions(usize),
    #[error("content_too_large")]
    ContentTooLarge,
    #[error("duplicate_actions")]
    DuplicateActions,
}

impl GuardReason {
    /// Whether the user may override this refusal by answering a
    /// synthesized `question` tool call.  Malformed calls and path
    /// violations are never confirmable — there is nothing sensible to
    /// approve.
    pub fn is_confirmable(&self) -> bool {
        matches!(
            self,
            Self::CommandBlocked(_)
                | Self::NetworkDisabled
                | Self::DangerousCommand(_)
                | Self::DeleteConfirm
                | Self::MutationRequiresPlannerJson(_)
                | Self::WebToolsDisabled
                | Self::TooManyActions(_)
                | Self::ContentTooLarge
                | Self::DuplicateActions
        )
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

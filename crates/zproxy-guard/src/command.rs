// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Shell-command classification: dangerous patterns, network use, and the
//! first-token allowlist.

use std::sync::OnceLock;

use regex::Regex;

/// Commands whose first token is allowed without the any-command override.
const ALLOWED_FIRST_TOKENS: &[&str] = &[
    "ls", "cat", "head", "tail", "grep", "rg", "ripgrep", "find", "fd", "echo", "pwd", "wc",
    "sort", "uniq", "cut", "tr", "sed", "awk", "diff", "stat", "file", "tree", "which", "env",
    "date", "du", "df", "basename", "dirname", "realpath", "jq", "git", "cargo", "rustc",
    "rustfmt", "python", "python3", "node", "npm", "npx", "pnpm", "yarn", "make", "go", "tar",
    "unzip", "gzip", "gunzip", "xargs", "test", "true", "false",
];

/// Patterns that reach the network; blocked unless networking is enabled.
const NETWORK_TOKENS: &[&str] = &[
    "curl", "wget", "nc", "ncat", "netcat", "ssh", "scp", "sftp", "rsync", "ping", "telnet",
    "dig", "nslookup", "ftp",
];

fn dangerous_res() -> &'static Vec<Regex> {
    static RES: OnceLock<Vec<Regex>> = OnceLock::new();
    RES.get_or_init(|| {
        [
            // Recursive force deletion anywhere in the pipeline.
            r"\brm\s+(-[a-zA-Z]*[rf][a-zA-Z]*\s+)+",
            // Filesystem / device destruction.
            r"\bmkfs(\.\w+)?\b",
            r"\bdd\s+.*\bof=",
            r">\s*/dev/sd[a-z]",
            r"\bshred\b",
            // Remote code piped into a shell.
            r"\b(curl|wget)\b.*\|\s*(ba|z|da)?sh\b",
            // Fork bomb.
            r":\s*\(\s*\)\s*\{.*\|.*&.*\}",
            // Privilege and system control.
            r"\bsudo\b",
            r"\bsu\s+-",
            r"\b(shutdown|reboot|halt|poweroff)\b",
            r"\bkill\s+-9\s+1\b",
            // World-writable root.
            r"\bchmod\s+(-[a-zA-Z]+\s+)*777\s+/",
            r"\bchown\s+.*\s+/\s*$",
            // Git history destruction.
            r"\bgit\s+push\s+.*--force",
            r"\bgit\s+reset\s+--hard\b",
        ]
        .iter()
        .map(|p| Regex::new(p).unwrap())
        .collect()
    })
}

/// What the shell guard concluded about a command string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CommandClass {
    /// First token on the allowlist, nothing dangerous spotted.
    Allowed,
    /// Matches a destructive pattern; `0` is the matched fragment.
    Dangerous(String),
    /// Reaches the network.
    Network,
    /// First token not on the allowlist.
    NotAllowlisted(String),
}

/// Classify `command`.  Danger beats network beats allowlisting, so a
/// `sudo curl …` is reported as dangerous, not merely networked.
pub fn classify_command(command: &str) -> CommandClass {
    for re in dangerous_res() {
        if let Some(m) = re.find(command) {
            return CommandClass::Dangerous(m.as_str().trim().to_string());
        }
    }
    let tokens: Vec<&str> = command.split_whitespace().collect();
    if tokens
        .iter()
        .any(|t| NETWORK_TOKENS.contains(&t.trim_start_matches('\\')))
    {
        return CommandClass::Network;
    }
    let first = tokens.first().copied().unwrap_or("");
    if ALLOWED_FIRST_TOKENS.contains(&first) {
        CommandClass::Allowed
    } else {
        CommandClass::NotAllowlisted(first.to_string())
    }
}

/// `true` when the command's first token is one of the search binaries the
/// non-planner paths are restricted to.
pub fn is_search_command(command: &str) -> bool {
    matches!(
        command.split_whitespace().next(),
        Some("rg") | Some("ripgrep") | Some("grep")
    )
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

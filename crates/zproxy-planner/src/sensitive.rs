// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Sensitive-path classification shared by the heuristics (which must not
//! infer reads of credentials) and the path guard (which blocks them).

/// Path components that are always sensitive, matched exactly.
const EXACT_COMPONENTS: &[&str] = &[".ssh", ".git", ".npmrc", ".pypirc", ".netrc"];

/// Component prefixes that are sensitive (`.env`, `.env.local`, `id_rsa.pub`…).
const PREFIX_COMPONENTS: &[&str] = &[".env", "id_rsa", "id_ed25519", "cred", "credentials"];

/// Any component *containing* one of these is sensitive.
const SUBSTRING_COMPONENTS: &[&str] = &["key"];

/// Return `true` when any component of `path` matches a sensitive pattern.
///
/// Matching is per-component and case-insensitive so `~/.SSH/config`,
/// `a/b/.env.production`, and `secrets/api_keys.json` are all caught.
pub fn is_sensitive_path(path: &str) -> bool {
    path.split(['/', '\\'])
        .filter(|c| !c.is_empty())
        .any(|component| {
            let c = component.to_ascii_lowercase();
            EXACT_COMPONENTS.contains(&c.as_str())
                || PREFIX_COMPONENTS.iter().any(|p| c.starts_with(p))
                || SUBSTRING_COMPONENTS.iter().any(|s| c.contains(s))
        })
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

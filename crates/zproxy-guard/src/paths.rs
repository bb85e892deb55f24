// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Workspace-rooted path validation and rewriting.
//!
//! File tools may only touch paths under a declared workspace root.
//! Relative paths are accepted as-is; absolute paths must resolve under a
//! root and are rewritten to the repo-relative form so the client agent
//! sees one canonical spelling.

use std::path::{Component, Path, PathBuf};

use zproxy_planner::sensitive::is_sensitive_path;

use crate::error::GuardReason;

/// Validate a path argument and return its canonical (workspace-relative)
/// spelling.
pub fn check_path(raw: &str, roots: &[PathBuf]) -> Result<String, GuardReason> {
    if raw.trim().is_empty() {
        return Err(GuardReason::MissingPath);
    }
    if raw.contains('\0') {
        return Err(GuardReason::PathOutsideWorkspace(raw.into()));
    }
    if raw.starts_with('~') {
        return Err(GuardReason::PathOutsideWorkspace(raw.into()));
    }
    if raw.split(['/', '\\']).any(|c| c == "..") {
        return Err(GuardReason::PathOutsideWorkspace(raw.into()));
    }
    if is_sensitive_path(raw) {
        return Err(GuardReason::SensitivePath(raw.into()));
    }

    let path = Path::new(raw);
    if path.is_relative() {
        return Ok(normalize_relative(path));
    }

    // Absolute: must lie under a root; rewrite to relative.
    let cleaned = clean_path(path);
    for root in roots {
        let root_clean = clean_path(root);
        if let Ok(rel) = cleaned.strip_prefix(&root_clean) {
            let rel = rel.to_string_lossy().replace('\\', "/");
            return Ok(if rel.is_empty() { ".".into() } else { rel });
        }
    }
    Err(GuardReason::PathOutsideWorkspace(raw.into()))
}

/// Validate a glob pattern: relative, no traversal, not rooted.
pub fn check_glob(pattern: &str, _roots: &[PathBuf]) -> Result<(), GuardReason> {
    let p = pattern.trim();
    if p.is_empty() {
        return Err(GuardReason::MissingPath);
    }
    if p.starts_with('/') || p.starts_with("//") || p.starts_with('~') || p.starts_with('\\') {
        return Err(GuardReason::PathOutsideWorkspace(pattern.into()));
    }
    // Drive-letter roots (C:\ or C:/).
    let bytes = p.as_bytes();
    if bytes.len() >= 2 && bytes[1] == b':' && bytes[0].is_ascii_alphabetic() {
        return Err(GuardReason::PathOutsideWorkspace(pattern.into()));
    }
    if p.split(['/', '\\']).any(|c| c == "..") {
        return Err(GuardReason::PathOutsideWorkspace(pattern.into()));
    }
    Ok(())
}

/// Resolve a shell `workdir` argument.  Invalid or non-existent directories
/// are dropped (`None`); a valid relative dir is rewritten to the absolute
/// form under the first workspace root.
pub fn resolve_workdir(raw: &str, roots: &[PathBuf]) -> Option<String> {
    if raw.trim().is_empty() || raw.contains('\0') || raw.starts_with('~') {
        return None;
    }
    if raw.split(['/', '\\']).any(|c| c == "..") {
        return None;
    }
    let path = Path::new(raw);
    let absolute = if path.is_absolute() {
        let cleaned = clean_path(path);
        if !roots.iter().any(|r| cleaned.starts_with(clean_path(r))) {
            return None;
        }
        cleaned
    } else {
        let root = roots.first()?;
        clean_path(&root.join(path))
    };
    if absolute.is_dir() {
        Some(absolute.to_string_lossy().to_string())
    } else {
        None
    }
}

/// Lexically normalize `.` and empty components; no filesystem access, so
/// it also works for paths that do not exist yet (writes).
fn clean_path(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for comp in path.components() {
        match comp {
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn normalize_relative(path: &Path) -> String {
    clean_path(path).to_string_lossy().replace('\\', "/")
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The single piece of persistent state: `~/.config/zproxy/config.json`
//! holding `{ "token": "…" }`.

use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::debug;

#[derive(Debug, Default, Serialize, Deserialize)]
struct SavedConfig {
    #[serde(default)]
    token: Option<String>,
}

/// Location of the saved config file, if a config directory exists.
pub fn token_file_path() -> Option<PathBuf> {
    dirs::config_dir().map(|d| d.join("zproxy").join("config.json"))
}

/// Read the saved bearer token.  Any I/O or parse failure is treated as
/// "no saved token" — the caller falls back to unauthenticated.
pub fn load_saved_token() -> Option<String> {
    let path = token_file_path()?;
    let text = std::fs::read_to_string(&path).ok()?;
    let saved: SavedConfig = serde_json::from_str(&text).ok()?;
    saved.token.filter(|t| !t.trim().is_empty())
}

/// Persist the bearer token, creating the config directory if needed.
pub fn save_token(token: &str) -> anyhow::Result<PathBuf> {
    let path = token_file_path().context("no config directory available")?;
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)
            .with_context(|| format!("creating {}", parent.display()))?;
    }
    let saved = SavedConfig {
        token: Some(token.to_string()),
    };
    let text = serde_json::to_string_pretty(&saved)?;
    std::fs::write(&path, text).with_context(|| format!("writing {}", path.display()))?;
    debug!(path = %path.display(), "saved token");
    Ok(path)
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

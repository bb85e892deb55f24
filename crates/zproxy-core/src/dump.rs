// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Debug-dump observability.
//!
//! With `PROXY_DEBUG` set, every notable event (`request`,
//! `response_tool_calls`, `guard_block`, `pending_confirmation_set`, …)
//! is either written as one JSON file into `PROXY_DEBUG_DUMP_DIR` or, when
//! no directory is configured, logged as a truncated JSON line.

use std::path::PathBuf;

use serde_json::Value;
use tracing::{debug, warn};
use uuid::Uuid;

/// Cap on the inline-logged JSON payload.
const LOG_TRUNCATE_BYTES: usize = 8 * 1024;

#[derive(Debug, Clone, Default)]
pub struct Dumper {
    enabled: bool,
    dir: Option<PathBuf>,
}

impl Dumper {
    pub fn new(enabled: bool, dir: Option<PathBuf>) -> Self {
        if let Some(d) = dir.as_ref().filter(|_| enabled) {
            if let Err(e) = std::fs::create_dir_all(d) {
                warn!(dir = %d.display(), error = %e, "cannot create dump dir; falling back to log lines");
                return Self {
                    enabled,
                    dir: None,
                };
            }
        }
        Self { enabled, dir }
    }

    pub fn disabled() -> Self {
        Self::default()
    }

    /// Record one event.  Failures are logged, never propagated — dumps
    /// must not break request handling.
    pub fn dump(&self, event: &str, payload: &Value) {
        if !self.enabled {
            return;
        }
        match &self.dir {
            Some(dir) => {
                let ts = chrono::Utc::now().format("%Y%m%dT%H%M%S%.3f");
                let name = format!("{ts}-{event}-{}.json", &Uuid::new_v4().simple().to_string()[..8]);
                let path = dir.join(name);
                match serde_json::to_vec_pretty(payload) {
                    Ok(bytes) => {
                        if let Err(e) = std::fs::write(&path, bytes) {
                            warn!(path = %path.display(), error = %e, "debug dump write failed");
                        }
                    }
                    Err(e) => warn!(error = %e, "debug dump serialization failed"),
                }
            }
            None => {
                let mut text = payload.to_string();
                if text.len() > LOG_TRUNCATE_BYTES {
                    let cut = (0..=LOG_TRUNCATE_BYTES)
                        .rev()
                        .find(|i| text.is_char_boundary(*i))
                        .unwrap_or(0);
                    text.truncate(cut);
                    text.push('…');
                }
                debug!(event = %event, payload = %text, "debug dump");
            }
        }
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn disabled_dumper_writes_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let d = Dumper::new(false, Some(tmp.path().to_path_buf()));
        d.dump("request", &json!({"x": 1}));
        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }

    #[test]
    fn enabled_dumper_writes_one_file_per_event() {
        let tmp = tempfile::tempdir().unwrap();
        let d = Dumper::new(true, Some(tmp.path().to_path_buf()));
        d.dump("request", &json!({"x": 1}));
        d.dump("guard_block", &json!({"reason": "sensitive_path"}));
        let names: Vec<String> = std::fs::read_dir(tmp.path())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.iter().any(|n| n.contains("-request-")));
        assert!(names.iter().any(|n| n.contains("-guard_block-")));
        assert!(names.iter().all(|n| n.ends_with(".json")));
    }

    #[test]
    fn dumped_file_is_valid_json() {
        let tmp = tempfile::tempdir().unwrap();
        let d = Dumper::new(true, Some(tmp.path().to_path_buf()));
        d.dump("request", &json!({"nested": {"a": [1, 2]}}));
        let entry = std::fs::read_dir(tmp.path()).unwrap().next().unwrap().unwrap();
        let text = std::fs::read_to_string(entry.path()).unwrap();
        let v: Value = serde_json::from_str(&text).unwrap();
        assert_eq!(v["nested"]["a"][1], json!(2));
    }

    #[test]
    fn dirless_dumper_does_not_panic() {
        let d = Dumper::new(true, None);
        d.dump("request", &json!({"big": "y".repeat(100_000)}));
    }
}

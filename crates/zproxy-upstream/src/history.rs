// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Linearization of the upstream's parent-pointer message DAG.
//!
//! The upstream stores a chat as a flat `id → message` map plus a
//! `currentId` cursor; each message points at its parent.  The active
//! conversation is the chain from `currentId` back to the root, reversed.

use std::collections::HashSet;

use serde_json::Value;

/// One linearized conversation entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HistoryMessage {
    pub role: String,
    pub content: String,
}

/// Walk `history.messages` from `history.currentId` to the root and return
/// the chain in conversation order, together with the current message id.
///
/// Tolerates broken data: a missing `currentId`, an id absent from the map,
/// a dangling `parentId`, or a parent cycle all simply terminate the walk.
/// O(depth) in the chain length.
pub fn linearize(history: &Value) -> (Vec<HistoryMessage>, Option<String>) {
    let messages = &history["messages"];
    let Some(current_id) = history["currentId"].as_str() else {
        return (Vec::new(), None);
    };
    if messages.get(current_id).is_none() {
        return (Vec::new(), None);
    }

    let mut chain: Vec<&str> = Vec::new();
    let mut seen: HashSet<&str> = HashSet::new();
    let mut cursor = Some(current_id);
    while let Some(id) = cursor {
        if !seen.insert(id) {
            // Parent cycle — stop rather than loop forever.
            break;
        }
        let Some(node) = messages.get(id) else { break };
        chain.push(id);
        cursor = node["parentId"].as_str().filter(|p| !p.is_empty());
    }
    chain.reverse();

    let out = chain
        .into_iter()
        .filter_map(|id| {
            let node = &messages[id];
            let role = node["role"].as_str()?.to_string();
            Some(HistoryMessage {
                role,
                content: content_text(&node["content"]),
            })
        })
        .collect();
    (out, Some(current_id.to_string()))
}

/// Project message content to plain text.  The upstream sends either a
/// string or a list of typed parts; only text parts are used.
fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p["text"].as_str())
            .collect::<Vec<_>>()
            .join(""),
        _ => String::new(),
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn node(id: &str, parent: Option<&str>, role: &str, content: &str) -> Value {
        json!({
            "id": id,
            "parentId": parent,
            "role": role,
            "content": content,
        })
    }

    #[test]
    fn linear_chain_is_returned_in_order() {
        let history = json!({
            "currentId": "c",
            "messages": {
                "a": node("a", None, "user", "first"),
                "b": node("b", Some("a"), "assistant", "second"),
                "c": node("c", Some("b"), "user", "third"),
            }
        });
        let (msgs, cur) = linearize(&history);
        assert_eq!(cur.as_deref(), Some("c"));
        let texts: Vec<&str> = msgs.iter().map(|m| m.content.as_str()).collect();
        assert_eq!(texts, vec!["first", "second", "third"]);
        assert_eq!(msgs[0].role, "user");
        assert_eq!(msgs[1].role, "assistant");
    }

    #[test]
    fn missing_current_id_yields_empty() {
        let history = json!({ "messages": {} });
        let (msgs, cur) = linearize(&history);
        assert!(msgs.is_empty());
        assert!(cur.is_none());
    }

    #[test]
    fn current_id_not_in_map_yields_empty() {
        let history = json!({
            "currentId": "ghost",
            "messages": { "a": node("a", None, "user", "x") }
        });
        let (msgs, cur) = linearize(&history);
        assert!(msgs.is_empty());
        assert!(cur.is_none());
    }

    #[test]
    fn dangling_parent_terminates_walk() {
        let history = json!({
            "currentId": "b",
            "messages": {
                "b": node("b", Some("never-existed"), "assistant", "tail"),
            }
        });
        let (msgs, _) = linearize(&history);
        assert_eq!(msgs.len(), 1);
        assert_eq!(msgs[0].content, "tail");
    }

    #[test]
    fn parent_cycle_terminates_walk() {
        let history = json!({
            "currentId": "a",
            "messages": {
                "a": node("a", Some("b"), "user", "one"),
                "b": node("b", Some("a"), "assistant", "two"),
            }
        });
        let (msgs, _) = linearize(&history);
        // Both nodes visited once, then the cycle is cut.
        assert_eq!(msgs.len(), 2);
        assert_eq!(msgs[0].content, "two");
        assert_eq!(msgs[1].content, "one");
    }

    #[test]
    fn typed_content_parts_are_joined() {
        let history = json!({
            "currentId": "a",
            "messages": {
                "a": {
                    "id": "a",
                    "parentId": null,
                    "role": "user",
                    "content": [
                        { "type": "text", "text": "hello " },
                        { "type": "text", "text": "world" },
                        { "type": "image", "url": "ignored" },
                    ],
                }
            }
        });
        let (msgs, _) = linearize(&history);
        assert_eq!(msgs[0].content, "hello world");
    }

    #[test]
    fn linearize_is_idempotent_on_single_chain() {
        // Rebuilding a DAG from the linearized output and linearizing again
        // must produce the same chain.
        let history = json!({
            "currentId": "m2",
            "messages": {
                "m0": node("m0", None, "user", "q"),
                "m1": node("m1", Some("m0"), "assistant", "a"),
                "m2": node("m2", Some("m1"), "user", "q2"),
            }
        });
        let (first, _) = linearize(&history);

        let mut rebuilt = serde_json::Map::new();
        let mut prev: Option<String> = None;
        for (i, m) in first.iter().enumerate() {
            let id = format!("r{i}");
            rebuilt.insert(
                id.clone(),
                node(&id, prev.as_deref(), &m.role, &m.content),
            );
            prev = Some(id);
        }
        let rebuilt = json!({ "currentId": prev, "messages": rebuilt });
        let (second, _) = linearize(&rebuilt);
        assert_eq!(first, second);
    }
}

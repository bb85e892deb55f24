// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Lax JSON handling for model output.
//!
//! Models wrap JSON in code fences, add `//` commentary, leave trailing
//! commas, and put raw newlines inside string literals.  The helpers here
//! normalize those forms so the *strict* serde parser stays the single
//! source of truth: every repair is a textual transformation followed by a
//! normal `serde_json::from_str`.

use serde_json::Value;

/// Strip a leading/trailing Markdown code fence (``` or ```json).
pub fn strip_code_fences(text: &str) -> String {
    let trimmed = text.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    // Drop the info string (e.g. "json") up to the first newline.
    let rest = match rest.find('\n') {
        Some(nl) => &rest[nl + 1..],
        None => rest,
    };
    let rest = rest.strip_suffix("```").unwrap_or(rest);
    rest.trim().to_string()
}

/// Remove `//` line comments and `/* */` block comments outside strings.
pub fn strip_comments(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let bytes: Vec<char> = text.chars().collect();
    let mut i = 0;
    let mut in_string = false;
    while i < bytes.len() {
        let c = bytes[i];
        if in_string {
            out.push(c);
            if c == '\\' && i + 1 < bytes.len() {
                out.push(bytes[i + 1]);
                i += 2;
                continue;
            }
            if c == '"' {
                in_string = false;
            }
            i += 1;
        } else if c == '"' {
            in_string = true;
            out.push(c);
            i += 1;
        } else if c == '/' && i + 1 < bytes.len() && bytes[i + 1] == '/' {
            while i < bytes.len() && bytes[i] != '\n' {
                i += 1;
            }
        } else if c == '/' && i + 1 < bytes.len() && bytes[i + 1] == '*' {
            i += 2;
            while i + 1 < bytes.len() && !(bytes[i] == '*' && bytes[i + 1] == '/') {
                i += 1;
            }
            i = (i + 2).min(bytes.len());
        } else {
            out.push(c);
            i += 1;
        }
    }
    out
}

/// Remove trailing commas before `}` / `]`, outside strings.
pub fn strip_trailing_commas(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    let mut in_string = false;
    while i < chars.len() {
        let c = chars[i];
        if in_string {
            out.push(c);
            if c == '\\' && i + 1 < chars.len() {
                out.push(chars[i + 1]);
                i += 2;
                continue;
            }
            if c == '"' {
                in_string = false;
            }
            i += 1;
        } else if c == '"' {
            in_string = true;
            out.push(c);
            i += 1;
        } else if c == ',' {
            // Look ahead past whitespace for a closing bracket.
            let mut j = i + 1;
            while j < chars.len() && chars[j].is_whitespace() {
                j += 1;
            }
            if j < chars.len() && (chars[j] == '}' || chars[j] == ']') {
                i += 1; // drop the comma
            } else {
                out.push(c);
                i += 1;
            }
        } else {
            out.push(c);
            i += 1;
        }
    }
    out
}

/// Escape raw control characters (newlines, tabs) inside string literals.
pub fn normalize_newlines_in_strings(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    let chars: Vec<char> = text.chars().collect();
    let mut i = 0;
    let mut in_string = false;
    while i < chars.len() {
        let c = chars[i];
        if in_string {
            match c {
                '\\' if i + 1 < chars.len() => {
                    out.push(c);
                    out.push(chars[i + 1]);
                    i += 2;
                    continue;
                }
                '"' => {
                    in_string = false;
                    out.push(c);
                }
                '\n' => out.push_str("\\n"),
                '\r' => out.push_str("\\r"),
                '\t' => out.push_str("\\t"),
                _ => out.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
        }
        i += 1;
    }
    out
}

/// Escape invalid escape sequences (`\c`, `\(`, …) inside string literals so
/// strict parsing succeeds.
pub fn fix_invalid_escapes(text: &str) -> String {
    let mut out = String::with_capacity(text.len() + 16);
    let mut chars = text.chars();
    let mut in_string = false;
    while let Some(c) = chars.next() {
        if in_string {
            match c {
                '\\' => match chars.next() {
                    Some(next)
                        if matches!(next, '"' | '\\' | '/' | 'b' | 'f' | 'n' | 'r' | 't' | 'u') =>
                    {
                        out.push('\\');
                        out.push(next);
                    }
                    Some(next) => {
                        out.push('\\');
                        out.push('\\');
                        out.push(next);
                    }
                    None => out.push('\\'),
                },
                '"' => {
                    in_string = false;
                    out.push('"');
                }
                _ => out.push(c),
            }
        } else {
            if c == '"' {
                in_string = true;
            }
            out.push(c);
        }
    }
    out
}

/// The full repair pipeline.  Idempotent: repairing already-repaired text
/// is a no-op, so it can be applied defensively at any layer.
pub fn repair_planner_json(text: &str) -> String {
    let s = strip_code_fences(text);
    let s = strip_comments(&s);
    let s = normalize_newlines_in_strings(&s);
    let s = fix_invalid_escapes(&s);
    strip_trailing_commas(&s)
}

/// First balanced `{…}` block, respecting string literals.
pub fn extract_first_object(text: &str) -> Option<&str> {
    extract_objects(text).into_iter().next()
}

/// Every top-level balanced `{…}` block in `text`, in order of appearance.
pub fn extract_objects(text: &str) -> Vec<&str> {
    let mut results = Vec::new();
    let bytes = text.as_bytes();
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'{' {
            if let Some(end) = balanced_end(text, i) {
                results.push(&text[i..=end]);
                i = end + 1;
                continue;
            }
        }
        i += 1;
    }
    results
}

/// Byte index of the `}` closing the `{` at `start`, or `None` if unbalanced.
fn balanced_end(text: &str, start: usize) -> Option<usize> {
    let bytes = text.as_bytes();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut i = start;
    while i < bytes.len() {
        let b = bytes[i];
        if in_string {
            match b {
                b'\\' => i += 1,
                b'"' => in_string = false,
                _ => {}
            }
        } else {
            match b {
                b'"' => in_string = true,
                b'{' => depth += 1,
                b'}' => {
                    depth -= 1;
                    if depth == 0 {
                        return Some(i);
                    }
                }
                _ => {}
            }
        }
        i += 1;
    }
    None
}

/// Strict parse, then a repaired retry, then the first balanced object.
pub fn parse_lenient(text: &str) -> Option<Value> {
    if let Ok(v) = serde_json::from_str(text) {
        return Some(v);
    }
    let repaired = repair_planner_json(text);
    if let Ok(v) = serde_json::from_str(&repaired) {
        return Some(v);
    }
    let block = extract_first_object(&repaired)?;
    serde_json::from_str(block).ok()
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    // ── Fences ───────────────────────────────────────────────────────────────

    #[test]
    fn fenced_json_is_unwrapped() {
        let s = "```json\n{\"a\": 1}\n```";
        assert_eq!(strip_code_fences(s), "{\"a\": 1}");
    }

    #[test]
    fn fence_without_language_is_unwrapped() {
        let s = "```\n{\"a\": 1}\n```";
        assert_eq!(strip_code_fences(s), "{\"a\": 1}");
    }

    #[test]
    fn unfenced_text_is_untouched() {
        assert_eq!(strip_code_fences("{\"a\": 1}"), "{\"a\": 1}");
    }

    // ── Comments ─────────────────────────────────────────────────────────────

    #[test]
    fn line_comments_are_removed() {
        let s = "{\n  \"a\": 1 // the answer\n}";
        let v: Value = serde_json::from_str(&strip_comments(s)).unwrap();
        assert_eq!(v, json!({"a": 1}));
    }

    #[test]
    fn block_comments_are_removed() {
        let s = "{ /* hidden */ \"a\": 1 }";
        let v: Value = serde_json::from_str(&strip_comments(s)).unwrap();
        assert_eq!(v, json!({"a": 1}));
    }

    #[test]
    fn slashes_inside_strings_survive() {
        let s = r#"{"url": "https://example.com/a//b"}"#;
        assert_eq!(strip_comments(s), s);
    }

    // ── Trailing commas ──────────────────────────────────────────────────────

    #[test]
    fn trailing_commas_are_removed() {
        let s = "{\"a\": [1, 2,], \"b\": {\"c\": 3,},}";
        let v: Value = serde_json::from_str(&strip_trailing_commas(s)).unwrap();
        assert_eq!(v, json!({"a": [1, 2], "b": {"c": 3}}));
    }

    #[test]
    fn commas_inside_strings_survive() {
        let s = r#"{"a": "x,}"}"#;
        assert_eq!(strip_trailing_commas(s), s);
    }

    // ── Newline normalization ────────────────────────────────────────────────

    #[test]
    fn raw_newlines_in_strings_are_escaped() {
        let s = "{\"text\": \"line one\nline two\"}";
        let v: Value = serde_json::from_str(&normalize_newlines_in_strings(s)).unwrap();
        assert_eq!(v["text"], json!("line one\nline two"));
    }

    #[test]
    fn escaped_newlines_are_not_double_escaped() {
        let s = r#"{"text": "a\nb"}"#;
        assert_eq!(normalize_newlines_in_strings(s), s);
    }

    #[test]
    fn newlines_outside_strings_are_kept() {
        let s = "{\n\"a\": 1\n}";
        assert_eq!(normalize_newlines_in_strings(s), s);
    }

    // ── Invalid escapes ──────────────────────────────────────────────────────

    #[test]
    fn invalid_escape_is_doubled() {
        let s = r#"{"path": "C:\projects"}"#;
        let fixed = fix_invalid_escapes(s);
        let v: Value = serde_json::from_str(&fixed).unwrap();
        assert_eq!(v["path"], json!(r"C:\projects"));
    }

    #[test]
    fn valid_escapes_are_preserved() {
        let s = r#"{"a": "x\n\t\"q\""}"#;
        assert_eq!(fix_invalid_escapes(s), s);
    }

    // ── Full pipeline ────────────────────────────────────────────────────────

    #[test]
    fn repair_handles_combined_malformations() {
        let s = "```json\n{\n  \"plan\": [\"step\",], // plan\n  \"actions\": [],\n  \"final\": \"a\nb\",\n}\n```";
        let v: Value = serde_json::from_str(&repair_planner_json(s)).unwrap();
        assert_eq!(v["plan"], json!(["step"]));
        assert_eq!(v["final"], json!("a\nb"));
    }

    #[test]
    fn repair_is_idempotent() {
        let inputs = [
            "```json\n{\"a\": [1,],}\n```",
            "{\"text\": \"x\ny\"} // c",
            r#"{"clean": true}"#,
            "{\"p\": \"C:\\win\\path\"}",
        ];
        for s in inputs {
            let once = repair_planner_json(s);
            let twice = repair_planner_json(&once);
            assert_eq!(once, twice, "repair must be idempotent for {s:?}");
        }
    }

    #[test]
    fn repair_of_valid_json_is_identity_after_parse() {
        let s = r#"{"a": 1, "b": [2, 3]}"#;
        let v1: Value = serde_json::from_str(s).unwrap();
        let v2: Value = serde_json::from_str(&repair_planner_json(s)).unwrap();
        assert_eq!(v1, v2);
    }

    // ── Object extraction ────────────────────────────────────────────────────

    #[test]
    fn first_object_is_extracted_from_prose() {
        let s = "Sure! Here is the plan: {\"a\": 1} — hope that helps.";
        assert_eq!(extract_first_object(s), Some("{\"a\": 1}"));
    }

    #[test]
    fn nested_braces_are_balanced() {
        let s = "x {\"a\": {\"b\": 2}} y";
        assert_eq!(extract_first_object(s), Some("{\"a\": {\"b\": 2}}"));
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_the_scan() {
        let s = r#"{"a": "}{"}"#;
        assert_eq!(extract_first_object(s), Some(s));
    }

    #[test]
    fn all_objects_are_found_in_order() {
        let s = "{\"a\":1} and {\"b\":2}";
        let objs = extract_objects(s);
        assert_eq!(objs, vec!["{\"a\":1}", "{\"b\":2}"]);
    }

    #[test]
    fn unbalanced_brace_yields_nothing() {
        assert!(extract_first_object("{\"a\": 1").is_none());
    }

    // ── parse_lenient ────────────────────────────────────────────────────────

    #[test]
    fn lenient_parses_strict_json() {
        assert_eq!(parse_lenient("{\"a\":1}"), Some(json!({"a":1})));
    }

    #[test]
    fn lenient_parses_fenced_with_trailing_comma() {
        let s = "```json\n{\"a\": 1,}\n```";
        assert_eq!(parse_lenient(s), Some(json!({"a": 1})));
    }

    #[test]
    fn lenient_extracts_object_from_prose() {
        let s = "The result is {\"a\": 1} as requested.";
        assert_eq!(parse_lenient(s), Some(json!({"a": 1})));
    }

    #[test]
    fn lenient_fails_on_hopeless_input() {
        assert!(parse_lenient("no json here at all").is_none());
    }
}

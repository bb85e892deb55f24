// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! OpenAI Chat Completions wire format — exactly the subset the proxy
//! speaks, with `skip_serializing_if` keeping replies minimal so picky
//! clients (IDE plugins, terminal agents) accept them.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

// ─── Requests ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Deserialize, Default)]
pub struct ChatCompletionRequest {
    #[serde(default)]
    pub model: Option<String>,
    pub messages: Vec<ChatMessage>,
    #[serde(default)]
    pub tools: Option<Vec<Value>>,
    /// `"auto"`, `"required"`, `"none"`, or `{"type":"function","function":{"name":…}}`.
    #[serde(default)]
    pub tool_choice: Option<Value>,
    #[serde(default)]
    pub stream: bool,
    #[serde(default)]
    pub enable_thinking: Option<bool>,
    /// Feature overrides forwarded to the upstream.
    #[serde(default)]
    pub features: Option<Value>,
    #[serde(default)]
    pub web_search: Option<bool>,
    #[serde(default)]
    pub auto_web_search: Option<bool>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    /// A string or a list of typed parts; only text parts are used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallOut>>,
}

impl ChatMessage {
    pub fn new(role: &str, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Some(Value::String(text.into())),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        }
    }

    pub fn system(text: impl Into<String>) -> Self {
        Self::new("system", text)
    }

    pub fn user(text: impl Into<String>) -> Self {
        Self::new("user", text)
    }

    /// Plain text of the content: the string itself, or the concatenated
    /// text parts of a typed list.
    pub fn text(&self) -> String {
        match &self.content {
            Some(Value::String(s)) => s.clone(),
            Some(Value::Array(parts)) => parts
                .iter()
                .filter_map(|p| p["text"].as_str())
                .collect::<Vec<_>>()
                .join(""),
            _ => String::new(),
        }
    }

    pub fn is_role(&self, role: &str) -> bool {
        self.role.eq_ignore_ascii_case(role)
    }
}

// ─── Tool calls ──────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolCallOut {
    pub id: String,
    #[serde(default)]
    pub index: usize,
    #[serde(rename = "type")]
    pub kind: String,
    pub function: FunctionCallOut,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FunctionCallOut {
    pub name: String,
    /// JSON-serialized argument object.
    pub arguments: String,
}

impl ToolCallOut {
    /// Wire form of a call with a fresh `call_…` id.
    pub fn new(index: usize, name: &str, args: &Value) -> Self {
        Self {
            id: fresh_call_id(),
            index,
            kind: "function".into(),
            function: FunctionCallOut {
                name: name.into(),
                arguments: args.to_string(),
            },
        }
    }
}

pub fn fresh_call_id() -> String {
    format!("call_{}", Uuid::new_v4().simple())
}

pub fn fresh_completion_id() -> String {
    format!("chatcmpl-{}", Uuid::new_v4().simple())
}

pub fn unix_timestamp() -> u64 {
    chrono::Utc::now().timestamp().max(0) as u64
}

// ─── Whole responses ─────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Usage {
    pub prompt_tokens: usize,
    pub completion_tokens: usize,
    pub total_tokens: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResponseMessage {
    pub role: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallOut>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Choice {
    pub index: usize,
    pub message: ResponseMessage,
    pub finish_reason: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionResponse {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<Choice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatCompletionResponse {
    /// A plain-text assistant reply (`finish_reason: stop`).
    pub fn text(model: &str, content: impl Into<String>) -> Self {
        Self {
            id: fresh_completion_id(),
            object: "chat.completion".into(),
            created: unix_timestamp(),
            model: model.into(),
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant".into(),
                    content: Some(content.into()),
                    tool_calls: None,
                },
                finish_reason: "stop".into(),
            }],
            usage: None,
        }
    }

    /// A tool-call reply (`finish_reason: tool_calls`).
    pub fn tool_calls(model: &str, calls: Vec<ToolCallOut>) -> Self {
        Self {
            id: fresh_completion_id(),
            object: "chat.completion".into(),
            created: unix_timestamp(),
            model: model.into(),
            choices: vec![Choice {
                index: 0,
                message: ResponseMessage {
                    role: "assistant".into(),
                    content: None,
                    tool_calls: Some(calls),
                },
                finish_reason: "tool_calls".into(),
            }],
            usage: None,
        }
    }

    pub fn finish_reason(&self) -> &str {
        self.choices
            .first()
            .map(|c| c.finish_reason.as_str())
            .unwrap_or("stop")
    }
}

// ─── Streaming chunks ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ChunkDelta {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,
    /// Mirrors upstream thinking into the OpenAI-compatible stream.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reasoning_content: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<ToolCallOut>>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChunkChoice {
    pub index: usize,
    pub delta: ChunkDelta,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatCompletionChunk {
    pub id: String,
    pub object: String,
    pub created: u64,
    pub model: String,
    pub choices: Vec<ChunkChoice>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub usage: Option<Usage>,
}

impl ChatCompletionChunk {
    pub fn delta(id: &str, created: u64, model: &str, delta: ChunkDelta) -> Self {
        Self {
            id: id.into(),
            object: "chat.completion.chunk".into(),
            created,
            model: model.into(),
            choices: vec![ChunkChoice {
                index: 0,
                delta,
                finish_reason: None,
            }],
            usage: None,
        }
    }

    pub fn role(id: &str, created: u64, model: &str) -> Self {
        Self::delta(
            id,
            created,
            model,
            ChunkDelta {
                role: Some("assistant".into()),
                ..Default::default()
            },
        )
    }

    pub fn content(id: &str, created: u64, model: &str, text: impl Into<String>) -> Self {
        Self::delta(
            id,
            created,
            model,
            ChunkDelta {
                content: Some(text.into()),
                ..Default::default()
            },
        )
    }

    pub fn reasoning(id: &str, created: u64, model: &str, text: impl Into<String>) -> Self {
        Self::delta(
            id,
            created,
            model,
            ChunkDelta {
                reasoning_content: Some(text.into()),
                ..Default::default()
            },
        )
    }

    pub fn finish(id: &str, created: u64, model: &str, reason: &str) -> Self {
        Self {
            id: id.into(),
            object: "chat.completion.chunk".into(),
            created,
            model: model.into(),
            choices: vec![ChunkChoice {
                index: 0,
                delta: ChunkDelta::default(),
                finish_reason: Some(reason.into()),
            }],
            usage: None,
        }
    }
}

/// Expand a whole response into the equivalent chunk sequence: role first,
/// then content / tool-call deltas, then the finish chunk.
pub fn response_to_chunks(resp: &ChatCompletionResponse) -> Vec<ChatCompletionChunk> {
    let mut chunks = vec![ChatCompletionChunk::role(&resp.id, resp.created, &resp.model)];
    if let Some(choice) = resp.choices.first() {
        if let Some(content) = &choice.message.content {
            if !content.is_empty() {
                chunks.push(ChatCompletionChunk::content(
                    &resp.id,
                    resp.created,
                    &resp.model,
                    content.clone(),
                ));
            }
        }
        if let Some(calls) = &choice.message.tool_calls {
            chunks.push(ChatCompletionChunk::delta(
                &resp.id,
                resp.created,
                &resp.model,
                ChunkDelta {
                    tool_calls: Some(calls.clone()),
                    ..Default::default()
                },
            ));
        }
        let mut finish = ChatCompletionChunk::finish(
            &resp.id,
            resp.created,
            &resp.model,
            &choice.finish_reason,
        );
        finish.usage = resp.usage.clone();
        chunks.push(finish);
    }
    chunks
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_text_from_string_content() {
        let m = ChatMessage::user("hello");
        assert_eq!(m.text(), "hello");
    }

    #[test]
    fn message_text_from_typed_parts() {
        let m = ChatMessage {
            role: "user".into(),
            content: Some(json!([
                {"type": "text", "text": "a"},
                {"type": "image_url", "image_url": {"url": "x"}},
                {"type": "text", "text": "b"},
            ])),
            name: None,
            tool_call_id: None,
            tool_calls: None,
        };
        assert_eq!(m.text(), "ab");
    }

    #[test]
    fn message_text_of_null_content_is_empty() {
        let m = ChatMessage {
            role: "assistant".into(),
            content: None,
            name: None,
            tool_call_id: None,
            tool_calls: None,
        };
        assert_eq!(m.text(), "");
    }

    #[test]
    fn text_response_shape() {
        let r = ChatCompletionResponse::text("glm-4.7", "hi");
        assert_eq!(r.object, "chat.completion");
        assert_eq!(r.finish_reason(), "stop");
        assert_eq!(r.choices[0].message.content.as_deref(), Some("hi"));
        assert!(r.id.starts_with("chatcmpl-"));
    }

    #[test]
    fn tool_call_response_shape() {
        let call = ToolCallOut::new(0, "read", &json!({"path": "a.txt"}));
        let r = ChatCompletionResponse::tool_calls("glm-4.7", vec![call]);
        assert_eq!(r.finish_reason(), "tool_calls");
        let calls = r.choices[0].message.tool_calls.as_ref().unwrap();
        assert_eq!(calls[0].function.name, "read");
        assert_eq!(calls[0].function.arguments, r#"{"path":"a.txt"}"#);
        assert!(calls[0].id.starts_with("call_"));
        assert_eq!(calls[0].kind, "function");
    }

    #[test]
    fn null_content_is_omitted_from_serialization() {
        let r = ChatCompletionResponse::tool_calls("m", vec![]);
        let json = serde_json::to_string(&r).unwrap();
        assert!(!json.contains("\"content\""));
    }

    #[test]
    fn chunk_sequence_for_text_response() {
        let r = ChatCompletionResponse::text("m", "answer");
        let chunks = response_to_chunks(&r);
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].choices[0].delta.role.as_deref(), Some("assistant"));
        assert_eq!(chunks[1].choices[0].delta.content.as_deref(), Some("answer"));
        assert_eq!(chunks[2].choices[0].finish_reason.as_deref(), Some("stop"));
    }

    #[test]
    fn chunk_sequence_for_tool_calls() {
        let call = ToolCallOut::new(0, "read", &json!({"path": "x"}));
        let r = ChatCompletionResponse::tool_calls("m", vec![call]);
        let chunks = response_to_chunks(&r);
        assert_eq!(chunks.len(), 3);
        assert!(chunks[1].choices[0].delta.tool_calls.is_some());
        assert_eq!(
            chunks[2].choices[0].finish_reason.as_deref(),
            Some("tool_calls")
        );
    }

    #[test]
    fn request_deserializes_minimal_form() {
        let req: ChatCompletionRequest =
            serde_json::from_str(r#"{"messages": [{"role": "user", "content": "hi"}]}"#).unwrap();
        assert!(!req.stream);
        assert!(req.tools.is_none());
        assert_eq!(req.messages[0].text(), "hi");
    }

    #[test]
    fn request_accepts_tool_messages() {
        let req: ChatCompletionRequest = serde_json::from_str(
            r#"{"messages": [{"role": "tool", "content": "out", "tool_call_id": "call_1"}]}"#,
        )
        .unwrap();
        assert_eq!(req.messages[0].tool_call_id.as_deref(), Some("call_1"));
    }

    #[test]
    fn reasoning_chunk_carries_reasoning_content() {
        let c = ChatCompletionChunk::reasoning("id", 0, "m", "hmm");
        let json = serde_json::to_string(&c).unwrap();
        assert!(json.contains("\"reasoning_content\":\"hmm\""));
        assert!(!json.contains("\"content\""));
    }
}

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! End-to-end handler scenarios: each test drives the full pipeline
//! (registry → heuristics/planner → guard → OpenAI reply) against a
//! scripted mock backend.

use std::sync::Arc;

use serde_json::{json, Value};

use zproxy_config::Config;
use zproxy_core::{
    ChatCompletionResponse, ChatMessage, Handler, MockBackend, ReplyBody, ToolCallOut,
};
use zproxy_upstream::{StreamChunk, StreamParser};

fn tool_decl(name: &str, params: &[&str]) -> Value {
    let mut props = serde_json::Map::new();
    for p in params {
        props.insert(p.to_string(), json!({ "type": "string" }));
    }
    json!({
        "type": "function",
        "function": {
            "name": name,
            "description": format!("{name} tool"),
            "parameters": { "type": "object", "properties": props }
        }
    })
}

fn handler(backend: Arc<MockBackend>) -> Handler {
    let mut config = Config::default();
    config.workspace.roots = vec![std::path::PathBuf::from("/work/project")];
    Handler::new(config, backend)
}

fn request(messages: Vec<ChatMessage>, tools: Vec<Value>) -> zproxy_core::ChatCompletionRequest {
    let mut req = zproxy_core::ChatCompletionRequest::default();
    req.messages = messages;
    req.tools = Some(tools);
    req
}

async fn run(h: &Handler, req: zproxy_core::ChatCompletionRequest) -> ChatCompletionResponse {
    match h.handle(req).await.body {
        ReplyBody::Full(r) => r,
        ReplyBody::Stream(_) => panic!("expected a non-streaming reply"),
    }
}

fn calls_of(resp: &ChatCompletionResponse) -> &Vec<ToolCallOut> {
    resp.choices[0]
        .message
        .tool_calls
        .as_ref()
        .expect("tool calls in response")
}

// ─── Seed 1: read heuristic ──────────────────────────────────────────────────

#[tokio::test]
async fn read_heuristic_produces_a_read_tool_call() {
    let backend = Arc::new(MockBackend::new());
    let h = handler(Arc::clone(&backend));
    let resp = run(
        &h,
        request(
            vec![ChatMessage::user("read README.md")],
            vec![tool_decl("read", &["filePath"])],
        ),
    )
    .await;

    assert_eq!(resp.finish_reason(), "tool_calls");
    let calls = calls_of(&resp);
    assert_eq!(calls.len(), 1);
    assert_eq!(calls[0].function.name, "read");
    assert_eq!(calls[0].function.arguments, r#"{"filePath":"README.md"}"#);
    assert_eq!(backend.request_count(), 0, "heuristic bypasses the model");
}

// ─── Seed 2: dangerous command → confirmation → replay ───────────────────────

#[tokio::test]
async fn dangerous_command_confirmation_round_trip() {
    let backend = Arc::new(MockBackend::with_replies(&[
        r#"{"plan": ["clean up"], "actions": [{"tool": "run_shell", "args": {"command": "rm -rf tmp"}, "why": "cleanup", "expect": "", "safety": {"risk": "high", "notes": ""}}]}"#,
    ]));
    let h = handler(backend);
    let tools = vec![
        tool_decl("run_shell", &["command"]),
        tool_decl("askquestion", &["question", "questions"]),
    ];

    // First request: the guard turns the dangerous command into a question.
    let resp = run(
        &h,
        request(vec![ChatMessage::user("remove the tmp directory")], tools.clone()),
    )
    .await;
    assert_eq!(resp.finish_reason(), "tool_calls");
    let question = calls_of(&resp)[0].clone();
    assert_ne!(question.function.name, "run_shell");
    assert!(question.function.arguments.contains("rm -rf tmp"));

    // Second request: a matching affirmative tool message replays the
    // stored call directly, bypassing the guard.
    let mut answer = ChatMessage::new("tool", "yes");
    answer.tool_call_id = Some(question.id.clone());
    let resp2 = run(
        &h,
        request(
            vec![ChatMessage::user("remove the tmp directory"), answer],
            tools,
        ),
    )
    .await;
    assert_eq!(resp2.finish_reason(), "tool_calls");
    let replay = &calls_of(&resp2)[0];
    assert_eq!(replay.function.name, "run_shell");
    assert!(replay.function.arguments.contains("rm -rf tmp"));
}

// ─── Seed 3: mutation boundary ───────────────────────────────────────────────

#[tokio::test]
async fn mutation_batch_collapses_to_the_first_write() {
    let backend = Arc::new(MockBackend::with_replies(&[
        r#"{"actions": [
            {"tool": "write", "args": {"path": "a.txt", "content": "1"}},
            {"tool": "write", "args": {"path": "b.txt", "content": "2"}},
            {"tool": "read", "args": {"path": "c.txt"}}
        ]}"#,
    ]));
    let h = handler(backend);
    let resp = run(
        &h,
        request(
            vec![ChatMessage::user("apply both edits and verify")],
            vec![
                tool_decl("write", &["path", "content"]),
                tool_decl("read", &["path"]),
            ],
        ),
    )
    .await;

    let calls = calls_of(&resp);
    assert_eq!(calls.len(), 1, "mutation batch truncates to one action");
    assert_eq!(calls[0].function.name, "write");
    assert!(calls[0].function.arguments.contains("a.txt"));
}

// ─── Seed 4: raw tool-call suppression ───────────────────────────────────────

#[tokio::test]
async fn identical_raw_batches_are_suppressed_on_repeat() {
    let raw = r#"[{"function": {"name": "read", "arguments": "{\"path\": \"README.md\"}"}}]"#;
    let backend = Arc::new(MockBackend::with_replies(&[raw, raw]));
    let h = {
        let mut config = Config::default();
        config.workspace.roots = vec![std::path::PathBuf::from("/work/project")];
        config.proxy.planner_max_retries = 0;
        Handler::new(config, backend)
    };
    let tools = vec![tool_decl("read", &["path"])];
    let mut tool_msg = ChatMessage::new("tool", "file contents here");
    tool_msg.tool_call_id = Some("call_prior".into());
    let messages = vec![ChatMessage::user("continue the task"), tool_msg];

    let first = run(&h, request(messages.clone(), tools.clone())).await;
    assert_eq!(first.finish_reason(), "tool_calls", "first raw batch dispatches");
    assert_eq!(calls_of(&first)[0].function.name, "read");

    let second = run(&h, request(messages, tools)).await;
    assert_eq!(
        second.finish_reason(),
        "stop",
        "identical repeat is suppressed; flow falls through to prose"
    );
    assert!(second.choices[0].message.content.is_some());
}

// ─── Seed 5: thinking dedup in the stream parser ─────────────────────────────

#[tokio::test]
async fn replayed_thinking_segment_reaches_the_consumer_once() {
    const THOUGHT: &str =
        "Let me think about X step by step, which takes well over fifty characters to write out.";
    let mut parser = StreamParser::new();
    let mut chunks = Vec::new();
    let lines = [
        json!({"type": "chat:completion", "data": {"delta_content": THOUGHT, "phase": "thinking"}}),
        json!({"type": "chat:completion", "data": {"delta_content": "partial answer. ", "phase": "answer"}}),
        json!({"type": "chat:completion", "data": {"delta_content": THOUGHT, "phase": "thinking"}}),
        json!({"type": "chat:completion", "data": {"delta_content": "final answer.", "phase": "answer"}}),
    ];
    for line in &lines {
        chunks.extend(parser.feed(format!("data: {line}\n").as_bytes()));
    }
    chunks.extend(parser.feed(b"data: [DONE]\n"));

    let thinking: String = chunks
        .iter()
        .filter_map(|c| match c {
            StreamChunk::Thinking(t) => Some(t.as_str()),
            _ => None,
        })
        .collect();
    assert_eq!(thinking, THOUGHT, "thinking is streamed exactly once");

    let ends = chunks
        .iter()
        .filter(|c| matches!(c, StreamChunk::ThinkingEnd))
        .count();
    assert_eq!(ends, 1, "the suppressed replay emits no second ThinkingEnd");

    let dones = chunks.iter().filter(|c| c.is_terminal()).count();
    assert_eq!(dones, 1);
}

// ─── Seed 6: absolute path rewrite ───────────────────────────────────────────

#[tokio::test]
async fn absolute_workspace_path_is_rewritten_to_relative() {
    let backend = Arc::new(MockBackend::with_replies(&[
        r#"{"actions": [{"tool": "read", "args": {"filePath": "/work/project/src/lib.rs"}}]}"#,
    ]));
    let h = handler(backend);
    let resp = run(
        &h,
        request(
            vec![ChatMessage::user("inspect the library entry point")],
            vec![tool_decl("read", &["filePath"])],
        ),
    )
    .await;

    assert_eq!(resp.finish_reason(), "tool_calls");
    assert_eq!(
        calls_of(&resp)[0].function.arguments,
        r#"{"filePath":"src/lib.rs"}"#
    );
}

// ─── Guard block surfaces as a content message ───────────────────────────────

#[tokio::test]
async fn sensitive_path_block_is_reported_in_prose() {
    let backend = Arc::new(MockBackend::with_replies(&[
        r#"{"actions": [{"tool": "read", "args": {"path": ".ssh/id_rsa"}}]}"#,
    ]));
    let h = handler(backend);
    let resp = run(
        &h,
        request(
            vec![ChatMessage::user("summarize the host configuration")],
            vec![tool_decl("read", &["path"])],
        ),
    )
    .await;
    assert_eq!(resp.finish_reason(), "stop");
    let content = resp.choices[0].message.content.as_deref().unwrap();
    assert!(content.starts_with("Blocked unsafe tool call"));
    assert!(content.contains("sensitive_path"));
}

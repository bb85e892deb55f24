// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! The seam between the handler and the upstream.
//!
//! The handler only needs two operations — make sure a chat exists, and
//! stream one completion — so they live behind a trait.  Production uses
//! [`zproxy_upstream::UpstreamClient`]; tests use [`MockBackend`] with
//! scripted chunk sequences.

use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;
use futures::stream::BoxStream;

use zproxy_upstream::{SendMessageOptions, StreamChunk, UpstreamClient};

#[async_trait]
pub trait ChatBackend: Send + Sync {
    /// Return a chat id to append to, creating a chat when needed.
    async fn ensure_chat(&self, title: &str, model: &str) -> anyhow::Result<String>;

    /// Post one completion and stream the decoded chunks.  The stream
    /// always ends with exactly one `Done` or `Error`.
    async fn send(&self, opts: SendMessageOptions) -> BoxStream<'static, StreamChunk>;
}

#[async_trait]
impl ChatBackend for UpstreamClient {
    async fn ensure_chat(&self, title: &str, model: &str) -> anyhow::Result<String> {
        let chat = self.create_chat(title, model, None).await?;
        Ok(chat.id)
    }

    async fn send(&self, opts: SendMessageOptions) -> BoxStream<'static, StreamChunk> {
        self.send_message(opts).await
    }
}

/// Scripted backend for handler tests: each `send` pops the next chunk
/// script; every received request is recorded for assertions.
#[derive(Debug, Default)]
pub struct MockBackend {
    scripts: Mutex<VecDeque<Vec<StreamChunk>>>,
    requests: Mutex<Vec<SendMessageOptions>>,
}

impl MockBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convenience: a backend whose next completions answer with the given
    /// content strings.
    pub fn with_replies(replies: &[&str]) -> Self {
        let backend = Self::new();
        for reply in replies {
            backend.push_script(vec![
                StreamChunk::Content(reply.to_string()),
                StreamChunk::Done,
            ]);
        }
        backend
    }

    /// Queue the chunk sequence for the next `send`.
    pub fn push_script(&self, chunks: Vec<StreamChunk>) {
        self.scripts.lock().unwrap().push_back(chunks);
    }

    /// Requests observed so far, in order.
    pub fn requests(&self) -> Vec<SendMessageOptions> {
        self.requests.lock().unwrap().clone()
    }

    pub fn request_count(&self) -> usize {
        self.requests.lock().unwrap().len()
    }
}

#[async_trait]
impl ChatBackend for MockBackend {
    async fn ensure_chat(&self, _title: &str, _model: &str) -> anyhow::Result<String> {
        Ok("mock-chat".into())
    }

    async fn send(&self, opts: SendMessageOptions) -> BoxStream<'static, StreamChunk> {
        self.requests.lock().unwrap().push(opts);
        let chunks = self
            .scripts
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| vec![StreamChunk::Error("mock script exhausted".into())]);
        Box::pin(futures::stream::iter(chunks))
    }
}

// ─── Unit tests ──────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn mock_replays_scripts_in_order() {
        let backend = MockBackend::with_replies(&["first", "second"]);
        let chunks: Vec<StreamChunk> = backend
            .send(SendMessageOptions::default())
            .await
            .collect()
            .await;
        assert_eq!(
            chunks,
            vec![StreamChunk::Content("first".into()), StreamChunk::Done]
        );
        let chunks: Vec<StreamChunk> = backend
            .send(SendMessageOptions::default())
            .await
            .collect()
            .await;
        assert_eq!(chunks[0], StreamChunk::Content("second".into()));
    }

    #[tokio::test]
    async fn exhausted_mock_reports_an_error_chunk() {
        let backend = MockBackend::new();
        let chunks: Vec<StreamChunk> = backend
            .send(SendMessageOptions::default())
            .await
            .collect()
            .await;
        assert!(matches!(chunks[0], StreamChunk::Error(_)));
    }

    #[tokio::test]
    async fn mock_records_requests() {
        let backend = MockBackend::with_replies(&["x"]);
        let mut opts = SendMessageOptions::default();
        opts.model = "glm-4.7".into();
        backend.send(opts).await;
        assert_eq!(backend.request_count(), 1);
        assert_eq!(backend.requests()[0].model, "glm-4.7");
    }

    #[tokio::test]
    async fn ensure_chat_returns_the_mock_id() {
        let backend = MockBackend::new();
        assert_eq!(backend.ensure_chat("t", "m").await.unwrap(), "mock-chat");
    }
}

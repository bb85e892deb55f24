// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
//! The proxy core: OpenAI wire types, the context compactor, per-process
//! session state, the chat-backend seam, and the request handler that
//! orchestrates planner, guard, and upstream into OpenAI-shaped replies.

pub mod backend;
pub mod compact;
pub mod dump;
pub mod handler;
pub mod openai;
pub mod session;

pub use backend::{ChatBackend, MockBackend};
pub use compact::Compactor;
pub use handler::{ContextStats, Handler, HandlerResponse, ReplyBody};
pub use openai::{
    ChatCompletionChunk, ChatCompletionRequest, ChatCompletionResponse, ChatMessage,
    FunctionCallOut, ToolCallOut, Usage,
};
pub use session::SessionState;

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
//! Client side of the upstream chat service: request signing, bearer-token
//! decoding, the JSON+SSE wire protocol, the streaming response parser, and
//! the parent-pointer history linearizer.

mod chunk;
mod client;
mod error;
mod history;
mod signature;
mod stream;
mod token;

pub use chunk::StreamChunk;
pub use client::{Chat, SendMessageOptions, UpstreamClient};
pub use error::UpstreamError;
pub use history::{linearize, HistoryMessage};
pub use signature::{sign_request, RequestSignature};
pub use stream::StreamParser;
pub use token::user_id_from_token;

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: Apache-2.0
pub mod schema;
mod env;
mod token_store;

pub use env::from_env;
pub use schema::{
    Config, ContextConfig, ProxyConfig, ServerConfig, UpstreamConfig, WorkspaceConfig,
};
pub use token_store::{load_saved_token, save_token, token_file_path};

// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
use clap::{Parser, Subcommand};

#[derive(Parser, Debug)]
#[command(
    name = "zproxy",
    version,
    about = "OpenAI-compatible tool-calling proxy for the Z.ai GLM web chat API",
    long_about = "Runs a local OpenAI-compatible /v1/chat/completions endpoint that brokers \
                  requests into the Z.ai web chat API, including tool-call planning and a \
                  safety guard for file and shell tools."
)]
pub struct Cli {
    /// Verbose logging to stderr (equivalent to RUST_LOG=debug)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Run the HTTP proxy (the default when no subcommand is given)
    Serve,
    /// Show the effective configuration, or save a bearer token
    Config {
        /// Save this bearer token to the config file and exit
        #[arg(long)]
        token: Option<String>,
    },
    /// List chats stored on the upstream
    Chats {
        #[arg(long, default_value_t = 1)]
        page: u32,
    },
    /// Create a new upstream chat
    New {
        /// Chat title
        title: String,
    },
    /// Print a chat's linearized history
    Chat {
        /// Upstream chat id
        id: String,
    },
    /// Show the identity behind the configured token
    Whoami,
}

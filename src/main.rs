// Copyright (c) 2024-2026 Martin Schröder <info@swedishembedded.com>
//
// SPDX-License-Identifier: MIT
mod cli;

use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tracing_subscriber::{filter::EnvFilter, fmt, prelude::*};

use cli::{Cli, Commands};
use zproxy_upstream::{linearize, UpstreamClient};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = zproxy_config::from_env();

    match cli.command.unwrap_or(Commands::Serve) {
        Commands::Serve => {
            let client = UpstreamClient::new(&config.upstream)
                .context("upstream client setup failed")?;
            let backend: Arc<dyn zproxy_core::ChatBackend> = Arc::new(client);
            zproxy_server::serve(config, backend).await
        }
        Commands::Config { token } => run_config(token),
        Commands::Chats { page } => {
            let client = UpstreamClient::new(&config.upstream)?;
            let chats = client.list_chats(page).await?;
            if chats.is_empty() {
                println!("(no chats on page {page})");
            }
            for chat in chats {
                println!("{}  {}  [{}]", chat.id, chat.title, chat.models.join(", "));
            }
            Ok(())
        }
        Commands::New { title } => {
            let client = UpstreamClient::new(&config.upstream)?;
            let chat = client
                .create_chat(&title, &config.upstream.model, None)
                .await?;
            println!("{}", chat.id);
            Ok(())
        }
        Commands::Chat { id } => {
            let client = UpstreamClient::new(&config.upstream)?;
            let chat = client.get_chat(&id).await?;
            let history = chat
                .get("chat")
                .map(|c| c["history"].clone())
                .filter(|h| !h.is_null())
                .unwrap_or_else(|| chat["history"].clone());
            let (messages, _) = linearize(&history);
            if messages.is_empty() {
                println!("(empty chat)");
            }
            for msg in messages {
                println!("[{}] {}", msg.role, msg.content);
            }
            Ok(())
        }
        Commands::Whoami => {
            let client = UpstreamClient::new(&config.upstream)?;
            let settings = client.get_user_settings().await?;
            print_identity(&settings);
            Ok(())
        }
    }
}

fn run_config(token: Option<String>) -> anyhow::Result<()> {
    if let Some(token) = token {
        let path = zproxy_config::save_token(&token)?;
        println!("token saved to {}", path.display());
        return Ok(());
    }
    // Re-resolve with the token redacted; the config itself is not a secret.
    let mut config = zproxy_config::from_env();
    if config.upstream.token.is_some() {
        config.upstream.token = Some("<redacted>".into());
    }
    println!("{}", serde_json::to_string_pretty(&config)?);
    Ok(())
}

/// Print whoami output; a guest-labelled identity means the upstream did
/// not accept the token.
fn print_identity(settings: &serde_json::Value) {
    let user = settings.get("user").unwrap_or(settings);
    let name = user["name"].as_str().unwrap_or("(unknown)");
    let email = user["email"].as_str().unwrap_or("");
    let role = user["role"].as_str().unwrap_or("");
    let guest = role.eq_ignore_ascii_case("guest") || name.eq_ignore_ascii_case("guest");
    if guest {
        println!("guest (token not accepted — run `zproxy config --token <token>`)");
    } else if email.is_empty() {
        println!("{name}");
    } else {
        println!("{name} <{email}>");
    }
}

/// Tracing to stderr; default level info, `--verbose` switches to debug.
/// `RUST_LOG` overrides both.
fn init_logging(verbose: bool) {
    let default = if verbose { "zproxy=debug,info" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::registry()
        .with(filter)
        .with(fmt::layer().with_writer(std::io::stderr))
        .init();
}

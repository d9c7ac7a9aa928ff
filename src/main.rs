//! zero-mail-agent: per-mailbox AI webmail agent
//!
//! Hosts one agent per configured mailbox. Each agent keeps a local SQLite
//! thread cache synced from its IMAP account, answers mail operations over
//! MCP and streams chat replies to browsers over a WebSocket.
//!
//! # Architecture
//!
//! - [`main`]: Process entry point with env loading and the two serve modes
//! - [`config`]: Environment-driven configuration for mailboxes and policies
//! - [`errors`]: Application error model with MCP error mapping
//! - [`agent`]: Per-mailbox agent and the registry running background sync
//! - [`sync`]: Paginated folder sync guarded by [`single_flight`]
//! - [`reader`]: Cache-first thread reads with one sync-then-retry on miss
//! - [`cache`]: SQLite thread metadata and chat history
//! - [`blobs`]: Full thread bodies on disk
//! - [`upstream`]: Mail provider contract; [`imap_provider`] implements it
//!   over [`imap`] and [`smtp`]
//! - [`chat`]: Chat model streaming and cancellable chat requests
//! - [`protocol`]: WebSocket chat envelope
//! - [`server`]: MCP tool handlers with validation
//! - [`http`]: Health, chat WebSocket and MCP streamable HTTP routes

mod agent;
mod blobs;
mod cache;
mod chat;
mod config;
mod errors;
mod http;
mod imap;
mod imap_provider;
mod mime;
mod models;
mod protocol;
mod reader;
mod retry;
mod server;
mod single_flight;
mod smtp;
mod sync;
#[cfg(test)]
mod testing;
mod thread_id;
mod upstream;

use std::sync::Arc;

use clap::{Parser, Subcommand};
use config::ServerConfig;
use rmcp::ServiceExt;
use rmcp::transport::stdio;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

use crate::agent::AgentRegistry;
use crate::server::ZeroMailServer;

#[derive(Debug, Parser)]
#[command(name = "zero-mail-agent", version, about = "Per-mailbox AI webmail agent")]
struct Cli {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Serve HTTP: health, chat WebSocket and MCP at /mcp; runs background sync
    Serve {
        /// Socket address to bind (overrides ZERO_MAIL_HTTP_BIND)
        #[arg(long)]
        bind: Option<String>,
    },
    /// Serve MCP over stdio (default)
    Stdio,
}

/// Application entry point
///
/// Initializes tracing from environment, loads config and builds one agent
/// per mailbox, then serves either MCP over stdio or the HTTP surface.
///
/// # Environment Variables
///
/// See [`ServerConfig::load_from_env`] for full configuration options.
///
/// # Example
///
/// ```no_run
/// ZERO_MAIL_DEFAULT_IMAP_HOST=imap.example.com \
/// ZERO_MAIL_DEFAULT_USER=user@example.com \
/// ZERO_MAIL_DEFAULT_PASS=secret \
/// cargo run -- serve --bind 127.0.0.1:8787
/// ```
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = Arc::new(ServerConfig::load_from_env()?);
    let agents = Arc::new(AgentRegistry::from_config(&config)?);
    server::attach_chat_tools(&config, &agents);
    let mcp = ZeroMailServer::new(Arc::clone(&config), Arc::clone(&agents));

    match cli.command.unwrap_or(Command::Stdio) {
        Command::Stdio => {
            let service = mcp.serve(stdio()).await?;
            service.waiting().await?;
        }
        Command::Serve { bind } => {
            let bind = bind.unwrap_or_else(|| config.http_bind.clone());
            let loops = agents.spawn_sync_loops(&config.sync.folders, config.sync.interval);

            let shutdown = CancellationToken::new();
            let signal = shutdown.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("shutdown requested");
                }
                signal.cancel();
            });

            http::serve(&bind, http::router(Arc::clone(&agents), mcp), shutdown).await?;
            agents.shutdown();
            for handle in loops {
                let _ = handle.await;
            }
        }
    }
    Ok(())
}

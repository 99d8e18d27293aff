//! `courtchat-server`: serves conversation history over HTTP and live
//! rooms over WebSocket from an in-memory message log.
//!
//! ```bash
//! cargo run --bin courtchat-server -- --bind 127.0.0.1:8080 --max-page-size 50
//! ```
//!
//! Ctrl-C closes every live socket before exiting, so clients see a close
//! frame and start reconnecting.

use std::process::ExitCode;
use std::sync::Arc;

use clap::Parser;
use courtchat_server::config::{ServerCliArgs, ServerConfig};
use courtchat_server::server::{self, ServerState};

#[tokio::main]
async fn main() -> ExitCode {
    let cli = ServerCliArgs::parse();
    let config = match ServerConfig::load(&cli) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("courtchat-server: {e}");
            return ExitCode::FAILURE;
        }
    };

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let state = Arc::new(ServerState::with_config(&config));
    let (addr, serving) = match server::start_server_with_state(&config.bind_addr, Arc::clone(&state)).await {
        Ok(bound) => bound,
        Err(e) => {
            tracing::error!(bind = %config.bind_addr, error = %e, "cannot listen");
            return ExitCode::FAILURE;
        }
    };
    tracing::info!(
        %addr,
        default_page_size = config.pages.default_size(),
        max_page_size = config.pages.max_size(),
        "history on /api/messages/{{conversation}}, live rooms on /ws/chat"
    );

    tokio::select! {
        finished = serving => {
            if let Err(e) = finished {
                tracing::error!(error = %e, "server task ended abnormally");
                return ExitCode::FAILURE;
            }
        }
        _ = tokio::signal::ctrl_c() => {
            tracing::info!("interrupted, closing live rooms");
            state.close_all_connections().await;
        }
    }
    ExitCode::SUCCESS
}

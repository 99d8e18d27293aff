//! `CourtChat` line client.
//!
//! Opens one conversation and prints it as it changes. Lines typed on
//! stdin are sent as messages; lines starting with `/` are commands.
//! Configuration via CLI flags, environment variables, or config file
//! (`~/.config/courtchat/config.toml`).
//!
//! ```bash
//! cargo run --bin courtchat -- \
//!     --history-url http://127.0.0.1:8080/api/messages \
//!     --live-url ws://127.0.0.1:8080/ws/chat \
//!     --user-id 7 --user-name sam --conversation 1
//! ```

use std::collections::HashMap;
use std::path::Path;

use clap::Parser;
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing_appender::non_blocking::WorkerGuard;

use courtchat::actor::{ConversationHandle, ConversationSnapshot};
use courtchat::config::{CliArgs, ClientConfig, ConfigError};
use courtchat::connection::ConnectionState;
use courtchat::registry::ConversationRegistry;
use courtchat::stream::{Delivery, LocalId, StreamEntry};
use courtchat_proto::message::ConversationId;

const HELP: &str = "commands: /older /refresh /connect /failed /resend <n> /quit";

#[tokio::main]
async fn main() {
    let cli = CliArgs::parse();

    let config = match ClientConfig::load(&cli) {
        Ok(c) => c,
        Err(e @ ConfigError::Zero { .. }) => {
            eprintln!("Invalid configuration: {e}");
            std::process::exit(2);
        }
        Err(e) => {
            eprintln!("Warning: failed to load config file: {e}");
            ClientConfig::default()
        }
    };

    // Logs go to a file so they don't interleave with the conversation.
    let _log_guard = init_logging(&cli.log_level, cli.log_file.as_deref());
    tracing::info!("courtchat starting");

    let Some(conversation) = config.conversation.map(ConversationId::new) else {
        eprintln!("No conversation given (--conversation)");
        std::process::exit(2);
    };
    let registry = match ConversationRegistry::from_config(&config) {
        Ok(r) => r,
        Err(e) => {
            eprintln!("Cannot start: {e}");
            std::process::exit(2);
        }
    };

    let handle = registry.open(conversation).await;
    println!("conversation {conversation} ({HELP})");
    run(&handle).await;

    registry.close_all().await;
    tracing::info!("courtchat exiting");
}

/// Initialize file-based logging.
///
/// Returns a [`WorkerGuard`] that must be held until shutdown so buffered
/// entries are flushed.
fn init_logging(level: &str, file_path: Option<&Path>) -> Option<WorkerGuard> {
    let default_path = std::env::temp_dir().join("courtchat.log");
    let log_path = file_path.unwrap_or(&default_path);

    let log_dir = log_path.parent()?;
    let file_name = log_path.file_name()?.to_str()?;

    let file_appender = tracing_appender::rolling::never(log_dir, file_name);
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    tracing_subscriber::fmt()
        .with_writer(non_blocking)
        .with_env_filter(env_filter)
        .with_ansi(false)
        .init();

    Some(guard)
}

/// Interleave stdin commands with snapshot printing until `/quit` or EOF.
async fn run(handle: &ConversationHandle) {
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    let mut snapshots = handle.subscribe();
    let mut view = View::default();
    view.render(&handle.snapshot());

    loop {
        tokio::select! {
            changed = snapshots.changed() => {
                if changed.is_err() {
                    println!("session closed");
                    return;
                }
                let snapshot = std::sync::Arc::clone(&*snapshots.borrow_and_update());
                view.render(&snapshot);
            }
            line = lines.next_line() => {
                let Ok(Some(line)) = line else { return };
                if !execute(handle, &view, line.trim()).await {
                    return;
                }
            }
        }
    }
}

/// Run one input line. Returns `false` to quit.
async fn execute(handle: &ConversationHandle, view: &View, line: &str) -> bool {
    let mut words = line.split_whitespace();
    match words.next() {
        None => {}
        Some("/quit") => return false,
        Some("/older") => match handle.load_older().await {
            Ok(outcome) if outcome.added == 0 && !outcome.has_more => {
                println!("-- beginning of conversation --");
            }
            Ok(outcome) => println!("-- loaded {} older messages --", outcome.added),
            Err(e) => println!("!! {e}"),
        },
        Some("/refresh") => {
            if let Err(e) = handle.refresh().await {
                println!("!! {e}");
            }
        }
        Some("/connect") => {
            if let Err(e) = handle.connect().await {
                println!("!! {e}");
            }
        }
        Some("/failed") => {
            for (n, entry) in view.failed.iter().enumerate() {
                println!("  [{}] {}", n + 1, entry.message.content);
            }
        }
        Some("/resend") => {
            let target = words
                .next()
                .and_then(|n| n.parse::<usize>().ok())
                .and_then(|n| n.checked_sub(1))
                .and_then(|n| view.failed.get(n));
            match target {
                Some(entry) => {
                    if let Err(e) = handle.resend(entry.local_id).await {
                        println!("!! {e}");
                    }
                }
                None => println!("!! no such failed message (see /failed)"),
            }
        }
        Some(command) if command.starts_with('/') => println!("{HELP}"),
        Some(_) => {
            if let Err(e) = handle.send(line).await {
                println!("!! {e}");
            }
        }
    }
    true
}

/// What has already been printed.
#[derive(Default)]
struct View {
    shown: HashMap<LocalId, Delivery>,
    state: Option<ConnectionState>,
    failed: Vec<StreamEntry>,
}

impl View {
    fn render(&mut self, snapshot: &ConversationSnapshot) {
        if self.state.as_ref() != Some(&snapshot.state) {
            println!("-- {} --", snapshot.state);
            self.state = Some(snapshot.state.clone());
        }
        for entry in &snapshot.entries {
            let previous = self.shown.insert(entry.local_id, entry.delivery.clone());
            match (previous, &entry.delivery) {
                (None, _) => println!("{}", line_for(entry)),
                (Some(before), now) if &before != now => {
                    if let Delivery::Failed { reason } = now {
                        println!("!! not delivered ({reason}): {}", entry.message.content);
                    }
                }
                _ => {}
            }
        }
        self.failed = snapshot.failed().cloned().collect();
    }
}

fn line_for(entry: &StreamEntry) -> String {
    let time = entry
        .message
        .timestamp
        .map(|ts| ts.as_datetime().format("%H:%M").to_string())
        .unwrap_or_default();
    let marker = match entry.delivery {
        Delivery::Confirmed => "",
        Delivery::Sending => " (sending)",
        Delivery::Failed { .. } => " (failed)",
    };
    format!(
        "{time} {}: {}{marker}",
        entry.message.sender_name, entry.message.content
    )
}

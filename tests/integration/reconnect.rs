//! Integration tests for losing and regaining the live channel.
//!
//! Run with: `cargo test --test reconnect`

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use courtchat::actor::{ConversationHandle, ConversationSnapshot};
use courtchat::config::{ClientConfig, ConnectionConfig};
use courtchat::connection::ConnectionState;
use courtchat::error::ChatError;
use courtchat::registry::ConversationRegistry;
use courtchat_proto::message::{ConversationId, Message, SenderId};
use courtchat_server::server::{self, ServerState};

const CONV: ConversationId = ConversationId::new(30);

fn client_config(addr: std::net::SocketAddr) -> ClientConfig {
    ClientConfig {
        history_url: Some(format!("http://{addr}/api/messages")),
        live_url: Some(format!("ws://{addr}/ws/chat")),
        user_id: Some(1),
        user_name: Some("sam".into()),
        connection: ConnectionConfig {
            connect_timeout: Duration::from_secs(2),
            max_reconnect_attempts: 1,
            reconnect_delay: Duration::from_millis(200),
            ..ConnectionConfig::default()
        },
        ..ClientConfig::default()
    }
}

fn note(content: &str) -> Message {
    Message {
        id: None,
        conversation_id: CONV,
        sender_id: SenderId::new(8),
        sender_name: "pat".into(),
        content: content.into(),
        timestamp: None,
    }
}

async fn wait(
    handle: &ConversationHandle,
    predicate: impl FnMut(&ConversationSnapshot) -> bool,
) -> Arc<ConversationSnapshot> {
    tokio::time::timeout(Duration::from_secs(10), handle.wait_for(predicate))
        .await
        .expect("timed out waiting for snapshot")
        .expect("session closed")
}

fn assert_unique_ids(snapshot: &ConversationSnapshot) {
    let mut seen = HashSet::new();
    for entry in &snapshot.entries {
        if let Some(id) = entry.message.id {
            assert!(seen.insert(id), "duplicate message id {id}");
        }
    }
}

#[tokio::test]
async fn messages_sent_while_disconnected_are_caught_up() {
    let state = Arc::new(ServerState::new());
    let (addr, _server) = server::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();
    state.publish(note("before")).await;

    let registry = ConversationRegistry::from_config(&client_config(addr)).unwrap();
    let handle = registry.open(CONV).await;
    wait(&handle, |s| s.state == ConnectionState::Connected && s.entries.len() == 1).await;

    // Drop every socket, then post while the client is away.
    state.close_all_connections().await;
    wait(&handle, |s| s.state != ConnectionState::Connected).await;
    state.publish(note("while away")).await;

    let snapshot = wait(&handle, |s| {
        s.state == ConnectionState::Connected
            && s.entries.iter().any(|e| e.message.content == "while away")
    })
    .await;
    assert_unique_ids(&snapshot);

    // Live delivery still works on the new link, without duplicates.
    state.publish(note("after")).await;
    let snapshot = wait(&handle, |s| {
        s.entries.iter().any(|e| e.message.content == "after")
    })
    .await;
    let contents: Vec<&str> = snapshot
        .entries
        .iter()
        .map(|e| e.message.content.as_str())
        .collect();
    assert_eq!(contents, vec!["before", "while away", "after"]);
    assert_unique_ids(&snapshot);

    registry.close_all().await;
}

#[tokio::test]
async fn gives_up_when_server_is_gone() {
    let state = Arc::new(ServerState::new());
    let (addr, server) = server::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .unwrap();

    let registry = ConversationRegistry::from_config(&client_config(addr)).unwrap();
    let handle = registry.open(CONV).await;
    wait(&handle, |s| s.state == ConnectionState::Connected).await;

    // Stop accepting, then drop the open socket.
    server.abort();
    let _ = server.await;
    state.close_all_connections().await;

    let snapshot = wait(&handle, |s| matches!(s.state, ConnectionState::Failed { .. })).await;
    assert!(matches!(snapshot.state, ConnectionState::Failed { .. }));

    assert_eq!(handle.send("hello?").await, Err(ChatError::NotConnected));
    let failed: Vec<_> = handle.snapshot().failed().map(|e| e.local_id).collect();
    assert_eq!(failed.len(), 1);

    assert!(matches!(
        handle.connect().await,
        Err(ChatError::ConnectionFailed { .. })
    ));
    registry.close_all().await;
}

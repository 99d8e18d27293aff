//! Integration tests: one conversation end to end against the reference
//! server, over real HTTP and WebSocket links.
//!
//! Run with: `cargo test --test conversation_flow`

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::sync::Arc;
use std::time::Duration;

use courtchat::actor::{ConversationHandle, ConversationSnapshot};
use courtchat::config::ClientConfig;
use courtchat::connection::ConnectionState;
use courtchat::registry::ConversationRegistry;
use courtchat::stream::{Delivery, Origin};
use courtchat_proto::message::{ConversationId, Message, SenderId, Timestamp};
use courtchat_server::server::{self, ServerState};

const CONV: ConversationId = ConversationId::new(12);

// =============================================================================
// Helpers
// =============================================================================

async fn start_server(seed: i64) -> (std::net::SocketAddr, Arc<ServerState>) {
    let state = Arc::new(ServerState::new());
    for i in 1..=seed {
        state
            .publish(Message {
                id: None,
                conversation_id: CONV,
                sender_id: SenderId::new(99),
                sender_name: "coach".into(),
                content: format!("history {i}"),
                timestamp: Timestamp::from_millis(1_700_000_000_000 + i * 1000),
            })
            .await;
    }
    let (addr, _handle) = server::start_server_with_state("127.0.0.1:0", Arc::clone(&state))
        .await
        .expect("server start");
    (addr, state)
}

fn client_config(addr: std::net::SocketAddr, user_id: i64) -> ClientConfig {
    ClientConfig {
        history_url: Some(format!("http://{addr}/api/messages")),
        live_url: Some(format!("ws://{addr}/ws/chat")),
        user_id: Some(user_id),
        user_name: Some(format!("player {user_id}")),
        ..ClientConfig::default()
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

fn contents(snapshot: &ConversationSnapshot) -> Vec<String> {
    snapshot
        .entries
        .iter()
        .map(|e| e.message.content.clone())
        .collect()
}

// =============================================================================
// Tests
// =============================================================================

#[tokio::test]
async fn opening_loads_newest_page_and_backfills() {
    let (addr, _state) = start_server(25).await;
    let registry = ConversationRegistry::from_config(&client_config(addr, 1)).unwrap();
    let handle = registry.open(CONV).await;

    let snapshot = wait(&handle, |s| {
        s.state == ConnectionState::Connected && s.entries.len() == 20
    })
    .await;
    assert!(snapshot.has_more);
    assert_eq!(contents(&snapshot).first().unwrap(), "history 6");
    assert_eq!(contents(&snapshot).last().unwrap(), "history 25");
    assert!(snapshot.entries.iter().all(|e| e.origin == Origin::History));

    let outcome = handle.load_older().await.unwrap();
    assert_eq!(outcome.added, 5);
    assert!(!outcome.has_more);
    assert_eq!(
        outcome.anchor.and_then(|a| a.message_id),
        snapshot.entries[0].message.id
    );

    let all = handle.snapshot();
    let expected: Vec<String> = (1..=25).map(|i| format!("history {i}")).collect();
    assert_eq!(contents(&all), expected);

    let again = handle.load_older().await.unwrap();
    assert_eq!(again.added, 0);
    registry.close_all().await;
}

#[tokio::test]
async fn send_is_confirmed_and_reaches_other_clients() {
    let (addr, state) = start_server(3).await;
    let alice = ConversationRegistry::from_config(&client_config(addr, 1)).unwrap();
    let bob = ConversationRegistry::from_config(&client_config(addr, 2)).unwrap();
    let alice_handle = alice.open(CONV).await;
    let bob_handle = bob.open(CONV).await;
    wait(&alice_handle, |s| s.state == ConnectionState::Connected && s.entries.len() == 3).await;
    wait(&bob_handle, |s| s.state == ConnectionState::Connected && s.entries.len() == 3).await;

    let local_id = alice_handle.send("court 2 is free").await.unwrap();

    let confirmed = wait(&alice_handle, |s| {
        s.entries
            .iter()
            .any(|e| e.local_id == local_id && e.delivery == Delivery::Confirmed)
    })
    .await;
    assert_eq!(confirmed.entries.len(), 4, "echo must replace the optimistic entry");
    let entry = confirmed.entries.last().unwrap();
    assert_eq!(entry.local_id, local_id);
    assert!(entry.message.id.is_some());
    assert_eq!(entry.message.sender_id, SenderId::new(1));

    let seen = wait(&bob_handle, |s| s.entries.len() == 4).await;
    let received = seen.entries.last().unwrap();
    assert_eq!(received.message.content, "court 2 is free");
    assert_eq!(received.message.id, entry.message.id);
    assert_eq!(received.origin, Origin::Live);

    assert_eq!(state.log.len(CONV).await, 4);
    alice.close_all().await;
    bob.close_all().await;
}

#[tokio::test]
async fn refresh_after_activity_has_no_duplicates() {
    let (addr, state) = start_server(5).await;
    let registry = ConversationRegistry::from_config(&client_config(addr, 1)).unwrap();
    let handle = registry.open(CONV).await;
    wait(&handle, |s| s.state == ConnectionState::Connected && s.entries.len() == 5).await;

    state
        .publish(Message {
            id: None,
            conversation_id: CONV,
            sender_id: SenderId::new(3),
            sender_name: "ref".into(),
            content: "live one".into(),
            timestamp: None,
        })
        .await;
    wait(&handle, |s| s.entries.len() == 6).await;

    let outcome = handle.refresh().await.unwrap();
    assert_eq!(outcome.added, 6);
    let snapshot = handle.snapshot();
    assert_eq!(snapshot.entries.len(), 6);
    assert_eq!(contents(&snapshot).last().unwrap(), "live one");
    registry.close_all().await;
}

#[tokio::test]
async fn blank_send_is_rejected_locally() {
    let (addr, state) = start_server(0).await;
    let registry = ConversationRegistry::from_config(&client_config(addr, 1)).unwrap();
    let handle = registry.open(CONV).await;
    wait(&handle, |s| s.state == ConnectionState::Connected).await;

    assert!(handle.send("   ").await.is_err());
    assert!(handle.snapshot().entries.is_empty());
    assert_eq!(state.log.len(CONV).await, 0);
    registry.close_all().await;
}

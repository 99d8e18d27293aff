//! Server core: shared state, the history endpoint and live conversation
//! rooms.
//!
//! `GET /api/messages/{conversation}?page=&size=` serves history windows.
//! `GET /ws/chat?locationId=` upgrades to a WebSocket subscribed to one
//! conversation. Every text frame a client sends is validated, stored with
//! a fresh id and timestamp, and broadcast to every socket in the room,
//! the sender included, so senders can confirm delivery from the echo.

use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use axum::extract::ws::{Message as WsMessage, WebSocket};
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::{RwLock, mpsc};

use courtchat_proto::codec;
use courtchat_proto::message::{ConversationId, Message};

use crate::config::{PageLimits, ServerConfig};
use crate::store::MessageLog;

type Room = HashMap<u64, mpsc::UnboundedSender<WsMessage>>;

/// Shared server state: the message log and the live rooms.
pub struct ServerState {
    /// Stored messages.
    pub log: MessageLog,
    rooms: RwLock<HashMap<ConversationId, Room>>,
    next_socket: AtomicU64,
    pages: PageLimits,
}

impl Default for ServerState {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerState {
    /// Creates state with an empty log and default page limits.
    #[must_use]
    pub fn new() -> Self {
        Self::with_limits(PageLimits::default())
    }

    /// Creates state with the page limits of a resolved [`ServerConfig`].
    #[must_use]
    pub fn with_config(config: &ServerConfig) -> Self {
        Self::with_limits(config.pages)
    }

    fn with_limits(pages: PageLimits) -> Self {
        Self {
            log: MessageLog::new(),
            rooms: RwLock::new(HashMap::new()),
            next_socket: AtomicU64::new(1),
            pages,
        }
    }

    /// Number of sockets subscribed to `conversation`.
    pub async fn subscribers(&self, conversation: ConversationId) -> usize {
        let rooms = self.rooms.read().await;
        rooms.get(&conversation).map_or(0, HashMap::len)
    }

    /// Store `message` and broadcast the stored form to its room.
    ///
    /// Used by the socket handler and for seeding from outside.
    pub async fn publish(&self, message: Message) -> Message {
        let stored = self.log.append(message).await;
        match codec::encode(&stored) {
            Ok(text) => {
                let rooms = self.rooms.read().await;
                if let Some(room) = rooms.get(&stored.conversation_id) {
                    for sender in room.values() {
                        let _ = sender.send(WsMessage::Text(text.clone().into()));
                    }
                }
            }
            Err(e) => tracing::error!(error = %e, "failed to encode stored message"),
        }
        stored
    }

    /// Send a Close frame to every connected socket.
    ///
    /// Clients see their link drop. Useful for tests and shutdown.
    pub async fn close_all_connections(&self) {
        let rooms = self.rooms.read().await;
        for (conversation, room) in rooms.iter() {
            tracing::info!(conversation = %conversation, sockets = room.len(), "closing room");
            for sender in room.values() {
                let _ = sender.send(WsMessage::Close(None));
            }
        }
    }

    async fn join(&self, conversation: ConversationId, sender: mpsc::UnboundedSender<WsMessage>) -> u64 {
        let socket_id = self.next_socket.fetch_add(1, Ordering::Relaxed);
        let mut rooms = self.rooms.write().await;
        rooms.entry(conversation).or_default().insert(socket_id, sender);
        socket_id
    }

    async fn leave(&self, conversation: ConversationId, socket_id: u64) {
        let mut rooms = self.rooms.write().await;
        if let Some(room) = rooms.get_mut(&conversation) {
            room.remove(&socket_id);
            if room.is_empty() {
                rooms.remove(&conversation);
            }
        }
    }
}

/// Query string of the history endpoint.
#[derive(Debug, serde::Deserialize)]
struct PageQuery {
    page: Option<u32>,
    size: Option<u32>,
}

/// Query string of the live endpoint.
#[derive(Debug, serde::Deserialize)]
struct LiveQuery {
    #[serde(rename = "locationId", alias = "conversationId")]
    conversation: i64,
}

async fn history_handler(
    State(state): State<Arc<ServerState>>,
    Path(conversation): Path<i64>,
    Query(query): Query<PageQuery>,
) -> impl IntoResponse {
    let conversation = ConversationId::new(conversation);
    let page = query.page.unwrap_or(0);
    let size = state.pages.size_for(query.size);
    let body = state.log.page(conversation, page, size).await;
    tracing::debug!(
        conversation = %conversation,
        page,
        size,
        returned = body.content.len(),
        "history request"
    );
    match codec::encode_page(&body) {
        Ok(text) => (StatusCode::OK, [(header::CONTENT_TYPE, "application/json")], text),
        Err(e) => {
            tracing::error!(error = %e, "failed to encode history page");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                [(header::CONTENT_TYPE, "text/plain")],
                e.to_string(),
            )
        }
    }
}

async fn live_handler(
    ws: axum::extract::ws::WebSocketUpgrade,
    State(state): State<Arc<ServerState>>,
    Query(query): Query<LiveQuery>,
) -> impl IntoResponse {
    let conversation = ConversationId::new(query.conversation);
    ws.on_upgrade(move |socket| handle_socket(socket, state, conversation))
}

/// Runs one subscribed socket until either side closes.
pub async fn handle_socket(socket: WebSocket, state: Arc<ServerState>, conversation: ConversationId) {
    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();
    let socket_id = state.join(conversation, tx.clone()).await;
    tracing::info!(conversation = %conversation, socket_id, "socket joined");

    let mut write_task = tokio::spawn(async move {
        while let Some(msg) = rx.recv().await {
            let closing = matches!(msg, WsMessage::Close(_));
            if ws_sender.send(msg).await.is_err() {
                tracing::warn!(socket_id, "WebSocket write failed");
                break;
            }
            if closing {
                break;
            }
        }
    });

    let reader_state = Arc::clone(&state);
    let mut read_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = ws_receiver.next().await {
            match msg {
                WsMessage::Text(text) => {
                    handle_text(&reader_state, conversation, socket_id, text.as_str()).await;
                }
                WsMessage::Ping(payload) => {
                    let _ = tx.send(WsMessage::Pong(payload));
                }
                WsMessage::Close(_) => {
                    tracing::debug!(socket_id, "received close frame");
                    break;
                }
                WsMessage::Binary(_) | WsMessage::Pong(_) => {}
            }
        }
    });

    tokio::select! {
        _ = &mut read_task => {
            write_task.abort();
        }
        _ = &mut write_task => {
            read_task.abort();
        }
    }

    state.leave(conversation, socket_id).await;
    tracing::info!(conversation = %conversation, socket_id, "socket left");
}

/// Validate, store and broadcast one chat frame.
async fn handle_text(state: &ServerState, conversation: ConversationId, socket_id: u64, text: &str) {
    let mut message = match codec::decode(text) {
        Ok(m) => m,
        Err(e) => {
            tracing::warn!(socket_id, error = %e, "dropping malformed frame");
            return;
        }
    };
    if let Err(e) = message.validate() {
        tracing::warn!(socket_id, error = %e, "dropping invalid message");
        return;
    }
    if message.conversation_id != conversation {
        tracing::warn!(
            socket_id,
            claimed = %message.conversation_id,
            subscribed = %conversation,
            "message for another conversation; using the subscribed one"
        );
    }
    // Ids and timestamps are the server's to assign.
    message.conversation_id = conversation;
    message.id = None;
    message.timestamp = None;
    let stored = state.publish(message).await;
    tracing::debug!(
        socket_id,
        conversation = %conversation,
        id = ?stored.id,
        "message stored and broadcast"
    );
}

/// Starts the server on `addr` with a fresh [`ServerState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server(
    addr: &str,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    start_server_with_state(addr, Arc::new(ServerState::new())).await
}

/// Starts the server with a pre-built [`ServerState`].
///
/// # Errors
///
/// Returns an error if the TCP listener cannot bind to the given address.
pub async fn start_server_with_state(
    addr: &str,
    state: Arc<ServerState>,
) -> Result<
    (std::net::SocketAddr, tokio::task::JoinHandle<()>),
    Box<dyn std::error::Error + Send + Sync>,
> {
    let app = axum::Router::new()
        .route("/api/messages/{conversation}", axum::routing::get(history_handler))
        .route("/ws/chat", axum::routing::get(live_handler))
        .with_state(state);

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let bound_addr = listener.local_addr()?;

    let handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            tracing::error!(error = %e, "server error");
        }
    });

    Ok((bound_addr, handle))
}

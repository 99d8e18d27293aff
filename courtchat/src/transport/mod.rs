//! Live-channel transport abstraction.
//!
//! A [`Connector`] opens one duplex link per conversation and hands back a
//! [`LiveLink`]: an outbound frame sender, an inbound frame receiver and a
//! guard that owns the background pump tasks. Implementations:
//! - [`websocket::WebSocketConnector`]: the production WebSocket channel
//! - [`loopback::LoopbackConnector`]: in-process channels for tests

pub mod loopback;
pub mod websocket;

use std::future::Future;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use courtchat_proto::message::ConversationId;

/// One unit on the live channel.
///
/// Ping and pong carry no payload; the transport only uses them as
/// liveness probes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// UTF-8 text (a JSON-encoded message).
    Text(String),
    /// Binary data. Not part of the chat protocol.
    Binary(Vec<u8>),
    /// Liveness probe.
    Ping,
    /// Liveness response.
    Pong,
    /// Orderly close.
    Close,
}

/// Errors that can occur while opening or using a live link.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// The link has been closed.
    #[error("connection closed")]
    ConnectionClosed,

    /// The operation timed out before completing.
    #[error("transport operation timed out")]
    Timeout,

    /// The endpoint refused the connection or could not be reached.
    #[error("endpoint {0} is unreachable")]
    Unreachable(String),

    /// An underlying I/O error occurred.
    #[error("transport I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The peer violated the transport protocol, or the endpoint is invalid.
    #[error("transport protocol error: {0}")]
    Protocol(String),
}

/// Opens live links for a conversation.
///
/// Each call produces an independent link. The caller owns the link and
/// drops it to tear the connection down.
pub trait Connector: Send + Sync + 'static {
    /// Open a live link subscribed to `conversation`.
    fn connect(
        &self,
        conversation: ConversationId,
    ) -> impl Future<Output = Result<LiveLink, TransportError>> + Send;
}

/// Aborts the transport's reader tasks when dropped.
///
/// Writer tasks are left to drain: they finish once every outbound sender
/// is gone, flushing any queued close frame first.
#[derive(Debug, Default)]
pub struct LinkGuard {
    tasks: Vec<JoinHandle<()>>,
}

impl LinkGuard {
    /// Wrap the reader tasks that belong to one link.
    #[must_use]
    pub const fn new(tasks: Vec<JoinHandle<()>>) -> Self {
        Self { tasks }
    }
}

impl Drop for LinkGuard {
    fn drop(&mut self) {
        for task in &self.tasks {
            task.abort();
        }
    }
}

/// An open duplex link.
#[derive(Debug)]
pub struct LiveLink {
    /// Frames queued for the remote end.
    pub outgoing: mpsc::UnboundedSender<Frame>,
    /// Frames (or the terminal error) read from the remote end.
    pub incoming: mpsc::Receiver<Result<Frame, TransportError>>,
    /// Keeps the pump tasks alive for the link's lifetime.
    pub guard: LinkGuard,
}

//! Errors surfaced at the conversation boundary.

use courtchat_proto::message::ValidationError;

use crate::stream::LocalId;

/// Error returned by [`crate::actor::ConversationHandle`] operations.
///
/// Variants carry owned strings so one outcome can be delivered to every
/// caller waiting on the same request.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ChatError {
    /// The live channel is not connected.
    #[error("not connected")]
    NotConnected,

    /// A history page could not be fetched. The cursor did not move.
    #[error("history fetch failed: {0}")]
    FetchFailed(String),

    /// Reconnection was exhausted; call `connect()` to try again.
    #[error("connection failed: {reason}")]
    ConnectionFailed {
        /// Last failure observed.
        reason: String,
    },

    /// A newer request replaced this one before it completed.
    #[error("superseded by a newer request")]
    Superseded,

    /// The conversation session has been closed.
    #[error("conversation session closed")]
    SessionClosed,

    /// The message could not be encoded for the wire.
    #[error("encode failed: {0}")]
    Encode(String),

    /// The message content was rejected before sending.
    #[error(transparent)]
    Validation(#[from] ValidationError),

    /// No resendable entry has this local id.
    #[error("no resendable entry {0}")]
    UnknownEntry(LocalId),
}

//! JSON encoding and decoding for the `CourtChat` wire protocol.
//!
//! Live frames are single JSON-encoded [`Message`] values. Client-to-server
//! frames omit `id` and `timestamp`; the server assigns both and echoes the
//! full message to every subscriber of the conversation.

use serde::Serialize;

use crate::history::{HistoryPage, PageBody, WirePage};
use crate::message::{ConversationId, Message, SenderId};

/// Error type for codec encode/decode operations.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    /// Serialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),
    /// The input was not a valid message or page.
    #[error("malformed frame: {0}")]
    Malformed(String),
}

/// Borrowed view of a [`Message`] without the server-assigned fields.
#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct OutboundMessage<'a> {
    conversation_id: ConversationId,
    sender_id: SenderId,
    #[serde(rename = "senderUserName")]
    sender_name: &'a str,
    content: &'a str,
}

/// Encodes a message with every present field (server echo form).
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the message cannot be serialized.
pub fn encode(message: &Message) -> Result<String, CodecError> {
    serde_json::to_string(message).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Encodes a client-to-server frame, leaving out `id` and `timestamp`.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the message cannot be serialized.
pub fn encode_outbound(message: &Message) -> Result<String, CodecError> {
    let outbound = OutboundMessage {
        conversation_id: message.conversation_id,
        sender_id: message.sender_id,
        sender_name: &message.sender_name,
        content: &message.content,
    };
    serde_json::to_string(&outbound).map_err(|e| CodecError::Serialization(e.to_string()))
}

/// Decodes one live frame into a [`Message`].
///
/// # Errors
///
/// Returns `CodecError::Malformed` if the text is not valid JSON or lacks a
/// required field.
pub fn decode(text: &str) -> Result<Message, CodecError> {
    serde_json::from_str(text).map_err(|e| CodecError::Malformed(e.to_string()))
}

/// Decodes a history response body.
///
/// Accepts the paged object form (`{"content": [...], "last": bool}`) and a
/// bare JSON array. For the bare form, `is_last` is inferred from whether
/// fewer than `requested_size` items came back.
///
/// # Errors
///
/// Returns `CodecError::Malformed` if the body matches neither form.
pub fn decode_page(text: &str, requested_size: u32) -> Result<HistoryPage, CodecError> {
    let wire: WirePage =
        serde_json::from_str(text).map_err(|e| CodecError::Malformed(e.to_string()))?;
    Ok(wire.into_page(requested_size))
}

/// Encodes a history response body in the paged object form.
///
/// # Errors
///
/// Returns `CodecError::Serialization` if the page cannot be serialized.
pub fn encode_page(page: &PageBody) -> Result<String, CodecError> {
    serde_json::to_string(page).map_err(|e| CodecError::Serialization(e.to_string()))
}

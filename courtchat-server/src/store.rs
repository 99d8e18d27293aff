//! In-memory message log, one per conversation.
//!
//! The [`MessageLog`] assigns ids and timestamps to accepted messages and
//! serves newest-first history windows. Items inside a window are ascending
//! by timestamp, the same order the live channel delivers them.

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};

use courtchat_proto::history::PageBody;
use courtchat_proto::message::{ConversationId, Message, MessageId, Timestamp};
use tokio::sync::RwLock;

/// Thread-safe message log for every conversation the server hosts.
pub struct MessageLog {
    conversations: RwLock<HashMap<ConversationId, Vec<Message>>>,
    next_id: AtomicI64,
}

impl Default for MessageLog {
    fn default() -> Self {
        Self::new()
    }
}

impl MessageLog {
    /// Creates an empty log. Ids start at 1.
    #[must_use]
    pub fn new() -> Self {
        Self {
            conversations: RwLock::new(HashMap::new()),
            next_id: AtomicI64::new(1),
        }
    }

    /// Stores a message and returns the stored form.
    ///
    /// A missing id or timestamp is assigned here. The message is placed by
    /// timestamp, after any message with the same timestamp.
    pub async fn append(&self, mut message: Message) -> Message {
        if message.id.is_none() {
            message.id = Some(MessageId::new(self.next_id.fetch_add(1, Ordering::Relaxed)));
        }
        if message.timestamp.is_none() {
            message.timestamp = Some(Timestamp::now());
        }
        let mut conversations = self.conversations.write().await;
        let log = conversations.entry(message.conversation_id).or_default();
        let at = log.partition_point(|m| m.timestamp <= message.timestamp);
        log.insert(at, message.clone());
        drop(conversations);
        message
    }

    /// Number of stored messages in `conversation`.
    pub async fn len(&self, conversation: ConversationId) -> usize {
        let conversations = self.conversations.read().await;
        conversations.get(&conversation).map_or(0, Vec::len)
    }

    /// One history window.
    ///
    /// Page 0 holds the newest `size` messages; each further page reaches
    /// `size` messages further back. `last` is set on the page that
    /// contains the oldest message, and on any page past the end.
    pub async fn page(&self, conversation: ConversationId, page: u32, size: u32) -> PageBody {
        let conversations = self.conversations.read().await;
        let log = conversations.get(&conversation).map_or(&[][..], Vec::as_slice);
        let size = size.max(1) as usize;
        let skip = (page as usize).saturating_mul(size);
        let end = log.len().saturating_sub(skip);
        let start = end.saturating_sub(size);
        PageBody {
            content: log[start..end].to_vec(),
            last: Some(start == 0),
            number: page,
            size: u32::try_from(size).unwrap_or(u32::MAX),
            total_elements: log.len() as u64,
        }
    }
}

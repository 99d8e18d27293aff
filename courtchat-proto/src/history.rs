//! History page types for the paginated message endpoint.
//!
//! Page 0 is the most recent window; higher page indices reach further back.
//! Items inside a page are ascending by timestamp once normalised.

use serde::{Deserialize, Serialize};

use crate::message::Message;

/// Default number of messages per history page.
pub const DEFAULT_PAGE_SIZE: u32 = 20;

/// Largest page size the backend will serve.
pub const MAX_PAGE_SIZE: u32 = 100;

/// A batch of historical messages.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct HistoryPage {
    /// Messages in this page.
    pub items: Vec<Message>,
    /// `true` when no older page exists.
    pub is_last: bool,
}

impl HistoryPage {
    /// Sorts the items ascending by timestamp, keeping arrival order for ties.
    ///
    /// Items without a timestamp sort first.
    pub fn normalise(&mut self) {
        self.items.sort_by_key(|m| m.timestamp);
    }
}

/// Paged object form of a history response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PageBody {
    /// Messages in this page.
    pub content: Vec<Message>,
    /// Whether this is the oldest page.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last: Option<bool>,
    /// Zero-based page index.
    #[serde(default)]
    pub number: u32,
    /// Requested page size.
    #[serde(default)]
    pub size: u32,
    /// Total number of messages in the conversation.
    #[serde(default)]
    pub total_elements: u64,
}

/// Every history response shape the client accepts.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum WirePage {
    /// `{"content": [...], "last": bool, ...}`
    Paged(PageBody),
    /// A plain array of messages.
    Bare(Vec<Message>),
}

impl WirePage {
    /// Converts to a [`HistoryPage`], inferring `is_last` when the body
    /// does not say.
    #[must_use]
    pub fn into_page(self, requested_size: u32) -> HistoryPage {
        let short = |len: usize| len < requested_size as usize;
        match self {
            Self::Paged(body) => {
                let is_last = body.last.unwrap_or_else(|| short(body.content.len()));
                HistoryPage {
                    items: body.content,
                    is_last,
                }
            }
            Self::Bare(items) => HistoryPage {
                is_last: short(items.len()),
                items,
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{ConversationId, MessageId, SenderId, Timestamp};

    fn at(millis: i64) -> Message {
        Message {
            id: Some(MessageId::new(millis)),
            conversation_id: ConversationId::new(1),
            sender_id: SenderId::new(1),
            sender_name: "a".into(),
            content: format!("m{millis}"),
            timestamp: Timestamp::from_millis(millis),
        }
    }

    #[test]
    fn normalise_sorts_descending_server_pages() {
        let mut page = HistoryPage {
            items: vec![at(3_000), at(2_000), at(1_000)],
            is_last: false,
        };
        page.normalise();
        let order: Vec<i64> = page
            .items
            .iter()
            .map(|m| m.timestamp.unwrap().as_millis())
            .collect();
        assert_eq!(order, vec![1_000, 2_000, 3_000]);
    }

    #[test]
    fn paged_body_without_last_infers_from_length() {
        let body = WirePage::Paged(PageBody {
            content: vec![at(1)],
            last: None,
            number: 0,
            size: 20,
            total_elements: 1,
        });
        assert!(body.into_page(20).is_last);
    }

    #[test]
    fn explicit_last_flag_wins() {
        let body = WirePage::Paged(PageBody {
            content: vec![at(1)],
            last: Some(false),
            number: 0,
            size: 20,
            total_elements: 40,
        });
        assert!(!body.into_page(20).is_last);
    }
}

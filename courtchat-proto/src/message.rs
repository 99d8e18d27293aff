//! Chat message wire types for the `CourtChat` protocol.
//!
//! A [`Message`] is one chat item in a location's conversation. The same
//! type travels over the live WebSocket channel and inside history pages.
//! Identifiers are plain integers assigned by the backend.

use std::fmt;

use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize, Serializer};

/// Maximum allowed message content size in bytes (64 KB).
pub const MAX_CONTENT_SIZE: usize = 64 * 1024;

/// Wire format used when emitting timestamps (UTC, microsecond precision).
const WIRE_TIMESTAMP_FORMAT: &str = "%Y-%m-%dT%H:%M:%S%.6f";

macro_rules! integer_id {
    ($(#[$doc:meta])* $name:ident) => {
        $(#[$doc])*
        #[derive(
            Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
        )]
        #[serde(transparent)]
        pub struct $name(i64);

        impl $name {
            /// Wraps a raw integer identifier.
            #[must_use]
            pub const fn new(raw: i64) -> Self {
                Self(raw)
            }

            /// Returns the raw integer value.
            #[must_use]
            pub const fn get(self) -> i64 {
                self.0
            }
        }

        impl From<i64> for $name {
            fn from(raw: i64) -> Self {
                Self(raw)
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                write!(f, "{}", self.0)
            }
        }
    };
}

integer_id!(
    /// Identifies a conversation (one location's chat channel).
    ConversationId
);

integer_id!(
    /// Identifies the authenticated user who sent a message.
    SenderId
);

integer_id!(
    /// Server-assigned message identifier. Absent until the server acknowledges.
    MessageId
);

/// Errors produced when parsing a wire timestamp.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TimestampError {
    /// The string form was not ISO-8601.
    #[error("unrecognised timestamp text: {0:?}")]
    Text(String),
    /// The component-array form had missing or out-of-range parts.
    #[error("invalid timestamp components: {0:?}")]
    Components(Vec<i64>),
}

/// A UTC instant with sub-second precision.
///
/// Accepts the string forms the backend emits (ISO-8601 with or without
/// fractional seconds, with or without an offset) as well as the
/// `[year, month, day, hour, minute, second, nanos]` array some Java JSON
/// mappers produce for local date-times.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct Timestamp(DateTime<Utc>);

impl Timestamp {
    /// Creates a timestamp for the current instant.
    #[must_use]
    pub fn now() -> Self {
        Self(Utc::now())
    }

    /// Creates a timestamp from milliseconds since the Unix epoch.
    ///
    /// Returns `None` when the value is outside chrono's representable range.
    #[must_use]
    pub fn from_millis(millis: i64) -> Option<Self> {
        DateTime::from_timestamp_millis(millis).map(Self)
    }

    /// Returns milliseconds since the Unix epoch.
    #[must_use]
    pub fn as_millis(&self) -> i64 {
        self.0.timestamp_millis()
    }

    /// Returns whole seconds since the Unix epoch (sub-second part truncated).
    #[must_use]
    pub fn whole_seconds(&self) -> i64 {
        self.0.timestamp()
    }

    /// Absolute distance between two instants.
    #[must_use]
    pub fn abs_diff(&self, other: &Self) -> std::time::Duration {
        (self.0 - other.0).abs().to_std().unwrap_or_default()
    }

    /// Returns the underlying chrono value.
    #[must_use]
    pub const fn as_datetime(&self) -> &DateTime<Utc> {
        &self.0
    }

    /// Parses the ISO-8601 text form. Offset-less values are taken as UTC.
    ///
    /// # Errors
    ///
    /// Returns [`TimestampError::Text`] if neither RFC 3339 nor the
    /// offset-less `YYYY-MM-DDTHH:MM:SS[.fff]` form matches.
    pub fn parse(text: &str) -> Result<Self, TimestampError> {
        if let Ok(dt) = DateTime::parse_from_rfc3339(text) {
            return Ok(Self(dt.with_timezone(&Utc)));
        }
        NaiveDateTime::parse_from_str(text, "%Y-%m-%dT%H:%M:%S%.f")
            .map(|naive| Self(naive.and_utc()))
            .map_err(|_| TimestampError::Text(text.to_string()))
    }

    /// Builds a timestamp from `[year, month, day, hour, minute, second, nanos?]`.
    ///
    /// # Errors
    ///
    /// Returns [`TimestampError::Components`] when fewer than six parts are
    /// given or any part is out of range.
    pub fn from_components(parts: &[i64]) -> Result<Self, TimestampError> {
        let invalid = || TimestampError::Components(parts.to_vec());
        if parts.len() < 6 {
            return Err(invalid());
        }
        let part = |i: usize| u32::try_from(parts[i]).map_err(|_| invalid());
        let year = i32::try_from(parts[0]).map_err(|_| invalid())?;
        let (month, day) = (part(1)?, part(2)?);
        let (hour, minute, second) = (part(3)?, part(4)?, part(5)?);
        let nanos = match parts.get(6) {
            Some(_) => part(6)?,
            None => 0,
        };
        NaiveDate::from_ymd_opt(year, month, day)
            .and_then(|date| date.and_hms_nano_opt(hour, minute, second, nanos))
            .map(|naive| Self(naive.and_utc()))
            .ok_or_else(invalid)
    }

    /// Formats the timestamp in the wire form.
    #[must_use]
    pub fn to_wire(&self) -> String {
        self.0.format(WIRE_TIMESTAMP_FORMAT).to_string()
    }
}

impl fmt::Display for Timestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_wire())
    }
}

impl Serialize for Timestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_wire())
    }
}

/// Accepted JSON shapes for a timestamp.
#[derive(Deserialize)]
#[serde(untagged)]
enum WireTimestamp {
    Text(String),
    Components(Vec<i64>),
}

impl<'de> Deserialize<'de> for Timestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        match WireTimestamp::deserialize(deserializer)? {
            WireTimestamp::Text(text) => Self::parse(&text),
            WireTimestamp::Components(parts) => Self::from_components(&parts),
        }
        .map_err(serde::de::Error::custom)
    }
}

/// Errors returned by [`Message::validate`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ValidationError {
    /// The content is empty or whitespace only.
    #[error("message content is empty")]
    Empty,
    /// The content exceeds [`MAX_CONTENT_SIZE`].
    #[error("message too large: {size} bytes (max {max} bytes)")]
    TooLarge {
        /// Actual size in bytes.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },
}

/// One chat item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Message {
    /// Server-assigned id; `None` until the server acknowledges the message.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<MessageId>,
    /// The conversation this message belongs to.
    #[serde(alias = "locationId")]
    pub conversation_id: ConversationId,
    /// The sending user.
    pub sender_id: SenderId,
    /// Display name of the sending user.
    #[serde(rename = "senderUserName")]
    pub sender_name: String,
    /// Message text.
    pub content: String,
    /// Server-assigned send time; optional at construction.
    ///
    /// A value that does not parse decodes as `None` rather than rejecting
    /// the whole message.
    #[serde(
        default,
        deserialize_with = "lenient_timestamp",
        skip_serializing_if = "Option::is_none"
    )]
    pub timestamp: Option<Timestamp>,
}

/// A timestamp field that may hold something unparseable.
#[derive(Deserialize)]
#[serde(untagged)]
enum MaybeTimestamp {
    Parsed(Timestamp),
    Unparsed(serde::de::IgnoredAny),
}

fn lenient_timestamp<'de, D: Deserializer<'de>>(
    deserializer: D,
) -> Result<Option<Timestamp>, D::Error> {
    Ok(
        match Option::<MaybeTimestamp>::deserialize(deserializer)? {
            Some(MaybeTimestamp::Parsed(ts)) => Some(ts),
            Some(MaybeTimestamp::Unparsed(_)) | None => None,
        },
    )
}

impl Message {
    /// Builds a locally-originated message that has no server id yet.
    #[must_use]
    pub fn outgoing(
        conversation_id: ConversationId,
        sender_id: SenderId,
        sender_name: impl Into<String>,
        content: impl Into<String>,
        timestamp: Timestamp,
    ) -> Self {
        Self {
            id: None,
            conversation_id,
            sender_id,
            sender_name: sender_name.into(),
            content: content.into(),
            timestamp: Some(timestamp),
        }
    }

    /// Checks that the content is non-blank and within the size limit.
    ///
    /// # Errors
    ///
    /// Returns [`ValidationError`] describing the first violated rule.
    pub fn validate(&self) -> Result<(), ValidationError> {
        if self.content.trim().is_empty() {
            return Err(ValidationError::Empty);
        }
        if self.content.len() > MAX_CONTENT_SIZE {
            return Err(ValidationError::TooLarge {
                size: self.content.len(),
                max: MAX_CONTENT_SIZE,
            });
        }
        Ok(())
    }

    /// The identity used to decide whether two representations are the
    /// same logical message.
    #[must_use]
    pub fn dedup_key(&self) -> DedupKey {
        self.id.map_or_else(|| self.content_key(), DedupKey::Id)
    }

    /// The id-less form of the dedup key, computed even when an id exists.
    #[must_use]
    pub fn content_key(&self) -> DedupKey {
        DedupKey::Content {
            conversation: self.conversation_id,
            sender: self.sender_id,
            content: self.content.clone(),
            second: self.timestamp.map(|ts| ts.whole_seconds()),
        }
    }

    /// Whether `other` carries the same author and text in the same conversation.
    #[must_use]
    pub fn same_authored_content(&self, other: &Self) -> bool {
        self.conversation_id == other.conversation_id
            && self.sender_id == other.sender_id
            && self.content == other.content
    }
}

/// Identity of a logical message.
///
/// `Id` once the server has assigned one; otherwise the author, text and
/// send time truncated to the second.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    /// Server-assigned id.
    Id(MessageId),
    /// Fallback key for messages without an id.
    Content {
        /// Conversation the message belongs to.
        conversation: ConversationId,
        /// Sending user.
        sender: SenderId,
        /// Message text.
        content: String,
        /// Timestamp truncated to whole seconds, if known.
        second: Option<i64>,
    },
}

//! The canonical message list of one conversation.
//!
//! [`MessageStream`] merges three sources into a single list that is always
//! sorted ascending by timestamp and never holds two entries with the same
//! [`DedupKey`]:
//!
//! - history pages ([`MessageStream::prepend`]), older than what is loaded
//! - live pushes ([`MessageStream::append_live`])
//! - local sends ([`MessageStream::append_optimistic`]) awaiting their echo
//!
//! A confirmed message that matches an optimistic entry replaces it in place
//! and the entry keeps its [`LocalId`]. Ties on timestamp keep arrival order,
//! except that history is placed before anything already loaded.

use std::collections::HashMap;
use std::fmt;
use std::time::Duration;

use uuid::Uuid;

use courtchat_proto::message::{DedupKey, Message, MessageId, Timestamp};

/// Client-side identity of a list entry, stable for the entry's lifetime.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct LocalId(Uuid);

impl LocalId {
    /// Generate a new time-ordered id.
    #[must_use]
    pub fn generate() -> Self {
        Self(Uuid::now_v7())
    }

    /// The underlying UUID.
    #[must_use]
    pub const fn as_uuid(&self) -> &Uuid {
        &self.0
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Where an entry came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Origin {
    /// A history page.
    History,
    /// A live push.
    Live,
    /// A local send not yet confirmed by the server.
    Optimistic,
}

/// Delivery status as the presentation layer should render it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Delivery {
    /// Known to the server.
    Confirmed,
    /// Sent, waiting for the server echo.
    Sending,
    /// Not confirmed; can be resent.
    Failed {
        /// Why the send is considered failed.
        reason: String,
    },
}

/// One item of the visible list.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StreamEntry {
    /// Stable client-side id.
    pub local_id: LocalId,
    /// The message as last received or sent.
    pub message: Message,
    /// Source of the current representation.
    pub origin: Origin,
    /// Delivery status.
    pub delivery: Delivery,
    /// Sort key: the message timestamp, or the local time it was first seen.
    pub timestamp: Timestamp,
}

impl StreamEntry {
    /// Whether this entry is still a local send awaiting its echo.
    #[must_use]
    pub fn is_optimistic(&self) -> bool {
        self.origin == Origin::Optimistic
    }
}

/// Result of merging one confirmed message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeResult {
    /// A new entry was inserted.
    Inserted(LocalId),
    /// An optimistic entry was replaced by its confirmed form.
    Reconciled(LocalId),
    /// Already present; nothing changed.
    Duplicate(LocalId),
}

impl MergeResult {
    /// The entry the message ended up in.
    #[must_use]
    pub const fn local_id(self) -> LocalId {
        match self {
            Self::Inserted(id) | Self::Reconciled(id) | Self::Duplicate(id) => id,
        }
    }
}

/// Summary of a [`MessageStream::prepend`].
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PrependSummary {
    /// Entries newly inserted.
    pub added: usize,
    /// Optimistic entries confirmed by the page.
    pub reconciled: Vec<LocalId>,
    /// Items skipped as already present.
    pub duplicates: usize,
}

/// Result of [`MessageStream::append_optimistic`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OptimisticResult {
    /// A new optimistic entry was inserted.
    Inserted(LocalId),
    /// An entry with the same dedup key exists; the send was folded into it.
    Coalesced(LocalId),
}

/// Where an entry goes among equal timestamps.
#[derive(Debug, Clone, Copy)]
enum Placement {
    /// Before existing entries with the same timestamp.
    Before,
    /// After existing entries with the same timestamp.
    After,
}

/// Ordered, deduplicated message list.
#[derive(Debug, Clone)]
pub struct MessageStream {
    entries: Vec<StreamEntry>,
    keys: HashMap<DedupKey, LocalId>,
    reconcile_window: Duration,
    revision: u64,
}

impl MessageStream {
    /// Create an empty stream.
    ///
    /// `reconcile_window` is how far apart an optimistic entry and a
    /// confirmed message with the same author and text may be and still be
    /// treated as the same message.
    #[must_use]
    pub fn new(reconcile_window: Duration) -> Self {
        Self {
            entries: Vec::new(),
            keys: HashMap::new(),
            reconcile_window,
            revision: 0,
        }
    }

    /// Entries in display order.
    #[must_use]
    pub fn entries(&self) -> &[StreamEntry] {
        &self.entries
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the list is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// The oldest entry, used as the scroll anchor before a backfill.
    #[must_use]
    pub fn oldest(&self) -> Option<&StreamEntry> {
        self.entries.first()
    }

    /// Look up an entry by local id.
    #[must_use]
    pub fn get(&self, local_id: LocalId) -> Option<&StreamEntry> {
        self.entries.iter().find(|e| e.local_id == local_id)
    }

    /// Bumped on every change to the list.
    #[must_use]
    pub const fn revision(&self) -> u64 {
        self.revision
    }

    /// Merge a history page.
    ///
    /// Items are sorted ascending first. Items already present are skipped,
    /// so overlapping page boundaries never create duplicates.
    pub fn prepend(&mut self, items: Vec<Message>) -> PrependSummary {
        let mut stamped: Vec<(Timestamp, Message)> = items
            .into_iter()
            .map(|mut m| (stamp(&mut m), m))
            .collect();
        stamped.sort_by_key(|(ts, _)| *ts);

        let mut summary = PrependSummary::default();
        // Newest first so equal timestamps keep page order at the lower bound.
        for (ts, message) in stamped.into_iter().rev() {
            match self.merge_confirmed(message, ts, Origin::History, Placement::Before) {
                MergeResult::Inserted(_) => summary.added += 1,
                MergeResult::Reconciled(id) => summary.reconciled.push(id),
                MergeResult::Duplicate(_) => summary.duplicates += 1,
            }
        }
        summary
    }

    /// Merge a server-pushed message.
    pub fn append_live(&mut self, mut message: Message) -> MergeResult {
        let ts = stamp(&mut message);
        self.merge_confirmed(message, ts, Origin::Live, Placement::After)
    }

    /// Insert a local send before the server has seen it.
    pub fn append_optimistic(&mut self, mut message: Message) -> OptimisticResult {
        let ts = stamp(&mut message);
        let key = message.dedup_key();
        if let Some(&existing) = self.keys.get(&key) {
            tracing::debug!(local_id = %existing, "identical send folded into existing entry");
            return OptimisticResult::Coalesced(existing);
        }
        let local_id = LocalId::generate();
        self.insert(
            StreamEntry {
                local_id,
                message,
                origin: Origin::Optimistic,
                delivery: Delivery::Sending,
                timestamp: ts,
            },
            key,
            Placement::After,
        );
        OptimisticResult::Inserted(local_id)
    }

    /// Flag an optimistic entry that is still `Sending` as failed.
    ///
    /// Returns `false` if the entry is gone, confirmed, or already failed.
    pub fn mark_failed(&mut self, local_id: LocalId, reason: impl Into<String>) -> bool {
        let Some(entry) = self.entries.iter_mut().find(|e| e.local_id == local_id) else {
            return false;
        };
        if !entry.is_optimistic() || entry.delivery != Delivery::Sending {
            return false;
        }
        entry.delivery = Delivery::Failed {
            reason: reason.into(),
        };
        self.revision += 1;
        true
    }

    /// Put a failed optimistic entry back to `Sending` and return the
    /// message to transmit again.
    pub fn mark_sending(&mut self, local_id: LocalId) -> Option<Message> {
        let entry = self
            .entries
            .iter_mut()
            .find(|e| e.local_id == local_id && e.is_optimistic())?;
        if !matches!(entry.delivery, Delivery::Failed { .. }) {
            return None;
        }
        entry.delivery = Delivery::Sending;
        let message = entry.message.clone();
        self.revision += 1;
        Some(message)
    }

    /// Remove every entry, returning the optimistic ones so the caller can
    /// [`restore`](Self::restore) them.
    pub fn clear(&mut self) -> Vec<StreamEntry> {
        self.keys.clear();
        self.revision += 1;
        self.entries
            .drain(..)
            .filter(StreamEntry::is_optimistic)
            .collect()
    }

    /// Re-insert entries returned by [`clear`](Self::clear).
    pub fn restore(&mut self, entries: Vec<StreamEntry>) {
        for entry in entries {
            let key = entry.message.dedup_key();
            if !self.keys.contains_key(&key) {
                self.insert(entry, key, Placement::After);
            }
        }
    }

    /// Merge a confirmed message at timestamp `ts`.
    fn merge_confirmed(
        &mut self,
        message: Message,
        ts: Timestamp,
        origin: Origin,
        placement: Placement,
    ) -> MergeResult {
        let key = message.dedup_key();
        if let Some(&existing) = self.keys.get(&key) {
            if self.is_optimistic(existing) {
                return self.reconcile(existing, message, ts, origin, placement);
            }
            return MergeResult::Duplicate(existing);
        }
        if message.id.is_some() {
            let pending = self
                .keys
                .get(&message.content_key())
                .copied()
                .filter(|id| self.is_optimistic(*id));
            if let Some(existing) = pending {
                return self.reconcile(existing, message, ts, origin, placement);
            }
        }
        let skewed = match origin {
            Origin::Live => self.skewed_match(&message, ts),
            Origin::History | Origin::Optimistic => None,
        };
        if let Some(existing) = skewed {
            return self.reconcile(existing, message, ts, origin, placement);
        }

        let local_id = LocalId::generate();
        self.insert(
            StreamEntry {
                local_id,
                message,
                origin,
                delivery: Delivery::Confirmed,
                timestamp: ts,
            },
            key,
            placement,
        );
        MergeResult::Inserted(local_id)
    }

    /// The oldest optimistic entry still awaiting its echo with the same
    /// author and text, whose timestamp is within the reconcile window of
    /// `ts`. Failed entries are never matched here: only an exact key can
    /// confirm them.
    fn skewed_match(&self, message: &Message, ts: Timestamp) -> Option<LocalId> {
        self.entries
            .iter()
            .find(|e| {
                e.is_optimistic()
                    && e.delivery == Delivery::Sending
                    && e.message.same_authored_content(message)
                    && e.timestamp.abs_diff(&ts) <= self.reconcile_window
            })
            .map(|e| e.local_id)
    }

    /// Replace optimistic entry `local_id` with its confirmed form.
    ///
    /// The entry stays where it is unless its new timestamp would break the
    /// ordering, in which case it moves to its sorted position.
    fn reconcile(
        &mut self,
        local_id: LocalId,
        message: Message,
        ts: Timestamp,
        origin: Origin,
        placement: Placement,
    ) -> MergeResult {
        let Some(idx) = self.position(local_id) else {
            return MergeResult::Duplicate(local_id);
        };
        let old_key = self.entries[idx].message.dedup_key();
        if self.keys.get(&old_key) == Some(&local_id) {
            self.keys.remove(&old_key);
        }
        let new_key = message.dedup_key();

        let fits = idx.checked_sub(1).is_none_or(|p| self.entries[p].timestamp <= ts)
            && self.entries.get(idx + 1).is_none_or(|n| ts <= n.timestamp);

        let mut entry = self.entries.remove(idx);
        entry.message = message;
        entry.origin = origin;
        entry.delivery = Delivery::Confirmed;
        entry.timestamp = ts;

        if fits {
            self.keys.insert(new_key, local_id);
            self.entries.insert(idx, entry);
            self.revision += 1;
        } else {
            tracing::debug!(local_id = %local_id, "confirmed message moved to its sorted position");
            self.insert(entry, new_key, placement);
        }
        MergeResult::Reconciled(local_id)
    }

    /// Insert at the sorted position for `entry.timestamp`.
    fn insert(&mut self, entry: StreamEntry, key: DedupKey, placement: Placement) {
        let ts = entry.timestamp;
        let idx = match placement {
            Placement::Before => self.entries.partition_point(|e| e.timestamp < ts),
            Placement::After => self.entries.partition_point(|e| e.timestamp <= ts),
        };
        self.keys.insert(key, entry.local_id);
        self.entries.insert(idx, entry);
        self.revision += 1;
    }

    fn position(&self, local_id: LocalId) -> Option<usize> {
        self.entries.iter().position(|e| e.local_id == local_id)
    }

    fn is_optimistic(&self, local_id: LocalId) -> bool {
        self.get(local_id).is_some_and(StreamEntry::is_optimistic)
    }
}

/// Server id of the oldest entry, if it has one.
#[must_use]
pub fn oldest_message_id(stream: &MessageStream) -> Option<MessageId> {
    stream.oldest().and_then(|e| e.message.id)
}

/// Give `message` a timestamp if it has none and return it.
fn stamp(message: &mut Message) -> Timestamp {
    *message.timestamp.get_or_insert_with(Timestamp::now)
}

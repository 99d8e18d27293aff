#![allow(clippy::unwrap_used)]

//! Property-based tests for the message stream merge engine.
//!
//! Verifies that, for any interleaving of history pages and live pushes:
//! 1. The list stays sorted by timestamp.
//! 2. No server id appears twice.
//! 3. Once every message has been seen, the list holds exactly the log.
//! 4. Re-applying a page adds nothing.
//!
//! And that every optimistic send is replaced in place by its echo, even
//! when the server clock is skewed.

use std::collections::HashSet;
use std::time::Duration;

use courtchat::stream::{Delivery, MergeResult, MessageStream, OptimisticResult, Origin};
use courtchat_proto::message::{ConversationId, Message, MessageId, SenderId, Timestamp};
use proptest::prelude::*;
use proptest::sample::Index;

const CONV: ConversationId = ConversationId::new(1);
const BASE: i64 = 1_700_000_000_000;
const WINDOW: Duration = Duration::from_secs(30);

/// The server's log: ids `1..=len`, one second apart, several senders.
fn server_log(len: usize) -> Vec<Message> {
    (1..=len as i64)
        .map(|i| Message {
            id: Some(MessageId::new(i)),
            conversation_id: CONV,
            sender_id: SenderId::new(i % 3),
            sender_name: format!("user {}", i % 3),
            content: format!("message {i}"),
            timestamp: Timestamp::from_millis(BASE + i * 1000),
        })
        .collect()
}

#[derive(Debug, Clone)]
enum Arrival {
    /// A history page covering `len` items starting at `start`.
    Page { start: Index, len: usize },
    /// One live push.
    Live(Index),
}

fn arb_arrival() -> impl Strategy<Value = Arrival> {
    prop_oneof![
        (any::<Index>(), 1_usize..12).prop_map(|(start, len)| Arrival::Page { start, len }),
        any::<Index>().prop_map(Arrival::Live),
    ]
}

fn apply(stream: &mut MessageStream, log: &[Message], arrival: &Arrival) {
    match arrival {
        Arrival::Page { start, len } => {
            let start = start.index(log.len());
            let end = (start + len).min(log.len());
            // Servers may send pages newest first.
            let mut page = log[start..end].to_vec();
            page.reverse();
            stream.prepend(page);
        }
        Arrival::Live(i) => {
            stream.append_live(log[i.index(log.len())].clone());
        }
    }
}

fn assert_sorted(stream: &MessageStream) {
    for pair in stream.entries().windows(2) {
        assert!(
            pair[0].timestamp <= pair[1].timestamp,
            "out of order: {:?} then {:?}",
            pair[0].timestamp,
            pair[1].timestamp
        );
    }
}

fn assert_unique(stream: &MessageStream) {
    let mut seen = HashSet::new();
    for entry in stream.entries() {
        if let Some(id) = entry.message.id {
            assert!(seen.insert(id), "duplicate id {id}");
        }
    }
}

proptest! {
    #[test]
    fn any_interleaving_stays_sorted_and_unique(
        len in 1_usize..40,
        arrivals in prop::collection::vec(arb_arrival(), 0..30),
    ) {
        let log = server_log(len);
        let mut stream = MessageStream::new(WINDOW);
        for arrival in &arrivals {
            apply(&mut stream, &log, arrival);
            assert_sorted(&stream);
            assert_unique(&stream);
        }
    }

    #[test]
    fn seeing_everything_yields_exactly_the_log(
        len in 1_usize..40,
        arrivals in prop::collection::vec(arb_arrival(), 0..30),
    ) {
        let log = server_log(len);
        let mut stream = MessageStream::new(WINDOW);
        for arrival in &arrivals {
            apply(&mut stream, &log, arrival);
        }
        stream.prepend(log.clone());

        let ids: Vec<i64> = stream
            .entries()
            .iter()
            .filter_map(|e| e.message.id.map(MessageId::get))
            .collect();
        prop_assert_eq!(ids, (1..=len as i64).collect::<Vec<_>>());
    }

    #[test]
    fn reapplying_a_page_adds_nothing(
        len in 1_usize..40,
        start in any::<Index>(),
        page_len in 1_usize..20,
    ) {
        let log = server_log(len);
        let start = start.index(len);
        let page = log[start..(start + page_len).min(len)].to_vec();
        let mut stream = MessageStream::new(WINDOW);

        let first = stream.prepend(page.clone());
        let revision = stream.revision();
        let second = stream.prepend(page.clone());

        prop_assert_eq!(first.added, page.len());
        prop_assert_eq!(second.added, 0);
        prop_assert_eq!(second.duplicates, page.len());
        prop_assert_eq!(stream.revision(), revision);
    }

    #[test]
    fn echoes_replace_optimistic_entries_despite_skew(
        skews in prop::collection::vec(-20_000_i64..20_000, 1..12),
    ) {
        let me = SenderId::new(42);
        let mut stream = MessageStream::new(WINDOW);
        let mut sent = Vec::new();
        for (i, _) in skews.iter().enumerate() {
            let i = i as i64;
            let message = Message::outgoing(
                CONV,
                me,
                "me",
                format!("send {i}"),
                Timestamp::from_millis(BASE + i * 5_000).unwrap(),
            );
            let OptimisticResult::Inserted(local_id) = stream.append_optimistic(message.clone()) else {
                panic!("distinct sends must not coalesce");
            };
            sent.push((local_id, message));
        }

        for (i, ((local_id, message), skew)) in sent.iter().zip(&skews).enumerate() {
            let mut echo = message.clone();
            echo.id = Some(MessageId::new(1_000 + i as i64));
            echo.timestamp = Timestamp::from_millis(message.timestamp.unwrap().as_millis() + skew);
            prop_assert_eq!(stream.append_live(echo), MergeResult::Reconciled(*local_id));
            assert_sorted(&stream);
        }

        prop_assert_eq!(stream.len(), skews.len());
        for entry in stream.entries() {
            prop_assert_eq!(&entry.delivery, &Delivery::Confirmed);
            prop_assert_eq!(entry.origin, Origin::Live);
            prop_assert!(entry.message.id.is_some());
        }
    }

    #[test]
    fn repeated_text_reconciles_in_send_order(
        count in 2_usize..8,
        lag in 0_i64..900,
    ) {
        let me = SenderId::new(42);
        let mut stream = MessageStream::new(WINDOW);
        let mut local_ids = Vec::new();
        for i in 0..count as i64 {
            let message = Message::outgoing(
                CONV,
                me,
                "me",
                "on my way",
                Timestamp::from_millis(BASE + i * 2_000).unwrap(),
            );
            match stream.append_optimistic(message) {
                OptimisticResult::Inserted(id) => local_ids.push(id),
                OptimisticResult::Coalesced(_) => panic!("sends two seconds apart must not coalesce"),
            }
        }

        for (i, local_id) in local_ids.iter().enumerate() {
            let i = i as i64;
            let echo = Message {
                id: Some(MessageId::new(500 + i)),
                timestamp: Timestamp::from_millis(BASE + i * 2_000 + lag),
                ..Message::outgoing(CONV, me, "me", "on my way", Timestamp::now())
            };
            prop_assert_eq!(stream.append_live(echo), MergeResult::Reconciled(*local_id));
        }
        prop_assert_eq!(stream.len(), count);
        assert_unique(&stream);
    }
}

#![allow(clippy::unwrap_used)]

//! Property-based tests for the JSON wire codec.
//!
//! Verifies that:
//! 1. Arbitrary text never makes `decode` or `decode_page` panic.
//! 2. Any well-formed message survives `encode` → `decode`.
//! 3. Outbound frames never carry the server-assigned fields.
//! 4. The dedup key of a message is stable across a round trip.

use courtchat_proto::codec;
use courtchat_proto::message::{ConversationId, Message, MessageId, SenderId, Timestamp};
use proptest::prelude::*;

/// Millisecond timestamps between 2000-01-01 and 2100-01-01.
fn arb_timestamp() -> impl Strategy<Value = Timestamp> {
    (946_684_800_000_i64..4_102_444_800_000).prop_filter_map("representable", |ms| {
        // Wire form carries microseconds, so whole milliseconds round-trip exactly.
        Timestamp::from_millis(ms)
    })
}

fn arb_message() -> impl Strategy<Value = Message> {
    (
        proptest::option::of(1_i64..i64::MAX),
        any::<i64>(),
        any::<i64>(),
        "[^\x00]{0,32}",
        "[^\x00]{1,256}",
        proptest::option::of(arb_timestamp()),
    )
        .prop_map(|(id, conv, sender, name, content, timestamp)| Message {
            id: id.map(MessageId::new),
            conversation_id: ConversationId::new(conv),
            sender_id: SenderId::new(sender),
            sender_name: name,
            content,
            timestamp,
        })
}

proptest! {
    #[test]
    fn decode_never_panics(text in "\\PC{0,512}") {
        let _ = codec::decode(&text);
    }

    #[test]
    fn decode_page_never_panics(text in "\\PC{0,512}", size in 0_u32..200) {
        let _ = codec::decode_page(&text, size);
    }

    #[test]
    fn decode_never_panics_on_json_shaped_noise(
        id in any::<i64>(),
        ts in prop::collection::vec(any::<i64>(), 0..9),
    ) {
        let text = format!(
            r#"{{"id":{id},"conversationId":1,"senderId":2,"senderUserName":"n","content":"c","timestamp":{ts:?}}}"#
        );
        let _ = codec::decode(&text);
    }

    #[test]
    fn message_round_trips(msg in arb_message()) {
        let text = codec::encode(&msg).unwrap();
        let decoded = codec::decode(&text).unwrap();
        prop_assert_eq!(&decoded, &msg);
        prop_assert_eq!(decoded.dedup_key(), msg.dedup_key());
    }

    #[test]
    fn outbound_frames_strip_server_fields(msg in arb_message()) {
        let decoded = codec::decode(&codec::encode_outbound(&msg).unwrap()).unwrap();
        prop_assert!(decoded.id.is_none());
        prop_assert!(decoded.timestamp.is_none());
        prop_assert!(decoded.same_authored_content(&msg));
    }
}

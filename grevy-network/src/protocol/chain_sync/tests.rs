//! Fixed test vectors for the chain-sync handler.

use grevy_chain::{BlockHash, ChunkRegistry, Point2, Point3, ToCbor};

use super::{ChainSyncHandler, Message};
use crate::{
    multiplexer::{ProtocolError, ProtocolHandler},
    protocol::testing::{
        collect_messages, empty_archive, first_point, genesis_hash, second_point, test_params,
        two_block_archive,
    },
};

fn reply(handler: &mut ChainSyncHandler, msg: &Message) -> Message {
    let generator = handler
        .data(&msg.to_cbor_bytes())
        .expect("the message is acceptable")
        .expect("chain-sync always replies");
    let mut messages = collect_messages::<Message>(generator);
    assert_eq!(messages.len(), 1, "chain-sync replies one message at a time");
    messages.remove(0)
}

#[test]
fn find_intersect_with_no_points_reports_the_tip() {
    grevy_test::init();

    let archive = two_block_archive();
    let tip = archive.tip().expect("chain is not empty");
    let mut handler = ChainSyncHandler::new(archive, test_params());
    assert_eq!(
        reply(&mut handler, &Message::FindIntersect(Vec::new())),
        Message::IntersectNotFound(tip)
    );
}

#[test]
fn find_intersect_known_point() {
    grevy_test::init();

    let archive = two_block_archive();
    let tip = archive.tip().expect("chain is not empty");
    let mut handler = ChainSyncHandler::new(archive, test_params());
    let target = second_point();
    assert_eq!(
        reply(&mut handler, &Message::FindIntersect(vec![target])),
        Message::IntersectFound(target, tip)
    );
}

#[test]
fn find_intersect_unknown_block() {
    grevy_test::init();

    let archive = two_block_archive();
    let tip = archive.tip().expect("chain is not empty");
    let mut handler = ChainSyncHandler::new(archive, test_params());
    let target = Point2 {
        slot: 21599,
        hash: BlockHash([0; 32]),
    };
    assert_eq!(
        reply(&mut handler, &Message::FindIntersect(vec![target])),
        Message::IntersectNotFound(tip)
    );
}

#[test]
fn find_intersect_on_an_empty_chain_reports_the_genesis_tip() {
    grevy_test::init();

    let mut handler = ChainSyncHandler::new(empty_archive(), test_params());
    let target = Point2 {
        slot: 21599,
        hash: BlockHash([0; 32]),
    };
    assert_eq!(
        reply(&mut handler, &Message::FindIntersect(vec![target])),
        Message::IntersectNotFound(Point3 {
            slot: 0,
            hash: genesis_hash(),
            height: 0,
        })
    );
}

#[test]
fn request_next_advances_past_the_intersection() {
    grevy_test::init();

    let archive = two_block_archive();
    let tip = archive.tip().expect("chain is not empty");
    let mut handler = ChainSyncHandler::new(archive, test_params());

    let target = first_point();
    assert_eq!(
        reply(&mut handler, &Message::FindIntersect(vec![target])),
        Message::IntersectFound(target, tip)
    );

    match reply(&mut handler, &Message::RequestNext) {
        Message::RollForward(header, got_tip) => {
            assert_eq!(header.era, 1);
            assert_eq!(header.point2(), second_point());
            assert_eq!(got_tip, tip);
        }
        other => panic!("expected a roll forward, got tag {}", other.tag()),
    }
}

#[test]
fn request_next_at_the_tip_awaits() {
    grevy_test::init();

    let archive = two_block_archive();
    let tip = archive.tip().expect("chain is not empty");
    let mut handler = ChainSyncHandler::new(archive, test_params());

    assert_eq!(
        reply(&mut handler, &Message::FindIntersect(vec![tip.point2()])),
        Message::IntersectFound(tip.point2(), tip)
    );
    assert_eq!(reply(&mut handler, &Message::RequestNext), Message::AwaitReply);

    // after an await-reply, further client messages are a violation
    assert!(matches!(
        handler.data(&Message::RequestNext.to_cbor_bytes()),
        Err(ProtocolError::UnexpectedMessage {
            state: "must_reply",
            ..
        })
    ));
}

#[test]
fn request_next_on_an_empty_chain_awaits() {
    grevy_test::init();

    let mut handler = ChainSyncHandler::new(empty_archive(), test_params());
    assert_eq!(reply(&mut handler, &Message::RequestNext), Message::AwaitReply);
}

#[test]
fn request_next_without_an_intersection_starts_from_the_chain_start() {
    grevy_test::init();

    let archive = two_block_archive();
    let tip = archive.tip().expect("chain is not empty");
    let mut handler = ChainSyncHandler::new(archive, test_params());

    match reply(&mut handler, &Message::RequestNext) {
        Message::RollForward(header, got_tip) => {
            assert_eq!(header.point2(), first_point());
            assert_eq!(got_tip, tip);
        }
        other => panic!("expected a roll forward, got tag {}", other.tag()),
    }
}

#[test]
fn server_messages_from_a_client_are_a_violation() {
    grevy_test::init();

    let mut handler = ChainSyncHandler::new(two_block_archive(), test_params());
    assert!(matches!(
        handler.data(&Message::AwaitReply.to_cbor_bytes()),
        Err(ProtocolError::UnexpectedTag { tag: 1, .. })
    ));
}

#[test]
fn terminal_notifications_end_the_protocol() {
    grevy_test::init();

    let mut stopped = ChainSyncHandler::new(two_block_archive(), test_params());
    stopped.stopped();
    assert!(stopped.data(&Message::RequestNext.to_cbor_bytes()).is_err());

    let mut failed = ChainSyncHandler::new(two_block_archive(), test_params());
    failed.failed("some error");
    assert!(failed.data(&Message::RequestNext.to_cbor_bytes()).is_err());
}

mod prop {
    use grevy_chain::{BlockHash, FromCbor, Header, Point2, Point3, ToCbor};
    use proptest::prelude::*;

    use super::super::Message;

    fn block_hash() -> impl Strategy<Value = BlockHash> {
        any::<[u8; 32]>().prop_map(BlockHash)
    }

    fn point2() -> impl Strategy<Value = Point2> {
        (any::<u64>(), block_hash()).prop_map(|(slot, hash)| Point2 { slot, hash })
    }

    fn point3() -> impl Strategy<Value = Point3> {
        (any::<u64>(), block_hash(), any::<u64>()).prop_map(|(slot, hash, height)| Point3 {
            slot,
            hash,
            height,
        })
    }

    fn header() -> impl Strategy<Value = Header> {
        (0u64..8, any::<u64>(), block_hash(), block_hash(), any::<u64>()).prop_map(
            |(era, slot, hash, prev_hash, height)| Header {
                era,
                slot,
                hash,
                prev_hash,
                height,
            },
        )
    }

    fn message() -> impl Strategy<Value = Message> {
        prop_oneof![
            Just(Message::RequestNext),
            Just(Message::AwaitReply),
            (header(), point3()).prop_map(|(h, t)| Message::RollForward(h, t)),
            (proptest::option::of(point2()), point3())
                .prop_map(|(p, t)| Message::RollBackward(p, t)),
            proptest::collection::vec(point2(), 0..5).prop_map(Message::FindIntersect),
            (point2(), point3()).prop_map(|(p, t)| Message::IntersectFound(p, t)),
            point3().prop_map(Message::IntersectNotFound),
            Just(Message::Done),
        ]
    }

    proptest! {
        #[test]
        fn message_round_trip(msg in message()) {
            let bytes = msg.to_cbor_bytes();
            prop_assert_eq!(Message::from_cbor_bytes(&bytes).expect("round trips"), msg);
        }
    }
}

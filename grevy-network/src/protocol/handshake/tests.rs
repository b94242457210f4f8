//! Fixed test vectors for handshake negotiation.
//!
//! The reply hexes are wire captures from a production peer, so they pin the
//! exact encoding, not just the message shape.

use grevy_chain::ToCbor;

use super::{
    client_proposal,
    message::{Message, VersionData},
    HandshakeHandler, HandshakeResult, VersionTable,
};
use crate::multiplexer::{ProtocolError, ProtocolHandler};

fn local(magic: u32) -> VersionData {
    VersionData {
        network_magic: magic,
        initiator_only_diffusion: false,
        peer_sharing: 0,
        query: false,
    }
}

fn table(versions: &[u64], promoted: u64) -> VersionTable {
    VersionTable::new(versions.iter().map(|v| (*v, local(1234))).collect(), promoted)
        .expect("promoted version is listed")
}

fn reply_hex(handler: &mut HandshakeHandler, payload: &[u8]) -> String {
    let generator = handler
        .data(payload)
        .expect("proposals never raise a violation")
        .expect("the handshake always replies");
    let buffers: Vec<Vec<u8>> = generator.collect();
    assert_eq!(buffers.len(), 1, "handshake replies are a single message");
    hex::encode(&buffers[0])
}

fn propose(versions: &[(u64, VersionData)]) -> Vec<u8> {
    Message::ProposeVersions(versions.iter().cloned().collect()).to_cbor_bytes()
}

#[test]
fn bad_version_table() {
    grevy_test::init();

    assert!(VersionTable::new([(22, local(1234))].into_iter().collect(), 20).is_err());
    assert!(VersionTable::new(Default::default(), 20).is_err());
}

#[test]
fn propose_empty() {
    grevy_test::init();

    let mut handler = HandshakeHandler::new(table(&[22], 22));
    assert_eq!(reply_hex(&mut handler, &propose(&[])), "820282008116");
}

#[test]
fn bad_message_is_refused_as_a_decode_error() {
    grevy_test::init();

    let mut handler = HandshakeHandler::new(table(&[20, 22], 22));
    // a query-reply-shaped message where a proposal belongs
    let payload = hex::decode("8203a114841904d2010000").expect("valid hex");
    assert_eq!(
        reply_hex(&mut handler, &payload),
        "820283011670696e76616c696420656e636f64696e67"
    );
}

#[test]
fn accept() {
    grevy_test::init();

    let mut handler = HandshakeHandler::new(table(&[20, 22], 22));
    let payload = propose(&[(
        20,
        VersionData {
            network_magic: 1234,
            initiator_only_diffusion: true,
            peer_sharing: 0,
            query: false,
        },
    )]);
    assert_eq!(reply_hex(&mut handler, &payload), "830114841904d2f500f4");
    assert_eq!(
        handler.negotiated(),
        Some(HandshakeResult {
            version: 20,
            data: VersionData {
                network_magic: 1234,
                initiator_only_diffusion: true,
                peer_sharing: 0,
                query: false,
            },
        })
    );
}

#[test]
fn query() {
    grevy_test::init();

    let mut handler = HandshakeHandler::new(table(&[20, 22], 22));
    let payload = propose(&[(
        20,
        VersionData {
            network_magic: 1234,
            initiator_only_diffusion: true,
            peer_sharing: 0,
            query: true,
        },
    )]);
    assert_eq!(
        reply_hex(&mut handler, &payload),
        "8203a214841904d2f400f416841904d2f400f4"
    );
    assert_eq!(handler.negotiated(), None);
}

#[test]
fn reject_encoding() {
    grevy_test::init();

    let mut handler = HandshakeHandler::new(table(&[20, 22], 22));
    assert_eq!(
        reply_hex(&mut handler, &[0x88]),
        "820283011670696e76616c696420656e636f64696e67"
    );
}

#[test]
fn reject_unknown_protocol_version() {
    grevy_test::init();

    let mut handler = HandshakeHandler::new(table(&[20, 22], 22));
    let payload = propose(&[(
        23,
        VersionData {
            network_magic: 1234,
            initiator_only_diffusion: true,
            peer_sharing: 0,
            query: false,
        },
    )]);
    assert_eq!(reply_hex(&mut handler, &payload), "82028200821416");
}

#[test]
fn reject_network_magic() {
    grevy_test::init();

    let mut handler = HandshakeHandler::new(table(&[20, 22], 22));
    let payload = propose(&[(
        22,
        VersionData {
            network_magic: 123_456_789,
            initiator_only_diffusion: true,
            peer_sharing: 0,
            query: false,
        },
    )]);
    assert_eq!(
        reply_hex(&mut handler, &payload),
        "8202830216783e7468652070726f706f736564206d61676963206973206e6f742\
         0737570706f727465643a207265713a2031323334353637383920686176653a2031323334"
    );
}

#[test]
fn reject_diffusion() {
    grevy_test::init();

    let mut handler = HandshakeHandler::new(table(&[20, 22], 22));
    let payload = propose(&[(
        22,
        VersionData {
            network_magic: 1234,
            initiator_only_diffusion: false,
            peer_sharing: 0,
            query: false,
        },
    )]);
    assert_eq!(
        reply_hex(&mut handler, &payload),
        "8202830216783961206e6567617469766520696e69746961746f725f6f6e6c795\
         f646966667573696f6e5f6d6f6465206973206e6f7420737570706f72746564"
    );
}

#[test]
fn reject_peer_sharing() {
    grevy_test::init();

    let mut handler = HandshakeHandler::new(table(&[20, 22], 22));
    let payload = propose(&[(
        22,
        VersionData {
            network_magic: 1234,
            initiator_only_diffusion: true,
            peer_sharing: 1,
            query: false,
        },
    )]);
    assert_eq!(
        reply_hex(&mut handler, &payload),
        "8202830216781d706565725f73686172696e67206973206e6f7420737570706f72746564"
    );
}

#[test]
fn query_for_an_unknown_version_is_a_mismatch() {
    grevy_test::init();

    let mut handler = HandshakeHandler::new(table(&[20, 22], 22));
    let payload = propose(&[(
        23,
        VersionData {
            network_magic: 1234,
            initiator_only_diffusion: true,
            peer_sharing: 0,
            query: true,
        },
    )]);
    assert_eq!(reply_hex(&mut handler, &payload), "82028200821416");
}

#[test]
fn second_message_is_a_violation() {
    grevy_test::init();

    let mut handler = HandshakeHandler::new(table(&[20], 20));
    let payload = propose(&[(
        20,
        VersionData {
            network_magic: 1234,
            initiator_only_diffusion: true,
            peer_sharing: 0,
            query: false,
        },
    )]);
    let _ = reply_hex(&mut handler, &payload);
    assert!(matches!(
        handler.data(&payload),
        Err(ProtocolError::UnexpectedMessage { state: "done", .. })
    ));
}

#[test]
fn failure_reporting() {
    grevy_test::init();

    let mut handler = HandshakeHandler::new(table(&[20], 20));
    handler.failed("some error");
    assert!(handler.data(&[]).is_err());
}

#[test]
fn cancellation_reporting() {
    grevy_test::init();

    let mut handler = HandshakeHandler::new(table(&[20], 20));
    handler.stopped();
    assert!(handler.data(&[]).is_err());
}

#[test]
fn client_proposal_requests_initiator_only_diffusion() {
    grevy_test::init();

    let proposal = client_proposal(14..=15, 764_824_073);
    assert_eq!(proposal.len(), 2);
    for data in proposal.values() {
        assert!(data.initiator_only_diffusion);
        assert_eq!(data.peer_sharing, 0);
        assert!(!data.query);
    }
}

mod prop {
    use grevy_chain::{FromCbor, ToCbor};
    use proptest::prelude::*;

    use super::super::message::{Message, RefuseReason, VersionData};

    fn version_data() -> impl Strategy<Value = VersionData> + Clone {
        (any::<u32>(), any::<bool>(), 0u8..2, any::<bool>()).prop_map(
            |(network_magic, initiator_only_diffusion, peer_sharing, query)| VersionData {
                network_magic,
                initiator_only_diffusion,
                peer_sharing,
                query,
            },
        )
    }

    fn message() -> impl Strategy<Value = Message> {
        let version_map = proptest::collection::btree_map(any::<u64>(), version_data(), 0..4);
        prop_oneof![
            version_map.clone().prop_map(Message::ProposeVersions),
            (any::<u64>(), version_data())
                .prop_map(|(v, d)| Message::AcceptVersion(v, d)),
            proptest::collection::vec(any::<u64>(), 0..4)
                .prop_map(|vs| Message::Refuse(RefuseReason::VersionMismatch(vs))),
            (any::<u64>(), ".{0,16}")
                .prop_map(|(v, m)| Message::Refuse(RefuseReason::DecodeError(v, m))),
            (any::<u64>(), ".{0,16}")
                .prop_map(|(v, m)| Message::Refuse(RefuseReason::Refused(v, m))),
            version_map.prop_map(Message::QueryReply),
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

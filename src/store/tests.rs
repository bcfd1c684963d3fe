//! Store module tests

use super::*;
use crate::config::Config;
use crate::message::{ClientMessage, Direction, MessageState};
use crate::protocol::{ProtocolVersion, QoS};
use bytes::Bytes;
use pretty_assertions::assert_eq;
use proptest::prelude::*;

fn store() -> (MessageStore, Notifier) {
    (MessageStore::new(Metrics::new()), Notifier::disabled())
}

fn base(db_id: u64, payload: &'static [u8]) -> Arc<BaseMessage> {
    let mut msg = BaseMessage::new("sensors/temp", Bytes::from_static(payload), QoS::AtLeastOnce, false);
    msg.db_id = db_id;
    Arc::new(msg)
}

#[test]
fn add_and_duplicate_rejection() {
    let (mut store, _n) = store();
    let msg = base(1, b"hello");
    store.add(Arc::clone(&msg)).unwrap();
    assert_eq!(store.len(), 1);
    assert_eq!(store.bytes(), 5);

    let dup = base(1, b"other");
    assert_eq!(store.add(dup), Err(StoreError::AlreadyExists));
    assert_eq!(store.len(), 1);
}

#[test]
fn ref_dec_evicts_at_zero() {
    let (mut store, notifier) = store();
    let msg = base(2, b"abc");
    store.add(Arc::clone(&msg)).unwrap();

    store.ref_inc(&msg);
    store.ref_inc(&msg);
    assert_eq!(msg.ref_count(), 2);

    store.ref_dec(&msg, &notifier);
    assert_eq!(msg.ref_count(), 1);
    assert!(store.get(2).is_some());

    store.ref_dec(&msg, &notifier);
    assert!(store.get(2).is_none());
    assert_eq!(store.len(), 0);
    assert_eq!(store.bytes(), 0);
}

#[test]
fn compact_removes_unreferenced_only() {
    let (mut store, notifier) = store();
    let kept = base(1, b"kept");
    let stale = base(2, b"stale");
    store.add(Arc::clone(&kept)).unwrap();
    store.add(Arc::clone(&stale)).unwrap();
    store.ref_inc(&kept);

    store.compact(&notifier);

    assert!(store.get(1).is_some());
    assert!(store.get(2).is_none());
    assert_eq!(store.len(), 1);
}

#[test]
fn clean_drains_everything() {
    let (mut store, _n) = store();
    for id in 1..=5 {
        store.add(base(id, b"x")).unwrap();
    }
    store.clean();
    assert!(store.is_empty());
    assert_eq!(store.bytes(), 0);
}

#[test]
fn find_by_source_mid_scans_inflight_then_queued() {
    let config = Config::default();
    let mut session = Session::new(Arc::from("c1"), ProtocolVersion::V311, &config);

    let inflight_base = {
        let mut b = BaseMessage::new("t", Bytes::from_static(b"a"), QoS::ExactlyOnce, false);
        b.db_id = 1;
        b.source_mid = 10;
        Arc::new(b)
    };
    let queued_base = {
        let mut b = BaseMessage::new("t", Bytes::from_static(b"b"), QoS::ExactlyOnce, false);
        b.db_id = 2;
        b.source_mid = 20;
        Arc::new(b)
    };

    session.msgs_in.inflight.push_back(ClientMessage {
        cmsg_id: 1,
        base: Arc::clone(&inflight_base),
        mid: 10,
        direction: Direction::In,
        state: MessageState::WaitForPubrel,
        qos: QoS::ExactlyOnce,
        retain: false,
        dup: false,
        subscription_identifier: 0,
    });
    session.msgs_in.queued.push_back(ClientMessage {
        cmsg_id: 2,
        base: Arc::clone(&queued_base),
        mid: 20,
        direction: Direction::In,
        state: MessageState::Queued,
        qos: QoS::ExactlyOnce,
        retain: false,
        dup: false,
        subscription_identifier: 0,
    });

    assert_eq!(find_by_source_mid(&session, 10).map(|m| m.db_id), Some(1));
    assert_eq!(find_by_source_mid(&session, 20).map(|m| m.db_id), Some(2));
    assert_eq!(find_by_source_mid(&session, 30).map(|m| m.db_id), None);
}

proptest! {
    #[test]
    fn generator_monotonic_across_any_sequence(node in 0u16..1024, count in 1usize..2000) {
        let mut gen = MessageIdGenerator::new(node);
        let mut last = 0u64;
        for _ in 0..count {
            let id = gen.next();
            prop_assert!(id > last);
            last = id;
        }
    }

    #[test]
    fn ref_count_balance(ops in proptest::collection::vec(0u8..2, 1..100)) {
        // Interleave inc/dec pairs; the count must equal incs minus decs
        // and the store must evict exactly when it reaches zero.
        let (mut store, notifier) = store();
        let msg = base(9, b"payload");
        store.add(Arc::clone(&msg)).unwrap();
        store.ref_inc(&msg); // baseline reference held by the test
        let mut count = 1i64;
        for op in ops {
            if op == 0 {
                store.ref_inc(&msg);
                count += 1;
            } else if count > 1 {
                store.ref_dec(&msg, &notifier);
                count -= 1;
            }
            prop_assert_eq!(msg.ref_count() as i64, count);
            prop_assert!(store.get(9).is_some());
        }
        store.ref_dec(&msg, &notifier);
        count -= 1;
        while count > 0 {
            store.ref_dec(&msg, &notifier);
            count -= 1;
        }
        prop_assert!(store.get(9).is_none());
    }
}

//! Session module tests

use super::*;
use crate::message::MessageState;
use bytes::Bytes;
use pretty_assertions::assert_eq;

use crate::message::BaseMessage;

fn config() -> Config {
    Config::default()
}

fn cmsg(payload: &'static [u8], qos: QoS, state: MessageState) -> ClientMessage {
    ClientMessage {
        cmsg_id: 0,
        base: Arc::new(BaseMessage::new("t", Bytes::from_static(payload), qos, false)),
        mid: 1,
        direction: Direction::Out,
        state,
        qos,
        retain: false,
        dup: false,
        subscription_identifier: 0,
    }
}

#[test]
fn queues_seed_window_from_config() {
    let session = Session::new(Arc::from("c1"), ProtocolVersion::V311, &config());
    assert_eq!(session.msgs_out.inflight_maximum, 20);
    assert_eq!(session.msgs_out.inflight_quota, 20);
    assert_eq!(session.msgs_in.inflight_maximum, 20);
    assert!(session.is_connected());
}

#[test]
fn stats_track_qos_split() {
    let mut q = MessageQueues::new(10);
    q.add_to_inflight_stats(100, QoS::AtMostOnce);
    q.add_to_inflight_stats(50, QoS::AtLeastOnce);
    assert_eq!(q.inflight_count, 2);
    assert_eq!(q.inflight_count12, 1);
    assert_eq!(q.inflight_bytes, 150);
    assert_eq!(q.inflight_bytes12, 50);

    q.remove_from_inflight_stats(100, QoS::AtMostOnce);
    assert_eq!(q.inflight_count, 1);
    assert_eq!(q.inflight_count12, 1);
    assert_eq!(q.inflight_bytes, 50);
    assert_eq!(q.inflight_bytes12, 50);
}

#[test]
fn dequeue_first_transfers_accounting() {
    let mut q = MessageQueues::new(5);
    let msg = cmsg(b"12345", QoS::AtLeastOnce, MessageState::Queued);
    q.add_to_queued_stats(msg.payload_len(), msg.qos);
    q.queued.push_back(msg);

    q.dequeue_first();

    assert_eq!(q.queued.len(), 0);
    assert_eq!(q.inflight.len(), 1);
    assert_eq!(q.queued_count, 0);
    assert_eq!(q.queued_bytes, 0);
    assert_eq!(q.inflight_count, 1);
    assert_eq!(q.inflight_bytes, 5);
    assert_eq!(q.inflight_bytes12, 5);
    assert_eq!(q.inflight_quota, 4);
}

#[test]
fn dequeue_first_on_empty_queue_is_noop() {
    let mut q = MessageQueues::new(5);
    q.dequeue_first();
    assert_eq!(q.inflight_quota, 5);
    assert!(q.inflight.is_empty());
}

#[test]
fn quotas_floor_and_cap() {
    let mut session = Session::new(Arc::from("c1"), ProtocolVersion::V5, &config());
    session.negotiate_send_window(2);

    session.decrement_send_quota();
    session.decrement_send_quota();
    session.decrement_send_quota(); // floors at 0
    assert_eq!(session.msgs_out.inflight_quota, 0);

    session.increment_send_quota();
    session.increment_send_quota();
    session.increment_send_quota(); // caps at the maximum
    assert_eq!(session.msgs_out.inflight_quota, 2);
}

#[test]
fn receive_quota_tracks_incoming_window() {
    let mut session = Session::new(Arc::from("c1"), ProtocolVersion::V5, &config());
    session.decrement_receive_quota();
    assert_eq!(session.msgs_in.inflight_quota, 19);
    session.increment_receive_quota();
    assert_eq!(session.msgs_in.inflight_quota, 20);
}

#[test]
fn store_resumes_persistent_sessions() {
    let store = SessionStore::new();
    let cfg = config();

    let (s1, resumed) = store.get_or_create("c1", ProtocolVersion::V311, false, &cfg);
    assert!(!resumed);
    {
        let mut s = s1.write();
        s.session_expiry_interval = 3600;
    }
    store.disconnect("c1");
    assert_eq!(s1.read().state, SessionState::Disconnected);

    let (s2, resumed) = store.get_or_create("c1", ProtocolVersion::V5, false, &cfg);
    assert!(resumed);
    assert_eq!(s2.read().state, SessionState::Connected);
    assert_eq!(s2.read().protocol_version, ProtocolVersion::V5);
}

#[test]
fn clean_start_discards_previous_session() {
    let store = SessionStore::new();
    let cfg = config();

    let (s1, _) = store.get_or_create("c1", ProtocolVersion::V311, false, &cfg);
    s1.write().session_expiry_interval = 3600;
    store.disconnect("c1");

    let (_, resumed) = store.get_or_create("c1", ProtocolVersion::V311, true, &cfg);
    assert!(!resumed);
}

#[test]
fn zero_expiry_sessions_removed_on_disconnect() {
    let store = SessionStore::new();
    let cfg = config();
    store.get_or_create("c1", ProtocolVersion::V311, true, &cfg);
    assert_eq!(store.len(), 1);
    store.disconnect("c1");
    assert!(store.is_empty());
}

#[test]
fn expired_sessions_cleaned_up() {
    let store = SessionStore::new();
    let cfg = config();
    let (s1, _) = store.get_or_create("c1", ProtocolVersion::V311, false, &cfg);
    {
        let mut s = s1.write();
        s.state = SessionState::Disconnected;
        s.session_expiry_interval = 0;
        s.disconnected_at = Some(Instant::now());
    }
    store.cleanup_expired();
    assert!(store.get("c1").is_none());
}

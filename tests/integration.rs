//! End-to-end delivery scenarios driven through the public API

use std::sync::Arc;

use bytes::Bytes;

use fluxmq_core::{
    Admission, BaseMessage, Config, MessageDb, MessageState, Origin, PacketSink, Properties,
    ProtocolVersion, QoS, RouteError, RouteOutcome, Router, Session, SessionState, SinkError,
};

#[derive(Default)]
struct WireLog {
    publishes: Vec<(u16, String, Vec<u8>, QoS, bool)>,
    pubrecs: Vec<u16>,
    pubrels: Vec<u16>,
}

impl PacketSink for WireLog {
    fn send_publish(
        &mut self,
        mid: u16,
        topic: &str,
        payload: &Bytes,
        qos: QoS,
        _retain: bool,
        dup: bool,
        _subscription_identifier: u32,
        _properties: &Properties,
        _expiry_interval: u32,
    ) -> Result<(), SinkError> {
        self.publishes
            .push((mid, topic.to_string(), payload.to_vec(), qos, dup));
        Ok(())
    }

    fn send_pubrec(&mut self, mid: u16, _reason: u8) -> Result<(), SinkError> {
        self.pubrecs.push(mid);
        Ok(())
    }

    fn send_pubrel(&mut self, mid: u16) -> Result<(), SinkError> {
        self.pubrels.push(mid);
        Ok(())
    }
}

#[derive(Default)]
struct RecordingRouter {
    routed: Vec<(String, String, QoS, bool)>,
}

impl Router for RecordingRouter {
    fn messages_queue(
        &mut self,
        source_id: &str,
        topic: &str,
        qos: QoS,
        retain: bool,
        _base: &Arc<BaseMessage>,
    ) -> Result<RouteOutcome, RouteError> {
        self.routed
            .push((source_id.to_string(), topic.to_string(), qos, retain));
        Ok(RouteOutcome::Routed)
    }
}

fn broker(config: Config) -> MessageDb {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
    let mut db = MessageDb::open(config);
    db.set_now(10_000);
    db
}

fn connect(db: &MessageDb, client_id: &str) -> Session {
    Session::new(Arc::from(client_id), ProtocolVersion::V311, db.config())
}

fn publish_to(
    db: &mut MessageDb,
    session: &mut Session,
    mid: u16,
    topic: &str,
    payload: &[u8],
    qos: QoS,
    expiry_interval: u32,
    sink: &mut WireLog,
) -> Admission {
    let base = BaseMessage::new(topic, Bytes::copy_from_slice(payload), qos, false);
    let base = db
        .store_message(None, base, expiry_interval, None, Origin::Broker)
        .unwrap();
    db.insert_outgoing(session, 0, mid, qos, false, &base, 0, true, false, sink)
        .unwrap()
}

#[test]
fn qos0_delivery_to_unlimited_session() {
    let mut config = Config::default();
    config.limits.max_inflight_messages = 0;
    let mut db = broker(config);
    let mut session = connect(&db, "reader");
    let mut wire = WireLog::default();

    let admission = publish_to(
        &mut db,
        &mut session,
        0,
        "sensors/temp",
        b"21.5",
        QoS::AtMostOnce,
        0,
        &mut wire,
    );

    assert_eq!(admission, Admission::Inflight);
    assert_eq!(wire.publishes.len(), 1);
    assert_eq!(wire.publishes[0].1, "sensors/temp");
    assert_eq!(session.msgs_out.inflight_count, 0);
    assert!(session.msgs_out.inflight.is_empty());
}

#[test]
fn qos1_window_of_one_queues_then_promotes_on_puback() {
    let mut config = Config::default();
    config.limits.max_inflight_messages = 1;
    let mut db = broker(config);
    let mut session = connect(&db, "reader");
    let mut wire = WireLog::default();

    let first = publish_to(&mut db, &mut session, 1, "a", b"one", QoS::AtLeastOnce, 0, &mut wire);
    let second = publish_to(&mut db, &mut session, 2, "a", b"two", QoS::AtLeastOnce, 0, &mut wire);

    assert_eq!(first, Admission::Inflight);
    assert_eq!(second, Admission::Queued);
    assert_eq!(wire.publishes.len(), 1);
    assert_eq!(session.msgs_out.inflight[0].state, MessageState::WaitForPuback);

    db.delete_outgoing(
        &mut session,
        1,
        MessageState::WaitForPuback,
        QoS::AtLeastOnce,
        &mut wire,
    )
    .unwrap();

    assert_eq!(wire.publishes.len(), 2);
    assert_eq!(wire.publishes[1].0, 2);
    assert_eq!(session.msgs_out.inflight[0].state, MessageState::WaitForPuback);
    assert!(session.msgs_out.queued.is_empty());
}

#[test]
fn inbound_qos2_exchange_routes_on_pubrel() {
    let mut db = broker(Config::default());
    let mut publisher = connect(&db, "publisher");
    let mut wire = WireLog::default();
    let mut router = RecordingRouter::default();

    let mut base = BaseMessage::new("lights/cmd", Bytes::from_static(b"hello"), QoS::ExactlyOnce, false);
    base.source_mid = 11;
    let base = db
        .store_message(Some(&publisher), base, 0, None, Origin::Client)
        .unwrap();

    let admission = db.insert_incoming(&mut publisher, 0, &base, false).unwrap();
    assert_eq!(admission, Admission::Inflight);
    assert_eq!(publisher.msgs_in.inflight[0].state, MessageState::WaitForPubrel);
    assert_eq!(publisher.msgs_in.inflight_bytes, 5);

    // The duplicate-detection lookup the broker does on re-sent PUBLISHes
    assert_eq!(
        db.find_by_source_mid(&publisher, 11).map(|m| m.db_id),
        Some(base.db_id)
    );

    db.release_incoming(&mut publisher, 11, &mut wire, &mut router)
        .unwrap();

    assert_eq!(router.routed.len(), 1);
    assert_eq!(
        router.routed[0],
        ("publisher".to_string(), "lights/cmd".to_string(), QoS::ExactlyOnce, false)
    );
    assert!(publisher.msgs_in.inflight.is_empty());
    assert_eq!(publisher.msgs_in.inflight_bytes, 0);
}

#[test]
fn expired_qos1_message_never_hits_the_wire() {
    let mut db = broker(Config::default());
    let mut session = connect(&db, "reader");
    let mut wire = WireLog::default();

    // Expires one second from now; the clock then jumps past it
    let base = BaseMessage::new("a", Bytes::from_static(b"stale"), QoS::AtLeastOnce, false);
    let base = db.store_message(None, base, 1, None, Origin::Broker).unwrap();
    db.set_now(db.now() + 2);

    let quota_before = session.msgs_out.inflight_quota;
    db.insert_outgoing(&mut session, 0, 1, QoS::AtLeastOnce, false, &base, 0, true, false, &mut wire)
        .unwrap();

    assert!(wire.publishes.is_empty());
    assert!(session.msgs_out.inflight.is_empty());
    assert_eq!(session.msgs_out.inflight_quota, quota_before);
}

#[test]
fn overlapping_subscriptions_deliver_once() {
    let mut db = broker(Config::default());
    let mut session = connect(&db, "c1");
    let mut wire = WireLog::default();

    let base = BaseMessage::new("a", Bytes::from_static(b"x"), QoS::AtLeastOnce, false);
    let base = db.store_message(None, base, 0, None, Origin::Broker).unwrap();

    let first = db
        .insert_outgoing(&mut session, 0, 1, QoS::AtLeastOnce, false, &base, 0, true, false, &mut wire)
        .unwrap();
    let second = db
        .insert_outgoing(&mut session, 0, 2, QoS::AtLeastOnce, false, &base, 0, true, false, &mut wire)
        .unwrap();

    assert_eq!(first, Admission::Inflight);
    assert_eq!(second, Admission::Suppressed);
    assert_eq!(wire.publishes.len(), 1);

    let dest_ids = base.dest_ids.lock();
    assert_eq!(dest_ids.len(), 1);
    assert_eq!(&*dest_ids[0], "c1");
}

#[test]
fn offline_backlog_flushes_in_order_after_reconnect() {
    let mut config = Config::default();
    config.limits.max_inflight_messages = 1;
    let mut db = broker(config);
    let mut session = connect(&db, "roamer");
    session.state = SessionState::Disconnected;
    let mut wire = WireLog::default();

    for (mid, payload) in [(1u16, b"one"), (2, b"two"), (3, b"thr")] {
        let base = BaseMessage::new("updates", Bytes::copy_from_slice(payload), QoS::AtLeastOnce, false);
        let base = db.store_message(None, base, 0, None, Origin::Broker).unwrap();
        let admission = db
            .insert_outgoing(&mut session, 0, mid, QoS::AtLeastOnce, false, &base, 0, false, false, &mut wire)
            .unwrap();
        assert_eq!(admission, Admission::Queued);
    }
    assert!(wire.publishes.is_empty());

    // Reconnect with a larger negotiated window
    session.state = SessionState::Connected;
    session.negotiate_send_window(16);
    db.reconnect_reset(&mut session);
    db.write_inflight_out_all(&mut session, &mut wire).unwrap();

    let mids: Vec<u16> = wire.publishes.iter().map(|p| p.0).collect();
    assert_eq!(mids, vec![1, 2, 3]);
    assert!(session
        .msgs_out
        .inflight
        .iter()
        .all(|m| m.state == MessageState::WaitForPuback));
    assert!(session.msgs_out.queued.is_empty());
}

#[test]
fn broker_internal_publish_reaches_the_router() {
    let mut db = broker(Config::default());
    let mut router = RecordingRouter::default();

    db.easy_queue(
        None,
        "$SYS/broker/clients/connected",
        QoS::AtMostOnce,
        b"17",
        false,
        0,
        None,
        &mut router,
    )
    .unwrap();

    assert_eq!(router.routed.len(), 1);
    assert_eq!(router.routed[0].0, "");
    assert_eq!(router.routed[0].1, "$SYS/broker/clients/connected");
}

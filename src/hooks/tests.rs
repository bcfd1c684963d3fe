//! Hooks module tests

use super::*;
use bytes::Bytes;
use parking_lot::Mutex;

#[derive(Default)]
struct RecordingHooks {
    events: Mutex<Vec<String>>,
}

impl PersistHooks for RecordingHooks {
    fn base_msg_add(&self, msg: &BaseMessage) {
        self.events.lock().push(format!("base_add:{}", msg.db_id));
    }

    fn base_msg_delete(&self, db_id: u64) {
        self.events.lock().push(format!("base_del:{}", db_id));
    }

    fn client_msg_add(&self, record: &ClientMsgRecord) {
        self.events
            .lock()
            .push(format!("cmsg_add:{}:{}", record.client_id, record.mid));
    }

    fn client_msg_update(&self, record: &ClientMsgRecord) {
        self.events
            .lock()
            .push(format!("cmsg_upd:{}:{:?}", record.client_id, record.state));
    }

    fn client_msg_delete(&self, record: &ClientMsgRecord) {
        self.events
            .lock()
            .push(format!("cmsg_del:{}:{}", record.client_id, record.mid));
    }
}

fn base(db_id: u64) -> Arc<BaseMessage> {
    let mut msg = BaseMessage::new("t", Bytes::from_static(b"p"), QoS::AtLeastOnce, false);
    msg.db_id = db_id;
    Arc::new(msg)
}

fn cmsg(base: &Arc<BaseMessage>, mid: u16) -> ClientMessage {
    ClientMessage {
        cmsg_id: 1,
        base: Arc::clone(base),
        mid,
        direction: Direction::Out,
        state: MessageState::PublishQos1,
        qos: QoS::AtLeastOnce,
        retain: false,
        dup: false,
        subscription_identifier: 0,
    }
}

#[test]
fn notifications_reach_hooks_in_order() {
    let hooks = Arc::new(RecordingHooks::default());
    let mut notifier = Notifier::new(hooks.clone());
    assert!(notifier.is_enabled());

    let client_id: Arc<str> = Arc::from("c1");
    let b = base(7);
    notifier.base_msg_add(&b);
    notifier.client_msg_add(&client_id, &cmsg(&b, 10));
    notifier.client_msg_delete(&client_id, &cmsg(&b, 10));
    notifier.base_msg_delete(7);

    // Shutdown joins the worker, so every notification has been drained
    notifier.shutdown();

    let events = hooks.events.lock();
    assert_eq!(
        *events,
        vec![
            "base_add:7".to_string(),
            "cmsg_add:c1:10".to_string(),
            "cmsg_del:c1:10".to_string(),
            "base_del:7".to_string(),
        ]
    );
}

#[test]
fn disabled_notifier_discards_silently() {
    let notifier = Notifier::disabled();
    assert!(!notifier.is_enabled());
    // Must not panic or block
    notifier.base_msg_delete(1);
    notifier.base_msg_add(&base(1));
}

#[test]
fn default_hooks_are_noops() {
    let hooks = DefaultHooks;
    hooks.base_msg_add(&base(1));
    hooks.base_msg_delete(1);
}

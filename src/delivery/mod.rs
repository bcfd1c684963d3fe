//! Delivery-state engine
//!
//! `MessageDb` owns the broker-wide message store and drives every
//! per-session delivery record through the MQTT QoS 0/1/2 handshakes,
//! enforcing inflight windows, queue budgets, deduplication and expiry.
//! Wire output goes through the [`PacketSink`] collaborator; accepted
//! inbound messages are handed to the [`Router`]. All operations run
//! synchronously to completion.

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use tracing::warn;

use crate::config::Config;
use crate::hooks::{Notifier, PersistHooks};
use crate::message::{BaseMessage, ClientMessage, Direction, MessageState, Origin};
use crate::metrics::Metrics;
use crate::protocol::{Properties, ProtocolVersion, QoS};
use crate::session::{BridgeStart, MessageQueues, Session};
use crate::store::{self, MessageIdGenerator, MessageStore};

mod error;
mod writer;


pub use error::{Admission, DbError, DropReason, RouteError, RouteOutcome, SinkError};

/// Wire output collaborator, bound to one session's connection.
///
/// Implementations encode and write the packet; the engine never sees the
/// wire format. `SinkError::OversizePacket` tells the engine to drop the
/// message rather than retry it.
pub trait PacketSink {
    #[allow(clippy::too_many_arguments)]
    fn send_publish(
        &mut self,
        mid: u16,
        topic: &str,
        payload: &Bytes,
        qos: QoS,
        retain: bool,
        dup: bool,
        subscription_identifier: u32,
        properties: &Properties,
        expiry_interval: u32,
    ) -> Result<(), SinkError>;

    fn send_pubrec(&mut self, mid: u16, reason: u8) -> Result<(), SinkError>;

    fn send_pubrel(&mut self, mid: u16) -> Result<(), SinkError>;
}

/// Subscription/routing collaborator: fans an accepted message out to the
/// sessions subscribed to its topic.
pub trait Router {
    fn messages_queue(
        &mut self,
        source_id: &str,
        topic: &str,
        qos: QoS,
        retain: bool,
        base: &Arc<BaseMessage>,
    ) -> Result<RouteOutcome, RouteError>;
}

/// The message database: broker-wide store plus the per-session delivery
/// operations. Created by [`MessageDb::open`], torn down by
/// [`MessageDb::close`].
pub struct MessageDb {
    config: Config,
    store: MessageStore,
    id_gen: MessageIdGenerator,
    metrics: Metrics,
    notifier: Notifier,
    /// Wall clock seconds, refreshed by the event loop
    now_real_s: u64,
}

impl MessageDb {
    /// Open the database without persistence hooks
    pub fn open(config: Config) -> Self {
        Self::open_with_hooks(config, None)
    }

    /// Open the database, spawning the persistence notifier when hooks are
    /// given
    pub fn open_with_hooks(config: Config, hooks: Option<Arc<dyn PersistHooks>>) -> Self {
        let metrics = Metrics::new();
        let store = MessageStore::new(metrics.clone());
        let id_gen = MessageIdGenerator::new(config.node.id);
        let notifier = match hooks {
            Some(hooks) => Notifier::new(hooks),
            None => Notifier::disabled(),
        };
        let now_real_s = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0);
        Self {
            config,
            store,
            id_gen,
            metrics,
            notifier,
            now_real_s,
        }
    }

    /// Drain the store and stop the persistence notifier
    pub fn close(&mut self) {
        self.store.clean();
        self.notifier.shutdown();
    }

    /// Refresh the wall clock; expiry decisions use this value
    pub fn set_now(&mut self, now_real_s: u64) {
        self.now_real_s = now_real_s;
    }

    pub fn now(&self) -> u64 {
        self.now_real_s
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn store(&self) -> &MessageStore {
        &self.store
    }

    /// Defensive sweep of unreferenced store entries
    pub fn compact(&mut self) {
        self.store.compact(&self.notifier);
    }

    /// Locate the base message a client's QoS 2 PUBLISH used `mid` for
    pub fn find_by_source_mid(&self, session: &Session, mid: u16) -> Option<Arc<BaseMessage>> {
        store::find_by_source_mid(session, mid)
    }

    // ----- admission ------------------------------------------------------

    /// Is this session ready to take another inflight message right now?
    pub fn ready_for_flight(&self, session: &Session, direction: Direction, qos: QoS) -> bool {
        let msgs = session.queues(direction);
        let limits = &self.config.limits;

        if msgs.inflight_maximum == 0 && limits.max_inflight_bytes == 0 {
            return true;
        }

        if qos == QoS::AtMostOnce {
            // QoS 0 is either sent now or dropped; there is no queueing
            // option unless the client is offline and queue_qos0_messages
            // is enabled.
            if limits.max_queued_messages == 0 && limits.max_inflight_bytes == 0 {
                return true;
            }
            // Bytes beyond the inflight window must fit the queue budget
            let valid_bytes = if msgs.inflight_bytes >= limits.max_inflight_bytes {
                msgs.inflight_bytes - limits.max_inflight_bytes < limits.max_queued_bytes
            } else {
                true
            };
            let valid_count = match direction {
                Direction::Out => session.out_packet_count < limits.max_queued_messages,
                Direction::In => {
                    msgs.inflight_count.saturating_sub(usize::from(msgs.inflight_maximum))
                        < limits.max_queued_messages
                }
            };

            if limits.max_queued_messages == 0 {
                return valid_bytes;
            }
            if limits.max_queued_bytes == 0 {
                return valid_count;
            }
            valid_bytes && valid_count
        } else {
            let valid_bytes = msgs.inflight_bytes12 < limits.max_inflight_bytes;
            let valid_count = msgs.inflight_quota > 0;

            if msgs.inflight_maximum == 0 {
                return valid_bytes;
            }
            if limits.max_inflight_bytes == 0 {
                return valid_count;
            }
            valid_bytes && valid_count
        }
    }

    /// May another message be queued for this session? Assumes the inflight
    /// check has already failed.
    pub fn ready_for_queue(&self, session: &Session, qos: QoS, direction: Direction) -> bool {
        let limits = &self.config.limits;

        if limits.max_queued_messages == 0 && limits.max_queued_bytes == 0 {
            return true;
        }
        if qos == QoS::AtMostOnce && !self.config.mqtt.queue_qos0_messages {
            return false; // connected QoS 0 is handled by ready_for_flight
        }

        let msgs = session.queues(direction);
        let source_bytes = msgs.queued_bytes12;
        let source_count = msgs.queued_count12;
        // Nothing is in flight for offline clients, so nothing to subtract
        let (adjust_bytes, adjust_count) = if session.is_connected() {
            (limits.max_inflight_bytes, usize::from(msgs.inflight_maximum))
        } else {
            (0, 0)
        };

        let valid_bytes = source_bytes.saturating_sub(adjust_bytes) < limits.max_queued_bytes;
        let valid_count = source_count.saturating_sub(adjust_count) < limits.max_queued_messages;

        if limits.max_queued_bytes == 0 {
            return valid_count;
        }
        if limits.max_queued_messages == 0 {
            return valid_bytes;
        }
        valid_bytes && valid_count
    }

    /// Latch the dropping state and account the loss
    fn drop_message(&self, session: &mut Session) {
        if !session.is_dropping {
            session.is_dropping = true;
            warn!(
                client_id = %session.client_id,
                "outgoing messages are being dropped for client"
            );
        }
        self.metrics.messages_dropped.inc();
        session.stats.messages_dropped += 1;
    }

    // ----- inserts --------------------------------------------------------

    /// Admit an outgoing delivery of `base` to this session.
    ///
    /// `cmsg_id` of 0 allocates the next per-session id (non-zero values
    /// come from persistence restore). With `update` set, freshly admitted
    /// inflight messages are written to the wire immediately and queue
    /// promotion runs.
    #[allow(clippy::too_many_arguments)]
    pub fn insert_outgoing(
        &mut self,
        session: &mut Session,
        cmsg_id: u64,
        mid: u16,
        qos: QoS,
        retain: bool,
        base: &Arc<BaseMessage>,
        subscription_identifier: u32,
        update: bool,
        persist: bool,
        sink: &mut dyn PacketSink,
    ) -> Result<Admission, DbError> {
        session.stats.messages_sent += 1;
        self.metrics.messages_sent.inc();

        // Skip clients this message already went to, for overlapping v3.x
        // subscriptions. A retained message here is a stale one being
        // replayed at subscribe time and is sent regardless.
        if session.protocol_version != ProtocolVersion::V5
            && !self.config.mqtt.allow_duplicate_messages
            && !retain
            && base.delivered_to(&session.client_id)
        {
            return Ok(Admission::Suppressed);
        }

        let connected = session.is_connected();
        if !connected {
            if qos == QoS::AtMostOnce && !self.config.mqtt.queue_qos0_messages {
                match &session.bridge {
                    None => return Ok(Admission::Dropped(DropReason::NotConnected)),
                    Some(b) if b.start_type != BridgeStart::Lazy => {
                        return Ok(Admission::Dropped(DropReason::NotConnected));
                    }
                    Some(_) => {}
                }
            }
            if session.bridge.as_ref().is_some_and(|b| b.clean_start_local) {
                return Ok(Admission::Dropped(DropReason::BridgeCleanStart));
            }
        }

        let (state, admission) = if connected {
            if self.ready_for_flight(session, Direction::Out, qos) {
                (MessageState::publish_for(qos), Admission::Inflight)
            } else if qos != QoS::AtMostOnce && self.ready_for_queue(session, qos, Direction::Out) {
                (MessageState::Queued, Admission::Queued)
            } else {
                self.drop_message(session);
                return Ok(Admission::Dropped(DropReason::QueueFull));
            }
        } else if self.ready_for_queue(session, qos, Direction::Out) {
            (MessageState::Queued, Admission::Queued)
        } else {
            self.drop_message(session);
            return Ok(Admission::Dropped(DropReason::QueueFull));
        };

        let cmsg_id = if cmsg_id != 0 {
            cmsg_id
        } else {
            session.next_cmsg_id()
        };
        self.store.ref_inc(base);
        let msg = ClientMessage {
            cmsg_id,
            base: Arc::clone(base),
            mid,
            direction: Direction::Out,
            state,
            qos: qos.min(session.max_qos),
            retain,
            dup: false,
            subscription_identifier,
        };
        let msg_qos = msg.qos;
        self.append_message(session, Direction::Out, msg, persist);

        // Record the recipient so overlapping subscriptions stay deduplicated
        if !self.config.mqtt.allow_duplicate_messages && !retain {
            base.record_dest(Arc::clone(&session.client_id));
        }

        if let Some(bridge) = session.bridge.as_mut() {
            if bridge.start_type == BridgeStart::Lazy
                && !connected
                && session.msgs_out.inflight_count + session.msgs_out.queued_count
                    >= bridge.threshold
            {
                bridge.lazy_reconnect = true;
            }
        }

        if msg_qos != QoS::AtMostOnce && state != MessageState::Queued {
            session.decrement_send_quota();
        }

        if update {
            self.write_inflight_out_latest(session, sink)?;
            self.write_queued_out(session);
        }

        Ok(admission)
    }

    /// Track an inbound QoS 2 PUBLISH until its PUBREL arrives
    pub fn insert_incoming(
        &mut self,
        session: &mut Session,
        cmsg_id: u64,
        base: &Arc<BaseMessage>,
        persist: bool,
    ) -> Result<Admission, DbError> {
        let (state, admission) = if self.ready_for_flight(session, Direction::In, base.qos) {
            (MessageState::WaitForPubrel, Admission::Inflight)
        } else if base.qos != QoS::AtMostOnce
            && self.ready_for_queue(session, base.qos, Direction::In)
        {
            (MessageState::Queued, Admission::Queued)
        } else {
            self.drop_message(session);
            return Ok(Admission::Dropped(DropReason::QueueFull));
        };

        let cmsg_id = if cmsg_id != 0 {
            cmsg_id
        } else {
            session.next_cmsg_id()
        };
        self.store.ref_inc(base);
        let msg = ClientMessage {
            cmsg_id,
            base: Arc::clone(base),
            mid: base.source_mid,
            direction: Direction::In,
            state,
            qos: base.qos.min(session.max_qos),
            retain: base.retain,
            dup: false,
            subscription_identifier: 0,
        };
        self.append_message(session, Direction::In, msg, persist);

        if base.qos != QoS::AtMostOnce {
            session.decrement_receive_quota();
        }
        Ok(admission)
    }

    /// Append an admitted message to the right list, keep the accounting,
    /// and notify persistence.
    fn append_message(
        &mut self,
        session: &mut Session,
        direction: Direction,
        msg: ClientMessage,
        persist: bool,
    ) {
        let notify = persist && session.is_persisted;
        if notify {
            self.notifier.base_msg_add(&msg.base);
        }
        let client_id = Arc::clone(&session.client_id);
        let queued = msg.state == MessageState::Queued;
        let (len, qos) = (msg.payload_len(), msg.qos);
        let data = session.queues_mut(direction);
        if queued {
            data.queued.push_back(msg);
            data.add_to_queued_stats(len, qos);
            self.metrics
                .queued_messages
                .with_label_values(&[direction.as_str()])
                .inc();
            if notify {
                if let Some(m) = data.queued.back() {
                    self.notifier.client_msg_add(&client_id, m);
                }
            }
        } else {
            data.inflight.push_back(msg);
            data.add_to_inflight_stats(len, qos);
            self.metrics
                .inflight_messages
                .with_label_values(&[direction.as_str()])
                .inc();
            if notify {
                if let Some(m) = data.inflight.back() {
                    self.notifier.client_msg_add(&client_id, m);
                }
            }
        }
    }

    // ----- acknowledgments ------------------------------------------------

    /// Complete an outgoing delivery on PUBACK (QoS 1) or PUBCOMP (QoS 2),
    /// then promote and flush whatever now fits the freed window.
    pub fn delete_outgoing(
        &mut self,
        session: &mut Session,
        mid: u16,
        expect_state: MessageState,
        qos: QoS,
        sink: &mut dyn PacketSink,
    ) -> Result<(), DbError> {
        let client_id = Arc::clone(&session.client_id);

        if let Some(idx) = session.msgs_out.inflight.iter().position(|m| m.mid == mid) {
            let msg = &session.msgs_out.inflight[idx];
            if msg.qos != qos {
                return Err(DbError::Protocol);
            }
            if qos == QoS::ExactlyOnce && msg.state != expect_state {
                return Err(DbError::Protocol);
            }
            let restore = msg.qos != QoS::AtMostOnce;
            self.remove_inflight(&client_id, &mut session.msgs_out, Direction::Out, idx);
            if restore {
                session.increment_send_quota();
            }
        } else if let Some(idx) = session.msgs_out.queued.iter().position(|m| m.mid == mid) {
            let msg = &session.msgs_out.queued[idx];
            if msg.qos != qos {
                return Err(DbError::Protocol);
            }
            if qos == QoS::ExactlyOnce && msg.state != expect_state {
                return Err(DbError::Protocol);
            }
            self.remove_queued(&client_id, &mut session.msgs_out, Direction::Out, idx);
        }

        self.write_queued_out(session);
        self.write_inflight_out_latest(session, sink)
    }

    /// Advance an outgoing inflight entry to a new handshake state (PUBREC
    /// received, for instance)
    pub fn update_outgoing(
        &mut self,
        session: &mut Session,
        mid: u16,
        state: MessageState,
        qos: QoS,
        persist: bool,
    ) -> Result<(), DbError> {
        let client_id = Arc::clone(&session.client_id);
        for msg in session.msgs_out.inflight.iter_mut() {
            if msg.mid == mid {
                if msg.qos != qos {
                    return Err(DbError::Protocol);
                }
                msg.state = state;
                if persist {
                    self.notifier.client_msg_update(&client_id, msg);
                }
                return Ok(());
            }
        }
        Err(DbError::NotFound)
    }

    /// Discard an incoming QoS 2 record without routing it
    pub fn remove_incoming(&mut self, session: &mut Session, mid: u16) -> Result<(), DbError> {
        let Some(idx) = session.msgs_in.inflight.iter().position(|m| m.mid == mid) else {
            return Err(DbError::NotFound);
        };
        let msg = &session.msgs_in.inflight[idx];
        if msg.base.qos != QoS::ExactlyOnce {
            return Err(DbError::Protocol);
        }
        let restore = msg.qos != QoS::AtMostOnce;
        let client_id = Arc::clone(&session.client_id);
        self.remove_inflight(&client_id, &mut session.msgs_in, Direction::In, idx);
        if restore {
            session.increment_receive_quota();
        }
        Ok(())
    }

    /// PUBREL received: route the held QoS 2 message to its subscribers and
    /// complete the exchange, then promote queued incoming messages that
    /// now fit.
    pub fn release_incoming(
        &mut self,
        session: &mut Session,
        mid: u16,
        sink: &mut dyn PacketSink,
        router: &mut dyn Router,
    ) -> Result<(), DbError> {
        let client_id = Arc::clone(&session.client_id);
        let mut deleted = false;

        if let Some(idx) = session.msgs_in.inflight.iter().position(|m| m.mid == mid) {
            let msg = &session.msgs_in.inflight[idx];
            if msg.base.qos != QoS::ExactlyOnce {
                return Err(DbError::Protocol);
            }
            let base = Arc::clone(&msg.base);
            let retain = msg.retain;
            let restore = msg.qos != QoS::AtMostOnce;

            match base.topic.as_deref() {
                // A denied QoS 2 publish finishes its handshake so the
                // client stops resending, but is never routed.
                None => {
                    self.remove_inflight(&client_id, &mut session.msgs_in, Direction::In, idx);
                    if restore {
                        session.increment_receive_quota();
                    }
                    deleted = true;
                }
                Some(topic) => {
                    match router.messages_queue(
                        &base.source_id,
                        topic,
                        QoS::ExactlyOnce,
                        retain,
                        &base,
                    ) {
                        // No subscribers still completes the exchange
                        Ok(_) => {
                            self.remove_inflight(&client_id, &mut session.msgs_in, Direction::In, idx);
                            if restore {
                                session.increment_receive_quota();
                            }
                            deleted = true;
                        }
                        Err(e) => return Err(DbError::Route(e)),
                    }
                }
            }
        }

        self.write_queued_in(session, sink)?;

        if deleted {
            Ok(())
        } else {
            Err(DbError::NotFound)
        }
    }

    // ----- reconnect and expiry -------------------------------------------

    /// Put both pipelines into a sensible state when a persistent session
    /// resumes: outgoing messages are marked for retry, incoming sub-QoS-2
    /// records are discarded (the client re-sends), and queued messages are
    /// promoted into the fresh window.
    pub fn reconnect_reset(&mut self, session: &mut Session) {
        self.reconnect_reset_outgoing(session);
        self.reconnect_reset_incoming(session);
    }

    pub fn reconnect_reset_outgoing(&mut self, session: &mut Session) {
        let client_id = Arc::clone(&session.client_id);
        let data = &mut session.msgs_out;
        data.reset_stats();
        data.inflight_quota = data.inflight_maximum;

        for idx in 0..data.inflight.len() {
            let (len, qos, state) = {
                let m = &data.inflight[idx];
                (m.payload_len(), m.qos, m.state)
            };
            data.add_to_inflight_stats(len, qos);
            if qos != QoS::AtMostOnce && data.inflight_quota > 0 {
                data.inflight_quota -= 1;
            }
            data.inflight[idx].state = match qos {
                QoS::AtMostOnce => MessageState::PublishQos0,
                QoS::AtLeastOnce => MessageState::PublishQos1,
                QoS::ExactlyOnce => {
                    if state == MessageState::WaitForPubcomp {
                        MessageState::ResendPubrel
                    } else {
                        MessageState::PublishQos2
                    }
                }
            };
            self.notifier.client_msg_update(&client_id, &data.inflight[idx]);
        }

        for idx in 0..data.queued.len() {
            let (len, qos) = {
                let m = &data.queued[idx];
                (m.payload_len(), m.qos)
            };
            data.add_to_queued_stats(len, qos);
        }

        // Promote queued messages now, otherwise they would sit until the
        // next delivery and go out of order
        self.promote_queued_out(session);
    }

    pub fn reconnect_reset_incoming(&mut self, session: &mut Session) {
        let client_id = Arc::clone(&session.client_id);
        session.msgs_in.reset_stats();
        session.msgs_in.inflight_quota = session.msgs_in.inflight_maximum;

        let mut idx = 0;
        while idx < session.msgs_in.inflight.len() {
            let (len, qos) = {
                let m = &session.msgs_in.inflight[idx];
                (m.payload_len(), m.qos)
            };
            if qos == QoS::ExactlyOnce {
                // State is preserved; it matches whatever the client saw
                session.msgs_in.add_to_inflight_stats(len, qos);
                if session.msgs_in.inflight_quota > 0 {
                    session.msgs_in.inflight_quota -= 1;
                }
                idx += 1;
            } else {
                // Anything below QoS 2 is retried whole by the client
                session.msgs_in.add_to_inflight_stats(len, qos);
                self.remove_inflight(&client_id, &mut session.msgs_in, Direction::In, idx);
            }
        }

        for idx in 0..session.msgs_in.queued.len() {
            let (len, qos) = {
                let m = &session.msgs_in.queued[idx];
                (m.payload_len(), m.qos)
            };
            session.msgs_in.add_to_queued_stats(len, qos);
        }

        // Promote queued QoS 2 records; the next write_queued_in pass sends
        // their PUBRECs
        loop {
            let Some(front) = session.msgs_in.queued.front() else {
                break;
            };
            if front.qos != QoS::ExactlyOnce {
                break;
            }
            if !self.ready_for_flight(session, Direction::In, QoS::ExactlyOnce) {
                break;
            }
            if let Some(front) = session.msgs_in.queued.front_mut() {
                front.state = MessageState::SendPubrec;
            }
            session.msgs_in.dequeue_first();
            self.record_promotion(Direction::In);
            if let Some(tail) = session.msgs_in.inflight.back() {
                self.notifier.client_msg_update(&client_id, tail);
            }
        }
    }

    /// Drop every expired message in both directions, restoring the
    /// appropriate window for inflight QoS 1/2 entries.
    pub fn expire_all_messages(&mut self, session: &mut Session) {
        let now = self.now_real_s;
        let client_id = Arc::clone(&session.client_id);

        let mut idx = 0;
        while idx < session.msgs_out.inflight.len() {
            let msg = &session.msgs_out.inflight[idx];
            if msg.base.is_expired(now) {
                let restore = msg.qos != QoS::AtMostOnce;
                self.remove_inflight(&client_id, &mut session.msgs_out, Direction::Out, idx);
                if restore {
                    session.increment_send_quota();
                }
            } else {
                idx += 1;
            }
        }

        idx = 0;
        while idx < session.msgs_out.queued.len() {
            if session.msgs_out.queued[idx].base.is_expired(now) {
                self.remove_queued(&client_id, &mut session.msgs_out, Direction::Out, idx);
            } else {
                idx += 1;
            }
        }

        idx = 0;
        while idx < session.msgs_in.inflight.len() {
            let msg = &session.msgs_in.inflight[idx];
            if msg.base.is_expired(now) {
                let restore = msg.qos != QoS::AtMostOnce;
                self.remove_inflight(&client_id, &mut session.msgs_in, Direction::In, idx);
                if restore {
                    session.increment_receive_quota();
                }
            } else {
                idx += 1;
            }
        }

        idx = 0;
        while idx < session.msgs_in.queued.len() {
            if session.msgs_in.queued[idx].base.is_expired(now) {
                self.remove_queued(&client_id, &mut session.msgs_in, Direction::In, idx);
            } else {
                idx += 1;
            }
        }
    }

    // ----- session teardown -----------------------------------------------

    /// Drop every incoming record and its store references
    pub fn delete_all_incoming(&mut self, session: &mut Session) {
        self.delete_queues(&mut session.msgs_in, Direction::In);
    }

    /// Drop every outgoing record and its store references
    pub fn delete_all_outgoing(&mut self, session: &mut Session) {
        self.delete_queues(&mut session.msgs_out, Direction::Out);
    }

    fn delete_queues(&mut self, data: &mut MessageQueues, direction: Direction) {
        let label = [direction.as_str()];
        while let Some(msg) = data.inflight.pop_front() {
            self.metrics.inflight_messages.with_label_values(&label).dec();
            self.store.ref_dec(&msg.base, &self.notifier);
        }
        while let Some(msg) = data.queued.pop_front() {
            self.metrics.queued_messages.with_label_values(&label).dec();
            self.store.ref_dec(&msg.base, &self.notifier);
        }
        data.reset_stats();
    }

    /// Clean-session teardown, honoring the bridge clean-start flags
    pub fn delete_all(&mut self, session: &mut Session, force: bool) {
        let bridge_clean_start = session.bridge.as_ref().is_some_and(|b| b.clean_start);
        let bridge_clean_start_local =
            session.bridge.as_ref().is_some_and(|b| b.clean_start_local);

        if force || session.clean_start || bridge_clean_start {
            self.delete_all_incoming(session);
        }
        if force
            || bridge_clean_start_local
            || (session.bridge.is_none() && session.clean_start)
        {
            self.delete_all_outgoing(session);
        }
    }

    // ----- broker-internal publishing -------------------------------------

    /// Register a new base message: source attribution, absolute expiry,
    /// id assignment and store insertion. `db_id` of `None` generates the
    /// next id (persistence restore passes the stored one).
    pub fn store_message(
        &mut self,
        source: Option<&Session>,
        mut base: BaseMessage,
        message_expiry_interval: u32,
        db_id: Option<u64>,
        origin: Origin,
    ) -> Result<Arc<BaseMessage>, DbError> {
        base.source_id = match source {
            Some(s) => Arc::clone(&s.client_id),
            None => Arc::from(""),
        };
        if let Some(source) = source {
            base.source_username = source.username.clone();
            base.source_listener = source.listener;
        }
        base.origin = origin;
        base.message_expiry_time = if message_expiry_interval > 0 {
            self.now_real_s + u64::from(message_expiry_interval)
        } else {
            0
        };
        base.db_id = match db_id {
            Some(id) => id,
            None => self.id_gen.next(),
        };

        let base = Arc::new(base);
        self.store
            .add(Arc::clone(&base))
            .map_err(|_| DbError::AlreadyExists)?;
        Ok(base)
    }

    /// Broker-internal publishing path ($SYS messages and the like):
    /// build a base message, register it, and hand it to the router.
    #[allow(clippy::too_many_arguments)]
    pub fn easy_queue(
        &mut self,
        source: Option<&Session>,
        topic: &str,
        qos: QoS,
        payload: &[u8],
        retain: bool,
        message_expiry_interval: u32,
        properties: Option<Properties>,
        router: &mut dyn Router,
    ) -> Result<(), DbError> {
        if topic.is_empty() {
            return Err(DbError::InvalidInput);
        }

        let retain = retain && self.config.mqtt.retain_available;
        let mut base = BaseMessage::new(topic, Bytes::copy_from_slice(payload), qos, retain);
        if let Some(properties) = properties {
            base.properties = properties;
        }

        let origin = if source.is_some() {
            Origin::Client
        } else {
            Origin::Broker
        };
        let base = self.store_message(source, base, message_expiry_interval, None, origin)?;

        let result = match base.topic.as_deref() {
            Some(topic) => router
                .messages_queue(&base.source_id, topic, base.qos, base.retain, &base)
                .map(|_| ())
                .map_err(DbError::Route),
            None => Err(DbError::InvalidInput),
        };

        // If routing took no references (or failed outright) the body has
        // no owners; evict it rather than leaving it for compact()
        if base.ref_count() == 0 {
            self.store.remove(base.db_id, false, &self.notifier);
        }
        result
    }

    // ----- internal helpers -----------------------------------------------

    /// Unlink an inflight entry: persistence delete, stats, store reference
    fn remove_inflight(
        &mut self,
        client_id: &Arc<str>,
        data: &mut MessageQueues,
        direction: Direction,
        idx: usize,
    ) {
        let Some(msg) = data.inflight.remove(idx) else {
            return;
        };
        self.notifier.client_msg_delete(client_id, &msg);
        data.remove_from_inflight_stats(msg.payload_len(), msg.qos);
        self.metrics
            .inflight_messages
            .with_label_values(&[direction.as_str()])
            .dec();
        self.store.ref_dec(&msg.base, &self.notifier);
    }

    /// Unlink a queued entry: persistence delete, stats, store reference
    fn remove_queued(
        &mut self,
        client_id: &Arc<str>,
        data: &mut MessageQueues,
        direction: Direction,
        idx: usize,
    ) {
        let Some(msg) = data.queued.remove(idx) else {
            return;
        };
        self.notifier.client_msg_delete(client_id, &msg);
        data.remove_from_queued_stats(msg.payload_len(), msg.qos);
        self.metrics
            .queued_messages
            .with_label_values(&[direction.as_str()])
            .dec();
        self.store.ref_dec(&msg.base, &self.notifier);
    }

    /// A queued entry just moved to inflight; keep the gauges with it
    fn record_promotion(&self, direction: Direction) {
        self.metrics
            .queued_messages
            .with_label_values(&[direction.as_str()])
            .dec();
        self.metrics
            .inflight_messages
            .with_label_values(&[direction.as_str()])
            .inc();
    }
}

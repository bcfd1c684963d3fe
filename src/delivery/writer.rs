//! Wire drivers: push inflight state machines forward and promote queued
//! messages into freed window space.

use std::sync::Arc;

use tracing::debug;

use crate::message::{Direction, MessageState};
use crate::protocol::QoS;
use crate::session::Session;

use super::{DbError, MessageDb, PacketSink, SinkError};

impl MessageDb {
    /// Drive one outgoing inflight entry. Returns true when the entry was
    /// removed (sent at QoS 0, expired, or oversize).
    fn write_inflight_out_single(
        &mut self,
        session: &mut Session,
        idx: usize,
        sink: &mut dyn PacketSink,
    ) -> Result<bool, DbError> {
        let client_id = Arc::clone(&session.client_id);
        let base = Arc::clone(&session.msgs_out.inflight[idx].base);

        let mut expiry_interval = 0u32;
        if base.message_expiry_time != 0 {
            if self.now_real_s > base.message_expiry_time {
                // Expired: must not send. Give the window back and drop.
                let restore = session.msgs_out.inflight[idx].qos != QoS::AtMostOnce;
                self.remove_inflight(&client_id, &mut session.msgs_out, Direction::Out, idx);
                if restore {
                    session.increment_send_quota();
                }
                return Ok(true);
            }
            expiry_interval = (base.message_expiry_time - self.now_real_s) as u32;
        }

        let (mid, qos, retain, dup, subscription_identifier, state) = {
            let m = &session.msgs_out.inflight[idx];
            (m.mid, m.qos, m.retain, m.dup, m.subscription_identifier, m.state)
        };
        let Some(topic) = base.topic.as_deref() else {
            // Topic-less bodies never leave the broker
            debug!(client_id = %client_id, mid, "skipping delivery of topic-less message");
            return Ok(false);
        };

        match state {
            MessageState::PublishQos0 => {
                let rc = sink.send_publish(
                    mid,
                    topic,
                    &base.payload,
                    qos,
                    retain,
                    dup,
                    subscription_identifier,
                    &base.properties,
                    expiry_interval,
                );
                match rc {
                    // Fire and forget; oversize is unrecoverable either way
                    Ok(()) | Err(SinkError::OversizePacket) => {
                        self.remove_inflight(&client_id, &mut session.msgs_out, Direction::Out, idx);
                        Ok(true)
                    }
                    Err(e) => Err(DbError::Sink(e)),
                }
            }
            MessageState::PublishQos1 => {
                let rc = sink.send_publish(
                    mid,
                    topic,
                    &base.payload,
                    qos,
                    retain,
                    dup,
                    subscription_identifier,
                    &base.properties,
                    expiry_interval,
                );
                match rc {
                    Ok(()) => {
                        let m = &mut session.msgs_out.inflight[idx];
                        m.dup = true; // Any retry attempts are a duplicate
                        m.state = MessageState::WaitForPuback;
                        self.notifier.client_msg_update(&client_id, m);
                        Ok(false)
                    }
                    Err(SinkError::OversizePacket) => {
                        self.remove_inflight(&client_id, &mut session.msgs_out, Direction::Out, idx);
                        Ok(true)
                    }
                    Err(e) => Err(DbError::Sink(e)),
                }
            }
            MessageState::PublishQos2 => {
                let rc = sink.send_publish(
                    mid,
                    topic,
                    &base.payload,
                    qos,
                    retain,
                    dup,
                    subscription_identifier,
                    &base.properties,
                    expiry_interval,
                );
                match rc {
                    Ok(()) => {
                        let m = &mut session.msgs_out.inflight[idx];
                        m.dup = true;
                        m.state = MessageState::WaitForPubrec;
                        self.notifier.client_msg_update(&client_id, m);
                        Ok(false)
                    }
                    Err(SinkError::OversizePacket) => {
                        self.remove_inflight(&client_id, &mut session.msgs_out, Direction::Out, idx);
                        Ok(true)
                    }
                    Err(e) => Err(DbError::Sink(e)),
                }
            }
            MessageState::ResendPubrel => match sink.send_pubrel(mid) {
                Ok(()) => {
                    let m = &mut session.msgs_out.inflight[idx];
                    m.state = MessageState::WaitForPubcomp;
                    self.notifier.client_msg_update(&client_id, m);
                    Ok(false)
                }
                Err(e) => Err(DbError::Sink(e)),
            },
            // Wait states advance on acknowledgment, not here
            _ => Ok(false),
        }
    }

    /// Drive the whole outgoing inflight list (session resume path)
    pub fn write_inflight_out_all(
        &mut self,
        session: &mut Session,
        sink: &mut dyn PacketSink,
    ) -> Result<(), DbError> {
        if !session.is_connected() {
            return Ok(());
        }
        let mut idx = 0;
        while idx < session.msgs_out.inflight.len() {
            if !self.write_inflight_out_single(session, idx, sink)? {
                idx += 1;
            }
        }
        Ok(())
    }

    /// Flush the contiguous block of not-yet-sent entries at the tail of
    /// the inflight list. Everything before the block is already mid
    /// exchange and needs no retransmit.
    pub fn write_inflight_out_latest(
        &mut self,
        session: &mut Session,
        sink: &mut dyn PacketSink,
    ) -> Result<(), DbError> {
        if !session.is_connected() || session.msgs_out.inflight.is_empty() {
            return Ok(());
        }

        let inflight = &session.msgs_out.inflight;
        let mut start = inflight.len();
        while start > 0 && inflight[start - 1].state.is_publish() {
            start -= 1;
        }

        let mut idx = start;
        while idx < session.msgs_out.inflight.len() {
            if !self.write_inflight_out_single(session, idx, sink)? {
                idx += 1;
            }
        }
        Ok(())
    }

    /// Promote queued outgoing messages while the inflight window accepts
    /// them
    pub fn write_queued_out(&mut self, session: &mut Session) {
        if !session.is_connected() {
            return;
        }
        self.promote_queued_out(session);
    }

    pub(super) fn promote_queued_out(&mut self, session: &mut Session) {
        loop {
            let Some(front) = session.msgs_out.queued.front() else {
                break;
            };
            let qos = front.qos;
            if !self.ready_for_flight(session, Direction::Out, qos) {
                break;
            }
            if let Some(front) = session.msgs_out.queued.front_mut() {
                front.state = MessageState::publish_for(qos);
            }
            session.msgs_out.dequeue_first();
            self.record_promotion(Direction::Out);
            if let Some(tail) = session.msgs_out.inflight.back() {
                self.notifier.client_msg_update(&session.client_id, tail);
            }
        }
    }

    /// Promote queued incoming QoS 2 records, emitting their PUBRECs.
    ///
    /// An entry whose PUBREC send fails stays inflight in `SendPubrec` and
    /// is retried by the next pass, so the first loop re-drives strays
    /// before more are promoted.
    pub fn write_queued_in(
        &mut self,
        session: &mut Session,
        sink: &mut dyn PacketSink,
    ) -> Result<(), DbError> {
        if !session.is_connected() {
            return Ok(());
        }
        let client_id = Arc::clone(&session.client_id);

        for idx in 0..session.msgs_in.inflight.len() {
            let (mid, state) = {
                let m = &session.msgs_in.inflight[idx];
                (m.mid, m.state)
            };
            if state == MessageState::SendPubrec {
                sink.send_pubrec(mid, 0).map_err(DbError::Sink)?;
                let m = &mut session.msgs_in.inflight[idx];
                m.state = MessageState::WaitForPubrel;
                self.notifier.client_msg_update(&client_id, m);
            }
        }

        loop {
            let Some(front) = session.msgs_in.queued.front() else {
                break;
            };
            if session.msgs_in.inflight_maximum != 0 && session.msgs_in.inflight_quota == 0 {
                break;
            }
            if front.qos != QoS::ExactlyOnce {
                break;
            }
            let mid = front.mid;
            if let Some(front) = session.msgs_in.queued.front_mut() {
                front.state = MessageState::SendPubrec;
            }
            session.msgs_in.dequeue_first();
            self.record_promotion(Direction::In);
            match sink.send_pubrec(mid, 0) {
                Ok(()) => {
                    if let Some(tail) = session.msgs_in.inflight.back_mut() {
                        tail.state = MessageState::WaitForPubrel;
                    }
                    if let Some(tail) = session.msgs_in.inflight.back() {
                        self.notifier.client_msg_update(&client_id, tail);
                    }
                }
                Err(e) => {
                    if let Some(tail) = session.msgs_in.inflight.back() {
                        self.notifier.client_msg_update(&client_id, tail);
                    }
                    return Err(DbError::Sink(e));
                }
            }
        }
        Ok(())
    }
}

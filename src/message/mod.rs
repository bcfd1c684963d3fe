//! Message data model
//!
//! `BaseMessage` is the broker-wide, reference-counted record of a unique
//! message body; `ClientMessage` is the per-session delivery record that
//! drives one copy of it through a QoS handshake. A `ClientMessage` holds
//! exactly one store reference to its `BaseMessage` for its whole lifetime.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::Bytes;
use parking_lot::Mutex;
use smallvec::SmallVec;

use crate::protocol::{Properties, QoS};

/// Direction of a delivery pipeline relative to the client
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    /// Broker to client
    Out,
    /// Client to broker (QoS 2 completion tracking)
    In,
}

impl Direction {
    /// Metrics label for this direction
    pub fn as_str(self) -> &'static str {
        match self {
            Direction::Out => "out",
            Direction::In => "in",
        }
    }
}

/// Where a message entered the broker
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Origin {
    #[default]
    Client,
    Broker,
}

/// Delivery handshake state of a `ClientMessage`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageState {
    /// QoS 0 PUBLISH pending
    PublishQos0,
    /// QoS 1 PUBLISH pending
    PublishQos1,
    /// QoS 2 PUBLISH pending
    PublishQos2,
    /// QoS 1 PUBLISH sent, awaiting PUBACK
    WaitForPuback,
    /// QoS 2 PUBLISH sent, awaiting PUBREC
    WaitForPubrec,
    /// QoS 2 inbound, awaiting PUBREL
    WaitForPubrel,
    /// QoS 2 PUBREL sent, awaiting PUBCOMP
    WaitForPubcomp,
    /// QoS 2 inbound PUBREC pending
    SendPubrec,
    /// QoS 2 PUBREL must be re-sent after a reconnect
    ResendPubrel,
    /// QoS 2 PUBCOMP must be re-sent
    ResendPubcomp,
    /// Admitted but waiting for inflight window space
    Queued,
}

impl MessageState {
    /// The pre-send state for an outgoing message of the given QoS
    pub fn publish_for(qos: QoS) -> Self {
        match qos {
            QoS::AtMostOnce => MessageState::PublishQos0,
            QoS::AtLeastOnce => MessageState::PublishQos1,
            QoS::ExactlyOnce => MessageState::PublishQos2,
        }
    }

    /// True for the not-yet-sent outgoing states
    pub fn is_publish(self) -> bool {
        matches!(
            self,
            MessageState::PublishQos0 | MessageState::PublishQos1 | MessageState::PublishQos2
        )
    }
}

/// A unique message body shared by every session it is delivered to.
///
/// Owned by the [`MessageStore`](crate::store::MessageStore); sessions hold
/// `Arc` handles and an explicit store reference count. When the count drops
/// to zero the store evicts and the persistence layer is notified.
#[derive(Debug)]
pub struct BaseMessage {
    /// Broker-wide monotonic id, assigned exactly once at registration
    pub db_id: u64,
    /// Topic; `None` marks a denied QoS 2 inbound that must finish its
    /// handshake without being routed
    pub topic: Option<String>,
    pub payload: Bytes,
    pub qos: QoS,
    pub retain: bool,
    /// Client id of the publisher, empty when broker-originated
    pub source_id: Arc<str>,
    pub source_username: Option<String>,
    /// Listener the message arrived on, if any
    pub source_listener: Option<u16>,
    /// Packet id the originating client used
    pub source_mid: u16,
    pub origin: Origin,
    pub properties: Properties,
    /// Absolute expiry in seconds since the epoch, 0 = never
    pub message_expiry_time: u64,
    ref_count: AtomicUsize,
    /// Client ids already delivered to, for duplicate suppression of
    /// overlapping MQTT v3.x subscriptions
    pub dest_ids: Mutex<SmallVec<[Arc<str>; 4]>>,
}

impl BaseMessage {
    pub fn new(topic: impl Into<String>, payload: Bytes, qos: QoS, retain: bool) -> Self {
        Self {
            db_id: 0,
            topic: Some(topic.into()),
            payload,
            qos,
            retain,
            source_id: Arc::from(""),
            source_username: None,
            source_listener: None,
            source_mid: 0,
            origin: Origin::Client,
            properties: Properties::new(),
            message_expiry_time: 0,
            ref_count: AtomicUsize::new(0),
            dest_ids: Mutex::new(SmallVec::new()),
        }
    }

    pub fn payload_len(&self) -> u64 {
        self.payload.len() as u64
    }

    pub fn ref_count(&self) -> usize {
        self.ref_count.load(Ordering::Acquire)
    }

    pub(crate) fn ref_inc(&self) {
        self.ref_count.fetch_add(1, Ordering::AcqRel);
    }

    /// Returns the count before the decrement
    pub(crate) fn ref_dec(&self) -> usize {
        self.ref_count.fetch_sub(1, Ordering::AcqRel)
    }

    /// Has this message already been delivered to `client_id`?
    pub fn delivered_to(&self, client_id: &str) -> bool {
        self.dest_ids.lock().iter().any(|id| &**id == client_id)
    }

    pub(crate) fn record_dest(&self, client_id: Arc<str>) {
        self.dest_ids.lock().push(client_id);
    }

    /// Expired relative to the given wall clock second count?
    pub fn is_expired(&self, now_real_s: u64) -> bool {
        self.message_expiry_time != 0 && now_real_s > self.message_expiry_time
    }
}

/// One session's delivery record for a `BaseMessage`
#[derive(Debug, Clone)]
pub struct ClientMessage {
    /// Per-session monotonic id
    pub cmsg_id: u64,
    pub base: Arc<BaseMessage>,
    /// Packet id used on this session
    pub mid: u16,
    pub direction: Direction,
    pub state: MessageState,
    /// Capped at the session's negotiated maximum QoS
    pub qos: QoS,
    pub retain: bool,
    /// Set once the first PUBLISH attempt succeeds; retries are duplicates
    pub dup: bool,
    /// MQTT v5 subscription identifier, 0 when absent
    pub subscription_identifier: u32,
}

impl ClientMessage {
    pub fn payload_len(&self) -> u64 {
        self.base.payload_len()
    }
}

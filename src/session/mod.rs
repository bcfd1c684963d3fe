//! MQTT Session Management
//!
//! Per-client state for the message core: identity, connection state,
//! negotiated limits, flow-control quotas, and the two directional message
//! pipelines (outgoing deliveries and incoming QoS 2 completions).

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Instant;

use dashmap::DashMap;
use parking_lot::RwLock;

use crate::config::Config;
use crate::message::{ClientMessage, Direction};
use crate::protocol::{ProtocolVersion, QoS};

#[cfg(test)]
mod tests;

/// Session state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Session is connected
    Connected,
    /// Session is disconnected but persisted
    Disconnected,
    /// Session has expired
    Expired,
}

/// How a bridge connection starts
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeStart {
    /// Connect at broker start and stay connected
    Automatic,
    /// Connect on demand once enough messages back up
    Lazy,
}

/// The bridge-specific flags the admission rules consult. Bridge connection
/// management itself lives outside this crate.
#[derive(Debug, Clone)]
pub struct BridgeState {
    pub start_type: BridgeStart,
    /// Discard remote-bound state on remote clean session
    pub clean_start: bool,
    /// Discard local session state on reconnect
    pub clean_start_local: bool,
    /// Backlog size that wakes a lazy bridge
    pub threshold: usize,
    /// Set when the backlog crosses the threshold while disconnected
    pub lazy_reconnect: bool,
}

/// Counters reported per session
#[derive(Debug, Clone, Copy, Default)]
pub struct SessionStats {
    pub messages_sent: u64,
    pub messages_received: u64,
    pub messages_dropped: u64,
}

/// One direction's pipelines and accounting.
///
/// Messages live in exactly one of the two queues. The counters are
/// maintained by the helpers below so that, after every public engine
/// operation, the payload sums of the queues equal the byte counters.
#[derive(Debug, Default)]
pub struct MessageQueues {
    /// Messages with a protocol exchange in progress, in wire order
    pub inflight: VecDeque<ClientMessage>,
    /// Admitted messages awaiting window space, in admission order
    pub queued: VecDeque<ClientMessage>,
    /// Negotiated QoS 1/2 window, 0 = unbounded
    pub inflight_maximum: u16,
    /// Remaining window
    pub inflight_quota: u16,
    pub inflight_count: usize,
    pub inflight_count12: usize,
    pub inflight_bytes: u64,
    pub inflight_bytes12: u64,
    pub queued_count: usize,
    pub queued_count12: usize,
    pub queued_bytes: u64,
    pub queued_bytes12: u64,
}

impl MessageQueues {
    pub fn new(inflight_maximum: u16) -> Self {
        Self {
            inflight_maximum,
            inflight_quota: inflight_maximum,
            ..Default::default()
        }
    }

    pub fn add_to_inflight_stats(&mut self, payload_len: u64, qos: QoS) {
        self.inflight_count += 1;
        self.inflight_bytes += payload_len;
        if qos != QoS::AtMostOnce {
            self.inflight_count12 += 1;
            self.inflight_bytes12 += payload_len;
        }
    }

    pub fn remove_from_inflight_stats(&mut self, payload_len: u64, qos: QoS) {
        self.inflight_count -= 1;
        self.inflight_bytes -= payload_len;
        if qos != QoS::AtMostOnce {
            self.inflight_count12 -= 1;
            self.inflight_bytes12 -= payload_len;
        }
    }

    pub fn add_to_queued_stats(&mut self, payload_len: u64, qos: QoS) {
        self.queued_count += 1;
        self.queued_bytes += payload_len;
        if qos != QoS::AtMostOnce {
            self.queued_count12 += 1;
            self.queued_bytes12 += payload_len;
        }
    }

    pub fn remove_from_queued_stats(&mut self, payload_len: u64, qos: QoS) {
        self.queued_count -= 1;
        self.queued_bytes -= payload_len;
        if qos != QoS::AtMostOnce {
            self.queued_count12 -= 1;
            self.queued_bytes12 -= payload_len;
        }
    }

    /// Move the head of `queued` to the tail of `inflight`, consuming one
    /// unit of window and transferring the accounting with it.
    pub fn dequeue_first(&mut self) {
        let Some(msg) = self.queued.pop_front() else {
            return;
        };
        if self.inflight_quota > 0 {
            self.inflight_quota -= 1;
        }
        let (len, qos) = (msg.payload_len(), msg.qos);
        self.remove_from_queued_stats(len, qos);
        self.add_to_inflight_stats(len, qos);
        self.inflight.push_back(msg);
    }

    /// Zero every counter (the queues themselves are untouched)
    pub fn reset_stats(&mut self) {
        self.inflight_count = 0;
        self.inflight_count12 = 0;
        self.inflight_bytes = 0;
        self.inflight_bytes12 = 0;
        self.queued_count = 0;
        self.queued_count12 = 0;
        self.queued_bytes = 0;
        self.queued_bytes12 = 0;
    }
}

/// Client session
pub struct Session {
    /// Client identifier
    pub client_id: Arc<str>,
    /// Protocol version
    pub protocol_version: ProtocolVersion,
    /// Session state
    pub state: SessionState,
    /// Clean start flag
    pub clean_start: bool,
    /// Session expiry interval in seconds (0 = delete on disconnect)
    pub session_expiry_interval: u32,
    /// Maximum QoS granted to this session
    pub max_qos: QoS,
    /// Username presented at authentication, if any
    pub username: Option<String>,
    /// Listener the client connected through
    pub listener: Option<u16>,
    /// Outgoing deliveries (broker to client)
    pub msgs_out: MessageQueues,
    /// Incoming QoS 2 completions (client to broker)
    pub msgs_in: MessageQueues,
    /// Packets sitting in the connection's socket write queue, maintained
    /// by the I/O layer; bounds QoS 0 admission
    pub out_packet_count: usize,
    /// Latched when messages start being dropped, so the condition is
    /// logged once per episode
    pub is_dropping: bool,
    /// Whether this session participates in persistence notification
    pub is_persisted: bool,
    pub stats: SessionStats,
    /// Bridge flags, present only for bridge sessions
    pub bridge: Option<BridgeState>,
    last_cmsg_id: u64,
    /// Disconnect timestamp
    pub disconnected_at: Option<Instant>,
}

impl Session {
    pub fn new(client_id: Arc<str>, protocol_version: ProtocolVersion, config: &Config) -> Self {
        let window = config.limits.max_inflight_messages;
        let max_qos = QoS::from_u8(config.mqtt.max_qos).unwrap_or(QoS::ExactlyOnce);
        Self {
            client_id,
            protocol_version,
            state: SessionState::Connected,
            clean_start: true,
            session_expiry_interval: 0,
            max_qos,
            username: None,
            listener: None,
            msgs_out: MessageQueues::new(window),
            msgs_in: MessageQueues::new(window),
            out_packet_count: 0,
            is_dropping: false,
            is_persisted: false,
            stats: SessionStats::default(),
            bridge: None,
            last_cmsg_id: 0,
            disconnected_at: None,
        }
    }

    pub fn is_connected(&self) -> bool {
        self.state == SessionState::Connected
    }

    /// Negotiate the outgoing window from the client's Receive Maximum
    pub fn negotiate_send_window(&mut self, receive_maximum: u16) {
        self.msgs_out.inflight_maximum = receive_maximum;
        self.msgs_out.inflight_quota = receive_maximum;
    }

    pub fn next_cmsg_id(&mut self) -> u64 {
        self.last_cmsg_id += 1;
        self.last_cmsg_id
    }

    /// The send quota is the remaining outgoing inflight window
    pub fn decrement_send_quota(&mut self) {
        if self.msgs_out.inflight_quota > 0 {
            self.msgs_out.inflight_quota -= 1;
        }
    }

    pub fn increment_send_quota(&mut self) {
        if self.msgs_out.inflight_quota < self.msgs_out.inflight_maximum {
            self.msgs_out.inflight_quota += 1;
        }
    }

    /// The receive quota is the remaining incoming inflight window
    pub fn decrement_receive_quota(&mut self) {
        if self.msgs_in.inflight_quota > 0 {
            self.msgs_in.inflight_quota -= 1;
        }
    }

    pub fn increment_receive_quota(&mut self) {
        if self.msgs_in.inflight_quota < self.msgs_in.inflight_maximum {
            self.msgs_in.inflight_quota += 1;
        }
    }

    /// Check if a disconnected session has outlived its expiry interval
    pub fn is_expired(&self) -> bool {
        if self.state != SessionState::Disconnected {
            return false;
        }
        if self.session_expiry_interval == 0 {
            return true;
        }
        if self.session_expiry_interval == 0xFFFF_FFFF {
            return false; // Never expires
        }
        if let Some(disconnected_at) = self.disconnected_at {
            return disconnected_at.elapsed().as_secs() >= u64::from(self.session_expiry_interval);
        }
        false
    }

    /// The pipelines for one direction
    pub fn queues(&self, direction: Direction) -> &MessageQueues {
        match direction {
            Direction::Out => &self.msgs_out,
            Direction::In => &self.msgs_in,
        }
    }

    pub fn queues_mut(&mut self, direction: Direction) -> &mut MessageQueues {
        match direction {
            Direction::Out => &mut self.msgs_out,
            Direction::In => &mut self.msgs_in,
        }
    }
}

/// Thread-safe session store keyed by client id
pub struct SessionStore {
    sessions: DashMap<Arc<str>, Arc<RwLock<Session>>>,
}

impl SessionStore {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
        }
    }

    /// Get or create a session. Returns the session and whether an existing
    /// one was resumed.
    pub fn get_or_create(
        &self,
        client_id: &str,
        protocol_version: ProtocolVersion,
        clean_start: bool,
        config: &Config,
    ) -> (Arc<RwLock<Session>>, bool) {
        let client_id: Arc<str> = client_id.into();

        if !clean_start {
            if let Some(session) = self.sessions.get(&client_id) {
                let mut s = session.write();
                if !s.is_expired() {
                    s.state = SessionState::Connected;
                    s.protocol_version = protocol_version;
                    s.disconnected_at = None;
                    drop(s);
                    return (session.clone(), true);
                }
            }
        }

        let session = Arc::new(RwLock::new(Session::new(
            client_id.clone(),
            protocol_version,
            config,
        )));
        self.sessions.insert(client_id, session.clone());
        (session, false)
    }

    /// Get a session by client ID
    pub fn get(&self, client_id: &str) -> Option<Arc<RwLock<Session>>> {
        self.sessions.get(client_id).map(|r| r.clone())
    }

    /// Remove a session
    pub fn remove(&self, client_id: &str) {
        self.sessions.remove(client_id);
    }

    /// Mark session as disconnected
    pub fn disconnect(&self, client_id: &str) {
        let should_remove = if let Some(session) = self.sessions.get(client_id) {
            let mut s = session.write();
            s.state = SessionState::Disconnected;
            s.disconnected_at = Some(Instant::now());
            s.session_expiry_interval == 0
        } else {
            false
        };

        // Remove after releasing the DashMap read lock to avoid deadlock
        if should_remove {
            self.sessions.remove(client_id);
        }
    }

    /// Clean up expired sessions
    pub fn cleanup_expired(&self) {
        self.sessions.retain(|_, session| {
            let s = session.read();
            !s.is_expired()
        });
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }
}

impl Default for SessionStore {
    fn default() -> Self {
        Self::new()
    }
}

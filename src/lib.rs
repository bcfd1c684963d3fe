//! FluxMQ message core - per-session message store and delivery-state
//! engine for an MQTT v3.1.1/v5.0 broker
//!
//! Owns the broker-wide reference-counted message store, the per-session
//! inflight/queued pipelines in both directions, and the QoS 0/1/2
//! handshake state machine, with quotas, back-pressure, deduplication,
//! expiry and reconnection continuity. Wire I/O, topic routing and
//! persistence are collaborators reached through traits.

pub mod config;
pub mod delivery;
pub mod hooks;
pub mod message;
pub mod metrics;
pub mod protocol;
pub mod session;
pub mod store;

pub use config::Config;
pub use delivery::{
    Admission, DbError, DropReason, MessageDb, PacketSink, RouteError, RouteOutcome, Router,
    SinkError,
};
pub use hooks::{ClientMsgRecord, DefaultHooks, PersistHooks};
pub use message::{BaseMessage, ClientMessage, Direction, MessageState, Origin};
pub use metrics::Metrics;
pub use protocol::{Properties, Property, ProtocolVersion, QoS};
pub use session::{BridgeStart, BridgeState, Session, SessionState, SessionStore};
pub use store::{MessageIdGenerator, MessageStore};

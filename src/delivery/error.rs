//! Delivery engine error and result types

use std::fmt;

/// Result of admitting a message to a session
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Admission {
    /// Entered the inflight window; a protocol exchange will start
    Inflight,
    /// Admitted but waiting for window space
    Queued,
    /// Rejected; the reason says why
    Dropped(DropReason),
    /// Already delivered to this client; nothing was inserted
    Suppressed,
}

impl Admission {
    /// Did the message enter one of the session's pipelines?
    pub fn is_admitted(self) -> bool {
        matches!(self, Admission::Inflight | Admission::Queued)
    }
}

/// Why a message was not admitted
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    /// The session's queue budget is exhausted
    QueueFull,
    /// QoS 0 to a disconnected session without QoS 0 queueing
    NotConnected,
    /// Bridge discards local session state on reconnect
    BridgeCleanStart,
}

/// Errors reported by the packet sending collaborator
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SinkError {
    /// The encoded packet exceeds the peer's maximum packet size; the
    /// message is dropped, never retried
    OversizePacket,
    /// Transient I/O condition; the caller re-drives later
    WouldBlock,
    /// The connection is gone
    ConnectionClosed,
    /// Any other I/O failure
    Io(String),
}

impl fmt::Display for SinkError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::OversizePacket => write!(f, "packet exceeds peer maximum size"),
            Self::WouldBlock => write!(f, "socket would block"),
            Self::ConnectionClosed => write!(f, "connection closed"),
            Self::Io(msg) => write!(f, "I/O error: {}", msg),
        }
    }
}

impl std::error::Error for SinkError {}

/// Outcome of handing a message to the routing layer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    /// Delivered to at least one subscriber
    Routed,
    /// Nobody is subscribed; treated as success by the core
    NoSubscribers,
}

/// Error from the routing layer
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RouteError {
    Internal(String),
}

impl fmt::Display for RouteError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Internal(msg) => write!(f, "routing error: {}", msg),
        }
    }
}

impl std::error::Error for RouteError {}

/// Errors from the delivery engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DbError {
    /// Missing topic or otherwise unusable input
    InvalidInput,
    /// QoS or state mismatch during acknowledgment correlation; the caller
    /// should tear the session down
    Protocol,
    /// Acknowledgment for an unknown packet id
    NotFound,
    /// Duplicate `db_id` during store registration
    AlreadyExists,
    /// The packet sink failed; transient variants may be retried
    Sink(SinkError),
    /// The routing layer failed
    Route(RouteError),
}

impl fmt::Display for DbError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::InvalidInput => write!(f, "invalid input"),
            Self::Protocol => write!(f, "protocol violation"),
            Self::NotFound => write!(f, "message not found"),
            Self::AlreadyExists => write!(f, "message already exists"),
            Self::Sink(e) => write!(f, "send failed: {}", e),
            Self::Route(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for DbError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        match self {
            Self::Sink(e) => Some(e),
            Self::Route(e) => Some(e),
            _ => None,
        }
    }
}

impl From<SinkError> for DbError {
    fn from(e: SinkError) -> Self {
        DbError::Sink(e)
    }
}

impl From<RouteError> for DbError {
    fn from(e: RouteError) -> Self {
        DbError::Route(e)
    }
}

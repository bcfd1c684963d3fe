//! Broker-wide base-message store
//!
//! Deduplicates message bodies across subscribers: each unique message is
//! registered once, keyed by its `db_id`, and sessions hold counted
//! references. Eviction happens exactly when the last reference is dropped.

use std::sync::Arc;

use ahash::AHashMap;
use tracing::debug;

use crate::hooks::Notifier;
use crate::message::BaseMessage;
use crate::metrics::Metrics;
use crate::session::Session;

mod id;

pub use id::MessageIdGenerator;

/// Errors from store registration
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreError {
    /// A message with this `db_id` is already registered
    AlreadyExists,
}

impl std::fmt::Display for StoreError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreError::AlreadyExists => write!(f, "message id already present in store"),
        }
    }
}

impl std::error::Error for StoreError {}

/// Registry of unique message bodies keyed by `db_id`
pub struct MessageStore {
    messages: AHashMap<u64, Arc<BaseMessage>>,
    count: usize,
    bytes: u64,
    metrics: Metrics,
}

impl MessageStore {
    pub fn new(metrics: Metrics) -> Self {
        Self {
            messages: AHashMap::new(),
            count: 0,
            bytes: 0,
            metrics,
        }
    }

    pub fn len(&self) -> usize {
        self.count
    }

    pub fn is_empty(&self) -> bool {
        self.count == 0
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    pub fn get(&self, db_id: u64) -> Option<&Arc<BaseMessage>> {
        self.messages.get(&db_id)
    }

    /// Register a message under its `db_id`
    pub fn add(&mut self, base: Arc<BaseMessage>) -> Result<(), StoreError> {
        if self.messages.contains_key(&base.db_id) {
            return Err(StoreError::AlreadyExists);
        }
        self.count += 1;
        self.bytes += base.payload_len();
        self.metrics.store_messages.set(self.count as i64);
        self.metrics.store_bytes.set(self.bytes as i64);
        self.messages.insert(base.db_id, base);
        Ok(())
    }

    /// Unlink a message, updating the global accounting, optionally letting
    /// the persistence layer know. The body is freed when the last `Arc`
    /// outside the store goes away.
    pub fn remove(&mut self, db_id: u64, notify: bool, notifier: &Notifier) {
        if let Some(base) = self.messages.remove(&db_id) {
            self.count -= 1;
            self.bytes -= base.payload_len();
            self.metrics.store_messages.set(self.count as i64);
            self.metrics.store_bytes.set(self.bytes as i64);
            if notify {
                notifier.base_msg_delete(base.db_id);
            }
        }
    }

    /// Take a reference on behalf of a new `ClientMessage`
    pub fn ref_inc(&self, base: &Arc<BaseMessage>) {
        base.ref_inc();
    }

    /// Drop a `ClientMessage`'s reference; evicts at zero
    pub fn ref_dec(&mut self, base: &Arc<BaseMessage>, notifier: &Notifier) {
        if base.ref_dec() == 1 {
            self.remove(base.db_id, true, notifier);
        }
    }

    /// Defensive sweep removing every unreferenced entry
    pub fn compact(&mut self, notifier: &Notifier) {
        let stale: Vec<u64> = self
            .messages
            .values()
            .filter(|m| m.ref_count() < 1)
            .map(|m| m.db_id)
            .collect();
        if !stale.is_empty() {
            debug!(count = stale.len(), "compacting unreferenced messages");
        }
        for db_id in stale {
            self.remove(db_id, true, notifier);
        }
    }

    /// Drain the store without persistence notification (shutdown path)
    pub fn clean(&mut self) {
        self.messages.clear();
        self.count = 0;
        self.bytes = 0;
        self.metrics.store_messages.set(0);
        self.metrics.store_bytes.set(0);
    }
}

/// Locate the base message a client's QoS 2 PUBLISH refers to, by the
/// packet id the client used. Scans the session's incoming inflight list,
/// then its incoming queue.
pub fn find_by_source_mid(session: &Session, mid: u16) -> Option<Arc<BaseMessage>> {
    session
        .msgs_in
        .inflight
        .iter()
        .chain(session.msgs_in.queued.iter())
        .find(|cmsg| cmsg.base.source_mid == mid)
        .map(|cmsg| Arc::clone(&cmsg.base))
}

#[cfg(test)]
mod tests;

//! Persistence notification hooks
//!
//! The core does not persist anything itself; it tells an external
//! persistence collaborator what changed. Notifications are fanned out to a
//! dedicated worker thread over a bounded channel so the event loop never
//! blocks on a slow backend. When the channel is full the notification is
//! dropped with a warning (backpressure).

use std::sync::Arc;
use std::thread::JoinHandle;

use crossbeam_channel::{bounded, Sender};
use tracing::warn;

use crate::message::{BaseMessage, ClientMessage, Direction, MessageState};
use crate::protocol::QoS;

#[cfg(test)]
mod tests;

/// Owned snapshot of a `ClientMessage`, shippable across threads
#[derive(Debug, Clone)]
pub struct ClientMsgRecord {
    pub client_id: Arc<str>,
    pub cmsg_id: u64,
    pub db_id: u64,
    pub mid: u16,
    pub direction: Direction,
    pub state: MessageState,
    pub qos: QoS,
    pub retain: bool,
    pub dup: bool,
    pub subscription_identifier: u32,
}

impl ClientMsgRecord {
    fn snapshot(client_id: &Arc<str>, msg: &ClientMessage) -> Self {
        Self {
            client_id: Arc::clone(client_id),
            cmsg_id: msg.cmsg_id,
            db_id: msg.base.db_id,
            mid: msg.mid,
            direction: msg.direction,
            state: msg.state,
            qos: msg.qos,
            retain: msg.retain,
            dup: msg.dup,
            subscription_identifier: msg.subscription_identifier,
        }
    }
}

/// A single persistence notification
#[derive(Debug)]
pub enum PersistOp {
    BaseMsgAdd(Arc<BaseMessage>),
    BaseMsgDelete(u64),
    ClientMsgAdd(ClientMsgRecord),
    ClientMsgUpdate(ClientMsgRecord),
    ClientMsgDelete(ClientMsgRecord),
}

/// Persistence hooks trait
///
/// Implement this to mirror message state into durable storage. All methods
/// have default no-op implementations; implementations run on the notifier's
/// worker thread, never on the event loop.
pub trait PersistHooks: Send + Sync {
    /// A base message was registered in the store
    fn base_msg_add(&self, _msg: &BaseMessage) {}

    /// The base message with this id was evicted from the store
    fn base_msg_delete(&self, _db_id: u64) {}

    /// A delivery record was created for a session
    fn client_msg_add(&self, _record: &ClientMsgRecord) {}

    /// A delivery record changed state
    fn client_msg_update(&self, _record: &ClientMsgRecord) {}

    /// A delivery record completed or was dropped
    fn client_msg_delete(&self, _record: &ClientMsgRecord) {}
}

/// Default hooks implementation that ignores everything
pub struct DefaultHooks;

impl PersistHooks for DefaultHooks {
    // All methods use default implementations (no-op)
}

impl Default for DefaultHooks {
    fn default() -> Self {
        Self
    }
}

const CHANNEL_CAPACITY: usize = 10_000;

/// Fans persistence notifications out to a worker thread
pub struct Notifier {
    tx: Option<Sender<PersistOp>>,
    handle: Option<JoinHandle<()>>,
}

impl Notifier {
    /// A notifier that discards everything (no hooks installed)
    pub fn disabled() -> Self {
        Self {
            tx: None,
            handle: None,
        }
    }

    /// Spawn the worker thread draining notifications into `hooks`
    pub fn new(hooks: Arc<dyn PersistHooks>) -> Self {
        let (tx, rx) = bounded::<PersistOp>(CHANNEL_CAPACITY);
        let handle = std::thread::Builder::new()
            .name("fluxmq-persist".into())
            .spawn(move || {
                for op in rx {
                    match op {
                        PersistOp::BaseMsgAdd(msg) => hooks.base_msg_add(&msg),
                        PersistOp::BaseMsgDelete(db_id) => hooks.base_msg_delete(db_id),
                        PersistOp::ClientMsgAdd(rec) => hooks.client_msg_add(&rec),
                        PersistOp::ClientMsgUpdate(rec) => hooks.client_msg_update(&rec),
                        PersistOp::ClientMsgDelete(rec) => hooks.client_msg_delete(&rec),
                    }
                }
            });
        match handle {
            Ok(handle) => Self {
                tx: Some(tx),
                handle: Some(handle),
            },
            Err(e) => {
                warn!("failed to spawn persistence notifier thread: {}", e);
                Self::disabled()
            }
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.tx.is_some()
    }

    /// Fire-and-forget dispatch; drops the op with a warning when the
    /// channel is full.
    fn send(&self, op: PersistOp) {
        if let Some(tx) = &self.tx {
            if let Err(e) = tx.try_send(op) {
                warn!("persistence channel full, dropping notification: {}", e);
            }
        }
    }

    pub fn base_msg_add(&self, msg: &Arc<BaseMessage>) {
        if self.tx.is_some() {
            self.send(PersistOp::BaseMsgAdd(Arc::clone(msg)));
        }
    }

    pub fn base_msg_delete(&self, db_id: u64) {
        self.send(PersistOp::BaseMsgDelete(db_id));
    }

    pub fn client_msg_add(&self, client_id: &Arc<str>, msg: &ClientMessage) {
        if self.tx.is_some() {
            self.send(PersistOp::ClientMsgAdd(ClientMsgRecord::snapshot(client_id, msg)));
        }
    }

    pub fn client_msg_update(&self, client_id: &Arc<str>, msg: &ClientMessage) {
        if self.tx.is_some() {
            self.send(PersistOp::ClientMsgUpdate(ClientMsgRecord::snapshot(client_id, msg)));
        }
    }

    pub fn client_msg_delete(&self, client_id: &Arc<str>, msg: &ClientMessage) {
        if self.tx.is_some() {
            self.send(PersistOp::ClientMsgDelete(ClientMsgRecord::snapshot(client_id, msg)));
        }
    }

    /// Flush outstanding notifications and stop the worker
    pub fn shutdown(&mut self) {
        self.tx = None;
        if let Some(handle) = self.handle.take() {
            if handle.join().is_err() {
                warn!("persistence notifier thread panicked");
            }
        }
    }
}

impl Drop for Notifier {
    fn drop(&mut self) {
        self.shutdown();
    }
}

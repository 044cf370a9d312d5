// src/connection/observer.rs
use std::fmt;
use std::sync::{Arc, Weak};

use super::manager::ManagerInner;

/// Why the manager left the Connected (or Connecting) state
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// The caller ended the session with `disconnect()`
    Requested,
    /// The transport closed underneath us
    Closed { code: Option<u16>, reason: String },
    /// The server refused or aborted the session
    Rejected(String),
    /// Transport failure, including failure to construct the transport
    Error(String),
    /// The connect attempt did not finish in time
    Timeout,
}

/// Delivered to disconnect observers on every transition out of a session
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DisconnectInfo {
    pub reason: DisconnectReason,
    /// Consecutive failed attempts so far, including this one
    pub reconnect_attempts: u32,
    /// False once automatic reconnect has given up (or was never wanted)
    pub will_reconnect: bool,
}

pub type ConnectCallback = Arc<dyn Fn() + Send + Sync>;
pub type DisconnectCallback = Arc<dyn Fn(&DisconnectInfo) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum ObserverKind {
    Connect,
    Disconnect,
}

/// Connect and disconnect observer lists
#[derive(Default)]
pub(crate) struct Observers {
    next_id: u64,
    on_connect: Vec<(u64, ConnectCallback)>,
    on_disconnect: Vec<(u64, DisconnectCallback)>,
}

impl Observers {
    pub fn add_connect(&mut self, callback: ConnectCallback) -> u64 {
        self.next_id += 1;
        self.on_connect.push((self.next_id, callback));
        self.next_id
    }

    pub fn add_disconnect(&mut self, callback: DisconnectCallback) -> u64 {
        self.next_id += 1;
        self.on_disconnect.push((self.next_id, callback));
        self.next_id
    }

    pub fn remove(&mut self, kind: ObserverKind, id: u64) -> bool {
        let before = self.len();
        match kind {
            ObserverKind::Connect => self.on_connect.retain(|(observer_id, _)| *observer_id != id),
            ObserverKind::Disconnect => {
                self.on_disconnect.retain(|(observer_id, _)| *observer_id != id)
            }
        }
        before != self.len()
    }

    pub fn connect_callbacks(&self) -> Vec<ConnectCallback> {
        self.on_connect.iter().map(|(_, cb)| Arc::clone(cb)).collect()
    }

    pub fn disconnect_callbacks(&self) -> Vec<DisconnectCallback> {
        self.on_disconnect.iter().map(|(_, cb)| Arc::clone(cb)).collect()
    }

    pub fn len(&self) -> usize {
        self.on_connect.len() + self.on_disconnect.len()
    }
}

/// Removes exactly one observer registration.
///
/// Observers stay registered until `dispose` is called; dropping the
/// disposer does not remove anything.
pub struct Disposer {
    kind: ObserverKind,
    id: u64,
    manager: Weak<ManagerInner>,
}

impl Disposer {
    pub(crate) fn new(kind: ObserverKind, id: u64, manager: Weak<ManagerInner>) -> Self {
        Self { kind, id, manager }
    }

    /// Returns false if the observer was already gone
    pub fn dispose(self) -> bool {
        match self.manager.upgrade() {
            Some(manager) => manager.remove_observer(self.kind, self.id),
            None => false,
        }
    }
}

impl fmt::Debug for Disposer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Disposer")
            .field("kind", &self.kind)
            .field("id", &self.id)
            .finish()
    }
}

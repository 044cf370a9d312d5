// src/connection/subscription.rs
use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use super::manager::ManagerInner;
use crate::transport::{Envelope, TransportSubscription};

// Generate unique subscription IDs
static NEXT_SUB_ID: AtomicU64 = AtomicU64::new(1);

/// Unique identifier for one registration in the subscription registry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

impl SubscriptionId {
    pub fn new() -> Self {
        Self(NEXT_SUB_ID.fetch_add(1, Ordering::SeqCst))
    }
}

impl Default for SubscriptionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SubscriptionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sub_{}", self.0)
    }
}

/// Callback invoked with every inbound message for a destination
pub type MessageCallback = Arc<dyn Fn(&Envelope) + Send + Sync>;

/// Whether a registration is currently bound to a live transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubscriptionStatus {
    /// Registered, waiting for the next successful connect
    Pending,
    /// Bound to a transport-level subscription
    Active(TransportSubscription),
}

/// Point-in-time view of one registration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriptionInfo {
    pub id: SubscriptionId,
    pub destination: String,
    pub status: SubscriptionStatus,
}

pub(crate) struct Registration {
    pub id: SubscriptionId,
    pub callback: MessageCallback,
    pub status: SubscriptionStatus,
}

/// Pending and Active registrations, keyed by destination.
///
/// A destination has at most one registration. Losing the transport demotes
/// registrations to Pending; only `remove` and `clear` drop them.
#[derive(Default)]
pub(crate) struct SubscriptionRegistry {
    entries: HashMap<String, Registration>,
}

impl SubscriptionRegistry {
    pub fn get(&self, destination: &str) -> Option<&Registration> {
        self.entries.get(destination)
    }

    pub fn insert(
        &mut self,
        destination: &str,
        callback: MessageCallback,
        status: SubscriptionStatus,
    ) -> SubscriptionId {
        let id = SubscriptionId::new();
        self.entries.insert(
            destination.to_string(),
            Registration {
                id,
                callback,
                status,
            },
        );
        id
    }

    /// Registration currently bound to `handle`, if any
    pub fn find_by_handle(&self, handle: &TransportSubscription) -> Option<&Registration> {
        self.entries
            .values()
            .find(|r| matches!(&r.status, SubscriptionStatus::Active(bound) if bound == handle))
    }

    pub fn remove(&mut self, destination: &str) -> Option<Registration> {
        self.entries.remove(destination)
    }

    /// Drop every binding but keep every registration
    pub fn demote_all(&mut self) -> usize {
        let mut demoted = 0;
        for registration in self.entries.values_mut() {
            if matches!(registration.status, SubscriptionStatus::Active(_)) {
                registration.status = SubscriptionStatus::Pending;
                demoted += 1;
            }
        }
        demoted
    }

    pub fn pending_destinations(&self) -> Vec<String> {
        self.entries
            .iter()
            .filter(|(_, r)| r.status == SubscriptionStatus::Pending)
            .map(|(destination, _)| destination.clone())
            .collect()
    }

    pub fn activate(&mut self, destination: &str, handle: TransportSubscription) {
        if let Some(registration) = self.entries.get_mut(destination) {
            registration.status = SubscriptionStatus::Active(handle);
        }
    }

    pub fn active_handles(&self) -> Vec<TransportSubscription> {
        self.entries
            .values()
            .filter_map(|r| match &r.status {
                SubscriptionStatus::Active(handle) => Some(handle.clone()),
                SubscriptionStatus::Pending => None,
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn snapshot(&self) -> Vec<SubscriptionInfo> {
        let mut infos: Vec<SubscriptionInfo> = self
            .entries
            .iter()
            .map(|(destination, r)| SubscriptionInfo {
                id: r.id,
                destination: destination.clone(),
                status: r.status.clone(),
            })
            .collect();
        infos.sort_by(|a, b| a.destination.cmp(&b.destination));
        infos
    }
}

/// Caller-side handle to a registration returned by `subscribe`
#[derive(Clone)]
pub struct SubscriptionHandle {
    id: SubscriptionId,
    destination: String,
    manager: Weak<ManagerInner>,
}

impl SubscriptionHandle {
    pub(crate) fn new(id: SubscriptionId, destination: &str, manager: Weak<ManagerInner>) -> Self {
        Self {
            id,
            destination: destination.to_string(),
            manager,
        }
    }

    pub fn id(&self) -> SubscriptionId {
        self.id
    }

    pub fn destination(&self) -> &str {
        &self.destination
    }

    /// Remove the registration this handle refers to.
    ///
    /// Does nothing if the destination has since been unsubscribed and
    /// registered again by someone else.
    pub fn unsubscribe(&self) {
        if let Some(manager) = self.manager.upgrade() {
            manager.unsubscribe_if(&self.destination, Some(self.id));
        }
    }
}

impl fmt::Debug for SubscriptionHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SubscriptionHandle")
            .field("id", &self.id)
            .field("destination", &self.destination)
            .finish()
    }
}

// src/registry.rs
use log::info;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;

use crate::config::ManagerConfig;
use crate::connection::ConnectionManager;
use crate::error::Result;
use crate::transport::Connector;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct ManagerKey {
    identity: String,
    endpoint: String,
}

/// One connection manager per (identity, endpoint) pair.
///
/// Built once by the application's composition root and handed to whoever
/// needs a manager, instead of a process-global map.
pub struct ManagerRegistry {
    connector: Arc<dyn Connector>,
    config: ManagerConfig,
    managers: Mutex<HashMap<ManagerKey, ConnectionManager>>,
}

impl ManagerRegistry {
    pub fn new(connector: Arc<dyn Connector>, config: ManagerConfig) -> Self {
        Self {
            connector,
            config,
            managers: Mutex::new(HashMap::new()),
        }
    }

    /// Return the manager for this pair, creating it on first use
    pub fn get_or_create(&self, identity: &str, endpoint: &str) -> Result<ConnectionManager> {
        let key = ManagerKey {
            identity: identity.to_string(),
            endpoint: endpoint.to_string(),
        };

        let mut managers = self.managers.lock();
        if let Some(manager) = managers.get(&key) {
            return Ok(manager.clone());
        }

        let manager = ConnectionManager::new(
            identity,
            endpoint,
            self.config.clone(),
            Arc::clone(&self.connector),
        )?;
        managers.insert(key, manager.clone());
        Ok(manager)
    }

    pub fn get(&self, identity: &str, endpoint: &str) -> Option<ConnectionManager> {
        let key = ManagerKey {
            identity: identity.to_string(),
            endpoint: endpoint.to_string(),
        };
        self.managers.lock().get(&key).cloned()
    }

    /// Forget the manager for this pair, disconnecting it first
    pub fn remove(&self, identity: &str, endpoint: &str) -> Option<ConnectionManager> {
        let key = ManagerKey {
            identity: identity.to_string(),
            endpoint: endpoint.to_string(),
        };
        let removed = self.managers.lock().remove(&key);
        if let Some(manager) = &removed {
            info!("Removing connection manager for {} at {}", identity, endpoint);
            manager.disconnect();
        }
        removed
    }

    pub fn disconnect_all(&self) {
        let managers: Vec<ConnectionManager> = self.managers.lock().values().cloned().collect();
        info!("Disconnecting {} connection managers", managers.len());
        for manager in managers {
            manager.disconnect();
        }
    }

    /// Disconnect every manager and wait for their transports to flush
    pub async fn shutdown_all(&self) {
        let managers: Vec<ConnectionManager> = self.managers.lock().values().cloned().collect();
        info!("Shutting down {} connection managers", managers.len());
        futures::future::join_all(managers.iter().map(|manager| manager.shutdown())).await;
    }

    /// True if `manager` is the one this registry holds for its pair
    pub fn contains(&self, manager: &ConnectionManager) -> bool {
        self.get(manager.identity(), manager.endpoint())
            .is_some_and(|held| held.same_as(manager))
    }

    pub fn len(&self) -> usize {
        self.managers.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

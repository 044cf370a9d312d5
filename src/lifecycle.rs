// src/lifecycle.rs
use anyhow::Result;
use log::{debug, info, warn};
use tokio::sync::{broadcast, watch};
use tokio::task::JoinHandle;

use crate::connection::ConnectionManager;

/// Whether the application is in front of the user
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AppState {
    Foreground,
    Background,
}

/// Connects a manager while the app is in the foreground and disconnects it
/// in the background.
///
/// Disconnecting drops every subscription, so screens that subscribe must do
/// so again when they come back into view.
pub struct LifecycleWatcher {
    manager: ConnectionManager,
    connect_handle: Option<JoinHandle<()>>,
}

impl LifecycleWatcher {
    pub fn new(manager: ConnectionManager) -> Self {
        Self {
            manager,
            connect_handle: None,
        }
    }

    /// True while a connect started by a foreground transition is unresolved
    pub fn connect_in_progress(&self) -> bool {
        self.connect_handle.as_ref().is_some_and(|h| !h.is_finished())
    }

    /// React to one app state transition
    pub fn apply(&mut self, state: AppState) {
        match state {
            AppState::Foreground => {
                if self.connect_in_progress() {
                    debug!("Connect already in progress for {}", self.manager.endpoint());
                    return;
                }
                info!("App in foreground, connecting {}", self.manager.endpoint());
                let manager = self.manager.clone();
                // connect() may wait for the timeout; keep watching meanwhile
                self.connect_handle = Some(tokio::spawn(async move {
                    if let Err(e) = manager.connect().await {
                        warn!("Foreground connect failed: {}", e);
                    }
                }));
            }
            AppState::Background => {
                info!("App in background, disconnecting {}", self.manager.endpoint());
                // cancels an in-flight connect; the spawned task then resolves
                self.manager.disconnect();
                self.connect_handle = None;
            }
        }
    }

    /// Follow `states` until shutdown is signalled or the sender goes away.
    /// The current state is applied first.
    pub async fn run(
        mut self,
        mut states: watch::Receiver<AppState>,
        mut shutdown: broadcast::Receiver<()>,
    ) -> Result<()> {
        let initial = *states.borrow_and_update();
        self.apply(initial);

        loop {
            tokio::select! {
                changed = states.changed() => {
                    if changed.is_err() {
                        info!("App state sender dropped, stopping lifecycle watcher");
                        break;
                    }
                    let state = *states.borrow_and_update();
                    self.apply(state);
                }
                _ = shutdown.recv() => {
                    info!("Received shutdown signal");
                    break;
                }
            }
        }

        if let Some(handle) = self.connect_handle.take() {
            if !handle.is_finished() {
                handle.abort();
            }
        }
        Ok(())
    }
}

// src/connection/manager.rs
use backoff::backoff::Backoff;
use futures::future::{BoxFuture, FutureExt, Shared};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::fmt;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::observer::{
    ConnectCallback, DisconnectCallback, DisconnectInfo, DisconnectReason, Disposer, ObserverKind,
    Observers,
};
use super::subscription::{
    MessageCallback, SubscriptionHandle, SubscriptionId, SubscriptionInfo, SubscriptionRegistry,
    SubscriptionStatus,
};
use crate::config::ManagerConfig;
use crate::error::{RelayError, Result};
use crate::transport::{
    Connector, Envelope, EventSink, Headers, ManagerEvent, OpenRequest, Transport, TransportEvent,
};

/// Connection state of the manager
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    /// Never connected, or explicitly disconnected
    Idle,
    /// A connect attempt is in flight
    Connecting,
    /// Session established
    Connected,
    /// Session lost; a retry may be scheduled
    Disconnected,
}

type ConnectOutcome = Shared<BoxFuture<'static, Result<()>>>;

// The single in-flight connect attempt. Every caller of connect() awaits
// `outcome`; `completer` resolves it exactly once.
struct Attempt {
    completer: oneshot::Sender<Result<()>>,
    outcome: ConnectOutcome,
    timeout: JoinHandle<()>,
}

impl Attempt {
    fn finish(self, result: Result<()>) {
        self.timeout.abort();
        let _ = self.completer.send(result);
    }
}

// Callbacks collected under the state lock and run after it is released
#[derive(Default)]
struct Deferred(Vec<Box<dyn FnOnce() + Send>>);

impl Deferred {
    fn push(&mut self, f: impl FnOnce() + Send + 'static) {
        self.0.push(Box::new(f));
    }

    fn run(self) {
        for f in self.0 {
            f();
        }
    }
}

struct ManagerState {
    phase: ConnectionState,
    should_reconnect: bool,
    reconnect_attempts: u32,
    // bumped on every new attempt and on disconnect; events carrying an
    // older generation belong to a discarded transport or timer
    generation: u64,
    transport: Option<Box<dyn Transport>>,
    attempt: Option<Attempt>,
    retry: Option<JoinHandle<()>>,
    backoff: Box<dyn Backoff + Send>,
    subscriptions: SubscriptionRegistry,
    observers: Observers,
}

pub(crate) struct ManagerInner {
    identity: String,
    endpoint: String,
    config: ManagerConfig,
    connector: Arc<dyn Connector>,
    events: mpsc::UnboundedSender<(u64, ManagerEvent)>,
    state_tx: watch::Sender<ConnectionState>,
    state: Mutex<ManagerState>,
}

/// Auto-reconnecting client session for one identity at one endpoint.
///
/// Cheap to clone; clones share the same transport, subscriptions and
/// observers. Subscriptions survive connection loss and are re-bound after
/// every successful reconnect. Sends are never queued.
#[derive(Clone)]
pub struct ConnectionManager {
    inner: Arc<ManagerInner>,
}

impl ConnectionManager {
    /// Create a manager for `identity` at `endpoint`. Must be called from
    /// within a Tokio runtime; no connection is made until `connect()`.
    pub fn new(
        identity: impl Into<String>,
        endpoint: impl Into<String>,
        config: ManagerConfig,
        connector: Arc<dyn Connector>,
    ) -> Result<Self> {
        let identity = identity.into();
        let endpoint = endpoint.into();

        if endpoint.is_empty() {
            return Err(RelayError::Config("Empty endpoint provided".to_string()));
        }
        if identity.is_empty() {
            return Err(RelayError::Config("Empty identity provided".to_string()));
        }
        let runtime = tokio::runtime::Handle::try_current().map_err(|_| {
            RelayError::Config("ConnectionManager must be created inside a Tokio runtime".to_string())
        })?;

        info!("Initializing connection manager for {} at {}", identity, endpoint);

        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let (state_tx, _) = watch::channel(ConnectionState::Idle);
        let backoff = config.reconnect_policy.backoff();

        let inner = Arc::new(ManagerInner {
            identity,
            endpoint,
            config,
            connector,
            events: events_tx,
            state_tx,
            state: Mutex::new(ManagerState {
                phase: ConnectionState::Idle,
                should_reconnect: false,
                reconnect_attempts: 0,
                generation: 0,
                transport: None,
                attempt: None,
                retry: None,
                backoff,
                subscriptions: SubscriptionRegistry::default(),
                observers: Observers::default(),
            }),
        });

        runtime.spawn(drive(Arc::downgrade(&inner), events_rx));

        Ok(Self { inner })
    }

    /// Connect, or join the attempt already in flight.
    ///
    /// Resolves immediately when already connected. Every concurrent caller
    /// receives the outcome of the same single attempt.
    pub async fn connect(&self) -> Result<()> {
        let mut deferred = Deferred::default();
        let outcome = {
            let mut guard = self.inner.state.lock();
            let state = &mut *guard;

            if state.phase == ConnectionState::Connected {
                return Ok(());
            }

            let in_flight = state.attempt.as_ref().map(|attempt| attempt.outcome.clone());
            match in_flight {
                Some(outcome) => {
                    debug!("Joining in-flight connect attempt to {}", self.inner.endpoint);
                    outcome
                }
                None => {
                    state.should_reconnect = true;
                    state.reconnect_attempts = 0;
                    state.backoff.reset();
                    self.inner.start_attempt(state, &mut deferred)
                }
            }
        };
        deferred.run();

        outcome.await
    }

    /// End the session: stop reconnecting, cancel any in-flight connect,
    /// drop every subscription and release the transport. No-op when idle.
    pub fn disconnect(&self) {
        drop(self.inner.disconnect());
    }

    /// Like `disconnect`, but waits (up to the connect timeout) until the
    /// released transport has flushed what was already sent through it.
    /// Use before the runtime goes away.
    pub async fn shutdown(&self) {
        let Some(finished) = self.inner.disconnect() else {
            return;
        };
        if tokio::time::timeout(self.inner.config.connect_timeout, finished)
            .await
            .is_err()
        {
            warn!("Transport to {} did not finish closing in time", self.inner.endpoint);
        }
    }

    /// Register `callback` for `destination`.
    ///
    /// If the destination is already registered the existing registration
    /// (and its callback) is kept and returned.
    pub fn subscribe<F>(&self, destination: &str, callback: F) -> SubscriptionHandle
    where
        F: Fn(&Envelope) + Send + Sync + 'static,
    {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;

        if let Some(existing) = state.subscriptions.get(destination) {
            debug!("Already subscribed to {} ({})", destination, existing.id);
            return SubscriptionHandle::new(existing.id, destination, Arc::downgrade(&self.inner));
        }

        let status = match state.transport.as_mut() {
            Some(transport) if state.phase == ConnectionState::Connected => {
                match transport.subscribe(destination) {
                    Ok(handle) => SubscriptionStatus::Active(handle),
                    Err(e) => {
                        warn!("Failed to bind {}, keeping it pending: {:#}", destination, e);
                        SubscriptionStatus::Pending
                    }
                }
            }
            _ => SubscriptionStatus::Pending,
        };

        let callback: MessageCallback = Arc::new(callback);
        let id = state.subscriptions.insert(destination, callback, status);
        info!("Adding subscription {} for {}", id, destination);

        SubscriptionHandle::new(id, destination, Arc::downgrade(&self.inner))
    }

    /// Remove the registration for `destination`; no-op when not registered
    pub fn unsubscribe(&self, destination: &str) -> bool {
        self.inner.unsubscribe_if(destination, None)
    }

    /// Publish a message. Fails fast unless connected; never queued.
    pub fn send(&self, destination: &str, headers: &Headers, body: &str) -> Result<()> {
        let mut guard = self.inner.state.lock();
        let state = &mut *guard;

        let transport = match state.transport.as_mut() {
            Some(transport) if state.phase == ConnectionState::Connected => transport,
            _ => {
                warn!(
                    "Dropping send to {}: not connected ({:?})",
                    destination, state.phase
                );
                return Err(RelayError::NotConnected);
            }
        };

        transport.publish(destination, headers, body).map_err(|e| {
            error!("Failed to publish to {}: {:#}", destination, e);
            RelayError::Transport(format!("{:#}", e))
        })
    }

    /// Observe every transition into Connected. Invoked before returning if
    /// the manager is already connected.
    pub fn add_on_connect<F>(&self, callback: F) -> Disposer
    where
        F: Fn() + Send + Sync + 'static,
    {
        let callback: ConnectCallback = Arc::new(callback);
        let (id, replay) = {
            let mut state = self.inner.state.lock();
            let id = state.observers.add_connect(Arc::clone(&callback));
            (id, state.phase == ConnectionState::Connected)
        };

        if replay {
            callback();
        }

        Disposer::new(ObserverKind::Connect, id, Arc::downgrade(&self.inner))
    }

    /// Observe every loss of the session, including failed attempts
    pub fn add_on_disconnect<F>(&self, callback: F) -> Disposer
    where
        F: Fn(&DisconnectInfo) + Send + Sync + 'static,
    {
        let callback: DisconnectCallback = Arc::new(callback);
        let id = self.inner.state.lock().observers.add_disconnect(callback);

        Disposer::new(ObserverKind::Disconnect, id, Arc::downgrade(&self.inner))
    }

    pub fn state(&self) -> ConnectionState {
        self.inner.state.lock().phase
    }

    /// Get a receiver for connection state changes
    pub fn state_receiver(&self) -> watch::Receiver<ConnectionState> {
        self.inner.state_tx.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn reconnect_attempts(&self) -> u32 {
        self.inner.state.lock().reconnect_attempts
    }

    pub fn should_reconnect(&self) -> bool {
        self.inner.state.lock().should_reconnect
    }

    pub fn identity(&self) -> &str {
        &self.inner.identity
    }

    pub fn endpoint(&self) -> &str {
        &self.inner.endpoint
    }

    pub fn config(&self) -> &ManagerConfig {
        &self.inner.config
    }

    /// Snapshot of every registration, sorted by destination
    pub fn subscriptions(&self) -> Vec<SubscriptionInfo> {
        self.inner.state.lock().subscriptions.snapshot()
    }

    pub fn is_subscribed(&self, destination: &str) -> bool {
        self.inner.state.lock().subscriptions.get(destination).is_some()
    }

    pub(crate) fn same_as(&self, other: &ConnectionManager) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl fmt::Debug for ConnectionManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionManager")
            .field("identity", &self.inner.identity)
            .field("endpoint", &self.inner.endpoint)
            .field("state", &self.state())
            .finish()
    }
}

impl ManagerInner {
    fn set_phase(&self, state: &mut ManagerState, phase: ConnectionState) {
        if state.phase != phase {
            debug!("{}: {:?} -> {:?}", self.endpoint, state.phase, phase);
            state.phase = phase;
            self.state_tx.send_replace(phase);
        }
    }

    fn spawn_timer(&self, generation: u64, delay: Duration, event: ManagerEvent) -> JoinHandle<()> {
        let events = self.events.clone();
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send((generation, event));
        })
    }

    // Idle/Disconnected -> Connecting with a fresh transport
    fn start_attempt(&self, state: &mut ManagerState, deferred: &mut Deferred) -> ConnectOutcome {
        if let Some(retry) = state.retry.take() {
            retry.abort();
        }

        state.generation += 1;
        let generation = state.generation;
        self.set_phase(state, ConnectionState::Connecting);

        let (completer, rx) = oneshot::channel();
        let outcome = rx
            .map(|result| result.unwrap_or(Err(RelayError::Cancelled)))
            .boxed()
            .shared();
        let timeout = self.spawn_timer(
            generation,
            self.config.connect_timeout,
            ManagerEvent::ConnectTimeout,
        );
        state.attempt = Some(Attempt {
            completer,
            outcome: outcome.clone(),
            timeout,
        });

        info!(
            "Attempting to connect to {} as {} (attempt #{})",
            self.endpoint,
            self.identity,
            state.reconnect_attempts + 1
        );

        let mut headers = self.config.connect_headers.clone();
        headers.insert(self.config.identity_header.clone(), self.identity.clone());
        let request = OpenRequest {
            endpoint: &self.endpoint,
            headers: &headers,
        };

        match self
            .connector
            .open(request, EventSink::new(generation, self.events.clone()))
        {
            Ok(transport) => state.transport = Some(transport),
            Err(e) => {
                error!("Failed to construct transport for {}: {:#}", self.endpoint, e);
                self.transport_lost(state, DisconnectReason::Error(format!("{:#}", e)), deferred);
            }
        }

        outcome
    }

    fn handle_event(&self, generation: u64, event: ManagerEvent) {
        let mut deferred = Deferred::default();
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            if generation != state.generation {
                debug!("Ignoring stale event from generation {}: {:?}", generation, event);
                return;
            }

            match event {
                ManagerEvent::Transport(TransportEvent::Opened) => {
                    self.session_opened(state, &mut deferred)
                }
                ManagerEvent::Transport(TransportEvent::Closed { code, reason }) => {
                    self.transport_lost(state, DisconnectReason::Closed { code, reason }, &mut deferred)
                }
                ManagerEvent::Transport(TransportEvent::Rejected(message)) => {
                    self.transport_lost(state, DisconnectReason::Rejected(message), &mut deferred)
                }
                ManagerEvent::Transport(TransportEvent::Error(message)) => {
                    self.transport_lost(state, DisconnectReason::Error(message), &mut deferred)
                }
                ManagerEvent::Transport(TransportEvent::Message(envelope)) => {
                    Self::dispatch(state, envelope, &mut deferred)
                }
                ManagerEvent::ConnectTimeout => {
                    if state.phase == ConnectionState::Connecting {
                        warn!(
                            "Connect to {} timed out after {:?}",
                            self.endpoint, self.config.connect_timeout
                        );
                        self.transport_lost(state, DisconnectReason::Timeout, &mut deferred);
                    }
                }
                ManagerEvent::Retry => {
                    state.retry = None;
                    if state.phase == ConnectionState::Disconnected && state.should_reconnect {
                        // nobody awaits an automatic attempt; the outcome is
                        // reported through observers
                        drop(self.start_attempt(state, &mut deferred));
                    }
                }
            }
        }
        deferred.run();
    }

    fn session_opened(&self, state: &mut ManagerState, deferred: &mut Deferred) {
        if state.phase != ConnectionState::Connecting {
            return;
        }

        info!("Successfully connected to {}", self.endpoint);
        self.set_phase(state, ConnectionState::Connected);
        state.reconnect_attempts = 0;
        state.backoff.reset();

        if let Some(attempt) = state.attempt.take() {
            attempt.finish(Ok(()));
        }

        Self::resubscribe(state);

        for callback in state.observers.connect_callbacks() {
            deferred.push(move || callback());
        }
    }

    // Bind every Pending registration to the live transport
    fn resubscribe(state: &mut ManagerState) {
        let Some(transport) = state.transport.as_mut() else {
            return;
        };

        let pending = state.subscriptions.pending_destinations();
        if pending.is_empty() {
            return;
        }

        let mut bound = 0;
        for destination in &pending {
            match transport.subscribe(destination) {
                Ok(handle) => {
                    state.subscriptions.activate(destination, handle);
                    bound += 1;
                }
                Err(e) => warn!("Failed to resubscribe to {}: {:#}", destination, e),
            }
        }
        info!("Resubscribed {}/{} pending subscriptions", bound, pending.len());
    }

    // Connecting/Connected -> Disconnected, scheduling a retry when allowed
    fn transport_lost(&self, state: &mut ManagerState, reason: DisconnectReason, deferred: &mut Deferred) {
        if !matches!(
            state.phase,
            ConnectionState::Connecting | ConnectionState::Connected
        ) {
            return;
        }

        if let Some(mut transport) = state.transport.take() {
            transport.close();
        }

        let demoted = state.subscriptions.demote_all();
        state.reconnect_attempts += 1;
        self.set_phase(state, ConnectionState::Disconnected);

        warn!(
            "Connection to {} lost ({:?}); {} subscriptions pending, attempt #{}",
            self.endpoint, reason, demoted, state.reconnect_attempts
        );

        if let Some(attempt) = state.attempt.take() {
            attempt.finish(Err(self.connect_error(&reason)));
        }

        let will_reconnect = state.should_reconnect
            && state.reconnect_attempts < self.config.max_reconnect_attempts
            && self.schedule_retry(state);

        if !will_reconnect && state.should_reconnect {
            error!(
                "Giving up on {} after {} consecutive failed attempts",
                self.endpoint, state.reconnect_attempts
            );
            state.should_reconnect = false;
        }

        let info = DisconnectInfo {
            reason,
            reconnect_attempts: state.reconnect_attempts,
            will_reconnect,
        };
        for callback in state.observers.disconnect_callbacks() {
            let info = info.clone();
            deferred.push(move || callback(&info));
        }
    }

    fn schedule_retry(&self, state: &mut ManagerState) -> bool {
        let Some(delay) = state.backoff.next_backoff() else {
            return false;
        };

        info!(
            "Will attempt reconnection to {} in {:?} (attempt #{})",
            self.endpoint,
            delay,
            state.reconnect_attempts + 1
        );
        state.retry = Some(self.spawn_timer(state.generation, delay, ManagerEvent::Retry));
        true
    }

    fn connect_error(&self, reason: &DisconnectReason) -> RelayError {
        match reason {
            DisconnectReason::Timeout => RelayError::ConnectTimeout(self.config.connect_timeout),
            DisconnectReason::Closed { reason, .. } => RelayError::Closed(reason.clone()),
            DisconnectReason::Rejected(message) => RelayError::Rejected(message.clone()),
            DisconnectReason::Error(message) => RelayError::Transport(message.clone()),
            DisconnectReason::Requested => RelayError::Cancelled,
        }
    }

    // Route by transport subscription id when the transport supplies one,
    // otherwise by destination. Only Active registrations receive messages.
    fn dispatch(state: &ManagerState, envelope: Envelope, deferred: &mut Deferred) {
        if state.phase != ConnectionState::Connected {
            debug!("Dropping message for {} while not connected", envelope.destination);
            return;
        }

        let registration = match &envelope.subscription {
            Some(handle) => state.subscriptions.find_by_handle(handle),
            None => state
                .subscriptions
                .get(&envelope.destination)
                .filter(|r| matches!(r.status, SubscriptionStatus::Active(_))),
        };

        let Some(registration) = registration else {
            debug!("No active subscription for message on {}", envelope.destination);
            return;
        };

        let callback = Arc::clone(&registration.callback);
        deferred.push(move || callback(&envelope));
    }

    // Returns a future for the released transport's teardown, if there was one
    fn disconnect(&self) -> Option<BoxFuture<'static, ()>> {
        let mut deferred = Deferred::default();
        let mut finished = None;
        {
            let mut guard = self.state.lock();
            let state = &mut *guard;

            if state.phase == ConnectionState::Idle {
                debug!("disconnect() on idle manager for {}", self.endpoint);
                return None;
            }

            info!("Disconnecting {} from {}", self.identity, self.endpoint);
            let was_connected = state.phase == ConnectionState::Connected;

            state.should_reconnect = false;
            state.generation += 1;

            if let Some(retry) = state.retry.take() {
                retry.abort();
            }
            if let Some(attempt) = state.attempt.take() {
                attempt.finish(Err(RelayError::Cancelled));
            }
            if let Some(mut transport) = state.transport.take() {
                for handle in state.subscriptions.active_handles() {
                    if let Err(e) = transport.unsubscribe(&handle) {
                        warn!("Failed to unsubscribe {}: {:#}", handle, e);
                    }
                }
                transport.close();
                finished = Some(transport.finished());
            }

            state.subscriptions.clear();
            self.set_phase(state, ConnectionState::Idle);

            if was_connected {
                let info = DisconnectInfo {
                    reason: DisconnectReason::Requested,
                    reconnect_attempts: state.reconnect_attempts,
                    will_reconnect: false,
                };
                for callback in state.observers.disconnect_callbacks() {
                    let info = info.clone();
                    deferred.push(move || callback(&info));
                }
            }
        }
        deferred.run();
        finished
    }

    pub(crate) fn unsubscribe_if(&self, destination: &str, expected: Option<SubscriptionId>) -> bool {
        let mut guard = self.state.lock();
        let state = &mut *guard;

        match state.subscriptions.get(destination) {
            None => return false,
            Some(registration) if expected.is_some_and(|id| id != registration.id) => return false,
            Some(_) => {}
        }

        let Some(registration) = state.subscriptions.remove(destination) else {
            return false;
        };

        if let SubscriptionStatus::Active(handle) = &registration.status {
            if let Some(transport) = state.transport.as_mut() {
                if let Err(e) = transport.unsubscribe(handle) {
                    warn!("Failed to unsubscribe {} ({}): {:#}", destination, handle, e);
                }
            }
        }

        info!("Removing subscription {} for {}", registration.id, destination);
        true
    }

    pub(crate) fn remove_observer(&self, kind: ObserverKind, id: u64) -> bool {
        self.state.lock().observers.remove(kind, id)
    }
}

impl Drop for ManagerInner {
    fn drop(&mut self) {
        let state = self.state.get_mut();
        if let Some(retry) = state.retry.take() {
            retry.abort();
        }
        if let Some(attempt) = state.attempt.take() {
            attempt.finish(Err(RelayError::Cancelled));
        }
        if let Some(mut transport) = state.transport.take() {
            transport.close();
        }
    }
}

// Single consumer of transport and timer events for one manager
async fn drive(manager: Weak<ManagerInner>, mut events: mpsc::UnboundedReceiver<(u64, ManagerEvent)>) {
    while let Some((generation, event)) = events.recv().await {
        let Some(inner) = manager.upgrade() else {
            break;
        };
        inner.handle_event(generation, event);
    }
    debug!("Connection manager task exiting");
}

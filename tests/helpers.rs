// tests/helpers.rs
#![allow(dead_code)]

use anyhow::Result;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;

use relay_client::transport::{OpenRequest, TransportSubscription};
use relay_client::{
    ConnectionManager, ConnectionState, Connector, Envelope, EventSink, Headers, ManagerConfig,
    ReconnectPolicy, Transport, TransportEvent,
};

/// What the mock does when asked to open a transport
#[derive(Debug, Clone, PartialEq)]
pub enum OpenBehavior {
    /// Report the session as established straight away
    Open,
    /// Construct the transport but never report anything
    Silent,
    /// Fail to construct the transport
    FailConstruct,
    /// Construct, then reject the session with a protocol error
    Reject(String),
}

#[derive(Debug, Clone, PartialEq)]
pub struct Published {
    pub destination: String,
    pub headers: Headers,
    pub body: String,
}

#[derive(Default)]
struct SessionLog {
    next_handle: u32,
    subscribed: Vec<(String, TransportSubscription)>,
    unsubscribed: Vec<TransportSubscription>,
    published: Vec<Published>,
    closed: bool,
}

/// One transport the mock constructed, observable from the test
pub struct MockSession {
    index: usize,
    sink: EventSink,
    headers: Headers,
    fail_subscribe: Mutex<Vec<String>>,
    log: Mutex<SessionLog>,
}

impl MockSession {
    pub fn headers(&self) -> &Headers {
        &self.headers
    }

    pub fn open(&self) {
        self.sink.emit(TransportEvent::Opened);
    }

    pub fn close_remotely(&self, reason: &str) {
        self.sink.emit(TransportEvent::Closed {
            code: Some(1006),
            reason: reason.to_string(),
        });
    }

    pub fn fail(&self, message: &str) {
        self.sink.emit(TransportEvent::Error(message.to_string()));
    }

    /// Deliver a message as the server would, tagged with the handle this
    /// session bound for `destination` (if any)
    pub fn deliver(&self, destination: &str, body: &str) {
        let subscription = self
            .log
            .lock()
            .subscribed
            .iter()
            .rev()
            .find(|(d, _)| d == destination)
            .map(|(_, handle)| handle.clone());

        let mut envelope = Envelope::new(destination, body);
        envelope.subscription = subscription;
        self.sink.emit(TransportEvent::Message(envelope));
    }

    /// Make the next transport-level subscribe for `destination` fail
    pub fn fail_subscribe_to(&self, destination: &str) {
        self.fail_subscribe.lock().push(destination.to_string());
    }

    pub fn subscribed(&self) -> Vec<(String, TransportSubscription)> {
        self.log.lock().subscribed.clone()
    }

    pub fn subscribe_count(&self, destination: &str) -> usize {
        self.log
            .lock()
            .subscribed
            .iter()
            .filter(|(d, _)| d == destination)
            .count()
    }

    pub fn unsubscribed(&self) -> Vec<TransportSubscription> {
        self.log.lock().unsubscribed.clone()
    }

    pub fn published(&self) -> Vec<Published> {
        self.log.lock().published.clone()
    }

    pub fn is_closed(&self) -> bool {
        self.log.lock().closed
    }
}

struct MockTransport {
    session: Arc<MockSession>,
}

impl Transport for MockTransport {
    fn subscribe(&mut self, destination: &str) -> Result<TransportSubscription> {
        let mut failing = self.session.fail_subscribe.lock();
        if let Some(pos) = failing.iter().position(|d| d == destination) {
            failing.remove(pos);
            anyhow::bail!("subscribe to {} refused", destination);
        }

        let mut log = self.session.log.lock();
        if log.closed {
            anyhow::bail!("transport closed");
        }
        log.next_handle += 1;
        let handle =
            TransportSubscription::new(format!("t{}-{}", self.session.index, log.next_handle));
        log.subscribed.push((destination.to_string(), handle.clone()));
        Ok(handle)
    }

    fn unsubscribe(&mut self, subscription: &TransportSubscription) -> Result<()> {
        self.session.log.lock().unsubscribed.push(subscription.clone());
        Ok(())
    }

    fn publish(&mut self, destination: &str, headers: &Headers, body: &str) -> Result<()> {
        self.session.log.lock().published.push(Published {
            destination: destination.to_string(),
            headers: headers.clone(),
            body: body.to_string(),
        });
        Ok(())
    }

    fn close(&mut self) {
        self.session.log.lock().closed = true;
    }
}

struct ConnectorState {
    behavior: OpenBehavior,
    sessions: Vec<Arc<MockSession>>,
    open_calls: usize,
    // handed to the next session constructed
    fail_next_subscribe: Vec<String>,
}

/// Scripted connector that records every transport it constructs
pub struct MockConnector {
    state: Mutex<ConnectorState>,
}

impl MockConnector {
    pub fn new(behavior: OpenBehavior) -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(ConnectorState {
                behavior,
                sessions: Vec::new(),
                open_calls: 0,
                fail_next_subscribe: Vec::new(),
            }),
        })
    }

    pub fn set_behavior(&self, behavior: OpenBehavior) {
        self.state.lock().behavior = behavior;
    }

    /// Make the next session refuse its first subscribe to `destination`,
    /// which lands in the resubscription pass when that session opens
    pub fn fail_next_session_subscribe(&self, destination: &str) {
        self.state
            .lock()
            .fail_next_subscribe
            .push(destination.to_string());
    }

    /// Number of `open` calls, including failed constructions
    pub fn open_calls(&self) -> usize {
        self.state.lock().open_calls
    }

    /// Number of transports actually constructed
    pub fn session_count(&self) -> usize {
        self.state.lock().sessions.len()
    }

    pub fn session(&self, index: usize) -> Arc<MockSession> {
        Arc::clone(&self.state.lock().sessions[index])
    }

    pub fn last_session(&self) -> Arc<MockSession> {
        let state = self.state.lock();
        Arc::clone(state.sessions.last().expect("no session opened yet"))
    }
}

impl Connector for MockConnector {
    fn open(&self, request: OpenRequest<'_>, events: EventSink) -> Result<Box<dyn Transport>> {
        let mut state = self.state.lock();
        state.open_calls += 1;

        if state.behavior == OpenBehavior::FailConstruct {
            anyhow::bail!("cannot reach {}", request.endpoint);
        }

        let session = Arc::new(MockSession {
            index: state.sessions.len(),
            sink: events,
            headers: request.headers.clone(),
            fail_subscribe: Mutex::new(std::mem::take(&mut state.fail_next_subscribe)),
            log: Mutex::new(SessionLog::default()),
        });
        state.sessions.push(Arc::clone(&session));

        match &state.behavior {
            OpenBehavior::Open => session.open(),
            OpenBehavior::Reject(message) => {
                session.sink.emit(TransportEvent::Rejected(message.clone()));
            }
            OpenBehavior::Silent | OpenBehavior::FailConstruct => {}
        }

        Ok(Box::new(MockTransport { session }))
    }
}

pub fn test_config() -> ManagerConfig {
    ManagerConfig::default()
        .connect_timeout(Duration::from_secs(10))
        .reconnect_policy(ReconnectPolicy::Fixed {
            delay: Duration::from_secs(5),
        })
        .max_reconnect_attempts(10)
}

pub fn new_manager(connector: &Arc<MockConnector>) -> Result<ConnectionManager> {
    let connector: Arc<dyn Connector> = connector.clone();
    Ok(ConnectionManager::new(
        "user-42",
        "ws://gateway.test/ws",
        test_config(),
        connector,
    )?)
}

/// Wait (in virtual time) until the manager reports `expected`
pub async fn wait_for_state(manager: &ConnectionManager, expected: ConnectionState) -> Result<()> {
    let mut rx: watch::Receiver<ConnectionState> = manager.state_receiver();
    tokio::time::timeout(Duration::from_secs(600), rx.wait_for(|state| *state == expected))
        .await
        .map_err(|_| anyhow::anyhow!("timed out waiting for {:?}", expected))??;
    Ok(())
}

/// Let the manager's driver task drain queued events
pub async fn settle() {
    for _ in 0..10 {
        tokio::task::yield_now().await;
    }
}

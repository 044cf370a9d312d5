// src/transport/mod.rs
pub mod frame;
pub mod websocket;

use futures::future::{BoxFuture, FutureExt};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use tokio::sync::mpsc::UnboundedSender;

pub use websocket::{WsConnector, WsTransport};

/// Ordered header map carried by frames and envelopes
pub type Headers = BTreeMap<String, String>;

/// Identifier the transport assigned to one transport-level subscription
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct TransportSubscription(String);

impl TransportSubscription {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransportSubscription {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// An inbound message: opaque text body plus headers
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Envelope {
    pub destination: String,
    pub subscription: Option<TransportSubscription>,
    pub headers: Headers,
    pub body: String,
}

impl Envelope {
    pub fn new(destination: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            destination: destination.into(),
            subscription: None,
            headers: Headers::new(),
            body: body.into(),
        }
    }
}

/// Things a transport reports about its session
#[derive(Debug, Clone, PartialEq)]
pub enum TransportEvent {
    /// Socket open and protocol session established
    Opened,
    /// Socket closed, by either side
    Closed { code: Option<u16>, reason: String },
    /// Server refused or aborted the session with a protocol error
    Rejected(String),
    /// Transport failure (handshake, I/O)
    Error(String),
    /// Inbound message for a subscribed destination
    Message(Envelope),
}

#[derive(Debug)]
pub(crate) enum ManagerEvent {
    Transport(TransportEvent),
    ConnectTimeout,
    Retry,
}

/// Tagged event stream back into the manager that owns the transport.
///
/// Each connect attempt hands out a sink with its own generation; events from
/// a sink whose generation is no longer current are dropped by the manager.
#[derive(Debug, Clone)]
pub struct EventSink {
    generation: u64,
    tx: UnboundedSender<(u64, ManagerEvent)>,
}

impl EventSink {
    pub(crate) fn new(generation: u64, tx: UnboundedSender<(u64, ManagerEvent)>) -> Self {
        Self { generation, tx }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Report an event; returns false once the manager is gone
    pub fn emit(&self, event: TransportEvent) -> bool {
        self.tx
            .send((self.generation, ManagerEvent::Transport(event)))
            .is_ok()
    }
}

/// Parameters for opening a transport
#[derive(Debug, Clone, Copy)]
pub struct OpenRequest<'a> {
    pub endpoint: &'a str,
    pub headers: &'a Headers,
}

/// A live duplex channel to the messaging gateway.
///
/// Owned exclusively by one connection manager and never reused across
/// connect attempts.
pub trait Transport: Send {
    /// Start receiving messages for `destination`
    fn subscribe(&mut self, destination: &str) -> anyhow::Result<TransportSubscription>;

    fn unsubscribe(&mut self, subscription: &TransportSubscription) -> anyhow::Result<()>;

    fn publish(&mut self, destination: &str, headers: &Headers, body: &str) -> anyhow::Result<()>;

    /// End the session; no further events are expected afterwards
    fn close(&mut self);

    /// Resolves once the session has written out everything queued before
    /// `close` and released its connection
    fn finished(&self) -> BoxFuture<'static, ()> {
        futures::future::ready(()).boxed()
    }
}

/// Factory for transports bound to an endpoint.
///
/// `open` only constructs the transport. Establishment, closure and inbound
/// messages are reported later through `events`.
pub trait Connector: Send + Sync {
    fn open(&self, request: OpenRequest<'_>, events: EventSink) -> anyhow::Result<Box<dyn Transport>>;
}

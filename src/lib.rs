// src/lib.rs
// Export modules so they can be used in tests
pub mod config;
pub mod connection;
pub mod error;
pub mod lifecycle;
pub mod registry;
pub mod transport;

pub use config::{ManagerConfig, ReconnectPolicy, Settings};
pub use connection::{
    ConnectionManager, ConnectionState, DisconnectInfo, DisconnectReason, Disposer,
    SubscriptionHandle, SubscriptionInfo, SubscriptionStatus,
};
pub use error::{RelayError, Result};
pub use registry::ManagerRegistry;
pub use transport::{Connector, Envelope, EventSink, Headers, Transport, TransportEvent};

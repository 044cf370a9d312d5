// src/error.rs
use std::time::Duration;
use thiserror::Error;

/// Errors surfaced to callers of the connection manager.
///
/// Cloneable because one connect attempt's outcome is handed to every caller
/// waiting on it.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RelayError {
    /// The transport did not report an established session in time
    #[error("Connect timed out after {0:?}")]
    ConnectTimeout(Duration),

    /// The transport could not be constructed or failed underneath us
    #[error("Transport error: {0}")]
    Transport(String),

    /// The server refused the session (bad identity, protocol error frame)
    #[error("Connection rejected: {0}")]
    Rejected(String),

    /// The transport closed before the session was established
    #[error("Connection closed: {0}")]
    Closed(String),

    /// The attempt was abandoned by an explicit disconnect
    #[error("Connect cancelled")]
    Cancelled,

    /// Operation needs a live session
    #[error("Not connected")]
    NotConnected,

    /// Invalid manager configuration
    #[error("Invalid configuration: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, RelayError>;

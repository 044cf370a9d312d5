// src/config.rs
use backoff::ExponentialBackoff;
use backoff::backoff::{Backoff, Constant};
use config::{Config, ConfigError, File, FileFormat};
use serde::Deserialize;
use std::time::Duration;

use crate::transport::Headers;

/// Delay policy between automatic reconnect attempts
#[derive(Debug, Clone, PartialEq)]
pub enum ReconnectPolicy {
    /// Same delay before every attempt
    Fixed { delay: Duration },
    /// Doubling delay starting at `initial`, capped at `max`
    Exponential { initial: Duration, max: Duration },
}

impl ReconnectPolicy {
    /// Build a fresh backoff sequence for this policy
    pub fn backoff(&self) -> Box<dyn Backoff + Send> {
        match self {
            ReconnectPolicy::Fixed { delay } => Box::new(Constant::new(*delay)),
            ReconnectPolicy::Exponential { initial, max } => Box::new(ExponentialBackoff {
                current_interval: *initial,
                initial_interval: *initial,
                randomization_factor: 0.0,
                multiplier: 2.0,
                max_interval: *max,
                // the attempt cap decides when to stop, not elapsed time
                max_elapsed_time: None,
                ..ExponentialBackoff::default()
            }),
        }
    }
}

/// Per-instance tunables of a connection manager
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// How long a connect attempt may wait for the session to be established
    pub connect_timeout: Duration,

    /// Delay policy between automatic reconnect attempts
    pub reconnect_policy: ReconnectPolicy,

    /// Consecutive failed attempts after which automatic reconnect gives up
    pub max_reconnect_attempts: u32,

    /// Header carrying the identity on connect
    pub identity_header: String,

    /// Extra headers sent with every connect
    pub connect_headers: Headers,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(10),
            reconnect_policy: ReconnectPolicy::Fixed {
                delay: Duration::from_secs(5),
            },
            max_reconnect_attempts: 10,
            identity_header: "login".to_string(),
            connect_headers: Headers::new(),
        }
    }
}

impl ManagerConfig {
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    pub fn reconnect_policy(mut self, policy: ReconnectPolicy) -> Self {
        self.reconnect_policy = policy;
        self
    }

    pub fn max_reconnect_attempts(mut self, attempts: u32) -> Self {
        self.max_reconnect_attempts = attempts;
        self
    }

    pub fn identity_header(mut self, header: impl Into<String>) -> Self {
        self.identity_header = header.into();
        self
    }

    /// Add a header sent on every connect
    pub fn connect_header(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.connect_headers.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Deserialize)]
pub struct RelaySettings {
    pub endpoint: String,
    pub identity: String,
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,
    #[serde(default = "default_reconnect_delay_secs")]
    pub reconnect_delay_secs: u64,
    /// When set, reconnect delays double up to this cap
    #[serde(default)]
    pub max_reconnect_delay_secs: Option<u64>,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_identity_header")]
    pub identity_header: String,
}

fn default_connect_timeout_secs() -> u64 {
    10
}

fn default_reconnect_delay_secs() -> u64 {
    5
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_identity_header() -> String {
    "login".to_string()
}

#[derive(Debug, Deserialize)]
pub struct Settings {
    pub relay: RelaySettings,
}

impl Settings {
    /// Load the config from `Settings.toml` plus optional environment overrides.
    pub fn new() -> Result<Self, ConfigError> {
        Self::load("Settings")
    }

    /// Load from the named file (extension optional) plus environment overrides.
    pub fn load(path: &str) -> Result<Self, ConfigError> {
        let builder = Config::builder()
            .add_source(File::with_name(path).required(false))
            .add_source(config::Environment::default().separator("__"));

        builder.build()?.try_deserialize()
    }

    /// Parse settings from an embedded TOML document, without env overrides.
    pub fn from_toml_str(toml: &str) -> Result<Self, ConfigError> {
        Config::builder()
            .add_source(File::from_str(toml, FileFormat::Toml))
            .build()?
            .try_deserialize()
    }

    pub fn manager_config(&self) -> ManagerConfig {
        let delay = Duration::from_secs(self.relay.reconnect_delay_secs);
        let reconnect_policy = match self.relay.max_reconnect_delay_secs {
            Some(max) => ReconnectPolicy::Exponential {
                initial: delay,
                max: Duration::from_secs(max),
            },
            None => ReconnectPolicy::Fixed { delay },
        };

        ManagerConfig::default()
            .connect_timeout(Duration::from_secs(self.relay.connect_timeout_secs))
            .reconnect_policy(reconnect_policy)
            .max_reconnect_attempts(self.relay.max_reconnect_attempts)
            .identity_header(self.relay.identity_header.clone())
    }
}

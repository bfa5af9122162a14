//! Core error types for x-Keeper

use std::path::PathBuf;
use thiserror::Error;
use xk_panel::PanelError;

use crate::types::NodeId;

/// Top-level error type for the x-Keeper crates
#[derive(Error, Debug)]
pub enum XkError {
    /// Tunnel or SSH error
    #[error("Connection error: {0}")]
    Connection(#[from] ConnectionError),

    /// Panel API error
    #[error("Panel error: {0}")]
    Panel(#[from] PanelError),

    /// Node store error
    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Tunnel and SSH errors
#[derive(Error, Debug)]
pub enum ConnectionError {
    /// The shared private key could not be loaded
    #[error("SSH key {path} could not be loaded: {reason}")]
    KeyNotFound { path: PathBuf, reason: String },

    /// Host key verification failed
    #[error("Host key for {host} rejected: {reason}")]
    HostKeyRejected { host: String, reason: String },

    /// Public-key authentication was refused
    #[error("Authentication failed for {user}@{host}")]
    AuthenticationFailed { user: String, host: String },

    /// The SSH server could not be reached or the handshake failed
    #[error("Failed to connect to {addr}: {reason}")]
    ConnectFailed { addr: String, reason: String },

    /// SSH connect did not finish in time
    #[error("Timed out connecting to {0}")]
    Timeout(String),

    /// No local port could be bound
    #[error("No free local port at or above {start}")]
    NoFreePort { start: u16 },

    /// Opening an SSH channel failed
    #[error("Channel error: {0}")]
    ChannelFailed(String),

    /// The SSH session went away
    #[error("Connection lost: {0}")]
    ConnectionLost(String),

    /// The node has no live connection in the registry
    #[error("Node {0} is not connected")]
    NodeNotConnected(NodeId),

    /// Local socket error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Node store errors
#[derive(Error, Debug)]
pub enum StoreError {
    /// No node with this ID
    #[error("Node {0} not found")]
    NodeNotFound(NodeId),

    /// Two nodes share an ID
    #[error("Duplicate node ID {0}")]
    DuplicateNode(NodeId),

    /// Reading or writing the store file failed
    #[error("Store I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parse error
    #[error("Store parse error: {0}")]
    Parse(#[from] toml::de::Error),

    /// TOML serialize error
    #[error("Store serialize error: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Configuration-related errors
#[derive(Error, Debug)]
pub enum ConfigError {
    /// Config file not found
    #[error("Config file not found: {0}")]
    NotFound(PathBuf),

    /// Invalid configuration
    #[error("Invalid config: {0}")]
    Invalid(String),

    /// TOML parse error
    #[error("TOML parse error: {0}")]
    Parse(#[from] toml::de::Error),
}

impl ConnectionError {
    /// Whether retrying the same connection attempt can never succeed
    ///
    /// Host-key mismatches and missing key material need operator action.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ConnectionError::KeyNotFound { .. } | ConnectionError::HostKeyRejected { .. }
        )
    }
}

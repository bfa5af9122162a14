//! Tunnel traits

use async_trait::async_trait;

use crate::error::ConnectionError;
use crate::types::Node;

/// A live port forward from a local listener to a node's panel
#[async_trait]
pub trait Tunnel: Send + Sync {
    /// Local port the panel is reachable on
    fn local_port(&self) -> u16;

    /// Check the underlying transport
    ///
    /// Must not hang longer than the transport's own timeouts.
    async fn is_alive(&self) -> bool;

    /// Stop accepting connections and tear the transport down
    ///
    /// Closing an already closed tunnel is a no-op.
    async fn close(&self) -> Result<(), ConnectionError>;
}

/// Opens tunnels to nodes
#[async_trait]
pub trait TunnelOpener: Send + Sync {
    /// Connect to `node` and start forwarding a local port to its panel
    async fn open(&self, node: &Node) -> Result<Box<dyn Tunnel>, ConnectionError>;
}

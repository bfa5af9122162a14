//! Broker facade
//!
//! Entry point for the command layer: resolves node IDs through the store
//! and dispatches to the registry and the issuance workflow.

use std::sync::Arc;

use futures::future::join_all;

use xk_core::config::BrokerConfig;
use xk_core::error::XkError;
use xk_core::traits::{NodeStore, TunnelOpener};
use xk_core::types::{NodeId, UserId};
use xk_panel::PanelClient;

use crate::issuance::{IssuanceError, KeyIssuer};
use crate::registry::{NodeRegistry, RegistrySettings};

/// Node store, connection registry and key issuer wired together
pub struct Broker {
    store: Arc<dyn NodeStore>,
    registry: NodeRegistry,
    issuer: KeyIssuer,
}

impl Broker {
    pub fn new(
        config: &BrokerConfig,
        store: Arc<dyn NodeStore>,
        opener: Arc<dyn TunnelOpener>,
    ) -> Self {
        let registry = NodeRegistry::new(opener, RegistrySettings::from(config));
        let issuer = KeyIssuer::new(registry.clone(), config.issuance.clone());
        Self {
            store,
            registry,
            issuer,
        }
    }

    pub fn registry(&self) -> &NodeRegistry {
        &self.registry
    }

    pub fn store(&self) -> &Arc<dyn NodeStore> {
        &self.store
    }

    /// Connect the node if needed and return its panel client
    pub async fn ensure(&self, node_id: NodeId) -> Result<Arc<PanelClient>, XkError> {
        let node = self.store.get_node(node_id).await?;
        self.registry.ensure(&node).await
    }

    /// Access link for `user` on `node_id`
    pub async fn issue_key(&self, node_id: NodeId, user: UserId) -> Result<String, IssuanceError> {
        let node = self.store.get_node(node_id).await?;
        self.issuer.issue_key(&node, user).await
    }

    /// Create the node's primary inbound and record it in the store
    pub async fn create_routing_rule(&self, node_id: NodeId) -> Result<i64, IssuanceError> {
        let node = self.store.get_node(node_id).await?;
        let inbound_id = self.issuer.create_routing_rule(&node).await?;
        self.store.set_inbound_id(node_id, inbound_id).await?;
        Ok(inbound_id)
    }

    /// Primary inbound of the node, creating it when missing
    ///
    /// Returns the inbound ID and whether it was created by this call.
    pub async fn provision(&self, node_id: NodeId) -> Result<(i64, bool), IssuanceError> {
        let node = self.store.get_node(node_id).await?;
        if let Some(inbound_id) = node.inbound_id {
            tracing::info!("Node {} already has inbound {}", node, inbound_id);
            return Ok((inbound_id, false));
        }
        let inbound_id = self.create_routing_rule(node_id).await?;
        Ok((inbound_id, true))
    }

    /// Emails of clients currently online on the node
    pub async fn online_clients(&self, node_id: NodeId) -> Result<Vec<String>, XkError> {
        let client = self.ensure(node_id).await?;
        Ok(client.online_clients().await?)
    }

    /// Try to connect every node in the store
    ///
    /// Returns how many nodes are connected afterwards. Nodes that fail keep
    /// reconnecting in the background.
    pub async fn connect_all(&self) -> Result<usize, XkError> {
        let nodes = self.store.list_nodes().await?;
        tracing::info!("Connecting {} node(s)", nodes.len());

        let results = join_all(nodes.iter().map(|node| self.registry.ensure(node))).await;
        let connected = results.iter().filter(|r| r.is_ok()).count();
        tracing::info!("{}/{} node(s) connected", connected, nodes.len());
        Ok(connected)
    }

    /// Close every tunnel and stop background tasks
    pub async fn close_all(&self) {
        self.registry.close_all().await;
    }
}

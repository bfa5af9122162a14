//! Node store trait

use async_trait::async_trait;

use crate::error::StoreError;
use crate::types::{Node, NodeId};

/// Persistent source of node records
#[async_trait]
pub trait NodeStore: Send + Sync {
    /// Fetch one node
    async fn get_node(&self, id: NodeId) -> Result<Node, StoreError>;

    /// All nodes, ordered by ID
    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError>;

    /// Record the node's primary inbound
    async fn set_inbound_id(&self, id: NodeId, inbound_id: i64) -> Result<(), StoreError>;
}

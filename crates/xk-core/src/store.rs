//! TOML-backed node store
//!
//! Nodes live in a single file as an array of tables:
//!
//! ```toml
//! [[nodes]]
//! id = 1
//! name = "ams-1"
//! ip = "203.0.113.7"
//! api_port = 2053
//! api_username = "admin"
//! api_password = "..."
//! reality_cover = "www.microsoft.com"
//! ```
//!
//! The file is read once when the store is opened and rewritten whenever a
//! node's inbound ID changes.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio::sync::RwLock;

use crate::error::StoreError;
use crate::traits::NodeStore;
use crate::types::{Node, NodeId};

#[derive(Debug, Default, Serialize, Deserialize)]
struct NodesFile {
    #[serde(default)]
    nodes: Vec<Node>,
}

/// Node store kept in memory and optionally persisted to a TOML file
pub struct TomlNodeStore {
    path: Option<PathBuf>,
    nodes: RwLock<BTreeMap<NodeId, Node>>,
}

impl TomlNodeStore {
    /// Open the store at `path`
    ///
    /// A missing file yields an empty store; the file is created on the
    /// first write.
    pub async fn open(path: impl Into<PathBuf>) -> Result<Self, StoreError> {
        let path = path.into();
        let nodes = if path.exists() {
            let content = tokio::fs::read_to_string(&path).await?;
            let file: NodesFile = toml::from_str(&content)?;
            index(file.nodes)?
        } else {
            tracing::warn!("Node file {} does not exist, starting empty", path.display());
            BTreeMap::new()
        };

        tracing::info!("Loaded {} node(s) from {}", nodes.len(), path.display());
        Ok(Self {
            path: Some(path),
            nodes: RwLock::new(nodes),
        })
    }

    /// A store that never touches disk
    pub fn in_memory(nodes: Vec<Node>) -> Result<Self, StoreError> {
        Ok(Self {
            path: None,
            nodes: RwLock::new(index(nodes)?),
        })
    }

    /// Backing file, if any
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    async fn persist(&self, nodes: &BTreeMap<NodeId, Node>) -> Result<(), StoreError> {
        let Some(path) = &self.path else {
            return Ok(());
        };

        let file = NodesFile {
            nodes: nodes.values().cloned().collect(),
        };
        let content = toml::to_string_pretty(&file)?;

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        // Write-then-rename so a crash never leaves a truncated file
        let tmp = path.with_extension("toml.tmp");
        tokio::fs::write(&tmp, content).await?;
        tokio::fs::rename(&tmp, path).await?;
        Ok(())
    }
}

fn index(nodes: Vec<Node>) -> Result<BTreeMap<NodeId, Node>, StoreError> {
    let mut map = BTreeMap::new();
    for node in nodes {
        let id = node.id;
        if map.insert(id, node).is_some() {
            return Err(StoreError::DuplicateNode(id));
        }
    }
    Ok(map)
}

#[async_trait]
impl NodeStore for TomlNodeStore {
    async fn get_node(&self, id: NodeId) -> Result<Node, StoreError> {
        self.nodes
            .read()
            .await
            .get(&id)
            .cloned()
            .ok_or(StoreError::NodeNotFound(id))
    }

    async fn list_nodes(&self) -> Result<Vec<Node>, StoreError> {
        Ok(self.nodes.read().await.values().cloned().collect())
    }

    async fn set_inbound_id(&self, id: NodeId, inbound_id: i64) -> Result<(), StoreError> {
        let mut nodes = self.nodes.write().await;
        let node = nodes.get_mut(&id).ok_or(StoreError::NodeNotFound(id))?;
        node.inbound_id = Some(inbound_id);
        tracing::info!("Node {} primary inbound set to {}", id, inbound_id);

        self.persist(&nodes).await
    }
}

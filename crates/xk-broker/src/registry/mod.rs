//! Per-node connection registry
//!
//! Maps each node to its live tunnel and panel client. At most one
//! connection exists per node: construction is serialized per node, and
//! the pool itself sits behind a single mutex. Every registered node gets
//! a health monitor; a node that fails to connect gets a background
//! reconnect loop with exponential backoff.

mod health;
mod pool;
mod reconnect;

pub use pool::NodeConnection;

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use xk_core::config::{BackoffConfig, BrokerConfig, PanelConfig};
use xk_core::error::XkError;
use xk_core::traits::TunnelOpener;
use xk_core::types::{ConnectionStatus, Node, NodeId};
use xk_panel::PanelClient;

use pool::PoolState;

/// Registry tunables
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    /// Delay between liveness checks
    pub health_interval: Duration,
    /// Backoff for nodes that fail to connect
    pub backoff: BackoffConfig,
    pub panel: PanelConfig,
}

impl From<&BrokerConfig> for RegistrySettings {
    fn from(config: &BrokerConfig) -> Self {
        Self {
            health_interval: config.health_interval,
            backoff: config.backoff.clone(),
            panel: config.panel.clone(),
        }
    }
}

/// Concurrency-safe pool of node connections
///
/// Cloning is cheap; clones share the same pool.
#[derive(Clone)]
pub struct NodeRegistry {
    inner: Arc<RegistryInner>,
}

pub(crate) struct RegistryInner {
    opener: Arc<dyn TunnelOpener>,
    settings: RegistrySettings,
    pool: Mutex<PoolState>,
    build_locks: DashMap<NodeId, Arc<Mutex<()>>>,
    next_generation: AtomicU64,
}

impl NodeRegistry {
    /// Create an empty registry
    pub fn new(opener: Arc<dyn TunnelOpener>, settings: RegistrySettings) -> Self {
        Self {
            inner: Arc::new(RegistryInner {
                opener,
                settings,
                pool: Mutex::new(PoolState::new()),
                build_locks: DashMap::new(),
                next_generation: AtomicU64::new(1),
            }),
        }
    }

    /// Return the node's panel client, connecting first if needed
    ///
    /// On failure a background reconnect loop is scheduled for the node and
    /// the error is returned right away.
    pub async fn ensure(&self, node: &Node) -> Result<Arc<PanelClient>, XkError> {
        if let Some(conn) = self.get(node.id).await {
            return Ok(conn.client);
        }

        let lock = self.inner.build_lock(node.id);
        let _guard = lock.lock().await;

        // Someone else may have finished while we waited
        if let Some(conn) = self.get(node.id).await {
            return Ok(conn.client);
        }

        match self.inner.build(node).await {
            Ok(conn) => {
                let client = Arc::clone(&conn.client);
                self.inner.register(node, conn, None).await;
                Ok(client)
            }
            Err(e) => {
                tracing::warn!("Failed to connect node {}: {}", node, e);
                self.inner.schedule_reconnect(node).await;
                Err(e)
            }
        }
    }

    /// The node's live connection, without connecting
    pub async fn get(&self, node_id: NodeId) -> Option<NodeConnection> {
        self.inner.pool.lock().await.connections.get(&node_id).cloned()
    }

    /// Connection status of a node
    pub async fn status(&self, node_id: NodeId) -> ConnectionStatus {
        let state = self.inner.pool.lock().await;
        if state.connections.contains_key(&node_id) {
            ConnectionStatus::Connected
        } else if state.reconnecting.contains_key(&node_id) {
            ConnectionStatus::Reconnecting
        } else {
            ConnectionStatus::Disconnected
        }
    }

    /// IDs of all connected nodes
    pub async fn connected(&self) -> Vec<NodeId> {
        let mut ids: Vec<NodeId> = self
            .inner
            .pool
            .lock()
            .await
            .connections
            .keys()
            .copied()
            .collect();
        ids.sort();
        ids
    }

    /// Close every connection and stop every background task
    ///
    /// Close errors are logged and never stop the sweep. The registry can
    /// be used again afterwards.
    pub async fn close_all(&self) {
        let mut state = self.inner.pool.lock().await;

        state.shutdown.cancel();
        state.shutdown = CancellationToken::new();
        state.monitors.clear();
        state.reconnecting.clear();

        let count = state.connections.len();
        for (node_id, conn) in state.connections.drain() {
            if let Err(e) = conn.tunnel.close().await {
                tracing::warn!("Error closing tunnel to node {}: {}", node_id, e);
            }
        }

        tracing::info!("Closed {} node connection(s)", count);
    }
}

impl RegistryInner {
    fn build_lock(&self, node_id: NodeId) -> Arc<Mutex<()>> {
        let lock = self
            .build_locks
            .entry(node_id)
            .or_insert_with(|| Arc::new(Mutex::new(())));
        Arc::clone(&lock)
    }

    async fn build(&self, node: &Node) -> Result<NodeConnection, XkError> {
        let generation = self.next_generation.fetch_add(1, Ordering::Relaxed);
        pool::build_connection(self.opener.as_ref(), &self.settings.panel, node, generation).await
    }

    /// Store a fresh connection and make sure the node has a monitor
    ///
    /// `task` is the token of the background task doing the registration,
    /// if any. A cancelled task must not register: its connection is
    /// closed instead, so nothing outlives `close_all`.
    async fn register(
        self: &Arc<Self>,
        node: &Node,
        conn: NodeConnection,
        task: Option<&CancellationToken>,
    ) -> bool {
        let mut state = self.pool.lock().await;

        if task.map_or(false, |t| t.is_cancelled()) {
            drop(state);
            tracing::debug!("Discarding connection to node {} after shutdown", node.id);
            if let Err(e) = conn.tunnel.close().await {
                tracing::debug!("Error closing discarded tunnel: {}", e);
            }
            return false;
        }

        tracing::info!(
            "Node {} connected on local port {}",
            node,
            conn.local_port()
        );
        let replaced = state.connections.insert(node.id, conn);

        if let Some(token) = state.reconnecting.remove(&node.id) {
            token.cancel();
        }

        if !state.monitors.contains_key(&node.id) {
            let token = state.shutdown.child_token();
            state.monitors.insert(node.id, token.clone());
            self.spawn_monitor(node, token);
        }
        drop(state);

        if let Some(old) = replaced {
            if let Err(e) = old.tunnel.close().await {
                tracing::debug!("Error closing replaced tunnel to node {}: {}", node.id, e);
            }
        }
        true
    }

    /// Start a reconnect loop unless one is running or the node is connected
    async fn schedule_reconnect(self: &Arc<Self>, node: &Node) {
        let mut state = self.pool.lock().await;
        if state.connections.contains_key(&node.id) || state.reconnecting.contains_key(&node.id) {
            return;
        }

        let token = state.shutdown.child_token();
        state.reconnecting.insert(node.id, token.clone());
        tracing::info!("Scheduling background reconnect for node {}", node);
        self.spawn_reconnect(node, token);
    }

    // Spawning happens in plain functions so the background futures do not
    // have to name the futures of the async methods they call back into.
    fn spawn_monitor(self: &Arc<Self>, node: &Node, token: CancellationToken) {
        tokio::spawn(health::run_monitor(
            Arc::downgrade(self),
            node.clone(),
            self.settings.health_interval,
            token,
        ));
    }

    fn spawn_reconnect(self: &Arc<Self>, node: &Node, token: CancellationToken) {
        tokio::spawn(reconnect::run_reconnect(
            Arc::downgrade(self),
            node.clone(),
            xk_tunnel::ExponentialBackoff::from_config(&self.settings.backoff),
            token,
        ));
    }
}

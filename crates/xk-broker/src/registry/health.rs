//! Connection health monitoring

use std::sync::{Arc, Weak};
use std::time::Duration;

use tokio_util::sync::CancellationToken;

use xk_core::types::Node;

use super::RegistryInner;

/// Check the node's tunnel every `interval` until cancelled
///
/// A dead tunnel is replaced by a complete new connection. If that fails
/// the node stays absent from the pool and the next cycle tries again.
pub(crate) async fn run_monitor(
    registry: Weak<RegistryInner>,
    node: Node,
    interval: Duration,
    cancel: CancellationToken,
) {
    tracing::debug!(
        "Health monitor for node {} started (interval {:?})",
        node.id,
        interval
    );

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }

        let Some(inner) = registry.upgrade() else {
            break;
        };
        inner.check_health(&node, &cancel).await;
    }

    tracing::debug!("Health monitor for node {} stopped", node.id);
}

impl RegistryInner {
    async fn check_health(self: &Arc<Self>, node: &Node, cancel: &CancellationToken) {
        let current = self.pool.lock().await.connections.get(&node.id).cloned();

        let dead_generation = match current {
            Some(conn) => {
                if conn.tunnel.is_alive().await {
                    tracing::trace!("Node {} tunnel healthy", node.id);
                    return;
                }
                tracing::warn!(
                    "Tunnel to node {} is dead after {:?} up, reconnecting",
                    node,
                    conn.connected_at.elapsed()
                );
                Some(conn.generation)
            }
            None => {
                tracing::info!("Node {} has no connection, reconnecting", node);
                None
            }
        };

        let lock = self.build_lock(node.id);
        let _guard = lock.lock().await;
        if cancel.is_cancelled() {
            return;
        }

        // Only evict the connection that was checked; a concurrent `ensure`
        // may already have replaced it.
        let evicted = {
            let mut state = self.pool.lock().await;
            match (dead_generation, state.connections.get(&node.id)) {
                (Some(dead), Some(conn)) if conn.generation == dead => {
                    state.connections.remove(&node.id)
                }
                (_, Some(_)) => return,
                (_, None) => None,
            }
        };
        if let Some(dead) = evicted {
            if let Err(e) = dead.tunnel.close().await {
                tracing::debug!("Error closing dead tunnel to node {}: {}", node.id, e);
            }
        }

        match self.build(node).await {
            Ok(conn) => {
                self.register(node, conn, Some(cancel)).await;
            }
            Err(e) => {
                tracing::error!(
                    "Reconnect of node {} failed: {}; retrying in {:?}",
                    node,
                    e,
                    self.settings.health_interval
                );
            }
        }
    }
}

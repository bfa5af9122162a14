//! Background reconnection for nodes that failed to connect

use std::sync::{Arc, Weak};

use tokio_util::sync::CancellationToken;

use xk_core::types::Node;
use xk_tunnel::ExponentialBackoff;

use super::RegistryInner;

/// Keep trying to connect `node` with growing delays
///
/// Stops once the node is connected (by this loop or anyone else), when
/// cancelled, or when the registry is gone.
pub(crate) async fn run_reconnect(
    registry: Weak<RegistryInner>,
    node: Node,
    mut backoff: ExponentialBackoff,
    cancel: CancellationToken,
) {
    loop {
        let delay = backoff.next_delay();
        tracing::info!(
            "Reconnecting node {} in {:?} (attempt {})",
            node,
            delay,
            backoff.attempts()
        );

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }

        let Some(inner) = registry.upgrade() else {
            break;
        };
        if inner.try_reconnect(&node, &cancel).await {
            break;
        }
    }

    tracing::debug!("Reconnect loop for node {} finished", node.id);
}

impl RegistryInner {
    /// One reconnect attempt; true when the loop should stop
    async fn try_reconnect(self: &Arc<Self>, node: &Node, cancel: &CancellationToken) -> bool {
        let lock = self.build_lock(node.id);
        let _guard = lock.lock().await;

        if cancel.is_cancelled() {
            return true;
        }
        if self.pool.lock().await.connections.contains_key(&node.id) {
            tracing::debug!("Node {} already connected, stopping reconnect loop", node.id);
            return true;
        }

        match self.build(node).await {
            Ok(conn) => {
                self.register(node, conn, Some(cancel)).await;
                true
            }
            Err(e) => {
                if let xk_core::XkError::Connection(ce) = &e {
                    if ce.is_fatal() {
                        tracing::error!(
                            "Node {} needs operator attention: {}",
                            node,
                            e
                        );
                        return false;
                    }
                }
                tracing::warn!("Reconnect attempt for node {} failed: {}", node, e);
                false
            }
        }
    }
}
